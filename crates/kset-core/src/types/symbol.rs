//! 종목 및 시장 유형 정의.
//!
//! 이 모듈은 거래 종목 관련 타입을 정의합니다:
//! - `MarketType` - 시장 유형 (국내 주식, 해외 주식)
//! - `Symbol` - 거래 가능한 상품을 나타내는 종목 식별자

use crate::error::{ErrorRecord, KsetResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 국내 단축 종목코드 길이.
const KR_CODE_LEN: usize = 6;

/// 해외 티커 최대 길이.
const US_TICKER_MAX_LEN: usize = 10;

/// 시장 유형 분류.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketType {
    /// 한국 주식 시장 (KOSPI, KOSDAQ, KONEX)
    KrStock,
    /// 미국 주식 시장
    UsStock,
}

impl MarketType {
    /// 이 시장의 결제 통화.
    pub fn currency(&self) -> &'static str {
        match self {
            MarketType::KrStock => "KRW",
            MarketType::UsStock => "USD",
        }
    }
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketType::KrStock => write!(f, "kr_stock"),
            MarketType::UsStock => write!(f, "us_stock"),
        }
    }
}

/// 거래 가능한 상품을 나타내는 종목 식별자.
///
/// 국내 종목은 6자리 단축코드(예: `005930`), 해외 종목은 티커(예: `AAPL`)입니다.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol {
    /// 종목코드 또는 티커
    pub code: String,
    /// 시장 유형
    pub market_type: MarketType,
}

impl Symbol {
    /// 검증 없이 새 종목을 생성합니다.
    pub fn new(code: impl Into<String>, market_type: MarketType) -> Self {
        Self {
            code: code.into().trim().to_uppercase(),
            market_type,
        }
    }

    /// 국내 종목을 생성합니다.
    pub fn kr(code: impl Into<String>) -> Self {
        Self::new(code, MarketType::KrStock)
    }

    /// 해외(미국) 종목을 생성합니다.
    pub fn us(ticker: impl Into<String>) -> Self {
        Self::new(ticker, MarketType::UsStock)
    }

    /// 검증을 거쳐 종목을 생성합니다.
    ///
    /// # Errors
    ///
    /// 형식이 맞지 않으면 `InvalidSymbol` 에러를 반환합니다.
    pub fn parse(code: &str, market_type: MarketType) -> KsetResult<Self> {
        let symbol = Self::new(code, market_type);
        symbol.validate()?;
        Ok(symbol)
    }

    /// 종목 형식을 검증합니다.
    pub fn validate(&self) -> KsetResult<()> {
        let valid = match self.market_type {
            MarketType::KrStock => {
                self.code.len() == KR_CODE_LEN
                    && self.code.chars().all(|c| c.is_ascii_alphanumeric())
                    && self.code.starts_with(|c: char| c.is_ascii_digit())
            }
            MarketType::UsStock => {
                !self.code.is_empty()
                    && self.code.len() <= US_TICKER_MAX_LEN
                    && self
                        .code
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '.')
                    && self.code.starts_with(|c: char| c.is_ascii_alphabetic())
            }
        };

        if valid {
            Ok(())
        } else {
            Err(ErrorRecord::invalid_symbol(format!(
                "잘못된 종목 식별자: '{}' ({})",
                self.code, self.market_type
            )))
        }
    }

    /// 결제 통화.
    pub fn currency(&self) -> &'static str {
        self.market_type.currency()
    }
}

impl FromStr for Symbol {
    type Err = ErrorRecord;

    /// 숫자로 시작하는 6자리 코드는 국내, 그 외는 해외 티커로 해석합니다.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let market_type = if trimmed.len() == KR_CODE_LEN
            && trimmed.starts_with(|c: char| c.is_ascii_digit())
        {
            MarketType::KrStock
        } else {
            MarketType::UsStock
        };
        Self::parse(trimmed, market_type)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_symbol_creation() {
        let symbol = Symbol::kr(" 005930 ");
        assert_eq!(symbol.code, "005930");
        assert_eq!(symbol.market_type, MarketType::KrStock);
        assert_eq!(symbol.currency(), "KRW");
    }

    #[test]
    fn test_symbol_validation() {
        assert!(Symbol::kr("005930").validate().is_ok());
        assert!(Symbol::kr("0000J0").validate().is_ok());
        assert!(Symbol::us("brk.b").validate().is_ok());

        let err = Symbol::kr("5930").validate().unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidSymbol);
        assert!(Symbol::kr("").validate().is_err());
        assert!(Symbol::us("12AB").validate().is_err());
    }

    #[test]
    fn test_symbol_from_str() {
        let kr: Symbol = "005930".parse().unwrap();
        assert_eq!(kr.market_type, MarketType::KrStock);

        let us: Symbol = "aapl".parse().unwrap();
        assert_eq!(us.market_type, MarketType::UsStock);
        assert_eq!(us.to_string(), "AAPL");

        assert!("??".parse::<Symbol>().is_err());
    }

    #[test]
    fn test_symbol_ordering() {
        let mut symbols = vec![Symbol::us("AAPL"), Symbol::kr("035720"), Symbol::kr("005930")];
        symbols.sort();
        assert_eq!(symbols[0], Symbol::kr("005930"));
        assert_eq!(symbols[1], Symbol::kr("035720"));
        assert!(MarketType::KrStock < MarketType::UsStock);

        let set: std::collections::BTreeSet<Symbol> = symbols.into_iter().collect();
        assert_eq!(set.len(), 3);
    }
}
