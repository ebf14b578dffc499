//! 시세 스냅샷.

use crate::types::{Price, Quantity, Symbol};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// 한 종목의 특정 시점 시세.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    /// 종목
    pub symbol: Symbol,
    /// 현재가
    pub last: Price,
    /// 최우선 매수호가
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid: Option<Price>,
    /// 최우선 매도호가
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask: Option<Price>,
    /// 시가
    pub open: Price,
    /// 고가
    pub high: Price,
    /// 저가
    pub low: Price,
    /// 누적 거래량
    pub volume: Quantity,
    /// 전일 대비
    pub change: Decimal,
    /// 전일 대비율 (%)
    pub change_rate: Decimal,
    /// 시세 시각
    pub timestamp: DateTime<Utc>,
}

impl MarketSnapshot {
    /// 현재가만으로 스냅샷을 생성합니다 (시/고/저가는 현재가로 채움).
    pub fn from_last(symbol: Symbol, last: Price) -> Self {
        Self {
            symbol,
            last,
            bid: None,
            ask: None,
            open: last,
            high: last,
            low: last,
            volume: Decimal::ZERO,
            change: Decimal::ZERO,
            change_rate: Decimal::ZERO,
            timestamp: Utc::now(),
        }
    }

    /// 호가를 설정합니다.
    pub fn with_quotes(mut self, bid: Price, ask: Price) -> Self {
        self.bid = Some(bid);
        self.ask = Some(ask);
        self
    }

    /// 새 체결가를 반영한 다음 스냅샷을 만듭니다.
    ///
    /// 고가/저가를 갱신하고 시가 대비 변화를 다시 계산합니다.
    pub fn next_tick(&self, last: Price, volume: Quantity) -> Self {
        let mut next = self.clone();
        next.last = last;
        next.high = next.high.max(last);
        next.low = next.low.min(last);
        next.volume += volume;
        next.change = last - self.open;
        next.change_rate = if self.open.is_zero() {
            Decimal::ZERO
        } else {
            (next.change / self.open * Decimal::from(100)).round_dp(2)
        };
        next.timestamp = Utc::now();
        next
    }

    /// 호가 스프레드.
    pub fn spread(&self) -> Option<Decimal> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }

    /// 중간가.
    pub fn mid_price(&self) -> Option<Price> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
            _ => None,
        }
    }
}
