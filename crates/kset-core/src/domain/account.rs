//! 잔고, 보유 종목, 포트폴리오 요약.

use crate::types::{Price, Quantity, Symbol};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// 계좌 예수금 정보.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    /// 통화
    pub currency: String,
    /// 예수금 총액
    pub cash: Decimal,
    /// 주문 가능 금액
    pub available_cash: Decimal,
    /// 증권사가 계산한 총 평가 금액 (제공 시)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_evaluation: Option<Decimal>,
}

impl Balance {
    /// 원화 잔고를 생성합니다.
    pub fn krw(cash: Decimal, available_cash: Decimal) -> Self {
        Self {
            currency: "KRW".to_string(),
            cash,
            available_cash,
            total_evaluation: None,
        }
    }

    /// 주문 등으로 묶인 금액.
    pub fn locked(&self) -> Decimal {
        self.cash - self.available_cash
    }
}

/// 보유 종목.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// 종목
    pub symbol: Symbol,
    /// 보유 수량
    pub quantity: Quantity,
    /// 매도 가능 수량
    pub available_quantity: Quantity,
    /// 매입 평균가
    pub average_price: Price,
    /// 현재가
    pub current_price: Price,
}

impl Position {
    /// 새 보유 종목을 생성합니다.
    pub fn new(symbol: Symbol, quantity: Quantity, average_price: Price, current_price: Price) -> Self {
        Self {
            symbol,
            quantity,
            available_quantity: quantity,
            average_price,
            current_price,
        }
    }

    /// 평가 금액.
    pub fn market_value(&self) -> Decimal {
        self.current_price * self.quantity
    }

    /// 매입 금액.
    pub fn cost_basis(&self) -> Decimal {
        self.average_price * self.quantity
    }

    /// 평가 손익.
    pub fn unrealized_pnl(&self) -> Decimal {
        self.market_value() - self.cost_basis()
    }

    /// 수익률 (%).
    pub fn return_pct(&self) -> Decimal {
        let cost = self.cost_basis();
        if cost.is_zero() {
            return Decimal::ZERO;
        }
        (self.unrealized_pnl() / cost * Decimal::from(100)).round_dp(2)
    }
}

/// 잔고와 보유 종목을 합친 포트폴리오 요약.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSummary {
    /// 잔고
    pub balance: Balance,
    /// 보유 종목
    pub positions: Vec<Position>,
    /// 총 평가 금액
    pub total_market_value: Decimal,
    /// 총 매입 금액
    pub total_cost: Decimal,
    /// 총 평가 손익
    pub unrealized_pnl: Decimal,
    /// 예수금 + 평가 금액
    pub total_equity: Decimal,
    /// 계산 시각
    pub computed_at: DateTime<Utc>,
}

impl PortfolioSummary {
    /// 잔고와 보유 종목으로 요약을 계산합니다.
    pub fn compute(balance: Balance, positions: Vec<Position>) -> Self {
        let total_market_value: Decimal = positions.iter().map(Position::market_value).sum();
        let total_cost: Decimal = positions.iter().map(Position::cost_basis).sum();
        Self {
            total_equity: balance.cash + total_market_value,
            unrealized_pnl: total_market_value - total_cost,
            total_market_value,
            total_cost,
            balance,
            positions,
            computed_at: Utc::now(),
        }
    }

    /// 종목으로 보유 내역을 찾습니다.
    pub fn position(&self, symbol: &Symbol) -> Option<&Position> {
        self.positions.iter().find(|p| &p.symbol == symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_position_pnl() {
        let pos = Position::new(Symbol::kr("005930"), dec!(10), dec!(70000), dec!(77000));
        assert_eq!(pos.market_value(), dec!(770000));
        assert_eq!(pos.unrealized_pnl(), dec!(70000));
        assert_eq!(pos.return_pct(), dec!(10.00));
    }

    #[test]
    fn test_portfolio_summary() {
        let balance = Balance::krw(dec!(1000000), dec!(800000));
        let positions = vec![
            Position::new(Symbol::kr("005930"), dec!(10), dec!(70000), dec!(77000)),
            Position::new(Symbol::kr("000660"), dec!(2), dec!(150000), dec!(140000)),
        ];
        let summary = PortfolioSummary::compute(balance, positions);
        assert_eq!(summary.total_market_value, dec!(1050000));
        assert_eq!(summary.total_cost, dec!(1000000));
        assert_eq!(summary.unrealized_pnl, dec!(50000));
        assert_eq!(summary.total_equity, dec!(2050000));
        assert_eq!(summary.balance.locked(), dec!(200000));
        assert!(summary.position(&Symbol::kr("000660")).is_some());
    }
}
