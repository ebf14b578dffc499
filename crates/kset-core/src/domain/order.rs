//! 주문 타입 및 생명주기 상태 머신.
//!
//! 이 모듈은 세션 엔진의 주문 관련 타입을 정의합니다:
//! - `Side` - 주문 방향 (매수/매도)
//! - `OrderType` - 주문 유형 (시장가, 지정가)
//! - `OrderStatus` - 주문 상태
//! - `OrderRequest` - 주문 요청
//! - `OrderAck` / `OrderState` - 증권사 응답 및 체결 업데이트
//! - `Order` - 주문 엔티티와 상태 전이 규칙
//!
//! # 상태 전이
//!
//! ```text
//! PendingSubmit ──> Submitted ──> PartiallyFilled ──> Filled
//!       │               │               │
//!       └──> Rejected <─┴───────────────┤
//!                       └──> Cancelled <┘
//! ```
//!
//! `Filled`, `Cancelled`, `Rejected`는 최종 상태이며 이후 어떤 업데이트도 적용되지 않습니다.

use crate::error::{ErrorRecord, KsetResult};
use crate::types::{Price, Quantity, Symbol};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 주문 방향 (매수 또는 매도).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    /// 매수
    Buy,
    /// 매도
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// 주문 유형.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    /// 시장가 주문
    Market,
    /// 지정가 주문
    Limit,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Market => write!(f, "MARKET"),
            OrderType::Limit => write!(f, "LIMIT"),
        }
    }
}

/// 주문 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// 생성됨, 증권사 응답 대기
    PendingSubmit,
    /// 증권사가 접수함
    Submitted,
    /// 부분 체결됨
    PartiallyFilled,
    /// 전량 체결됨
    Filled,
    /// 취소됨
    Cancelled,
    /// 거부됨
    Rejected,
}

impl OrderStatus {
    /// 최종 상태인지 확인합니다.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }

    /// 취소 요청을 받을 수 있는 상태인지 확인합니다.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, OrderStatus::Submitted | OrderStatus::PartiallyFilled)
    }

    fn rank(&self) -> u8 {
        match self {
            OrderStatus::PendingSubmit => 0,
            OrderStatus::Submitted => 1,
            OrderStatus::PartiallyFilled => 2,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected => 3,
        }
    }

    /// `next` 상태가 상태 머신 상에서 도달 가능한지 확인합니다.
    ///
    /// 부분 체결은 추가 체결로 자기 자신에게 전이할 수 있습니다.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if *self == OrderStatus::PartiallyFilled && next == OrderStatus::PartiallyFilled {
            return true;
        }
        next.rank() > self.rank()
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::PendingSubmit => "pending_submit",
            OrderStatus::Submitted => "submitted",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// 새 주문 생성을 위한 주문 요청.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// 클라이언트 주문 ID (없으면 세션이 부여)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
    /// 거래 종목
    pub symbol: Symbol,
    /// 주문 방향
    pub side: Side,
    /// 주문 유형
    pub order_type: OrderType,
    /// 주문 수량
    pub quantity: Quantity,
    /// 지정가 (지정가 주문에만 필수)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Price>,
}

impl OrderRequest {
    /// 시장가 매수 주문을 생성합니다.
    pub fn market_buy(symbol: Symbol, quantity: Quantity) -> Self {
        Self {
            client_order_id: None,
            symbol,
            side: Side::Buy,
            order_type: OrderType::Market,
            quantity,
            price: None,
        }
    }

    /// 시장가 매도 주문을 생성합니다.
    pub fn market_sell(symbol: Symbol, quantity: Quantity) -> Self {
        Self {
            side: Side::Sell,
            ..Self::market_buy(symbol, quantity)
        }
    }

    /// 지정가 매수 주문을 생성합니다.
    pub fn limit_buy(symbol: Symbol, quantity: Quantity, price: Price) -> Self {
        Self {
            client_order_id: None,
            symbol,
            side: Side::Buy,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
        }
    }

    /// 지정가 매도 주문을 생성합니다.
    pub fn limit_sell(symbol: Symbol, quantity: Quantity, price: Price) -> Self {
        Self {
            side: Side::Sell,
            ..Self::limit_buy(symbol, quantity, price)
        }
    }

    /// 클라이언트 주문 ID를 설정합니다.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_order_id = Some(client_id.into());
        self
    }

    /// 요청의 형식적 유효성을 검증합니다.
    ///
    /// # Errors
    ///
    /// - `InvalidSymbol`: 종목 형식 오류
    /// - `InvalidState`: 수량이 0 이하이거나, 지정가 여부와 가격 유무가 맞지 않음
    pub fn validate(&self) -> KsetResult<()> {
        self.symbol.validate()?;

        if self.quantity <= Decimal::ZERO {
            return Err(ErrorRecord::invalid_state(format!(
                "주문 수량은 0보다 커야 합니다: {}",
                self.quantity
            )));
        }

        match (self.order_type, self.price) {
            (OrderType::Limit, None) => Err(ErrorRecord::invalid_state(
                "지정가 주문에는 가격이 필요합니다",
            )),
            (OrderType::Limit, Some(price)) if price <= Decimal::ZERO => Err(
                ErrorRecord::invalid_state(format!("지정가는 0보다 커야 합니다: {}", price)),
            ),
            (OrderType::Market, Some(_)) => Err(ErrorRecord::invalid_state(
                "시장가 주문에는 가격을 지정할 수 없습니다",
            )),
            _ => Ok(()),
        }
    }
}

/// 증권사의 주문 접수 응답.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAck {
    /// 증권사 주문번호
    pub provider_order_id: String,
    /// 접수 시각
    pub accepted_at: DateTime<Utc>,
}

/// 증권사 조회/취소에 사용하는 주문 식별 정보.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderQuery {
    /// 클라이언트 주문 ID
    pub client_order_id: String,
    /// 증권사 주문번호 (접수 전이면 없음)
    pub provider_order_id: Option<String>,
    /// 종목
    pub symbol: Symbol,
}

/// 증권사가 보고한 주문 상태 (조회 또는 스트림).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderState {
    /// 증권사 주문번호
    pub provider_order_id: String,
    /// 클라이언트 주문 ID (증권사가 되돌려주는 경우)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
    /// 증권사가 판단한 상태
    pub status: OrderStatus,
    /// 누적 체결 수량
    pub filled_quantity: Quantity,
    /// 평균 체결가
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_fill_price: Option<Price>,
    /// 증권사 기준 갱신 시각
    pub updated_at: DateTime<Utc>,
}

/// 업데이트가 폐기된 이유.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// 이미 최종 상태
    Terminal,
    /// 기록된 체결 수량보다 작음 (순서 역전)
    StaleFill,
    /// 주문 수량을 초과하는 체결
    Overfill,
    /// 체결 변화 없이 더 오래된 타임스탬프
    Outdated,
    /// 변화 없음
    Duplicate,
    /// 다른 증권사 주문번호
    ForeignOrder,
}

/// 업데이트 적용 결과.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// 적용됨 (이전 상태 포함)
    Applied {
        /// 적용 전 상태
        previous: OrderStatus,
    },
    /// 폐기됨
    Discarded(DiscardReason),
}

impl UpdateOutcome {
    /// 적용되었는지 확인합니다.
    pub fn is_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied { .. })
    }
}

/// 하나의 매매 의도와 그 체결 상태.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// 클라이언트 주문 ID (세션 내 고유, 불변)
    pub client_order_id: String,
    /// 증권사 주문번호 (접수 후 한 번만 설정)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_order_id: Option<String>,
    /// 거래 종목
    pub symbol: Symbol,
    /// 주문 방향
    pub side: Side,
    /// 주문 유형
    pub order_type: OrderType,
    /// 주문 수량
    pub quantity: Quantity,
    /// 지정가
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Price>,
    /// 누적 체결 수량
    pub filled_quantity: Quantity,
    /// 평균 체결가
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_fill_price: Option<Price>,
    /// 현재 상태
    pub status: OrderStatus,
    /// 거부 사유
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    /// 생성 시각
    pub created_at: DateTime<Utc>,
    /// 마지막 변경 시각
    pub updated_at: DateTime<Utc>,
    /// 마지막으로 적용된 증권사 업데이트 시각
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_updated_at: Option<DateTime<Utc>>,
}

impl Order {
    /// 요청으로부터 `PendingSubmit` 상태의 주문을 생성합니다.
    pub fn from_request(request: OrderRequest, client_order_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            client_order_id: client_order_id.into(),
            provider_order_id: None,
            symbol: request.symbol,
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            price: request.price,
            filled_quantity: Decimal::ZERO,
            average_fill_price: None,
            status: OrderStatus::PendingSubmit,
            error: None,
            created_at: now,
            updated_at: now,
            provider_updated_at: None,
        }
    }

    /// 남은 체결 수량.
    pub fn remaining_quantity(&self) -> Quantity {
        self.quantity - self.filled_quantity
    }

    /// 최종 상태인지 확인합니다.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 증권사 조회용 식별 정보.
    pub fn query(&self) -> OrderQuery {
        OrderQuery {
            client_order_id: self.client_order_id.clone(),
            provider_order_id: self.provider_order_id.clone(),
            symbol: self.symbol.clone(),
        }
    }

    /// 증권사 접수를 기록합니다 (`PendingSubmit` → `Submitted`).
    ///
    /// # Errors
    ///
    /// `PendingSubmit`이 아니거나 이미 다른 주문번호가 기록되어 있으면 `InvalidState`.
    pub fn mark_submitted(&mut self, ack: &OrderAck) -> KsetResult<()> {
        if self.status != OrderStatus::PendingSubmit {
            return Err(ErrorRecord::invalid_state(format!(
                "주문 {}은(는) {} 상태에서 접수될 수 없습니다",
                self.client_order_id, self.status
            )));
        }
        if let Some(existing) = &self.provider_order_id {
            if existing != &ack.provider_order_id {
                return Err(ErrorRecord::invalid_state(format!(
                    "주문 {}의 증권사 주문번호는 이미 {}입니다",
                    self.client_order_id, existing
                )));
            }
        }

        self.provider_order_id = Some(ack.provider_order_id.clone());
        self.status = OrderStatus::Submitted;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// 거부를 기록합니다.
    pub fn mark_rejected(&mut self, error: ErrorRecord) -> KsetResult<()> {
        if !self.status.can_transition_to(OrderStatus::Rejected) {
            return Err(self.transition_error(OrderStatus::Rejected));
        }
        self.status = OrderStatus::Rejected;
        self.error = Some(error);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// 취소 확인을 기록합니다.
    ///
    /// # Errors
    ///
    /// `Submitted`/`PartiallyFilled`가 아니면 `InvalidState`.
    pub fn mark_cancelled(&mut self) -> KsetResult<()> {
        if !self.status.is_cancellable() {
            return Err(self.transition_error(OrderStatus::Cancelled));
        }
        self.status = OrderStatus::Cancelled;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// 증권사 업데이트를 멱등적으로 병합합니다.
    ///
    /// - 최종 상태의 주문에는 적용하지 않습니다.
    /// - 체결 수량이 기록보다 작거나 주문 수량을 넘으면 폐기합니다.
    /// - 체결 수량이 같으면 더 최신 타임스탬프만 반영합니다.
    pub fn apply_update(&mut self, update: &OrderState) -> UpdateOutcome {
        if self.is_terminal() {
            return UpdateOutcome::Discarded(DiscardReason::Terminal);
        }
        if let Some(existing) = &self.provider_order_id {
            if existing != &update.provider_order_id {
                return UpdateOutcome::Discarded(DiscardReason::ForeignOrder);
            }
        }
        if update.filled_quantity > self.quantity || update.filled_quantity < Decimal::ZERO {
            return UpdateOutcome::Discarded(DiscardReason::Overfill);
        }
        if update.filled_quantity < self.filled_quantity {
            return UpdateOutcome::Discarded(DiscardReason::StaleFill);
        }

        let newer = self
            .provider_updated_at
            .map_or(true, |last| update.updated_at >= last);
        let fill_advanced = update.filled_quantity > self.filled_quantity;
        if !fill_advanced && !newer {
            return UpdateOutcome::Discarded(DiscardReason::Outdated);
        }

        let previous = self.status;
        let mut changed = false;

        if self.provider_order_id.is_none() {
            self.provider_order_id = Some(update.provider_order_id.clone());
            changed = true;
        }

        if fill_advanced {
            self.filled_quantity = update.filled_quantity;
            if update.average_fill_price.is_some() {
                self.average_fill_price = update.average_fill_price;
            }
            changed = true;
        } else if update.average_fill_price.is_some()
            && update.average_fill_price != self.average_fill_price
        {
            self.average_fill_price = update.average_fill_price;
            changed = true;
        }

        let next = if self.filled_quantity == self.quantity {
            OrderStatus::Filled
        } else if newer
            && matches!(update.status, OrderStatus::Cancelled | OrderStatus::Rejected)
        {
            update.status
        } else if self.filled_quantity > Decimal::ZERO {
            OrderStatus::PartiallyFilled
        } else {
            OrderStatus::Submitted
        };

        if next != self.status && self.status.can_transition_to(next) {
            if next == OrderStatus::Rejected && self.error.is_none() {
                self.error = Some(ErrorRecord::provider(
                    "REJECTED",
                    "증권사가 주문을 거부했습니다",
                    false,
                ));
            }
            self.status = next;
            changed = true;
        }

        if !changed {
            return UpdateOutcome::Discarded(DiscardReason::Duplicate);
        }

        if newer {
            self.provider_updated_at = Some(update.updated_at);
        }
        self.updated_at = Utc::now();
        UpdateOutcome::Applied { previous }
    }

    fn transition_error(&self, next: OrderStatus) -> ErrorRecord {
        ErrorRecord::invalid_state(format!(
            "주문 {}: {} → {} 전이는 허용되지 않습니다",
            self.client_order_id, self.status, next
        ))
    }
}
