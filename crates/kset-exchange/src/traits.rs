//! 증권사 trait 정의.
//!
//! 세션 엔진은 [`Provider`]를 통해서만 증권사와 통신합니다. 구현체는
//! 증권사 고유 에러를 경계를 넘기 전에 [`ErrorRecord`]로 정규화해야 합니다.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kset_core::{
    Balance, Credentials, Environment, KsetResult, MarketSnapshot, OrderAck, OrderQuery,
    OrderRequest, OrderState, Position, Symbol,
};

use crate::feed::ProviderFeed;

/// 인증 요청.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    /// 자격증명
    pub credentials: Credentials,
    /// 실행 환경
    pub environment: Environment,
    /// 모의투자 여부
    pub demo: bool,
}

/// 인증 결과.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthGrant {
    /// 세션(토큰) 만료 시각
    pub expires_at: Option<DateTime<Utc>>,
}

/// 증권사 기능 인터페이스.
///
/// 모든 작업은 `ErrorRecord`로 실패하며, 각 작업 문서에 발생 가능한 분류를 적습니다.
/// `RateLimit`/`Timeout`은 모든 네트워크 작업에서 발생할 수 있습니다.
#[async_trait]
pub trait Provider: Send + Sync {
    /// 증권사 식별자 (예: "kis").
    fn name(&self) -> &str;

    /// 인증하고 세션을 엽니다.
    ///
    /// 에러: `Authentication`, `Provider`
    async fn authenticate(&self, request: &AuthRequest) -> KsetResult<AuthGrant>;

    // === 시세 ===

    /// 현재 시세를 조회합니다.
    ///
    /// 에러: `InvalidSymbol`, `MarketClosed`, `Provider`
    async fn fetch_market_data(&self, symbol: &Symbol) -> KsetResult<MarketSnapshot>;

    /// 실시간 시세 스트림을 엽니다.
    ///
    /// 스트림 중 장애는 `FeedMessage::Fault`로 전달됩니다.
    /// 에러: `InvalidSymbol`, `Provider`
    async fn stream_market_data(&self, symbol: &Symbol) -> KsetResult<ProviderFeed<MarketSnapshot>>;

    // === 주문 ===

    /// 주문을 제출합니다.
    ///
    /// 에러: `MarketClosed`, `InsufficientFunds`, `InvalidSymbol`, `Provider`
    async fn submit_order(&self, request: &OrderRequest) -> KsetResult<OrderAck>;

    /// 주문 취소를 요청합니다. 성공은 증권사의 취소 확인을 뜻합니다.
    ///
    /// 에러: `InvalidState` (이미 체결/취소됨), `MarketClosed`, `Provider`
    async fn cancel_order(&self, query: &OrderQuery) -> KsetResult<()>;

    /// 주문 상태를 조회합니다.
    ///
    /// 에러: `InvalidState` (알 수 없는 주문), `Provider`
    async fn fetch_order(&self, query: &OrderQuery) -> KsetResult<OrderState>;

    /// 계좌의 주문 체결 스트림을 엽니다.
    ///
    /// 이 스트림의 단절은 전송 계층 단절로 간주됩니다.
    async fn stream_order_updates(&self) -> KsetResult<ProviderFeed<OrderState>>;

    // === 계좌 ===

    /// 예수금을 조회합니다.
    async fn fetch_balance(&self) -> KsetResult<Balance>;

    /// 보유 종목을 조회합니다.
    async fn fetch_positions(&self) -> KsetResult<Vec<Position>>;

    /// 세션을 닫습니다 (토큰 폐기 등). 실패해도 호출자는 무시합니다.
    async fn close(&self) -> KsetResult<()> {
        Ok(())
    }
}
