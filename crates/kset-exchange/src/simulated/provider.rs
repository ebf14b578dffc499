//! 메모리 내 시뮬레이션 증권사.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use kset_core::{
    blend_average_price, Balance, ErrorKind, ErrorRecord, KsetResult, MarketSnapshot, OrderAck,
    OrderQuery, OrderRequest, OrderState, OrderStatus, OrderType, Position, Price, Quantity, Side,
    Symbol,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::feed::ProviderFeed;
use crate::traits::{AuthGrant, AuthRequest, Provider};

use super::broadcaster::FeedBroadcaster;

/// 시뮬레이션 대상 작업.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOperation {
    /// 인증
    Authenticate,
    /// 시세 조회
    FetchMarketData,
    /// 시세 스트림 열기
    StreamMarketData,
    /// 주문 제출
    SubmitOrder,
    /// 주문 취소
    CancelOrder,
    /// 주문 조회
    FetchOrder,
    /// 체결 스트림 열기
    StreamOrderUpdates,
    /// 잔고 조회
    FetchBalance,
    /// 보유 종목 조회
    FetchPositions,
    /// 세션 종료
    Close,
}

/// 시뮬레이션 증권사 설정.
#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    /// 증권사 식별자
    pub name: String,
    /// 초기 예수금 (원)
    pub initial_cash: Decimal,
    /// 스트림 버퍼 크기
    pub stream_buffer: usize,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            name: "sim".to_string(),
            initial_cash: dec!(10_000_000),
            stream_buffer: 256,
        }
    }
}

impl SimulatedConfig {
    /// 초기 예수금을 설정합니다.
    pub fn with_initial_cash(mut self, cash: Decimal) -> Self {
        self.initial_cash = cash;
        self
    }

    /// 증권사 식별자를 설정합니다.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[derive(Debug, Clone)]
struct SimOrder {
    request: OrderRequest,
    state: OrderState,
}

impl SimOrder {
    fn remaining(&self) -> Quantity {
        self.request.quantity - self.state.filled_quantity
    }

    fn is_open(&self) -> bool {
        !self.state.status.is_terminal()
    }
}

#[derive(Debug, Default)]
struct SimState {
    credentials_valid: bool,
    authenticated: bool,
    market_closed: bool,
    cash: Decimal,
    prices: HashMap<Symbol, MarketSnapshot>,
    holdings: HashMap<Symbol, Position>,
    orders: HashMap<String, SimOrder>,
    next_order_no: u64,
    failures: HashMap<SimOperation, VecDeque<ErrorRecord>>,
    latency: HashMap<SimOperation, Duration>,
    calls: HashMap<SimOperation, u32>,
    market_feeds: HashMap<Symbol, FeedBroadcaster<MarketSnapshot>>,
    order_feed: FeedBroadcaster<OrderState>,
}

impl SimState {
    fn require_auth(&self) -> KsetResult<()> {
        if self.authenticated {
            Ok(())
        } else {
            Err(ErrorRecord::authentication("인증되지 않은 세션입니다").with_native_code("EGW00123"))
        }
    }

    fn require_symbol(&self, symbol: &Symbol) -> KsetResult<&MarketSnapshot> {
        symbol.validate()?;
        self.prices.get(symbol).ok_or_else(|| {
            ErrorRecord::invalid_symbol(format!("존재하지 않는 종목코드입니다: {}", symbol))
                .with_native_code("APBK1662")
        })
    }

    fn reserved_cash(&self) -> Decimal {
        self.orders
            .values()
            .filter(|o| o.is_open() && o.request.side == Side::Buy)
            .map(|o| o.remaining() * self.reference_price(&o.request))
            .sum()
    }

    fn reserved_quantity(&self, symbol: &Symbol) -> Quantity {
        self.orders
            .values()
            .filter(|o| o.is_open() && o.request.side == Side::Sell && &o.request.symbol == symbol)
            .map(SimOrder::remaining)
            .sum()
    }

    fn reference_price(&self, request: &OrderRequest) -> Price {
        match (request.order_type, request.price) {
            (OrderType::Limit, Some(price)) => price,
            _ => self
                .prices
                .get(&request.symbol)
                .map(|s| s.last)
                .unwrap_or(Decimal::ZERO),
        }
    }

    fn find_order_key(&self, query: &OrderQuery) -> Option<String> {
        if let Some(id) = &query.provider_order_id {
            if self.orders.contains_key(id) {
                return Some(id.clone());
            }
        }
        self.orders
            .iter()
            .find(|(_, o)| o.state.client_order_id.as_deref() == Some(query.client_order_id.as_str()))
            .map(|(id, _)| id.clone())
    }
}

/// 테스트와 데모를 위한 메모리 내 증권사.
///
/// 장애 주입(`fail_next`), 지연(`set_latency`), 자격증명 만료,
/// 전송 계층 단절, 체결 발생을 직접 제어할 수 있습니다.
#[derive(Clone)]
pub struct SimulatedProvider {
    config: SimulatedConfig,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedProvider {
    /// 새 시뮬레이션 증권사를 생성합니다.
    pub fn new(config: SimulatedConfig) -> Self {
        let state = SimState {
            credentials_valid: true,
            cash: config.initial_cash,
            next_order_no: 1,
            ..Default::default()
        };
        Self {
            config,
            state: Arc::new(Mutex::new(state)),
        }
    }

    // === 시나리오 제어 ===

    /// 종목 시세를 등록하고 열린 스트림에 전송합니다.
    pub async fn publish_snapshot(&self, snapshot: MarketSnapshot) {
        let mut state = self.state.lock().await;
        if let Some(feeds) = state.market_feeds.get_mut(&snapshot.symbol) {
            feeds.broadcast(&snapshot);
        }
        state.prices.insert(snapshot.symbol.clone(), snapshot);
    }

    /// 현재가만 바꿔 전송합니다. 등록되지 않은 종목이면 새로 등록합니다.
    pub async fn publish_price(&self, symbol: &Symbol, last: Price) -> MarketSnapshot {
        let next = {
            let state = self.state.lock().await;
            match state.prices.get(symbol) {
                Some(current) => current.next_tick(last, Decimal::ONE),
                None => MarketSnapshot::from_last(symbol.clone(), last),
            }
        };
        self.publish_snapshot(next.clone()).await;
        next
    }

    /// 보유 종목을 설정합니다.
    pub async fn set_holding(&self, symbol: &Symbol, quantity: Quantity, average_price: Price) {
        let mut state = self.state.lock().await;
        let current = state.prices.get(symbol).map(|s| s.last).unwrap_or(average_price);
        state.holdings.insert(
            symbol.clone(),
            Position::new(symbol.clone(), quantity, average_price, current),
        );
    }

    /// 장 운영 여부를 설정합니다.
    pub async fn set_market_closed(&self, closed: bool) {
        self.state.lock().await.market_closed = closed;
    }

    /// 자격증명을 만료시킵니다. 이후 인증과 인증이 필요한 호출은 실패합니다.
    pub async fn expire_credentials(&self) {
        let mut state = self.state.lock().await;
        state.credentials_valid = false;
        state.authenticated = false;
    }

    /// 자격증명을 복구합니다.
    pub async fn restore_credentials(&self) {
        self.state.lock().await.credentials_valid = true;
    }

    /// 다음 `op` 호출을 `error`로 실패시킵니다. 여러 번 호출하면 순서대로 쌓입니다.
    pub async fn fail_next(&self, op: SimOperation, error: ErrorRecord) {
        self.state
            .lock()
            .await
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// 다음 `times`번의 `op` 호출을 실패시킵니다.
    pub async fn fail_times(&self, op: SimOperation, times: usize, error: ErrorRecord) {
        let mut state = self.state.lock().await;
        let queue = state.failures.entry(op).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    /// `op` 호출에 응답 지연을 둡니다.
    pub async fn set_latency(&self, op: SimOperation, latency: Duration) {
        self.state.lock().await.latency.insert(op, latency);
    }

    /// 전송 계층 단절을 흉내 냅니다. 열린 모든 스트림이 장애로 끝납니다.
    pub async fn drop_transport(&self) {
        let mut state = self.state.lock().await;
        let error = ErrorRecord::provider("TRANSPORT", "연결이 끊어졌습니다", true);
        state.order_feed.fault_all(&error);
        for feeds in state.market_feeds.values_mut() {
            feeds.fault_all(&error);
        }
        info!(provider = %self.config.name, "시뮬레이션 전송 계층 단절");
    }

    /// 한 종목의 시세 스트림만 장애로 끝냅니다.
    pub async fn fault_market_stream(&self, symbol: &Symbol, error: ErrorRecord) {
        let mut state = self.state.lock().await;
        if let Some(feeds) = state.market_feeds.get_mut(symbol) {
            feeds.fault_all(&error);
        }
    }

    /// 주문을 체결시키고 체결 스트림에 알립니다.
    ///
    /// # Errors
    ///
    /// 알 수 없는 주문, 최종 상태 주문, 잔량 초과 체결이면 `InvalidState`.
    pub async fn fill_order(
        &self,
        provider_order_id: &str,
        quantity: Quantity,
        price: Price,
    ) -> KsetResult<OrderState> {
        let mut state = self.state.lock().await;
        let order = state
            .orders
            .get(provider_order_id)
            .cloned()
            .ok_or_else(|| ErrorRecord::invalid_state(format!("주문 없음: {}", provider_order_id)))?;
        if !order.is_open() {
            return Err(ErrorRecord::invalid_state("이미 종료된 주문입니다"));
        }
        if quantity <= Decimal::ZERO || quantity > order.remaining() {
            return Err(ErrorRecord::invalid_state(format!(
                "체결 수량 {}이(가) 잔량 {}을(를) 벗어납니다",
                quantity,
                order.remaining()
            )));
        }

        let filled = order.state.filled_quantity + quantity;
        let average = blend_average_price(
            order.state.average_fill_price,
            order.state.filled_quantity,
            quantity,
            price,
        );
        let next = OrderState {
            status: if filled == order.request.quantity {
                OrderStatus::Filled
            } else {
                OrderStatus::PartiallyFilled
            },
            filled_quantity: filled,
            average_fill_price: Some(average),
            updated_at: Utc::now(),
            ..order.state.clone()
        };

        let symbol = order.request.symbol.clone();
        let notional = quantity * price;
        match order.request.side {
            Side::Buy => {
                state.cash -= notional;
                let current = state.prices.get(&symbol).map(|s| s.last).unwrap_or(price);
                let holding = state
                    .holdings
                    .entry(symbol.clone())
                    .or_insert_with(|| Position::new(symbol.clone(), Decimal::ZERO, price, current));
                holding.average_price =
                    blend_average_price(Some(holding.average_price), holding.quantity, quantity, price);
                holding.quantity += quantity;
            }
            Side::Sell => {
                state.cash += notional;
                if let Some(holding) = state.holdings.get_mut(&symbol) {
                    holding.quantity -= quantity;
                }
                state.holdings.retain(|_, h| h.quantity > Decimal::ZERO);
            }
        }

        if let Some(stored) = state.orders.get_mut(provider_order_id) {
            stored.state = next.clone();
        }
        state.order_feed.broadcast(&next);
        debug!(order_id = provider_order_id, filled = %filled, "시뮬레이션 체결");
        Ok(next)
    }

    /// 임의의 주문 상태를 체결 스트림에 그대로 보냅니다 (순서 역전/중복 재현용).
    pub async fn emit_order_state(&self, order_state: OrderState) {
        self.state.lock().await.order_feed.broadcast(&order_state);
    }

    // === 관찰 ===

    /// `op`가 호출된 횟수.
    pub async fn call_count(&self, op: SimOperation) -> u32 {
        self.state.lock().await.calls.get(&op).copied().unwrap_or(0)
    }

    /// 종목별로 열려 있는 시세 스트림 수.
    pub async fn open_market_streams(&self, symbol: &Symbol) -> usize {
        self.state
            .lock()
            .await
            .market_feeds
            .get(symbol)
            .map_or(0, FeedBroadcaster::open_count)
    }

    /// 열려 있는 체결 스트림 수.
    pub async fn open_order_streams(&self) -> usize {
        self.state.lock().await.order_feed.open_count()
    }

    /// 인증된 상태인지 확인합니다.
    pub async fn is_authenticated(&self) -> bool {
        self.state.lock().await.authenticated
    }

    /// 클라이언트 주문 ID로 증권사 측 주문 상태를 찾습니다.
    pub async fn order_by_client_id(&self, client_order_id: &str) -> Option<OrderState> {
        self.state
            .lock()
            .await
            .orders
            .values()
            .find(|o| o.state.client_order_id.as_deref() == Some(client_order_id))
            .map(|o| o.state.clone())
    }

    /// 호출 횟수를 세고, 지연과 주입된 장애를 적용합니다.
    async fn enter(&self, op: SimOperation) -> KsetResult<()> {
        let (latency, failure) = {
            let mut state = self.state.lock().await;
            *state.calls.entry(op).or_insert(0) += 1;
            let failure = state.failures.get_mut(&op).and_then(VecDeque::pop_front);
            (state.latency.get(&op).copied(), failure)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl Default for SimulatedProvider {
    fn default() -> Self {
        Self::new(SimulatedConfig::default())
    }
}

#[async_trait]
impl Provider for SimulatedProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn authenticate(&self, request: &AuthRequest) -> KsetResult<AuthGrant> {
        self.enter(SimOperation::Authenticate).await?;
        request.credentials.validate()?;

        let mut state = self.state.lock().await;
        if !state.credentials_valid {
            return Err(ErrorRecord::authentication("기간이 만료된 token 입니다")
                .with_native_code("EGW00123"));
        }
        state.authenticated = true;
        Ok(AuthGrant {
            expires_at: Some(Utc::now() + ChronoDuration::hours(24)),
        })
    }

    async fn fetch_market_data(&self, symbol: &Symbol) -> KsetResult<MarketSnapshot> {
        self.enter(SimOperation::FetchMarketData).await?;
        let state = self.state.lock().await;
        state.require_auth()?;
        state.require_symbol(symbol).cloned()
    }

    async fn stream_market_data(&self, symbol: &Symbol) -> KsetResult<ProviderFeed<MarketSnapshot>> {
        self.enter(SimOperation::StreamMarketData).await?;
        let mut state = self.state.lock().await;
        state.require_auth()?;
        state.require_symbol(symbol)?;
        let buffer = self.config.stream_buffer;
        Ok(state
            .market_feeds
            .entry(symbol.clone())
            .or_default()
            .subscribe(buffer))
    }

    async fn submit_order(&self, request: &OrderRequest) -> KsetResult<OrderAck> {
        self.enter(SimOperation::SubmitOrder).await?;
        request.validate()?;

        let mut state = self.state.lock().await;
        state.require_auth()?;
        state.require_symbol(&request.symbol)?;
        if state.market_closed {
            return Err(ErrorRecord::market_closed("장종료 되었습니다").with_native_code("APBK0919"));
        }

        match request.side {
            Side::Buy => {
                let cost = request.quantity * state.reference_price(request);
                let available = state.cash - state.reserved_cash();
                if cost > available {
                    return Err(ErrorRecord::insufficient_funds(format!(
                        "주문가능금액을 초과 했습니다 (필요 {}, 가능 {})",
                        cost, available
                    ))
                    .with_native_code("APBK0952"));
                }
            }
            Side::Sell => {
                let held = state
                    .holdings
                    .get(&request.symbol)
                    .map_or(Decimal::ZERO, |h| h.quantity);
                let sellable = held - state.reserved_quantity(&request.symbol);
                if request.quantity > sellable {
                    return Err(ErrorRecord::insufficient_funds(format!(
                        "매도가능수량을 초과 했습니다 (가능 {})",
                        sellable
                    ))
                    .with_native_code("APBK0400"));
                }
            }
        }

        let order_no = format!("{:010}", state.next_order_no);
        state.next_order_no += 1;
        let now = Utc::now();
        state.orders.insert(
            order_no.clone(),
            SimOrder {
                request: request.clone(),
                state: OrderState {
                    provider_order_id: order_no.clone(),
                    client_order_id: request.client_order_id.clone(),
                    status: OrderStatus::Submitted,
                    filled_quantity: Decimal::ZERO,
                    average_fill_price: None,
                    updated_at: now,
                },
            },
        );
        debug!(order_id = %order_no, symbol = %request.symbol, "시뮬레이션 주문 접수");
        Ok(OrderAck {
            provider_order_id: order_no,
            accepted_at: now,
        })
    }

    async fn cancel_order(&self, query: &OrderQuery) -> KsetResult<()> {
        self.enter(SimOperation::CancelOrder).await?;
        let mut state = self.state.lock().await;
        state.require_auth()?;
        let key = state.find_order_key(query).ok_or_else(|| {
            ErrorRecord::invalid_state(format!("주문을 찾을 수 없습니다: {}", query.client_order_id))
        })?;

        let cancelled = match state.orders.get_mut(&key) {
            Some(order) if order.is_open() => {
                order.state.status = OrderStatus::Cancelled;
                order.state.updated_at = Utc::now();
                order.state.clone()
            }
            _ => {
                return Err(ErrorRecord::new(
                    ErrorKind::InvalidState,
                    "정정/취소할 수량이 없습니다",
                )
                .with_native_code("APBK0344"))
            }
        };
        state.order_feed.broadcast(&cancelled);
        Ok(())
    }

    async fn fetch_order(&self, query: &OrderQuery) -> KsetResult<OrderState> {
        self.enter(SimOperation::FetchOrder).await?;
        let state = self.state.lock().await;
        state.require_auth()?;
        state
            .find_order_key(query)
            .and_then(|key| state.orders.get(&key))
            .map(|o| o.state.clone())
            .ok_or_else(|| {
                ErrorRecord::invalid_state(format!("주문을 찾을 수 없습니다: {}", query.client_order_id))
            })
    }

    async fn stream_order_updates(&self) -> KsetResult<ProviderFeed<OrderState>> {
        self.enter(SimOperation::StreamOrderUpdates).await?;
        let mut state = self.state.lock().await;
        state.require_auth()?;
        let buffer = self.config.stream_buffer;
        Ok(state.order_feed.subscribe(buffer))
    }

    async fn fetch_balance(&self) -> KsetResult<Balance> {
        self.enter(SimOperation::FetchBalance).await?;
        let state = self.state.lock().await;
        state.require_auth()?;
        let holdings_value: Decimal = state
            .holdings
            .values()
            .map(|h| {
                let last = state.prices.get(&h.symbol).map_or(h.current_price, |s| s.last);
                last * h.quantity
            })
            .sum();
        let mut balance = Balance::krw(state.cash, state.cash - state.reserved_cash());
        balance.total_evaluation = Some(state.cash + holdings_value);
        Ok(balance)
    }

    async fn fetch_positions(&self) -> KsetResult<Vec<Position>> {
        self.enter(SimOperation::FetchPositions).await?;
        let state = self.state.lock().await;
        state.require_auth()?;
        let mut positions: Vec<Position> = state
            .holdings
            .values()
            .map(|h| {
                let mut position = h.clone();
                if let Some(snapshot) = state.prices.get(&h.symbol) {
                    position.current_price = snapshot.last;
                }
                position.available_quantity = h.quantity - state.reserved_quantity(&h.symbol);
                position
            })
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn close(&self) -> KsetResult<()> {
        self.enter(SimOperation::Close).await?;
        let mut state = self.state.lock().await;
        state.authenticated = false;
        state.order_feed.close_all();
        for feeds in state.market_feeds.values_mut() {
            feeds.close_all();
        }
        Ok(())
    }
}
