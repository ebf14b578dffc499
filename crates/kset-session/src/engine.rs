//! 거래 세션.
//!
//! 세션 관리자, 증권사 호출기, 주문 장부, 시세 허브를 묶은 공개 진입점입니다.
//!
//! # 예시
//!
//! ```rust,ignore
//! let provider: Arc<dyn Provider> = Arc::new(SimulatedProvider::default());
//! let session = TradingSession::new(provider, &provider_config, &SessionConfig::default());
//! session.connect().await?;
//!
//! let order = session
//!     .create_order(OrderRequest::limit_buy(Symbol::kr("005930"), dec!(10), dec!(80000)))
//!     .await?;
//! let _orders = session.subscribe_orders(|event: &OrderEvent| println!("{:?}", event));
//! ```

use kset_core::{
    session_span, Balance, ConnectionState, ErrorKind, ErrorRecord, KsetResult, MarketSnapshot,
    Order, OrderRequest, OrderState, PortfolioSummary, Position, ProviderConfig, SessionConfig,
    SessionInfo, SessionKey, Symbol,
};
use kset_exchange::{FeedMessage, Provider, ProviderFeed, RateLimiter, RetryConfig};
use futures::future::join_all;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use crate::gateway::{Gateway, RetryPolicy};
use crate::listener::{Listener, ListenerHandle};
use crate::market_data::{FeedHealth, MarketDataEvent, MarketDataHub, MarketDataSubscription};
use crate::orders::{generate_client_order_id, OrderEvent, OrderTracker};
use crate::registry::SessionRegistry;
use crate::session::{SessionEvent, SessionManager, SessionSettings};

/// 주문 이벤트 구독 핸들.
pub type OrderSubscription = ListenerHandle<OrderEvent>;

/// 세션 이벤트 구독 핸들.
pub type SessionSubscription = ListenerHandle<SessionEvent>;

struct SessionCore {
    provider: Arc<dyn Provider>,
    session: SessionManager,
    gateway: Arc<Gateway>,
    orders: OrderTracker,
    hub: Arc<MarketDataHub>,
    order_pump: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SessionCore {
    async fn open_order_stream(&self, timeout: Duration) -> KsetResult<ProviderFeed<OrderState>> {
        let provider = self.provider.clone();
        self.gateway
            .call("stream_order_updates", timeout, RetryPolicy::Transient, || {
                provider.stream_order_updates()
            })
            .await
    }

    /// 재인증하고 체결 스트림을 다시 연 뒤, 놓친 업데이트를 조회로 맞춥니다.
    async fn restore(&self, cause: ErrorRecord) -> KsetResult<ProviderFeed<OrderState>> {
        self.session.recover(&cause).await?;
        let feed = self.open_order_stream(self.gateway.default_timeout()).await?;
        self.reconcile_active().await;
        Ok(feed)
    }

    async fn reconcile_active(&self) {
        let polls = self.orders.active().into_iter().map(|order| async move {
            let query = order.query();
            let polled = self
                .gateway
                .call(
                    "fetch_order",
                    self.gateway.default_timeout(),
                    RetryPolicy::Transient,
                    || self.provider.fetch_order(&query),
                )
                .await;
            match polled {
                Ok(state) => {
                    self.orders.reconcile(&order.client_order_id, &state);
                }
                Err(error) => debug!(
                    client_order_id = %order.client_order_id,
                    error = %error,
                    "재연결 후 주문 조회 실패"
                ),
            }
        });
        join_all(polls).await;
    }

    /// 세션을 닫고 모든 스트림과 리스너를 정리합니다.
    async fn shutdown(&self, lost: Option<ErrorRecord>, abort_pump: bool) {
        self.session.cancel_token().cancel();
        self.hub.shutdown().await;
        if let Some(pump) = self.order_pump.lock().await.take() {
            if abort_pump {
                pump.abort();
            }
        }
        self.session.close(lost).await;
        self.orders.listeners().clear();
    }
}

impl Drop for SessionCore {
    fn drop(&mut self) {
        self.session.cancel_token().cancel();
        if let Some(pump) = self.order_pump.get_mut().take() {
            pump.abort();
        }
    }
}

async fn run_order_updates(core: Weak<SessionCore>, mut feed: ProviderFeed<OrderState>) {
    let Some(cancel) = core.upgrade().map(|c| c.session.cancel_token()) else {
        return;
    };

    loop {
        let error = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                message = feed.next() => match message {
                    Some(FeedMessage::Item(update)) => {
                        let Some(core) = core.upgrade() else {
                            return;
                        };
                        core.orders.apply_update(&update);
                    }
                    Some(FeedMessage::Fault(error)) => break error,
                    None => break ErrorRecord::provider("FEED_CLOSED", "체결 스트림이 끊어졌습니다", true),
                },
            }
        };
        if cancel.is_cancelled() {
            return;
        }

        let Some(core) = core.upgrade() else {
            return;
        };
        match core.restore(error).await {
            Ok(next) => feed = next,
            Err(error) => {
                if !cancel.is_cancelled() {
                    warn!(error = %error, "재연결 실패, 세션 종료");
                    core.shutdown(Some(error), false).await;
                }
                return;
            }
        }
    }
}

/// 증권사 하나와 계좌 하나에 묶인 거래 세션.
///
/// 복제본과 `with_timeout` 뷰는 같은 세션을 공유합니다.
/// 모든 복제본이 드롭되면 진행 중인 스트림이 닫힙니다.
#[derive(Clone)]
pub struct TradingSession {
    core: Arc<SessionCore>,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for TradingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradingSession")
            .field("provider", &self.core.provider.name())
            .field("state", &self.core.session.state())
            .field("timeout", &self.timeout())
            .finish()
    }
}

impl TradingSession {
    /// 새 세션을 생성합니다.
    ///
    /// 세션 전용 등록부를 씁니다. 같은 계좌로 여러 세션을 만들 수 있는 곳에서는
    /// [`TradingSession::with_registry`]로 등록부를 공유하세요.
    pub fn new(
        provider: Arc<dyn Provider>,
        provider_config: &ProviderConfig,
        session_config: &SessionConfig,
    ) -> Self {
        Self::with_registry(provider, provider_config, session_config, SessionRegistry::new())
    }

    /// 공유 등록부로 세션을 생성합니다.
    pub fn with_registry(
        provider: Arc<dyn Provider>,
        provider_config: &ProviderConfig,
        session_config: &SessionConfig,
        registry: SessionRegistry,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::from_config(&provider_config.rate_limit));
        let settings = SessionSettings {
            enabled: provider_config.enabled,
            credentials: provider_config.credentials.clone(),
            environment: session_config.environment,
            demo: provider_config.demo,
            reconnect: session_config.reconnect.clone(),
            timeout: provider_config.timeout(),
        };
        let session = SessionManager::new(provider.clone(), limiter.clone(), registry, settings);
        let gateway = Arc::new(Gateway::new(
            provider.clone(),
            limiter,
            session.state_receiver(),
            session.cancel_token(),
            RetryConfig::new(provider_config.max_retry_attempts),
            provider_config.timeout(),
        ));
        let hub = Arc::new(MarketDataHub::new(
            gateway.clone(),
            RetryConfig::from_reconnect(&session_config.reconnect),
        ));

        Self {
            core: Arc::new(SessionCore {
                provider,
                session,
                gateway,
                orders: OrderTracker::default(),
                hub,
                order_pump: tokio::sync::Mutex::new(None),
            }),
            timeout: None,
        }
    }

    /// 호출마다 `timeout`을 마감 시간으로 쓰는 뷰를 만듭니다.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            core: self.core.clone(),
            timeout: Some(timeout),
        }
    }

    /// 시도별 마감 시간.
    pub fn timeout(&self) -> Duration {
        self.timeout
            .unwrap_or_else(|| self.core.gateway.default_timeout())
    }

    /// 증권사 식별자.
    pub fn provider_name(&self) -> &str {
        self.core.provider.name()
    }

    // ==================== 세션 ====================

    /// 인증하고 체결 스트림을 엽니다. 이미 연결되어 있으면 아무것도 하지 않습니다.
    ///
    /// # Errors
    ///
    /// - 자격증명 누락/거부: `Authentication` (세션은 `Disconnected`로 남음)
    /// - 같은 증권사/계좌의 세션이 이미 있음: `InvalidState`
    /// - 설정에서 비활성화된 증권사: `InvalidState`
    /// - 이미 닫힌 세션: `SessionClosed`
    pub async fn connect(&self) -> KsetResult<()> {
        let core = &self.core;
        core.session.connect().await?;

        let mut pump = core.order_pump.lock().await;
        if pump.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }
        match core.open_order_stream(self.timeout()).await {
            Ok(feed) => {
                let span = session_span!(
                    "order_updates",
                    core.provider.name(),
                    core.session.masked_account()
                );
                *pump = Some(tokio::spawn(
                    run_order_updates(Arc::downgrade(core), feed).instrument(span),
                ));
                Ok(())
            }
            Err(error) => {
                drop(pump);
                warn!(error = %error, "체결 스트림을 열 수 없어 연결을 되돌립니다");
                core.session.abort_connect().await;
                Err(error)
            }
        }
    }

    /// 세션을 닫습니다.
    ///
    /// 진행 중인 호출은 `SessionClosed`로 끝나고, 반환 이후에는 어떤 이벤트도 전달되지 않습니다.
    /// 여러 번 호출해도 안전합니다.
    pub async fn disconnect(&self) -> KsetResult<()> {
        self.core.shutdown(None, true).await;
        Ok(())
    }

    /// 연결 상태.
    pub fn state(&self) -> ConnectionState {
        self.core.session.state()
    }

    /// 연결 상태 변경 수신기.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.core.session.state_receiver()
    }

    /// 증권사와 계좌 식별자. 자격증명이 없으면 `None`.
    pub fn session_key(&self) -> Option<SessionKey> {
        self.core.session.key()
    }

    /// 세션 요약.
    pub fn info(&self) -> SessionInfo {
        self.core.session.info()
    }

    /// 세션 이벤트를 구독합니다.
    pub fn subscribe_session_events(
        &self,
        listener: impl Listener<SessionEvent>,
    ) -> SessionSubscription {
        let events = self.core.session.events();
        ListenerHandle::new(events, events.add(Arc::new(listener)))
    }

    // ==================== 시세 ====================

    /// 현재 시세를 조회합니다.
    pub async fn get_market_data(&self, symbol: &Symbol) -> KsetResult<MarketSnapshot> {
        symbol.validate()?;
        let provider = self.core.provider.clone();
        self.core
            .gateway
            .call("fetch_market_data", self.timeout(), RetryPolicy::Transient, || {
                provider.fetch_market_data(symbol)
            })
            .await
    }

    /// 실시간 시세를 구독합니다.
    ///
    /// 같은 종목의 두 번째 구독부터는 증권사 스트림을 새로 열지 않고,
    /// 마지막 시세를 즉시 받은 뒤 이후 시세를 함께 받습니다.
    pub async fn subscribe_market_data(
        &self,
        symbol: Symbol,
        listener: impl Listener<MarketDataEvent>,
    ) -> KsetResult<MarketDataSubscription> {
        self.core
            .hub
            .subscribe(symbol, Arc::new(listener), self.timeout())
            .await
    }

    /// 종목 스트림 상태. 구독이 없으면 `None`.
    pub async fn market_feed_health(&self, symbol: &Symbol) -> Option<FeedHealth> {
        self.core.hub.health(symbol).await
    }

    /// 종목 구독자 수.
    pub async fn market_subscriber_count(&self, symbol: &Symbol) -> usize {
        self.core.hub.subscriber_count(symbol).await
    }

    /// 구독 중인 종목.
    pub async fn subscribed_symbols(&self) -> Vec<Symbol> {
        self.core.hub.symbols().await
    }

    // ==================== 주문 ====================

    /// 주문을 제출합니다.
    ///
    /// 주문은 `PendingSubmit`으로 먼저 기록됩니다. 결과에 따라:
    /// - 접수: `Submitted`
    /// - 증권사 거부: `Rejected` (에러 기록 포함) 후 에러 반환
    /// - 마감 시간 초과나 세션 종료: 접수 여부를 알 수 없으므로 `PendingSubmit` 유지.
    ///   `get_order`로 증권사 상태를 조회해 맞출 수 있습니다.
    ///
    /// 마감 시간 초과는 중복 주문을 막기 위해 재시도하지 않습니다.
    pub async fn create_order(&self, request: OrderRequest) -> KsetResult<Order> {
        request.validate()?;
        self.core.gateway.ensure_open()?;

        let mut request = request;
        let client_order_id = request
            .client_order_id
            .get_or_insert_with(generate_client_order_id)
            .clone();
        let span = session_span!(
            "create_order",
            self.core.provider.name(),
            self.core.session.masked_account(),
            client_order_id
        );

        async {
            self.core
                .orders
                .insert(Order::from_request(request.clone(), client_order_id.clone()))?;

            let provider = self.core.provider.clone();
            let submitted = self
                .core
                .gateway
                .call("submit_order", self.timeout(), RetryPolicy::NotOnTimeout, || {
                    provider.submit_order(&request)
                })
                .await;

            match submitted {
                Ok(ack) => self.core.orders.mark_submitted(&client_order_id, &ack),
                Err(error) if matches!(error.kind, ErrorKind::Timeout | ErrorKind::SessionClosed) => {
                    warn!(error = %error, "주문 접수 여부를 알 수 없어 PendingSubmit으로 둡니다");
                    Err(error)
                }
                Err(error) => {
                    if let Err(state_error) =
                        self.core.orders.mark_rejected(&client_order_id, error.clone())
                    {
                        debug!(error = %state_error, "거부 기록 생략");
                    }
                    Err(error)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// 증권사에서 주문 상태를 조회해 병합한 스냅샷을 돌려줍니다.
    ///
    /// 최종 상태의 주문은 조회하지 않습니다. 증권사가 모르는 `PendingSubmit` 주문은
    /// 그대로 돌려줍니다.
    ///
    /// # Errors
    ///
    /// 알 수 없는 주문이면 `InvalidState`.
    pub async fn get_order(&self, client_order_id: &str) -> KsetResult<Order> {
        self.core.gateway.ensure_open()?;
        let order = self.core.orders.require(client_order_id)?;
        if order.is_terminal() {
            return Ok(order);
        }

        let provider = self.core.provider.clone();
        let query = order.query();
        let polled = self
            .core
            .gateway
            .call("fetch_order", self.timeout(), RetryPolicy::Transient, || {
                provider.fetch_order(&query)
            })
            .await;
        match polled {
            Ok(state) => {
                self.core.orders.reconcile(client_order_id, &state);
            }
            Err(error)
                if error.kind == ErrorKind::InvalidState
                    && order.provider_order_id.is_none() =>
            {
                debug!(client_order_id, "증권사에 접수되지 않은 주문");
            }
            Err(error) => return Err(error),
        }
        self.core.orders.require(client_order_id)
    }

    /// 로컬 주문 스냅샷 (증권사 조회 없음).
    pub fn order(&self, client_order_id: &str) -> Option<Order> {
        self.core.orders.get(client_order_id)
    }

    /// 주문을 취소합니다.
    ///
    /// # Errors
    ///
    /// - `Submitted`/`PartiallyFilled`가 아닌 주문: `InvalidState` (상태 변경 없음)
    /// - 증권사가 취소를 거부하면 그 에러. 이때 주문 상태를 다시 조회해 맞춥니다.
    pub async fn cancel_order(&self, client_order_id: &str) -> KsetResult<Order> {
        self.core.gateway.ensure_open()?;
        let order = self.core.orders.require(client_order_id)?;
        if !order.status.is_cancellable() {
            return Err(ErrorRecord::invalid_state(format!(
                "주문 {}은(는) {} 상태라 취소할 수 없습니다",
                client_order_id, order.status
            )));
        }

        let span = session_span!(
            "cancel_order",
            self.core.provider.name(),
            self.core.session.masked_account(),
            client_order_id
        );
        async {
            let provider = self.core.provider.clone();
            let query = order.query();
            let cancelled = self
                .core
                .gateway
                .call("cancel_order", self.timeout(), RetryPolicy::Transient, || {
                    provider.cancel_order(&query)
                })
                .await;
            match cancelled {
                Ok(()) => self.core.orders.mark_cancelled(client_order_id),
                Err(error) => {
                    if error.kind == ErrorKind::InvalidState {
                        let polled = self
                            .core
                            .gateway
                            .call("fetch_order", self.timeout(), RetryPolicy::Never, || {
                                provider.fetch_order(&query)
                            })
                            .await;
                        if let Ok(state) = polled {
                            self.core.orders.reconcile(client_order_id, &state);
                        }
                    }
                    info!(error = %error, "주문 취소 실패");
                    Err(error)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// 세션의 모든 주문 (생성 순).
    pub fn orders(&self) -> Vec<Order> {
        self.core.orders.list()
    }

    /// 최종 상태가 아닌 주문.
    pub fn active_orders(&self) -> Vec<Order> {
        self.core.orders.active()
    }

    /// 주문 이벤트를 구독합니다.
    pub fn subscribe_orders(&self, listener: impl Listener<OrderEvent>) -> OrderSubscription {
        let listeners = self.core.orders.listeners();
        ListenerHandle::new(listeners, listeners.add(Arc::new(listener)))
    }

    // ==================== 계좌 ====================

    /// 예수금을 조회합니다.
    pub async fn get_balance(&self) -> KsetResult<Balance> {
        let provider = self.core.provider.clone();
        self.core
            .gateway
            .call("fetch_balance", self.timeout(), RetryPolicy::Transient, || {
                provider.fetch_balance()
            })
            .await
    }

    /// 보유 종목을 조회합니다.
    pub async fn get_positions(&self) -> KsetResult<Vec<Position>> {
        let provider = self.core.provider.clone();
        self.core
            .gateway
            .call("fetch_positions", self.timeout(), RetryPolicy::Transient, || {
                provider.fetch_positions()
            })
            .await
    }

    /// 예수금과 보유 종목으로 계좌 요약을 계산합니다.
    pub async fn get_portfolio(&self) -> KsetResult<PortfolioSummary> {
        let (balance, positions) = tokio::try_join!(self.get_balance(), self.get_positions())?;
        Ok(PortfolioSummary::compute(balance, positions))
    }
}
