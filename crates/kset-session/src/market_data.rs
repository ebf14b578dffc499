//! 시세 구독 허브.
//!
//! 종목마다 증권사 스트림을 하나만 열고 모든 구독자에게 나눠 줍니다.
//! 마지막 구독자가 떠나면 스트림을 닫고 항목을 지웁니다.
//! 스트림 장애는 `Stalled`로 알리고 재연결 백오프로 다시 엽니다.

use kset_core::{ErrorRecord, KsetResult, MarketSnapshot, Symbol};
use kset_exchange::{FeedCloser, FeedMessage, ProviderFeed, RetryConfig};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::gateway::{session_closed, Gateway, RetryPolicy};
use crate::listener::{lock, Listener, ListenerId, ListenerSet};

/// 시세 구독 이벤트.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarketDataEvent {
    /// 새 시세
    Snapshot {
        /// 시세 스냅샷
        snapshot: MarketSnapshot,
    },
    /// 스트림 장애로 시세가 멈춤 (재연결 시도 중)
    Stalled {
        /// 장애 원인
        error: ErrorRecord,
    },
    /// 스트림이 다시 열림
    Resumed,
    /// 재연결 실패로 구독이 끝남
    Terminated {
        /// 마지막 에러
        error: ErrorRecord,
    },
}

/// 종목 스트림 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedHealth {
    /// 정상 수신 중
    Active,
    /// 장애 감지
    Stalled,
    /// 재연결 중
    Reconnecting,
}

struct FeedShared {
    symbol: Symbol,
    listeners: ListenerSet<MarketDataEvent>,
    last: Mutex<Option<MarketSnapshot>>,
    health: Mutex<FeedHealth>,
    closer: Mutex<Option<FeedCloser>>,
    cancel: CancellationToken,
}

impl FeedShared {
    fn new(symbol: Symbol, closer: FeedCloser) -> Self {
        Self {
            symbol,
            listeners: ListenerSet::default(),
            last: Mutex::new(None),
            health: Mutex::new(FeedHealth::Active),
            closer: Mutex::new(Some(closer)),
            cancel: CancellationToken::new(),
        }
    }

    fn publish(&self, snapshot: MarketSnapshot) {
        let mut last = lock(&self.last);
        *last = Some(snapshot.clone());
        let emitter = self.listeners.begin_emit();
        drop(last);
        emitter.deliver(&MarketDataEvent::Snapshot { snapshot });
    }

    /// 구독자를 붙이고 마지막 시세를 먼저 전달합니다.
    fn attach(&self, listener: Arc<dyn Listener<MarketDataEvent>>) -> Option<ListenerId> {
        let last = lock(&self.last);
        let replay = last
            .clone()
            .map(|snapshot| MarketDataEvent::Snapshot { snapshot });
        self.listeners.add_with_replay(listener, replay.as_ref())
    }

    fn health(&self) -> FeedHealth {
        *lock(&self.health)
    }

    fn set_health(&self, health: FeedHealth) {
        *lock(&self.health) = health;
    }

    fn replace_closer(&self, closer: FeedCloser) {
        *lock(&self.closer) = Some(closer);
    }

    fn close_feed(&self) {
        self.cancel.cancel();
        if let Some(closer) = lock(&self.closer).take() {
            closer.close();
        }
    }
}

struct FeedSlot {
    shared: Arc<FeedShared>,
    pump: JoinHandle<()>,
}

impl FeedSlot {
    fn teardown(self) {
        self.shared.close_feed();
        self.pump.abort();
        self.shared.listeners.clear();
    }
}

type OpenGates = Mutex<HashMap<Symbol, Arc<tokio::sync::Mutex<()>>>>;

/// 종목 하나의 스트림 열기 차례.
///
/// 같은 종목의 첫 구독자들은 여기서 줄을 서고, 다른 종목은 기다리지 않습니다.
/// 마지막 대기자가 떠나면 게이트를 지웁니다.
struct OpenTurn<'a> {
    gates: &'a OpenGates,
    symbol: Symbol,
    turn: Option<OwnedMutexGuard<()>>,
}

impl<'a> OpenTurn<'a> {
    async fn wait(gates: &'a OpenGates, symbol: &Symbol) -> OpenTurn<'a> {
        let gate = lock(gates).entry(symbol.clone()).or_default().clone();
        let turn = gate.lock_owned().await;
        OpenTurn {
            gates,
            symbol: symbol.clone(),
            turn: Some(turn),
        }
    }
}

impl Drop for OpenTurn<'_> {
    fn drop(&mut self) {
        // 게이트 복제는 이 락 아래에서만 일어나므로 참조 수가 흔들리지 않습니다.
        let mut gates = lock(self.gates);
        self.turn.take();
        let idle = gates
            .get(&self.symbol)
            .is_some_and(|gate| Arc::strong_count(gate) == 1);
        if idle {
            gates.remove(&self.symbol);
        }
    }
}

/// 종목별 시세 스트림 공유기.
///
/// `feeds` 락은 네트워크 호출 동안 잡지 않습니다. 스트림 열기는 종목별 `opening` 게이트로 직렬화합니다.
pub(crate) struct MarketDataHub {
    gateway: Arc<Gateway>,
    backoff: RetryConfig,
    feeds: tokio::sync::Mutex<HashMap<Symbol, FeedSlot>>,
    opening: OpenGates,
}

impl MarketDataHub {
    pub(crate) fn new(gateway: Arc<Gateway>, backoff: RetryConfig) -> Self {
        Self {
            gateway,
            backoff,
            feeds: tokio::sync::Mutex::new(HashMap::new()),
            opening: Mutex::new(HashMap::new()),
        }
    }

    /// 이미 열린 스트림이 있으면 구독자를 붙입니다.
    async fn join_existing(
        &self,
        symbol: &Symbol,
        listener: &Arc<dyn Listener<MarketDataEvent>>,
    ) -> KsetResult<Option<ListenerId>> {
        let feeds = self.feeds.lock().await;
        if self.gateway.is_closed() {
            return Err(session_closed());
        }
        let Some(slot) = feeds.get(symbol) else {
            return Ok(None);
        };
        let id = slot
            .shared
            .attach(listener.clone())
            .ok_or_else(session_closed)?;
        debug!(
            symbol = %symbol,
            subscribers = slot.shared.listeners.len(),
            "기존 시세 스트림에 구독자 추가"
        );
        Ok(Some(id))
    }

    /// 구독합니다. 종목의 첫 구독자만 증권사 스트림을 엽니다.
    pub(crate) async fn subscribe(
        self: &Arc<Self>,
        symbol: Symbol,
        listener: Arc<dyn Listener<MarketDataEvent>>,
        timeout: Duration,
    ) -> KsetResult<MarketDataSubscription> {
        symbol.validate()?;
        self.gateway.ensure_open()?;

        if let Some(id) = self.join_existing(&symbol, &listener).await? {
            return Ok(MarketDataSubscription::new(self, symbol, id));
        }

        let _turn = OpenTurn::wait(&self.opening, &symbol).await;
        // 앞선 차례가 이미 열었을 수 있습니다.
        if let Some(id) = self.join_existing(&symbol, &listener).await? {
            return Ok(MarketDataSubscription::new(self, symbol, id));
        }

        let provider = self.gateway.provider().clone();
        let feed = self
            .gateway
            .call("stream_market_data", timeout, RetryPolicy::Transient, || {
                provider.stream_market_data(&symbol)
            })
            .await?;

        let mut feeds = self.feeds.lock().await;
        if self.gateway.is_closed() {
            feed.close();
            return Err(session_closed());
        }
        let shared = Arc::new(FeedShared::new(symbol.clone(), feed.closer()));
        let Some(id) = shared.attach(listener) else {
            shared.close_feed();
            return Err(session_closed());
        };
        let span = tracing::info_span!("market_feed", symbol = %symbol);
        let pump = tokio::spawn(run_feed(Arc::downgrade(self), shared.clone(), feed).instrument(span));
        feeds.insert(symbol.clone(), FeedSlot { shared, pump });
        drop(feeds);

        info!(symbol = %symbol, "시세 스트림 열림");
        Ok(MarketDataSubscription::new(self, symbol, id))
    }

    /// 구독자를 뗍니다. 마지막 구독자였으면 스트림을 닫고 항목을 지운 뒤 반환합니다.
    pub(crate) async fn unsubscribe(&self, symbol: &Symbol, listener_id: ListenerId) -> bool {
        let mut feeds = self.feeds.lock().await;
        let Some(slot) = feeds.get(symbol) else {
            return false;
        };
        if !slot.shared.listeners.remove(listener_id) {
            return false;
        }
        if slot.shared.listeners.is_empty() {
            if let Some(slot) = feeds.remove(symbol) {
                slot.teardown();
                info!(symbol = %symbol, "마지막 구독자 해제, 시세 스트림 닫힘");
            }
        }
        true
    }

    /// 모든 스트림을 닫습니다.
    pub(crate) async fn shutdown(&self) {
        let mut feeds = self.feeds.lock().await;
        let count = feeds.len();
        for (_, slot) in feeds.drain() {
            slot.teardown();
        }
        if count > 0 {
            debug!(count, "시세 스트림 모두 닫힘");
        }
    }

    pub(crate) async fn health(&self, symbol: &Symbol) -> Option<FeedHealth> {
        self.feeds
            .lock()
            .await
            .get(symbol)
            .map(|slot| slot.shared.health())
    }

    pub(crate) async fn subscriber_count(&self, symbol: &Symbol) -> usize {
        self.feeds
            .lock()
            .await
            .get(symbol)
            .map_or(0, |slot| slot.shared.listeners.len())
    }

    pub(crate) async fn symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = self.feeds.lock().await.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// 장애 난 스트림을 백오프로 다시 엽니다.
    async fn reopen(
        &self,
        shared: &FeedShared,
        cause: ErrorRecord,
    ) -> KsetResult<ProviderFeed<MarketSnapshot>> {
        let provider = self.gateway.provider().clone();
        let symbol = &shared.symbol;
        let mut last_error = cause;

        for attempt in 1..=self.backoff.max_retries {
            shared.set_health(FeedHealth::Reconnecting);
            tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => return Err(session_closed()),
                _ = tokio::time::sleep(self.backoff.delay_for(attempt)) => {}
            }

            let opened = self
                .gateway
                .call(
                    "stream_market_data",
                    self.gateway.default_timeout(),
                    RetryPolicy::Never,
                    || provider.stream_market_data(symbol),
                )
                .await;
            match opened {
                Ok(feed) => {
                    if shared.cancel.is_cancelled() {
                        return Err(session_closed());
                    }
                    shared.replace_closer(feed.closer());
                    return Ok(feed);
                }
                Err(error) if !error.is_retryable() => return Err(error),
                Err(error) => {
                    debug!(attempt, error = %error, "시세 스트림 재연결 실패");
                    last_error = error;
                }
            }
        }
        Err(last_error)
    }

    /// 재연결을 포기하고 구독을 끝냅니다.
    async fn terminate(&self, shared: &Arc<FeedShared>, error: ErrorRecord) {
        {
            let mut feeds = self.feeds.lock().await;
            if shared.cancel.is_cancelled() {
                return;
            }
            let owned = feeds
                .get(&shared.symbol)
                .is_some_and(|slot| Arc::ptr_eq(&slot.shared, shared));
            if owned {
                feeds.remove(&shared.symbol);
            }
            shared.close_feed();
        }

        warn!(symbol = %shared.symbol, error = %error, "시세 구독 종료");
        shared.listeners.emit(&MarketDataEvent::Terminated { error });
        shared.listeners.clear();
    }
}

impl Drop for MarketDataHub {
    fn drop(&mut self) {
        for (_, slot) in self.feeds.get_mut().drain() {
            slot.teardown();
        }
    }
}

async fn run_feed(
    hub: Weak<MarketDataHub>,
    shared: Arc<FeedShared>,
    mut feed: ProviderFeed<MarketSnapshot>,
) {
    loop {
        let error = loop {
            tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => return,
                message = feed.next() => match message {
                    Some(FeedMessage::Item(snapshot)) => shared.publish(snapshot),
                    Some(FeedMessage::Fault(error)) => break error,
                    None => break ErrorRecord::provider("FEED_CLOSED", "시세 스트림이 끊어졌습니다", true),
                },
            }
        };
        if shared.cancel.is_cancelled() {
            return;
        }

        warn!(error = %error, "시세 스트림 장애");
        shared.set_health(FeedHealth::Stalled);
        shared.listeners.emit(&MarketDataEvent::Stalled {
            error: error.clone(),
        });

        let Some(hub) = hub.upgrade() else {
            return;
        };
        match hub.reopen(&shared, error).await {
            Ok(next) => {
                feed = next;
                shared.set_health(FeedHealth::Active);
                info!("시세 스트림 재개");
                shared.listeners.emit(&MarketDataEvent::Resumed);
            }
            Err(error) => {
                hub.terminate(&shared, error).await;
                return;
            }
        }
    }
}

/// 시세 구독 핸들.
///
/// `unsubscribe`를 부르거나 핸들을 드롭하면 구독이 해제됩니다.
/// 드롭은 해제를 백그라운드 작업으로 예약합니다.
#[must_use = "핸들을 버리면 구독이 해제됩니다"]
pub struct MarketDataSubscription {
    hub: Weak<MarketDataHub>,
    symbol: Symbol,
    listener_id: ListenerId,
    released: bool,
}

impl MarketDataSubscription {
    fn new(hub: &Arc<MarketDataHub>, symbol: Symbol, listener_id: ListenerId) -> Self {
        Self {
            hub: Arc::downgrade(hub),
            symbol,
            listener_id,
            released: false,
        }
    }

    /// 구독 종목.
    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    /// 구독을 해제합니다. 마지막 구독자였으면 반환 전에 스트림이 닫힙니다.
    pub async fn unsubscribe(mut self) {
        self.released = true;
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(&self.symbol, self.listener_id).await;
        }
    }
}

impl std::fmt::Debug for MarketDataSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataSubscription")
            .field("symbol", &self.symbol)
            .field("listener_id", &self.listener_id)
            .finish()
    }
}

impl Drop for MarketDataSubscription {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Some(hub) = self.hub.upgrade() else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let symbol = self.symbol.clone();
            let listener_id = self.listener_id;
            runtime.spawn(async move {
                hub.unsubscribe(&symbol, listener_id).await;
            });
        }
    }
}
