//! 세션 관리자.
//!
//! 연결 상태 기계를 소유합니다.
//!
//! ```text
//! Disconnected ─connect─▶ Connecting ─ok─▶ Connected ─fault─▶ Reconnecting ─ok─▶ Connected
//!      ▲                      │                 │                   │
//!      └───────fail───────────┘           disconnect            exhausted
//!                                               ▼                   ▼
//!                                             Closed ◀──────────────┘
//! ```

use chrono::{DateTime, Utc};
use kset_core::{
    ConnectionState, Credentials, Environment, ErrorKind, ErrorRecord, KsetResult, ReconnectConfig,
    SessionInfo, SessionKey,
};
use kset_exchange::{AuthGrant, AuthRequest, Provider, RateLimiter, RetryConfig};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::gateway::session_closed;
use crate::listener::{lock, ListenerSet};
use crate::registry::{SessionClaim, SessionRegistry};

/// 세션 이벤트.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// 연결 완료
    Connected,
    /// 재연결 시도 중
    Reconnecting {
        /// 시도 번호 (1부터)
        attempt: u32,
    },
    /// 재연결 완료
    Reconnected,
    /// 재연결 실패로 연결을 잃음
    ConnectionLost {
        /// 마지막 에러
        error: ErrorRecord,
    },
    /// 세션 종료
    Closed,
}

#[derive(Debug, Default)]
struct SessionTimes {
    connected_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
}

/// 세션 설정 묶음.
#[derive(Debug, Clone)]
pub(crate) struct SessionSettings {
    pub enabled: bool,
    pub credentials: Option<Credentials>,
    pub environment: Environment,
    pub demo: bool,
    pub reconnect: ReconnectConfig,
    pub timeout: Duration,
}

/// 연결 상태와 인증 수명주기 관리.
pub(crate) struct SessionManager {
    provider: Arc<dyn Provider>,
    limiter: Arc<RateLimiter>,
    registry: SessionRegistry,
    settings: SessionSettings,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
    claim: Mutex<Option<SessionClaim>>,
    times: Mutex<SessionTimes>,
    lifecycle: tokio::sync::Mutex<()>,
    events: Arc<ListenerSet<SessionEvent>>,
}

impl SessionManager {
    pub(crate) fn new(
        provider: Arc<dyn Provider>,
        limiter: Arc<RateLimiter>,
        registry: SessionRegistry,
        settings: SessionSettings,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            provider,
            limiter,
            registry,
            settings,
            state,
            cancel: CancellationToken::new(),
            claim: Mutex::new(None),
            times: Mutex::new(SessionTimes::default()),
            lifecycle: tokio::sync::Mutex::new(()),
            events: Arc::new(ListenerSet::default()),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn events(&self) -> &Arc<ListenerSet<SessionEvent>> {
        &self.events
    }

    pub(crate) fn masked_account(&self) -> String {
        self.settings
            .credentials
            .as_ref()
            .map(Credentials::masked_account)
            .unwrap_or_default()
    }

    pub(crate) fn key(&self) -> Option<SessionKey> {
        self.settings
            .credentials
            .as_ref()
            .map(|c| SessionKey::new(self.provider.name(), c.account.clone()))
    }

    pub(crate) fn info(&self) -> SessionInfo {
        let times = lock(&self.times);
        SessionInfo {
            provider: self.provider.name().to_string(),
            account: self.masked_account(),
            environment: self.settings.environment,
            demo: self.settings.demo,
            state: self.state(),
            connected_at: times.connected_at,
            expires_at: times.expires_at,
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(provider = self.provider.name(), from = %previous, to = %next, "연결 상태 변경");
        }
    }

    fn emit(&self, event: SessionEvent) {
        self.events.emit(&event);
    }

    /// 토큰 하나를 쓰고 마감 시간 안에 인증합니다.
    async fn authenticate(&self, credentials: &Credentials) -> KsetResult<AuthGrant> {
        let request = AuthRequest {
            credentials: credentials.clone(),
            environment: self.settings.environment,
            demo: self.settings.demo,
        };
        let attempt = async {
            self.limiter.acquire().await?;
            self.provider.authenticate(&request).await
        };
        let bounded = async {
            match tokio::time::timeout(self.settings.timeout, attempt).await {
                Ok(result) => result,
                Err(_) => Err(ErrorRecord::timeout("인증 응답이 없습니다")),
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(session_closed()),
            result = bounded => result,
        }
    }

    fn record_grant(&self, grant: &AuthGrant) {
        let mut times = lock(&self.times);
        times.connected_at = Some(Utc::now());
        times.expires_at = grant.expires_at;
    }

    /// 인증하고 세션을 엽니다. 이미 연결되어 있으면 아무것도 하지 않습니다.
    ///
    /// 실패하면 `Disconnected`로 돌아가고 식별자 점유를 풀어 다시 시도할 수 있습니다.
    pub(crate) async fn connect(&self) -> KsetResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        match self.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Closed => return Err(session_closed()),
            _ => {}
        }
        if self.cancel.is_cancelled() {
            return Err(session_closed());
        }
        if !self.settings.enabled {
            return Err(ErrorRecord::invalid_state(format!(
                "비활성화된 증권사입니다: {}",
                self.provider.name()
            )));
        }

        let credentials = self
            .settings
            .credentials
            .clone()
            .ok_or_else(|| ErrorRecord::authentication("자격증명이 설정되지 않았습니다"))?;
        credentials.validate()?;
        let claim = self
            .registry
            .claim(SessionKey::new(self.provider.name(), credentials.account.clone()))?;

        let span = kset_core::session_span!(
            "connect",
            self.provider.name(),
            credentials.masked_account()
        );
        async {
            self.set_state(ConnectionState::Connecting);
            match self.authenticate(&credentials).await {
                Ok(grant) => {
                    self.record_grant(&grant);
                    *lock(&self.claim) = Some(claim);
                    self.set_state(ConnectionState::Connected);
                    info!(expires_at = ?grant.expires_at, "세션 연결");
                    self.emit(SessionEvent::Connected);
                    Ok(())
                }
                Err(error) => {
                    drop(claim);
                    self.set_state(ConnectionState::Disconnected);
                    warn!(error = %error, "세션 연결 실패");
                    Err(error)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// 연결에 이어지는 준비 작업이 실패했을 때 연결을 되돌립니다.
    pub(crate) async fn abort_connect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() == ConnectionState::Connected {
            lock(&self.claim).take();
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// 전송 계층 장애 후 재인증합니다.
    ///
    /// 백오프 사이마다 `Reconnecting` 이벤트를 발행합니다. 인증 에러는 재시도하지 않습니다.
    ///
    /// # Errors
    ///
    /// 재시도가 소진되면 마지막 에러, 세션이 닫히면 `SessionClosed`.
    pub(crate) async fn recover(&self, cause: &ErrorRecord) -> KsetResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.cancel.is_cancelled() {
            return Err(session_closed());
        }
        if self.state() != ConnectionState::Connected {
            return Err(ErrorRecord::invalid_state(format!(
                "{} 상태에서는 재연결할 수 없습니다",
                self.state()
            )));
        }
        let credentials = self
            .settings
            .credentials
            .clone()
            .ok_or_else(|| ErrorRecord::authentication("자격증명이 설정되지 않았습니다"))?;

        warn!(provider = self.provider.name(), cause = %cause, "연결 장애, 재연결 시작");
        self.set_state(ConnectionState::Reconnecting);

        let backoff = RetryConfig::from_reconnect(&self.settings.reconnect);
        let mut last_error = cause.clone();
        for attempt in 1..=backoff.max_retries {
            self.emit(SessionEvent::Reconnecting { attempt });
            let delay = backoff.delay_for(attempt);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(session_closed()),
                _ = tokio::time::sleep(delay) => {}
            }

            match self.authenticate(&credentials).await {
                Ok(grant) => {
                    self.record_grant(&grant);
                    self.set_state(ConnectionState::Connected);
                    info!(provider = self.provider.name(), attempt, "재연결 완료");
                    self.emit(SessionEvent::Reconnected);
                    return Ok(());
                }
                Err(error) if error.kind == ErrorKind::SessionClosed => return Err(error),
                Err(error) => {
                    warn!(attempt, error = %error, "재연결 실패");
                    let fatal = error.kind == ErrorKind::Authentication;
                    last_error = error;
                    if fatal {
                        break;
                    }
                }
            }
        }
        Err(last_error)
    }

    /// 세션을 닫습니다. 진행 중인 호출은 `SessionClosed`로 끝납니다.
    ///
    /// `lost`가 있으면 `ConnectionLost`를 먼저 발행합니다. 이후 `Closed`를 발행하고
    /// 세션 리스너를 모두 제거합니다.
    pub(crate) async fn close(&self, lost: Option<ErrorRecord>) {
        self.cancel.cancel();
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() == ConnectionState::Closed {
            return;
        }

        let had_claim = lock(&self.claim).is_some();
        if had_claim {
            let deadline = tokio::time::Instant::now() + self.settings.timeout;
            match self.limiter.acquire_within(self.settings.timeout).await {
                Ok(()) => {
                    match tokio::time::timeout_at(deadline, self.provider.close()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(error)) => warn!(error = %error, "증권사 세션 종료 실패"),
                        Err(_) => warn!("증권사 세션 종료 응답 없음"),
                    }
                }
                Err(error) => warn!(error = %error, "요청 한도 초과, 증권사 종료 호출 생략"),
            }
        }
        lock(&self.claim).take();
        self.set_state(ConnectionState::Closed);
        info!(provider = self.provider.name(), account = %self.masked_account(), "세션 종료");

        if let Some(error) = lost {
            self.emit(SessionEvent::ConnectionLost { error });
        }
        self.emit(SessionEvent::Closed);
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kset_exchange::{SimOperation, SimulatedProvider};

    fn settings() -> SessionSettings {
        SessionSettings {
            enabled: true,
            credentials: Some(Credentials::api_key("5012345601", "key", "secret")),
            environment: Environment::Development,
            demo: true,
            reconnect: ReconnectConfig {
                max_attempts: 3,
                initial_delay_ms: 100,
                max_delay_ms: 1_000,
                multiplier: 2.0,
            },
            timeout: Duration::from_secs(5),
        }
    }

    fn manager_with(
        sim: &SimulatedProvider,
        limiter: RateLimiter,
        settings: SessionSettings,
    ) -> SessionManager {
        SessionManager::new(
            Arc::new(sim.clone()),
            Arc::new(limiter),
            SessionRegistry::new(),
            settings,
        )
    }

    fn manager(sim: &SimulatedProvider, registry: SessionRegistry) -> SessionManager {
        SessionManager::new(
            Arc::new(sim.clone()),
            Arc::new(RateLimiter::new(100.0, 10, Duration::from_secs(5))),
            registry,
            settings(),
        )
    }

    #[tokio::test]
    async fn test_connect_and_close() {
        let sim = SimulatedProvider::default();
        let registry = SessionRegistry::new();
        let session = manager(&sim, registry.clone());

        session.connect().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Connected);
        assert!(session.info().connected_at.is_some());
        assert_eq!(registry.len(), 1);

        session.connect().await.unwrap();
        assert_eq!(sim.call_count(SimOperation::Authenticate).await, 1);

        session.close(None).await;
        assert_eq!(session.state(), ConnectionState::Closed);
        assert!(registry.is_empty());
        assert_eq!(
            session.connect().await.unwrap_err().kind,
            ErrorKind::SessionClosed
        );
    }

    #[tokio::test]
    async fn test_failed_connect_releases_identity() {
        let sim = SimulatedProvider::default();
        sim.expire_credentials().await;
        let registry = SessionRegistry::new();
        let session = manager(&sim, registry.clone());

        let err = session.connect().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Authentication);
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(registry.is_empty());

        sim.restore_credentials().await;
        session.connect().await.unwrap();
        assert_eq!(session.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_duplicate_identity_rejected() {
        let sim = SimulatedProvider::default();
        let registry = SessionRegistry::new();
        let first = manager(&sim, registry.clone());
        let second = manager(&sim, registry);

        first.connect().await.unwrap();
        let err = second.connect().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);
        assert_eq!(second.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_with_backoff() {
        let sim = SimulatedProvider::default();
        let session = manager(&sim, SessionRegistry::new());
        session.connect().await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        session
            .events()
            .add(Arc::new(move |e: &SessionEvent| sink.lock().unwrap().push(e.clone())));

        sim.fail_next(
            SimOperation::Authenticate,
            ErrorRecord::provider("TRANSPORT", "연결이 끊어졌습니다", true),
        )
        .await;
        session
            .recover(&ErrorRecord::provider("TRANSPORT", "drop", true))
            .await
            .unwrap();

        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                SessionEvent::Reconnecting { attempt: 1 },
                SessionEvent::Reconnecting { attempt: 2 },
                SessionEvent::Reconnected,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_stops_on_authentication() {
        let sim = SimulatedProvider::default();
        let session = manager(&sim, SessionRegistry::new());
        session.connect().await.unwrap();
        sim.expire_credentials().await;

        let err = session
            .recover(&ErrorRecord::provider("TRANSPORT", "drop", true))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Authentication);
        assert_eq!(sim.call_count(SimOperation::Authenticate).await, 2);
        assert_eq!(session.state(), ConnectionState::Reconnecting);
    }

    #[tokio::test]
    async fn test_disabled_provider_rejected() {
        let sim = SimulatedProvider::default();
        let session = manager_with(
            &sim,
            RateLimiter::new(100.0, 10, Duration::from_secs(5)),
            SessionSettings {
                enabled: false,
                ..settings()
            },
        );

        let err = session.connect().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(sim.call_count(SimOperation::Authenticate).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_waits_for_token() {
        let sim = SimulatedProvider::default();
        let session = manager_with(
            &sim,
            RateLimiter::new(1.0, 1, Duration::from_secs(5)),
            settings(),
        );
        session.connect().await.unwrap();

        session.close(None).await;
        assert_eq!(session.state(), ConnectionState::Closed);
        assert_eq!(sim.call_count(SimOperation::Close).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_skips_provider_without_token() {
        let sim = SimulatedProvider::default();
        let session = manager_with(
            &sim,
            RateLimiter::new(1.0, 1, Duration::from_secs(5)),
            SessionSettings {
                timeout: Duration::from_millis(200),
                ..settings()
            },
        );
        session.connect().await.unwrap();

        session.close(None).await;
        assert_eq!(session.state(), ConnectionState::Closed);
        assert_eq!(sim.call_count(SimOperation::Close).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_reconnect_attempts_give_up_immediately() {
        let sim = SimulatedProvider::default();
        let mut zero = settings();
        zero.reconnect.max_attempts = 0;
        let session = manager_with(
            &sim,
            RateLimiter::new(100.0, 10, Duration::from_secs(5)),
            zero,
        );
        session.connect().await.unwrap();

        let cause = ErrorRecord::provider("TRANSPORT", "drop", true);
        let err = session.recover(&cause).await.unwrap_err();
        assert_eq!(err, cause);
        assert_eq!(sim.call_count(SimOperation::Authenticate).await, 1);
    }
}
