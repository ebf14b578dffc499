//! 증권사 호출 경로.
//!
//! 모든 호출은 다음 순서를 거칩니다.
//! 1. 세션 상태 확인 (재연결 중이면 마감 시각까지 대기)
//! 2. 요청 한도 토큰 획득 (시도마다 하나)
//! 3. 시도별 마감 시각을 둔 증권사 호출
//! 4. 재시도 가능한 에러는 지수 백오프로 재시도
//!
//! 세션이 닫히면 진행 중인 호출은 `SessionClosed`로 끝납니다.

use kset_core::{ConnectionState, ErrorKind, ErrorRecord, KsetResult};
use kset_exchange::{with_retry_context, Provider, RateLimiter, RetryConfig, RetryContext};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 재시도 정책.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetryPolicy {
    /// 재시도 가능한 모든 에러를 재시도
    Transient,
    /// `Timeout`은 재시도하지 않음 (주문 제출처럼 중복 실행이 위험한 작업)
    NotOnTimeout,
    /// 재시도하지 않음
    Never,
}

impl RetryPolicy {
    fn allows(self, error: &ErrorRecord) -> bool {
        match self {
            RetryPolicy::Transient => error.is_retryable(),
            RetryPolicy::NotOnTimeout => error.is_retryable() && error.kind != ErrorKind::Timeout,
            RetryPolicy::Never => false,
        }
    }
}

pub(crate) fn session_closed() -> ErrorRecord {
    ErrorRecord::session_closed("세션이 종료되었습니다")
}

fn not_connected() -> ErrorRecord {
    ErrorRecord::invalid_state("세션이 연결되지 않았습니다")
}

/// 세션 상태를 확인하는 증권사 호출기.
pub(crate) struct Gateway {
    provider: Arc<dyn Provider>,
    limiter: Arc<RateLimiter>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    retry: RetryConfig,
    timeout: Duration,
}

impl Gateway {
    pub(crate) fn new(
        provider: Arc<dyn Provider>,
        limiter: Arc<RateLimiter>,
        state: watch::Receiver<ConnectionState>,
        cancel: CancellationToken,
        retry: RetryConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            limiter,
            state,
            cancel,
            retry,
            timeout,
        }
    }

    pub(crate) fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// 기본 시도별 마감 시간.
    pub(crate) fn default_timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 대기 없이 호출 가능 여부를 확인합니다.
    ///
    /// 연결 중이거나 재연결 중이면 통과시킵니다 (실제 호출이 기다립니다).
    pub(crate) fn ensure_open(&self) -> KsetResult<()> {
        if self.cancel.is_cancelled() {
            return Err(session_closed());
        }
        match *self.state.borrow() {
            ConnectionState::Closed => Err(session_closed()),
            ConnectionState::Disconnected => Err(not_connected()),
            _ => Ok(()),
        }
    }

    /// 세션이 `Connected`가 될 때까지 기다립니다.
    async fn ready(&self) -> KsetResult<()> {
        let mut state = self.state.clone();
        loop {
            let current = *state.borrow_and_update();
            match current {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Closed => return Err(session_closed()),
                ConnectionState::Disconnected => return Err(not_connected()),
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    if state.changed().await.is_err() {
                        return Err(session_closed());
                    }
                }
            }
        }
    }

    /// 증권사를 호출합니다.
    ///
    /// `timeout`은 시도마다 적용되며 상태 대기와 토큰 대기를 포함합니다.
    pub(crate) async fn call<T, F, Fut>(
        &self,
        operation: &'static str,
        timeout: Duration,
        policy: RetryPolicy,
        mut request: F,
    ) -> KsetResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = KsetResult<T>>,
    {
        let context = RetryContext::new(operation, self.provider.name());
        let config = match policy {
            RetryPolicy::Never => RetryConfig {
                max_retries: 0,
                ..self.retry.clone()
            },
            _ => self.retry.clone(),
        };

        let attempts = with_retry_context(
            &config,
            &context,
            || {
                let pending = request();
                async move {
                    let attempt = async {
                        self.ready().await?;
                        self.limiter.acquire().await?;
                        pending.await
                    };
                    match tokio::time::timeout(timeout, attempt).await {
                        Ok(result) => result,
                        Err(_) => Err(ErrorRecord::timeout(format!(
                            "{}: {}ms 안에 응답이 없습니다",
                            operation,
                            timeout.as_millis()
                        ))),
                    }
                }
            },
            |error| policy.allows(error),
        );

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!(operation, "세션 종료로 호출 중단");
                Err(session_closed())
            }
            (result, stats) = attempts => {
                if stats.attempts > 1 {
                    debug!(
                        operation,
                        attempts = stats.attempts,
                        waited_ms = stats.total_delay.as_millis() as u64,
                        ok = result.is_ok(),
                        "재시도 완료"
                    );
                }
                result
            }
        }
    }
}
