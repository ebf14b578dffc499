//! 재시도 조정.
//!
//! 재시도 가능한 `ErrorRecord`에 대해 지수 백오프로 작업을 반복합니다.
//! 재시도 불가 에러는 즉시 반환됩니다.

use kset_core::{ErrorRecord, KsetResult, ReconnectConfig};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// 재시도 설정.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// 첫 시도 이후 최대 재시도 횟수
    pub max_retries: u32,
    /// 첫 재시도 전 대기 시간
    pub initial_delay: Duration,
    /// 최대 대기 시간
    pub max_delay: Duration,
    /// 증가 배수
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// 최대 재시도 횟수로 생성합니다.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// 재시도하지 않는 설정.
    pub fn no_retry() -> Self {
        Self::new(0)
    }

    /// 재연결 백오프 설정을 재시도 설정으로 바꿉니다.
    pub fn from_reconnect(config: &ReconnectConfig) -> Self {
        Self {
            max_retries: config.max_attempts,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier.max(1.0),
        }
    }

    /// 첫 대기 시간을 설정합니다.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// 최대 대기 시간을 설정합니다.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// `retry`번째(1부터) 재시도 전 대기 시간.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(30) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exp);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// 로그에 남길 작업 정보.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// 작업 이름 (예: "fetch_market_data")
    pub operation: &'static str,
    /// 증권사 식별자
    pub provider: String,
}

impl RetryContext {
    /// 새 컨텍스트를 생성합니다.
    pub fn new(operation: &'static str, provider: impl Into<String>) -> Self {
        Self {
            operation,
            provider: provider.into(),
        }
    }
}

/// 재시도 통계.
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    /// 총 시도 횟수
    pub attempts: u32,
    /// 백오프로 대기한 총 시간
    pub total_delay: Duration,
    /// 마지막으로 재시도된 에러
    pub last_error: Option<ErrorRecord>,
}

/// 재시도 가능한 에러에 대해 작업을 반복합니다.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation: F) -> KsetResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = KsetResult<T>>,
{
    with_retry_if(config, operation, ErrorRecord::is_retryable).await
}

/// `should_retry`가 참인 에러에 대해 작업을 반복합니다.
pub async fn with_retry_if<T, F, Fut, P>(
    config: &RetryConfig,
    operation: F,
    should_retry: P,
) -> KsetResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = KsetResult<T>>,
    P: Fn(&ErrorRecord) -> bool,
{
    let context = RetryContext::new("operation", "-");
    with_retry_context(config, &context, operation, should_retry)
        .await
        .0
}

/// 컨텍스트 로깅과 통계를 포함해 작업을 반복합니다.
pub async fn with_retry_context<T, F, Fut, P>(
    config: &RetryConfig,
    context: &RetryContext,
    mut operation: F,
    should_retry: P,
) -> (KsetResult<T>, RetryStats)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = KsetResult<T>>,
    P: Fn(&ErrorRecord) -> bool,
{
    let mut stats = RetryStats::default();

    loop {
        stats.attempts += 1;
        let error = match operation().await {
            Ok(value) => return (Ok(value), stats),
            Err(error) => error,
        };

        let retries_done = stats.attempts - 1;
        if !should_retry(&error) || retries_done >= config.max_retries {
            if retries_done > 0 {
                warn!(
                    provider = %context.provider,
                    operation = context.operation,
                    attempts = stats.attempts,
                    error = %error,
                    "재시도 후에도 실패"
                );
            }
            return (Err(error), stats);
        }

        let delay = config.delay_for(retries_done + 1);
        debug!(
            provider = %context.provider,
            operation = context.operation,
            attempt = stats.attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "재시도 대기"
        );
        stats.last_error = Some(error);
        stats.total_delay += delay;
        tokio::time::sleep(delay).await;
    }
}
