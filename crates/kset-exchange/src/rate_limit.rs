//! 증권사별 요청 한도 관리.
//!
//! 연속 리필 Token Bucket을 사용합니다. 대기자는 공정(FIFO) 뮤텍스를
//! 잡은 채로 리필을 기다리므로 먼저 요청한 호출이 먼저 토큰을 받습니다.

use kset_core::{ErrorRecord, KsetResult, RateLimitConfig};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Token Bucket 상태.
#[derive(Debug)]
struct TokenBucket {
    /// 현재 토큰 수 (소수 포함)
    tokens: f64,
    /// 마지막 리필 시각
    last_refill: Instant,
    /// 버킷 용량
    max_tokens: f64,
    /// 초당 리필 토큰 수
    refill_rate: f64,
}

impl TokenBucket {
    fn new(requests_per_second: f64, burst_size: u32) -> Self {
        let max_tokens = f64::from(burst_size.max(1));
        Self {
            tokens: max_tokens,
            last_refill: Instant::now(),
            max_tokens,
            refill_rate: requests_per_second.max(f64::MIN_POSITIVE),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }

    fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_until_next_token(&self) -> Duration {
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64((1.0 - self.tokens) / self.refill_rate).unwrap_or(Duration::MAX)
    }
}

/// 증권사 하나의 요청 예산.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
    acquire_timeout: Duration,
}

impl RateLimiter {
    /// 새 Rate Limiter를 생성합니다.
    pub fn new(requests_per_second: f64, burst_size: u32, acquire_timeout: Duration) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(requests_per_second, burst_size)),
            acquire_timeout,
        }
    }

    /// 설정으로부터 생성합니다.
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(
            config.requests_per_second,
            config.burst_size,
            config.acquire_timeout(),
        )
    }

    /// 기본 대기 시간 안에 토큰 하나를 얻습니다.
    pub async fn acquire(&self) -> KsetResult<()> {
        self.acquire_within(self.acquire_timeout).await
    }

    /// `timeout` 안에 토큰 하나를 얻습니다.
    ///
    /// # Errors
    ///
    /// 시간 안에 토큰을 얻지 못하면 `RateLimit`.
    pub async fn acquire_within(&self, timeout: Duration) -> KsetResult<()> {
        match tokio::time::timeout(timeout, self.acquire_inner()).await {
            Ok(()) => Ok(()),
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "요청 한도 대기 시간 초과");
                Err(ErrorRecord::rate_limit(format!(
                    "{}ms 안에 요청 토큰을 얻지 못했습니다",
                    timeout.as_millis()
                )))
            }
        }
    }

    /// 대기 없이 토큰을 얻습니다. 다른 대기자가 있으면 실패합니다.
    pub fn try_acquire(&self) -> bool {
        match self.bucket.try_lock() {
            Ok(mut bucket) => bucket.try_acquire(),
            Err(_) => false,
        }
    }

    /// 현재 사용 가능한 토큰 수.
    pub async fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock().await;
        bucket.refill();
        bucket.tokens
    }

    async fn acquire_inner(&self) {
        let mut bucket = self.bucket.lock().await;
        loop {
            if bucket.try_acquire() {
                return;
            }
            let wait = bucket.time_until_next_token();
            debug!(wait_ms = wait.as_millis() as u64, "요청 토큰 리필 대기");
            tokio::time::sleep(wait).await;
        }
    }
}
