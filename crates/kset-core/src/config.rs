//! 설정 관리.
//!
//! 파일(TOML 등)에서 읽은 뒤 `KSET__` 접두사 환경 변수로 덮어씁니다.
//! 예: `KSET__PROVIDERS__KIS__RATE_LIMIT__REQUESTS_PER_SECOND=20`

use crate::domain::{Credentials, Environment};
use crate::logging::LogConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// 최상위 설정.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KsetConfig {
    /// 로깅 설정
    pub logging: LogConfig,
    /// 세션 공통 설정
    pub session: SessionConfig,
    /// 증권사별 설정 (키: 증권사 식별자)
    pub providers: HashMap<String, ProviderConfig>,
}

/// 세션 공통 설정.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// 실행 환경
    pub environment: Environment,
    /// 재연결 백오프
    pub reconnect: ReconnectConfig,
    /// 스트림 채널 버퍼 크기
    pub stream_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            reconnect: ReconnectConfig::default(),
            stream_buffer: 256,
        }
    }
}

/// 지수 백오프 재연결 설정.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// 최대 시도 횟수 (1 이상)
    pub max_attempts: u32,
    /// 첫 대기 시간 (밀리초)
    pub initial_delay_ms: u64,
    /// 최대 대기 시간 (밀리초)
    pub max_delay_ms: u64,
    /// 증가 배수
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// `attempt`번째(1부터) 시도 전 대기 시간.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(30) as i32;
        let millis = self.initial_delay_ms as f64 * self.multiplier.powi(exp);
        Duration::from_millis(millis.min(self.max_delay_ms as f64) as u64)
    }
}

/// 요청 한도 설정.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// 초당 요청 수
    pub requests_per_second: f64,
    /// 버스트 허용량
    pub burst_size: u32,
    /// 토큰 대기 최대 시간 (밀리초)
    pub acquire_timeout_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        // KIS 실전 계좌 기준 초당 20건
        Self {
            requests_per_second: 20.0,
            burst_size: 20,
            acquire_timeout_ms: 5_000,
        }
    }
}

impl RateLimitConfig {
    /// 토큰 대기 최대 시간.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// 증권사별 설정.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// 활성화 여부
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 모의투자 여부
    #[serde(default)]
    pub demo: bool,
    /// 자격증명
    #[serde(default)]
    pub credentials: Option<Credentials>,
    /// 요청 타임아웃 (초)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// 재시도 가능한 에러의 최대 재시도 횟수
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    /// 요청 한도
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

fn default_enabled() -> bool {
    true
}
fn default_timeout_secs() -> u64 {
    10
}
fn default_max_retry_attempts() -> u32 {
    3
}

impl ProviderConfig {
    /// 자격증명으로 기본 설정을 생성합니다.
    pub fn new(credentials: Credentials) -> Self {
        Self {
            enabled: true,
            demo: false,
            credentials: Some(credentials),
            timeout_secs: default_timeout_secs(),
            max_retry_attempts: default_max_retry_attempts(),
            rate_limit: RateLimitConfig::default(),
        }
    }

    /// 모의투자 여부를 설정합니다.
    pub fn with_demo(mut self, demo: bool) -> Self {
        self.demo = demo;
        self
    }

    /// 요청 한도를 설정합니다.
    pub fn with_rate_limit(mut self, requests_per_second: f64, burst_size: u32) -> Self {
        self.rate_limit.requests_per_second = requests_per_second;
        self.rate_limit.burst_size = burst_size;
        self
    }

    /// 최대 재시도 횟수를 설정합니다.
    pub fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    /// 요청 타임아웃.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// 설정 검증 에러.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("잘못된 설정 [{field}]: {reason}")]
pub struct ConfigValidationError {
    /// 문제가 된 항목 경로
    pub field: String,
    /// 사유
    pub reason: String,
}

impl ConfigValidationError {
    fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl KsetConfig {
    /// 파일과 환경 변수에서 설정을 로드합니다.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(
                config::Environment::with_prefix("KSET")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// 기본 경로(`config/kset.toml`)에서 설정을 로드합니다.
    pub fn load_default() -> Result<Self, config::ConfigError> {
        Self::load("config/kset.toml")
    }

    /// 증권사 설정을 조회합니다.
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }

    /// 값의 의미적 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let reconnect = &self.session.reconnect;
        if reconnect.max_attempts == 0 {
            return Err(ConfigValidationError::new(
                "session.reconnect.max_attempts",
                "0보다 커야 합니다",
            ));
        }
        if reconnect.multiplier < 1.0 {
            return Err(ConfigValidationError::new(
                "session.reconnect.multiplier",
                "1.0 이상이어야 합니다",
            ));
        }
        if reconnect.initial_delay_ms > reconnect.max_delay_ms {
            return Err(ConfigValidationError::new(
                "session.reconnect.initial_delay_ms",
                "max_delay_ms보다 클 수 없습니다",
            ));
        }
        if self.session.stream_buffer == 0 {
            return Err(ConfigValidationError::new(
                "session.stream_buffer",
                "0보다 커야 합니다",
            ));
        }

        for (name, provider) in &self.providers {
            if !provider.enabled {
                continue;
            }
            let field = |f: &str| format!("providers.{}.{}", name, f);
            if !(provider.rate_limit.requests_per_second > 0.0) {
                return Err(ConfigValidationError::new(
                    field("rate_limit.requests_per_second"),
                    "0보다 커야 합니다",
                ));
            }
            if provider.rate_limit.burst_size == 0 {
                return Err(ConfigValidationError::new(
                    field("rate_limit.burst_size"),
                    "0보다 커야 합니다",
                ));
            }
            if provider.timeout_secs == 0 {
                return Err(ConfigValidationError::new(
                    field("timeout_secs"),
                    "0보다 커야 합니다",
                ));
            }
            if provider.credentials.is_none() {
                return Err(ConfigValidationError::new(
                    field("credentials"),
                    "활성화된 증권사에는 자격증명이 필요합니다",
                ));
            }
        }
        Ok(())
    }
}
