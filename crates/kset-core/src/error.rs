//! 세션 엔진의 에러 타입.
//!
//! 모든 증권사 고유 에러는 Provider 경계를 넘기 전에 정확히 하나의
//! [`ErrorKind`]로 정규화됩니다. 호출자는 증권사 고유 코드가 아니라
//! `kind`로 분기해야 합니다.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// 정규화된 에러 분류.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 자격증명이 유효하지 않거나 만료됨
    Authentication,
    /// 장 운영 시간이 아니어서 거부됨
    MarketClosed,
    /// 잔고 부족으로 주문 거부
    InsufficientFunds,
    /// 알 수 없거나 잘못된 종목 식별자
    InvalidSymbol,
    /// 로컬 또는 증권사 측 요청 한도 초과
    RateLimit,
    /// 호출자 기한 내 응답 없음
    Timeout,
    /// 현재 주문/세션 상태에서 허용되지 않는 작업
    InvalidState,
    /// 연결 해제 이후 또는 해제 도중의 작업
    SessionClosed,
    /// 분류되지 않은 증권사 고유 에러
    Provider,
}

impl ErrorKind {
    /// 이 분류의 기본 재시도 가능 여부.
    ///
    /// `Provider`는 증권사의 복구 가능성 힌트에 따라 결정되므로 기본값은 `false`입니다.
    pub fn default_retryable(&self) -> bool {
        matches!(self, ErrorKind::RateLimit | ErrorKind::Timeout)
    }

    /// 진단용 이름 (예: `AuthenticationError`).
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::Authentication => "AuthenticationError",
            ErrorKind::MarketClosed => "MarketClosedError",
            ErrorKind::InsufficientFunds => "InsufficientFundsError",
            ErrorKind::InvalidSymbol => "InvalidSymbolError",
            ErrorKind::RateLimit => "RateLimitError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::InvalidState => "InvalidStateError",
            ErrorKind::SessionClosed => "SessionClosedError",
            ErrorKind::Provider => "ProviderError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 정규화된 실패 기록.
///
/// 사용자에게 노출되는 모든 실패는 분류, 사람이 읽을 수 있는 메시지,
/// 그리고 가능한 경우 원래의 증권사 고유 코드를 함께 가집니다.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}{}", .native_code.as_ref().map(|c| format!(" [{}]", c)).unwrap_or_default())]
pub struct ErrorRecord {
    /// 에러 분류
    pub kind: ErrorKind,
    /// 증권사 고유 에러 코드 (진단용으로 보존)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native_code: Option<String>,
    /// 사람이 읽을 수 있는 메시지
    pub message: String,
    /// 재시도 가능 여부
    pub retryable: bool,
}

/// 세션 엔진 작업을 위한 Result 타입.
pub type KsetResult<T> = Result<T, ErrorRecord>;

impl ErrorRecord {
    /// 분류의 기본 재시도 정책으로 새 기록을 생성합니다.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            native_code: None,
            message: message.into(),
            retryable: kind.default_retryable(),
        }
    }

    /// 인증 에러.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, message)
    }

    /// 장 종료 에러.
    pub fn market_closed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MarketClosed, message)
    }

    /// 잔고 부족 에러.
    pub fn insufficient_funds(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InsufficientFunds, message)
    }

    /// 잘못된 종목 에러.
    pub fn invalid_symbol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidSymbol, message)
    }

    /// 요청 한도 초과 에러.
    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimit, message)
    }

    /// 타임아웃 에러.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// 잘못된 상태 에러.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState, message)
    }

    /// 세션 종료 에러.
    pub fn session_closed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SessionClosed, message)
    }

    /// 분류되지 않은 증권사 에러.
    ///
    /// `recoverable`은 증권사가 제공하는 복구 가능성 힌트입니다.
    pub fn provider(code: impl Into<String>, message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            kind: ErrorKind::Provider,
            native_code: Some(code.into()),
            message: message.into(),
            retryable: recoverable,
        }
    }

    /// 증권사 고유 코드를 붙입니다.
    pub fn with_native_code(mut self, code: impl Into<String>) -> Self {
        self.native_code = Some(code.into());
        self
    }

    /// 재시도 가능 여부를 덮어씁니다.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// 재시도 가능한 에러인지 확인합니다.
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// 주어진 분류인지 확인합니다.
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// 세션을 더 이상 사용할 수 없게 만드는 에러인지 확인합니다.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind, ErrorKind::Authentication | ErrorKind::SessionClosed)
    }
}

impl From<serde_json::Error> for ErrorRecord {
    fn from(err: serde_json::Error) -> Self {
        ErrorRecord::provider("PARSE", err.to_string(), false)
    }
}
