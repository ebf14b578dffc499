//! 세션 및 자격증명 타입.

use crate::error::{ErrorRecord, KsetResult};
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// 연결 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// 연결되지 않음 (재연결 가능)
    Disconnected,
    /// 인증 진행 중
    Connecting,
    /// 인증 완료, 사용 가능
    Connected,
    /// 전송 계층 단절 후 복구 중
    Reconnecting,
    /// 종료됨 (재사용 불가)
    Closed,
}

impl ConnectionState {
    /// 요청을 처리할 수 있는 상태인지 확인합니다.
    pub fn is_usable(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// 실행 환경.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// 실거래
    Production,
    /// 개발
    #[default]
    Development,
    /// 스테이징
    Staging,
}

/// 자격증명 종류.
///
/// 증권사마다 인증 방식이 다릅니다. KIS처럼 AppKey/AppSecret을 쓰는 곳과
/// 공동인증서를 쓰는 곳이 있습니다.
#[derive(Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialKind {
    /// API 키 방식
    ApiKey {
        /// 앱 키
        app_key: String,
        /// 앱 시크릿
        app_secret: SecretString,
    },
    /// 인증서 방식
    Certificate {
        /// 인증서 경로
        path: PathBuf,
        /// 인증서 비밀번호
        password: SecretString,
    },
}

/// 계좌 자격증명.
///
/// 비밀 값은 `Debug` 출력이나 로그에 노출되지 않습니다.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    /// 계좌번호 (세션 식별에 사용)
    pub account: String,
    /// 인증 정보
    #[serde(flatten)]
    pub kind: CredentialKind,
}

impl Credentials {
    /// API 키 자격증명을 생성합니다.
    pub fn api_key(
        account: impl Into<String>,
        app_key: impl Into<String>,
        app_secret: impl Into<String>,
    ) -> Self {
        Self {
            account: account.into(),
            kind: CredentialKind::ApiKey {
                app_key: app_key.into(),
                app_secret: SecretString::from(app_secret.into()),
            },
        }
    }

    /// 인증서 자격증명을 생성합니다.
    pub fn certificate(
        account: impl Into<String>,
        path: impl Into<PathBuf>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            account: account.into(),
            kind: CredentialKind::Certificate {
                path: path.into(),
                password: SecretString::from(password.into()),
            },
        }
    }

    /// 필수 항목이 모두 채워져 있는지 검증합니다.
    ///
    /// # Errors
    ///
    /// 비어 있는 항목이 있으면 `Authentication`.
    pub fn validate(&self) -> KsetResult<()> {
        if self.account.trim().is_empty() {
            return Err(ErrorRecord::authentication("계좌번호가 비어 있습니다"));
        }
        match &self.kind {
            CredentialKind::ApiKey {
                app_key,
                app_secret,
            } => {
                if app_key.trim().is_empty() || app_secret.expose_secret().trim().is_empty() {
                    return Err(ErrorRecord::authentication(
                        "AppKey 또는 AppSecret이 비어 있습니다",
                    ));
                }
            }
            CredentialKind::Certificate { path, password } => {
                if path.as_os_str().is_empty() || password.expose_secret().is_empty() {
                    return Err(ErrorRecord::authentication(
                        "인증서 경로 또는 비밀번호가 비어 있습니다",
                    ));
                }
            }
        }
        Ok(())
    }

    /// 비밀 값을 가린 계좌번호 (로그용).
    pub fn masked_account(&self) -> String {
        let chars: Vec<char> = self.account.chars().collect();
        if chars.len() <= 4 {
            return "*".repeat(chars.len());
        }
        let visible: String = chars[chars.len() - 4..].iter().collect();
        format!("{}{}", "*".repeat(chars.len() - 4), visible)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            CredentialKind::ApiKey { .. } => "api_key",
            CredentialKind::Certificate { .. } => "certificate",
        };
        f.debug_struct("Credentials")
            .field("account", &self.masked_account())
            .field("kind", &kind)
            .finish_non_exhaustive()
    }
}

/// 증권사와 계좌로 이루어진 세션 식별자.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    /// 증권사 식별자
    pub provider: String,
    /// 계좌번호
    pub account: String,
}

impl SessionKey {
    /// 새 식별자를 생성합니다.
    pub fn new(provider: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            account: account.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.account)
    }
}

/// 세션 요약 정보 (조회용 스냅샷).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// 증권사 식별자
    pub provider: String,
    /// 가려진 계좌번호
    pub account: String,
    /// 실행 환경
    pub environment: Environment,
    /// 모의투자 여부
    pub demo: bool,
    /// 연결 상태
    pub state: ConnectionState,
    /// 마지막 인증 시각
    pub connected_at: Option<DateTime<Utc>>,
    /// 인증 만료 시각
    pub expires_at: Option<DateTime<Utc>>,
}
