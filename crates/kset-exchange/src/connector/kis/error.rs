//! KIS 에러 응답 정규화.
//!
//! KIS REST 응답은 `rt_cd`/`msg_cd`/`msg1` 봉투를, 토큰 발급 실패는
//! `error_code`/`error_description` 형식을 사용합니다. 두 형식 모두
//! 정확히 하나의 `ErrorKind`로 분류합니다.

use kset_core::{ErrorKind, ErrorRecord, KsetResult};
use serde::Deserialize;
use tracing::warn;

/// KIS API 응답 봉투.
#[derive(Debug, Clone, Deserialize)]
pub struct KisErrorResponse {
    /// 응답 코드 (0 = 성공)
    pub rt_cd: String,
    /// 메시지 코드
    pub msg_cd: String,
    /// 메시지 내용
    pub msg1: String,
}

/// KIS OAuth 에러 응답.
#[derive(Debug, Clone, Deserialize)]
pub struct KisOAuthErrorResponse {
    /// 에러 코드 (예: "EGW00103")
    pub error_code: String,
    /// 에러 설명
    pub error_description: String,
}

/// 게이트웨이 코드별 분류.
fn classify_gateway_code(code: &str) -> Option<ErrorKind> {
    match code {
        // 유효하지 않은 AppKey / 만료된 AppKey / AppSecret 불일치
        "EGW00101" | "EGW00102" | "EGW00103" => Some(ErrorKind::Authentication),
        // 기간이 만료된 token / 유효하지 않은 token
        "EGW00121" | "EGW00123" => Some(ErrorKind::Authentication),
        // 초당 거래건수 초과
        "EGW00201" => Some(ErrorKind::RateLimit),
        // 1분당 1회 토큰 발급 제한
        "EGW00133" => Some(ErrorKind::RateLimit),
        _ => None,
    }
}

/// 메시지 내용으로 분류합니다. 주문 거부는 대부분 `APBK` 코드에 사유가 문장으로 옵니다.
fn classify_message(message: &str) -> Option<ErrorKind> {
    const RULES: &[(&str, ErrorKind)] = &[
        ("장종료", ErrorKind::MarketClosed),
        ("장운영", ErrorKind::MarketClosed),
        ("장개시", ErrorKind::MarketClosed),
        ("주문가능금액", ErrorKind::InsufficientFunds),
        ("잔고가 부족", ErrorKind::InsufficientFunds),
        ("매도가능수량", ErrorKind::InsufficientFunds),
        ("종목코드", ErrorKind::InvalidSymbol),
        ("존재하지 않는 종목", ErrorKind::InvalidSymbol),
        ("거래건수를 초과", ErrorKind::RateLimit),
        ("정정/취소할 수량이 없", ErrorKind::InvalidState),
        ("이미 체결", ErrorKind::InvalidState),
    ];
    RULES
        .iter()
        .find(|(needle, _)| message.contains(needle))
        .map(|(_, kind)| *kind)
}

impl KisErrorResponse {
    /// 성공 응답인지 확인합니다.
    pub fn is_success(&self) -> bool {
        self.rt_cd == "0"
    }

    /// 실패 응답을 `ErrorRecord`로 변환합니다.
    pub fn to_error_record(&self) -> ErrorRecord {
        let message = self.msg1.trim().to_string();
        let kind = classify_gateway_code(&self.msg_cd).or_else(|| classify_message(&message));
        match kind {
            Some(kind) => ErrorRecord::new(kind, message).with_native_code(&self.msg_cd),
            // rt_cd 1은 처리 실패, 그 외(예: 7)는 일시 장애로 간주
            None => ErrorRecord::provider(&self.msg_cd, message, self.rt_cd != "1"),
        }
    }

    /// 실패 응답이면 에러를 반환합니다.
    pub fn check(&self) -> KsetResult<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(self.to_error_record())
        }
    }
}

impl KisOAuthErrorResponse {
    /// `ErrorRecord`로 변환합니다.
    pub fn to_error_record(&self) -> ErrorRecord {
        let message = match self.error_code.as_str() {
            "EGW00103" => "유효하지 않은 AppKey입니다".to_string(),
            "EGW00102" => "AppKey가 만료되었습니다".to_string(),
            "EGW00101" => "AppSecret이 일치하지 않습니다".to_string(),
            _ => self.error_description.trim().to_string(),
        };
        let kind = classify_gateway_code(&self.error_code).unwrap_or(ErrorKind::Authentication);
        ErrorRecord::new(kind, message).with_native_code(&self.error_code)
    }
}

/// HTTP 상태 코드와 응답 본문으로 에러를 분류합니다.
///
/// OAuth 형식, 봉투 형식 순으로 해석하고, 둘 다 아니면 상태 코드로 판단합니다.
pub fn classify_http_error(status: u16, body: &str) -> ErrorRecord {
    if let Ok(oauth) = serde_json::from_str::<KisOAuthErrorResponse>(body) {
        return oauth.to_error_record();
    }
    if let Ok(envelope) = serde_json::from_str::<KisErrorResponse>(body) {
        if !envelope.is_success() {
            return envelope.to_error_record();
        }
    }

    let code = format!("HTTP{}", status);
    match status {
        401 | 403 => ErrorRecord::authentication(format!("인증 실패 (HTTP {})", status))
            .with_native_code(code),
        408 | 504 => ErrorRecord::timeout(format!("응답 시간 초과 (HTTP {})", status))
            .with_native_code(code),
        429 => ErrorRecord::rate_limit("요청 한도 초과").with_native_code(code),
        500..=599 => ErrorRecord::provider(code, truncate(body), true),
        _ => {
            warn!(status, "분류되지 않은 KIS 응답");
            ErrorRecord::provider(code, truncate(body), false)
        }
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(200).collect()
}
