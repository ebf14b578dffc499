//! 한국투자증권(KIS) 어댑터 구성 요소.
//!
//! 전송 계층(REST/WebSocket 클라이언트)은 이 크레이트 밖에 있습니다.
//! 여기서는 KIS 응답을 세션 엔진 타입으로 바꾸는 경계만 다룹니다:
//! - 에러 봉투 및 OAuth 에러 분류
//! - 일별 주문체결조회 결과 변환

mod error;
mod execution;

pub use error::{classify_http_error, KisErrorResponse, KisOAuthErrorResponse};
pub use execution::KrOrderExecution;
