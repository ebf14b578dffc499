//! 증권사 연결 계층.
//!
//! 이 크레이트는 다음을 제공합니다:
//! - Provider trait: 증권사 중립 기능 인터페이스
//! - ProviderFeed: 취소 가능한 스트림 핸들
//! - Rate limiting: 증권사별 Token Bucket
//! - 재시도: 지수 백오프 재시도 조정
//! - KIS 에러 응답 정규화
//! - 시뮬레이션 증권사 (테스트 및 모의 실행용)

pub mod connector;
pub mod feed;
pub mod rate_limit;
pub mod retry;
pub mod simulated;
pub mod traits;

pub use feed::{FeedCloser, FeedMessage, FeedSender, ProviderFeed};
pub use rate_limit::RateLimiter;
pub use retry::{
    with_retry, with_retry_context, with_retry_if, RetryConfig, RetryContext, RetryStats,
};
pub use simulated::{SimOperation, SimulatedConfig, SimulatedProvider};
pub use traits::*;
