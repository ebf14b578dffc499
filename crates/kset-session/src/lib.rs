//! 세션 엔진.
//!
//! 이 crate는 다음을 제공합니다:
//! - 인증, 재연결, 종료를 포함한 세션 수명주기
//! - 주문 상태 기계와 체결 업데이트 병합
//! - 종목별 스트림을 공유하는 시세 구독 허브
//! - 요청 한도와 재시도가 적용된 증권사 호출 경로
//!
//! # 예제
//!
//! ```rust,ignore
//! use kset_session::{OrderEvent, TradingSession};
//!
//! let session = TradingSession::new(provider, &provider_config, &session_config);
//! session.connect().await?;
//! let _orders = session.subscribe_orders(|event: &OrderEvent| tracing::info!(?event));
//! ```

mod engine;
mod gateway;
pub mod listener;
pub mod market_data;
pub mod orders;
pub mod registry;
mod session;

// 주요 타입 재내보내기
pub use engine::{OrderSubscription, SessionSubscription, TradingSession};
pub use listener::{Listener, ListenerHandle, ListenerId, ListenerSet};
pub use market_data::{FeedHealth, MarketDataEvent, MarketDataSubscription};
pub use orders::{generate_client_order_id, OrderEvent};
pub use registry::{SessionClaim, SessionRegistry};
pub use session::SessionEvent;
