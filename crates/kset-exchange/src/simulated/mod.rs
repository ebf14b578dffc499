//! 테스트와 데모를 위한 시뮬레이션 증권사.
//!
//! 실제 증권사 없이 세션 엔진 전체를 돌려볼 수 있습니다.
//!
//! # 예제
//!
//! ```ignore
//! use kset_exchange::simulated::{SimulatedProvider, SimulatedConfig};
//!
//! let sim = SimulatedProvider::new(SimulatedConfig::default().with_initial_cash(dec!(5_000_000)));
//! sim.publish_price(&Symbol::kr("005930"), dec!(80000)).await;
//!
//! // 세션에는 Arc<dyn Provider>로 주입합니다
//! let provider: Arc<dyn Provider> = Arc::new(sim.clone());
//! ```

mod broadcaster;
mod provider;

pub use broadcaster::FeedBroadcaster;
pub use provider::{SimOperation, SimulatedConfig, SimulatedProvider};
