//! 세션 엔진의 도메인 모델.

mod account;
mod market_data;
mod order;
mod session;

pub use account::*;
pub use market_data::*;
pub use order::*;
pub use session::*;
