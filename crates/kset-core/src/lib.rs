//! # KSET Core
//!
//! 증권사 세션 엔진의 핵심 도메인 모델 및 타입을 제공합니다.
//!
//! - 종목 및 주문 타입, 주문 상태 머신
//! - 시세 스냅샷, 잔고, 보유 종목, 포트폴리오 요약
//! - 세션 상태 및 자격증명
//! - 정규화된 에러 분류 (`ErrorKind`, `ErrorRecord`)
//! - 설정 관리 및 로깅 인프라

pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod types;

pub use config::*;
pub use domain::*;
pub use error::*;
pub use logging::*;
pub use types::*;
