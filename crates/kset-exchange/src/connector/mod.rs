//! 증권사별 어댑터 구성 요소.

pub mod kis;
