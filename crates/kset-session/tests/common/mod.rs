//! 세션 통합 테스트 공용 도구.

#![allow(dead_code)]

use kset_core::{Credentials, ProviderConfig, ReconnectConfig, SessionConfig, Symbol};
use kset_exchange::{Provider, SimulatedProvider};
use kset_session::{SessionRegistry, TradingSession};
use rust_decimal_macros::dec;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const ACCOUNT: &str = "5012345601";

pub fn provider_config() -> ProviderConfig {
    ProviderConfig::new(Credentials::api_key(ACCOUNT, "app-key", "app-secret"))
        .with_demo(true)
        .with_rate_limit(100.0, 20)
}

pub fn session_config() -> SessionConfig {
    SessionConfig {
        reconnect: ReconnectConfig {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2.0,
        },
        ..Default::default()
    }
}

pub fn samsung() -> Symbol {
    Symbol::kr("005930")
}

/// 삼성전자 80,000원 시세가 등록된 시뮬레이션 증권사와 세션 (연결 전).
pub async fn setup_with(config: ProviderConfig) -> (SimulatedProvider, TradingSession) {
    let sim = SimulatedProvider::default();
    sim.publish_price(&samsung(), dec!(80000)).await;
    let provider: Arc<dyn Provider> = Arc::new(sim.clone());
    let session = TradingSession::with_registry(
        provider,
        &config,
        &session_config(),
        SessionRegistry::new(),
    );
    (sim, session)
}

/// 연결된 세션.
pub async fn connected() -> (SimulatedProvider, TradingSession) {
    let (sim, session) = setup_with(provider_config()).await;
    session.connect().await.unwrap();
    (sim, session)
}

/// 이벤트를 모으는 리스너.
pub fn recorder<E: Clone + Send + 'static>(
) -> (Arc<Mutex<Vec<E>>>, impl Fn(&E) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |event: &E| sink.lock().unwrap().push(event.clone()))
}

/// 조건이 참이 될 때까지 기다립니다 (가상 시간 기준 최대 30초).
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..3_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
