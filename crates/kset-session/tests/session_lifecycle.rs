//! 세션 수명주기 통합 테스트
//!
//! 연결, 중복 식별자, 종료, 재연결 시나리오를 시뮬레이션 증권사로 검증합니다.

mod common;

use common::*;
use kset_core::{ConnectionState, ErrorKind, OrderRequest};
use kset_exchange::{Provider, SimOperation, SimulatedProvider};
use kset_session::{MarketDataEvent, OrderEvent, SessionEvent, SessionRegistry, TradingSession};
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_connect_reports_session_info() {
    let (sim, session) = connected().await;

    assert_eq!(session.state(), ConnectionState::Connected);
    let info = session.info();
    assert_eq!(info.provider, "sim");
    assert_eq!(info.account, "******5601");
    assert!(info.demo);
    assert!(info.connected_at.is_some());
    assert!(info.expires_at.is_some());
    assert_eq!(sim.open_order_streams().await, 1);

    session.connect().await.unwrap();
    assert_eq!(sim.call_count(SimOperation::Authenticate).await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_expired_credentials_leave_session_disconnected() {
    let (sim, session) = setup_with(provider_config()).await;
    sim.expire_credentials().await;

    let err = session.connect().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Authentication);
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(session.info().connected_at.is_none());
    assert_eq!(sim.open_order_streams().await, 0);

    let err = session
        .get_market_data(&samsung())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidState);

    sim.restore_credentials().await;
    session.connect().await.unwrap();
    assert_eq!(session.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_missing_credentials() {
    let mut config = provider_config();
    config.credentials = None;
    let (_sim, session) = setup_with(config).await;
    let err = session.connect().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Authentication);
    assert!(session.session_key().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_one_live_session_per_identity() {
    let sim = SimulatedProvider::default();
    let provider: Arc<dyn Provider> = Arc::new(sim.clone());
    let registry = SessionRegistry::new();
    let open = |registry: &SessionRegistry| {
        TradingSession::with_registry(
            provider.clone(),
            &provider_config(),
            &session_config(),
            registry.clone(),
        )
    };

    let first = open(&registry);
    let second = open(&registry);
    first.connect().await.unwrap();

    let err = second.connect().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidState);
    assert_eq!(second.state(), ConnectionState::Disconnected);

    first.disconnect().await.unwrap();
    assert!(registry.is_empty());
    second.connect().await.unwrap();
    assert!(registry.is_live(&second.session_key().unwrap()));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_closes_everything() {
    let (sim, session) = connected().await;
    let symbol = samsung();

    let (session_events, on_session) = recorder::<SessionEvent>();
    let _session_sub = session.subscribe_session_events(on_session);
    let (order_events, on_order) = recorder::<OrderEvent>();
    let _order_sub = session.subscribe_orders(on_order);
    let (market_events, on_market) = recorder::<MarketDataEvent>();
    let _market_sub = session
        .subscribe_market_data(symbol.clone(), on_market)
        .await
        .unwrap();

    let order = session
        .create_order(OrderRequest::limit_buy(symbol.clone(), dec!(10), dec!(80000)))
        .await
        .unwrap();
    session.disconnect().await.unwrap();

    assert_eq!(session.state(), ConnectionState::Closed);
    assert_eq!(sim.open_order_streams().await, 0);
    assert_eq!(sim.open_market_streams(&symbol).await, 0);
    assert_eq!(
        session_events.lock().unwrap().last(),
        Some(&SessionEvent::Closed)
    );

    let orders_before = order_events.lock().unwrap().len();
    let market_before = market_events.lock().unwrap().len();
    sim.publish_price(&symbol, dec!(81000)).await;
    let _ = sim
        .fill_order(order.provider_order_id.as_deref().unwrap(), dec!(10), dec!(80000))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(order_events.lock().unwrap().len(), orders_before);
    assert_eq!(market_events.lock().unwrap().len(), market_before);

    let err = session
        .create_order(OrderRequest::market_buy(symbol.clone(), dec!(1)))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::SessionClosed);
    assert_eq!(
        session.get_market_data(&symbol).await.unwrap_err().kind,
        ErrorKind::SessionClosed
    );
    assert_eq!(
        session
            .subscribe_market_data(symbol.clone(), |_: &MarketDataEvent| {})
            .await
            .unwrap_err()
            .kind,
        ErrorKind::SessionClosed
    );
    assert_eq!(
        session.connect().await.unwrap_err().kind,
        ErrorKind::SessionClosed
    );

    session.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_aborts_in_flight_call() {
    let (sim, session) = connected().await;
    sim.set_latency(SimOperation::FetchBalance, Duration::from_secs(5))
        .await;

    let pending = {
        let session = session.clone();
        tokio::spawn(async move { session.get_balance().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    session.disconnect().await.unwrap();

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.kind, ErrorKind::SessionClosed);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_spaces_calls() {
    let (_sim, session) = setup_with(provider_config().with_rate_limit(2.0, 1)).await;
    session.connect().await.unwrap();

    let start = Instant::now();
    for _ in 0..3 {
        session.get_market_data(&samsung()).await.unwrap();
    }
    assert!(start.elapsed() >= Duration::from_millis(1_000));
}

#[tokio::test(start_paused = true)]
async fn test_transport_drop_recovers() {
    let (sim, session) = connected().await;
    let symbol = samsung();
    let (session_events, on_session) = recorder::<SessionEvent>();
    let _session_sub = session.subscribe_session_events(on_session);
    let (market_events, on_market) = recorder::<MarketDataEvent>();
    let _market_sub = session
        .subscribe_market_data(symbol.clone(), on_market)
        .await
        .unwrap();

    sim.drop_transport().await;

    eventually(|| {
        session_events
            .lock()
            .unwrap()
            .contains(&SessionEvent::Reconnected)
    })
    .await;
    assert_eq!(session.state(), ConnectionState::Connected);
    assert!(matches!(
        session_events.lock().unwrap()[0],
        SessionEvent::Reconnecting { attempt: 1 }
    ));

    eventually(|| {
        market_events
            .lock()
            .unwrap()
            .contains(&MarketDataEvent::Resumed)
    })
    .await;
    assert!(market_events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, MarketDataEvent::Stalled { .. })));

    sim.publish_price(&symbol, dec!(80500)).await;
    eventually(|| {
        matches!(
            market_events.lock().unwrap().last(),
            Some(MarketDataEvent::Snapshot { snapshot }) if snapshot.last == dec!(80500)
        )
    })
    .await;

    let order = session
        .create_order(OrderRequest::limit_buy(symbol.clone(), dec!(1), dec!(80000)))
        .await
        .unwrap();
    sim.fill_order(order.provider_order_id.as_deref().unwrap(), dec!(1), dec!(80000))
        .await
        .unwrap();
    eventually(|| {
        session
            .order(&order.client_order_id)
            .is_some_and(|o| o.is_terminal())
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_failure_closes_session() {
    let (sim, session) = connected().await;
    let (session_events, on_session) = recorder::<SessionEvent>();
    let _session_sub = session.subscribe_session_events(on_session);

    sim.expire_credentials().await;
    sim.drop_transport().await;

    let mut states = session.state_changes();
    tokio::time::timeout(
        Duration::from_secs(30),
        states.wait_for(|s| *s == ConnectionState::Closed),
    )
    .await
    .unwrap()
    .unwrap();

    let events = session_events.lock().unwrap().clone();
    assert!(matches!(
        events.iter().rev().nth(1),
        Some(SessionEvent::ConnectionLost { error }) if error.kind == ErrorKind::Authentication
    ));
    assert_eq!(events.last(), Some(&SessionEvent::Closed));

    let err = session.get_balance().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::SessionClosed);
}

#[tokio::test(start_paused = true)]
async fn test_disabled_provider_refuses_to_connect() {
    let mut config = provider_config();
    config.enabled = false;
    let (sim, session) = setup_with(config).await;

    let err = session.connect().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidState);
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert_eq!(sim.call_count(SimOperation::Authenticate).await, 0);
    assert_eq!(sim.open_order_streams().await, 0);
}
