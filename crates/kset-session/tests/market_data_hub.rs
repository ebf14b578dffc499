//! 시세 구독 허브 통합 테스트
//!
//! 종목별 스트림 공유, 마지막 시세 재생, 구독 해제, 장애 복구를 검증합니다.

mod common;

use common::*;
use kset_core::{ErrorKind, ErrorRecord, Symbol};
use kset_exchange::SimOperation;
use kset_session::{FeedHealth, MarketDataEvent};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::time::Duration;

fn last_prices(events: &[MarketDataEvent]) -> Vec<Decimal> {
    events
        .iter()
        .filter_map(|e| match e {
            MarketDataEvent::Snapshot { snapshot } => Some(snapshot.last),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_two_subscribers_share_one_stream() {
    let (sim, session) = connected().await;
    let symbol = samsung();

    let (first_events, first) = recorder::<MarketDataEvent>();
    let first_sub = session
        .subscribe_market_data(symbol.clone(), first)
        .await
        .unwrap();
    sim.publish_price(&symbol, dec!(80100)).await;
    eventually(|| first_events.lock().unwrap().len() == 1).await;

    let (second_events, second) = recorder::<MarketDataEvent>();
    let second_sub = session
        .subscribe_market_data(symbol.clone(), second)
        .await
        .unwrap();
    assert_eq!(last_prices(&second_events.lock().unwrap()), vec![dec!(80100)]);

    assert_eq!(sim.call_count(SimOperation::StreamMarketData).await, 1);
    assert_eq!(sim.open_market_streams(&symbol).await, 1);
    assert_eq!(session.market_subscriber_count(&symbol).await, 2);
    assert_eq!(session.market_feed_health(&symbol).await, Some(FeedHealth::Active));

    sim.publish_price(&symbol, dec!(80200)).await;
    eventually(|| second_events.lock().unwrap().len() == 2).await;
    eventually(|| first_events.lock().unwrap().len() == 2).await;
    assert_eq!(
        last_prices(&first_events.lock().unwrap()),
        vec![dec!(80100), dec!(80200)]
    );

    first_sub.unsubscribe().await;
    assert_eq!(sim.open_market_streams(&symbol).await, 1);
    assert_eq!(session.market_subscriber_count(&symbol).await, 1);

    second_sub.unsubscribe().await;
    assert_eq!(sim.open_market_streams(&symbol).await, 0);
    assert!(session.subscribed_symbols().await.is_empty());
    assert_eq!(session.market_feed_health(&symbol).await, None);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_handle_unsubscribes() {
    let (sim, session) = connected().await;
    let symbol = samsung();

    let sub = session
        .subscribe_market_data(symbol.clone(), |_: &MarketDataEvent| {})
        .await
        .unwrap();
    assert_eq!(sub.symbol(), &symbol);
    drop(sub);

    for _ in 0..100 {
        if session.subscribed_symbols().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(session.subscribed_symbols().await.is_empty());
    assert_eq!(sim.open_market_streams(&symbol).await, 0);

    let _again = session
        .subscribe_market_data(symbol.clone(), |_: &MarketDataEvent| {})
        .await
        .unwrap();
    assert_eq!(sim.call_count(SimOperation::StreamMarketData).await, 2);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_symbol_leaves_no_entry() {
    let (_sim, session) = connected().await;

    let err = session
        .subscribe_market_data(Symbol::kr("999999"), |_: &MarketDataEvent| {})
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidSymbol);

    let err = session
        .subscribe_market_data(Symbol::kr("ABC"), |_: &MarketDataEvent| {})
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidSymbol);
    assert!(session.subscribed_symbols().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stream_fault_stalls_then_resumes() {
    let (sim, session) = connected().await;
    let symbol = samsung();
    let (events, listener) = recorder::<MarketDataEvent>();
    let _sub = session
        .subscribe_market_data(symbol.clone(), listener)
        .await
        .unwrap();

    sim.fault_market_stream(
        &symbol,
        ErrorRecord::provider("TRANSPORT", "시세 연결 끊김", true),
    )
    .await;

    eventually(|| events.lock().unwrap().contains(&MarketDataEvent::Resumed)).await;
    assert!(matches!(
        events.lock().unwrap()[0],
        MarketDataEvent::Stalled { .. }
    ));
    assert_eq!(session.market_feed_health(&symbol).await, Some(FeedHealth::Active));
    assert_eq!(sim.call_count(SimOperation::StreamMarketData).await, 2);

    sim.publish_price(&symbol, dec!(79900)).await;
    eventually(|| last_prices(&events.lock().unwrap()) == vec![dec!(79900)]).await;
}

#[tokio::test(start_paused = true)]
async fn test_stream_terminates_after_exhausted_retries() {
    let (sim, session) = connected().await;
    let symbol = samsung();
    let (events, listener) = recorder::<MarketDataEvent>();
    let _sub = session
        .subscribe_market_data(symbol.clone(), listener)
        .await
        .unwrap();

    sim.fail_times(
        SimOperation::StreamMarketData,
        10,
        ErrorRecord::provider("EGW00500", "일시적 장애", true),
    )
    .await;
    sim.fault_market_stream(&symbol, ErrorRecord::timeout("no data"))
        .await;

    eventually(|| {
        matches!(
            events.lock().unwrap().last(),
            Some(MarketDataEvent::Terminated { .. })
        )
    })
    .await;
    assert!(session.subscribed_symbols().await.is_empty());

    let count = events.lock().unwrap().len();
    sim.publish_price(&symbol, dec!(1)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(events.lock().unwrap().len(), count);
}

#[tokio::test(start_paused = true)]
async fn test_get_market_data() {
    let (sim, session) = connected().await;
    let snapshot = session.get_market_data(&samsung()).await.unwrap();
    assert_eq!(snapshot.last, dec!(80000));

    sim.fail_next(SimOperation::FetchMarketData, ErrorRecord::rate_limit("EGW00201"))
        .await;
    assert!(session.get_market_data(&samsung()).await.is_ok());
    assert_eq!(sim.call_count(SimOperation::FetchMarketData).await, 3);

    let err = session
        .get_market_data(&Symbol::kr("999999"))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidSymbol);
}

#[tokio::test(start_paused = true)]
async fn test_slow_stream_open_does_not_block_other_symbols() {
    let (sim, session) = connected().await;
    let hynix = Symbol::kr("000660");
    sim.publish_price(&hynix, dec!(180000)).await;
    let _hynix_sub = session
        .subscribe_market_data(hynix.clone(), |_: &MarketDataEvent| {})
        .await
        .unwrap();

    sim.set_latency(SimOperation::StreamMarketData, Duration::from_secs(2))
        .await;
    let opener = session.clone();
    let pending = tokio::spawn(async move {
        opener
            .subscribe_market_data(samsung(), |_: &MarketDataEvent| {})
            .await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let lookups = async {
        let symbols = session.subscribed_symbols().await;
        let health = session.market_feed_health(&hynix).await;
        let joined = session
            .subscribe_market_data(hynix.clone(), |_: &MarketDataEvent| {})
            .await;
        (symbols, health, joined)
    };
    let (symbols, health, joined) = tokio::time::timeout(Duration::from_millis(100), lookups)
        .await
        .expect("lookups waited on another symbol's stream open");
    assert_eq!(symbols, vec![hynix.clone()]);
    assert_eq!(health, Some(FeedHealth::Active));
    let _second = joined.unwrap();
    assert_eq!(session.market_subscriber_count(&hynix).await, 2);

    let _samsung_sub = pending.await.unwrap().unwrap();
    assert_eq!(session.subscribed_symbols().await, vec![hynix, samsung()]);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_first_subscribers_open_once() {
    let (sim, session) = connected().await;
    sim.set_latency(SimOperation::StreamMarketData, Duration::from_millis(500))
        .await;

    let spawn_subscriber = || {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .subscribe_market_data(samsung(), |_: &MarketDataEvent| {})
                .await
        })
    };
    let first = spawn_subscriber();
    let second = spawn_subscriber();
    let _first = first.await.unwrap().unwrap();
    let _second = second.await.unwrap().unwrap();

    assert_eq!(sim.call_count(SimOperation::StreamMarketData).await, 1);
    assert_eq!(sim.open_market_streams(&samsung()).await, 1);
    assert_eq!(session.market_subscriber_count(&samsung()).await, 2);
}
