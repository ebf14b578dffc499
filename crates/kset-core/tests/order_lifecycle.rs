//! 주문 상태 머신 통합 테스트
//!
//! 임의 순서의 체결 업데이트를 병합해도 체결 수량 불변식이 유지되는지 확인합니다.

use chrono::{Duration, TimeZone, Utc};
use kset_core::{
    ErrorKind, Order, OrderAck, OrderRequest, OrderState, OrderStatus, Symbol,
};
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn submitted(quantity: u32) -> Order {
    let request = OrderRequest::limit_buy(Symbol::kr("005930"), Decimal::from(quantity), dec!(80000));
    let mut order = Order::from_request(request, "c-prop");
    order
        .mark_submitted(&OrderAck {
            provider_order_id: "P-1".to_string(),
            accepted_at: Utc::now(),
        })
        .unwrap();
    order
}

fn status_strategy() -> impl Strategy<Value = OrderStatus> {
    prop_oneof![
        Just(OrderStatus::Submitted),
        Just(OrderStatus::PartiallyFilled),
        Just(OrderStatus::Filled),
        Just(OrderStatus::Cancelled),
        Just(OrderStatus::Rejected),
    ]
}

proptest! {
    /// 어떤 업데이트 순서에서도 체결 수량은 감소하지 않고 주문 수량을 넘지 않습니다.
    #[test]
    fn fills_are_monotonic_and_bounded(
        quantity in 1u32..50,
        updates in prop::collection::vec((0u32..70, status_strategy(), 0i64..100), 0..40),
    ) {
        let mut order = submitted(quantity);
        let base = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        let mut last_filled = Decimal::ZERO;
        let mut terminal_seen: Option<OrderStatus> = None;

        for (filled, status, offset) in updates {
            order.apply_update(&OrderState {
                provider_order_id: "P-1".to_string(),
                client_order_id: None,
                status,
                filled_quantity: Decimal::from(filled),
                average_fill_price: Some(dec!(80000)),
                updated_at: base + Duration::seconds(offset),
            });

            prop_assert!(order.filled_quantity >= last_filled);
            prop_assert!(order.filled_quantity <= order.quantity);
            if let Some(terminal) = terminal_seen {
                prop_assert_eq!(order.status, terminal);
            }
            if order.status.is_terminal() {
                terminal_seen = Some(order.status);
            }
            if order.status == OrderStatus::Filled {
                prop_assert_eq!(order.filled_quantity, order.quantity);
            }
            last_filled = order.filled_quantity;
        }
    }

    /// 같은 업데이트를 두 번 적용해도 결과가 같습니다.
    #[test]
    fn applying_twice_is_idempotent(quantity in 2u32..50, filled in 0u32..50) {
        let filled = filled.min(quantity);
        let mut order = submitted(quantity);
        let update = OrderState {
            provider_order_id: "P-1".to_string(),
            client_order_id: None,
            status: OrderStatus::PartiallyFilled,
            filled_quantity: Decimal::from(filled),
            average_fill_price: Some(dec!(80100)),
            updated_at: Utc::now(),
        };
        order.apply_update(&update);
        let snapshot = (order.status, order.filled_quantity, order.average_fill_price);
        let second = order.apply_update(&update);
        prop_assert!(!second.is_applied());
        prop_assert_eq!(snapshot, (order.status, order.filled_quantity, order.average_fill_price));
    }
}

#[test]
fn test_terminal_order_rejects_cancel() {
    let mut order = submitted(10);
    order.apply_update(&OrderState {
        provider_order_id: "P-1".to_string(),
        client_order_id: None,
        status: OrderStatus::Filled,
        filled_quantity: dec!(10),
        average_fill_price: Some(dec!(80000)),
        updated_at: Utc::now(),
    });
    assert_eq!(order.status, OrderStatus::Filled);

    let err = order.mark_cancelled().unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidState);
    assert_eq!(order.status, OrderStatus::Filled);
}

#[test]
fn test_rejected_keeps_error_record() {
    let request = OrderRequest::market_buy(Symbol::kr("005930"), dec!(1));
    let mut order = Order::from_request(request, "c-rej");
    order
        .mark_rejected(kset_core::ErrorRecord::insufficient_funds("주문가능금액을 초과했습니다"))
        .unwrap();
    assert_eq!(order.status, OrderStatus::Rejected);
    assert_eq!(order.error.as_ref().map(|e| e.kind), Some(ErrorKind::InsufficientFunds));
}
