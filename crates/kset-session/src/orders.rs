//! 주문 추적.
//!
//! 세션이 제출한 주문을 클라이언트 주문 ID 기준으로 보관하고,
//! 증권사 주문번호 색인으로 체결 업데이트를 찾아 병합합니다.

use kset_core::{
    ErrorRecord, KsetResult, Order, OrderAck, OrderState, OrderStatus, UpdateOutcome,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::listener::{lock, Emitter, ListenerSet};

/// 주문 이벤트. 각 이벤트는 변경 직후의 주문 스냅샷을 담습니다.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "order", rename_all = "snake_case")]
pub enum OrderEvent {
    /// 주문 생성 (`PendingSubmit`)
    Created(Order),
    /// 증권사 접수
    Submitted(Order),
    /// 부분 체결
    PartiallyFilled(Order),
    /// 전량 체결
    Filled(Order),
    /// 취소
    Cancelled(Order),
    /// 거부
    Rejected(Order),
}

impl OrderEvent {
    /// 주문 상태에 해당하는 이벤트를 만듭니다.
    pub fn for_order(order: Order) -> Self {
        match order.status {
            OrderStatus::PendingSubmit => OrderEvent::Created(order),
            OrderStatus::Submitted => OrderEvent::Submitted(order),
            OrderStatus::PartiallyFilled => OrderEvent::PartiallyFilled(order),
            OrderStatus::Filled => OrderEvent::Filled(order),
            OrderStatus::Cancelled => OrderEvent::Cancelled(order),
            OrderStatus::Rejected => OrderEvent::Rejected(order),
        }
    }

    /// 이벤트에 담긴 주문.
    pub fn order(&self) -> &Order {
        match self {
            OrderEvent::Created(o)
            | OrderEvent::Submitted(o)
            | OrderEvent::PartiallyFilled(o)
            | OrderEvent::Filled(o)
            | OrderEvent::Cancelled(o)
            | OrderEvent::Rejected(o) => o,
        }
    }

    /// 클라이언트 주문 ID.
    pub fn client_order_id(&self) -> &str {
        &self.order().client_order_id
    }
}

/// 새 클라이언트 주문 ID.
pub fn generate_client_order_id() -> String {
    format!("kset-{}", Uuid::new_v4().simple())
}

#[derive(Default)]
struct OrderBook {
    orders: HashMap<String, Order>,
    by_provider_id: HashMap<String, String>,
    sequence: Vec<String>,
}

impl OrderBook {
    fn resolve(&self, update: &OrderState) -> Option<String> {
        if let Some(client_id) = self.by_provider_id.get(&update.provider_order_id) {
            return Some(client_id.clone());
        }
        update
            .client_order_id
            .as_ref()
            .filter(|id| self.orders.contains_key(*id))
            .cloned()
    }

    fn index(&mut self, order: &Order) {
        if let Some(provider_id) = &order.provider_order_id {
            self.by_provider_id
                .entry(provider_id.clone())
                .or_insert_with(|| order.client_order_id.clone());
        }
    }

    fn get_mut(&mut self, client_order_id: &str) -> KsetResult<&mut Order> {
        self.orders
            .get_mut(client_order_id)
            .ok_or_else(|| unknown_order(client_order_id))
    }
}

fn unknown_order(client_order_id: &str) -> ErrorRecord {
    ErrorRecord::invalid_state(format!("알 수 없는 주문입니다: {}", client_order_id))
}

/// 세션의 주문 장부.
///
/// 모든 변경은 발행 게이트, 장부 락 순서로 락을 잡아 직렬화되고,
/// 이벤트는 장부 락을 푼 뒤 변경 순서대로 발행됩니다. 리스너는 전달 중에
/// 주문 스냅샷을 읽을 수 있습니다.
pub(crate) struct OrderTracker {
    book: Mutex<OrderBook>,
    listeners: Arc<ListenerSet<OrderEvent>>,
}

impl Default for OrderTracker {
    fn default() -> Self {
        Self {
            book: Mutex::new(OrderBook::default()),
            listeners: Arc::new(ListenerSet::default()),
        }
    }
}

impl OrderTracker {
    pub(crate) fn listeners(&self) -> &Arc<ListenerSet<OrderEvent>> {
        &self.listeners
    }

    /// 새 주문을 등록하고 `Created`를 발행합니다.
    ///
    /// # Errors
    ///
    /// 같은 클라이언트 주문 ID가 이미 있으면 `InvalidState`.
    pub(crate) fn insert(&self, order: Order) -> KsetResult<Order> {
        let emitter = self.listeners.begin_emit();
        let mut book = lock(&self.book);
        if book.orders.contains_key(&order.client_order_id) {
            return Err(ErrorRecord::invalid_state(format!(
                "중복된 클라이언트 주문 ID입니다: {}",
                order.client_order_id
            )));
        }
        book.sequence.push(order.client_order_id.clone());
        book.orders
            .insert(order.client_order_id.clone(), order.clone());
        drop(book);

        debug!(client_order_id = %order.client_order_id, symbol = %order.symbol, "주문 생성");
        emitter.deliver(&OrderEvent::Created(order.clone()));
        Ok(order)
    }

    /// 증권사 접수를 기록합니다.
    ///
    /// 체결 스트림이 응답보다 먼저 도착해 이미 같은 주문번호로 진행된 주문이면
    /// 현재 스냅샷을 그대로 돌려줍니다.
    pub(crate) fn mark_submitted(&self, client_order_id: &str, ack: &OrderAck) -> KsetResult<Order> {
        let emitter = self.listeners.begin_emit();
        let mut book = lock(&self.book);
        let order = book.get_mut(client_order_id)?;
        if order.status != OrderStatus::PendingSubmit
            && order.provider_order_id.as_deref() == Some(ack.provider_order_id.as_str())
        {
            return Ok(order.clone());
        }
        order.mark_submitted(ack)?;
        let snapshot = order.clone();
        book.index(&snapshot);
        drop(book);

        info!(
            client_order_id,
            order_id = %ack.provider_order_id,
            "주문 접수"
        );
        emitter.deliver(&OrderEvent::Submitted(snapshot.clone()));
        Ok(snapshot)
    }

    /// 거부를 기록합니다.
    pub(crate) fn mark_rejected(&self, client_order_id: &str, error: ErrorRecord) -> KsetResult<Order> {
        let emitter = self.listeners.begin_emit();
        let mut book = lock(&self.book);
        let order = book.get_mut(client_order_id)?;
        order.mark_rejected(error)?;
        let snapshot = order.clone();
        drop(book);

        warn!(
            client_order_id,
            error = ?snapshot.error,
            "주문 거부"
        );
        emitter.deliver(&OrderEvent::Rejected(snapshot.clone()));
        Ok(snapshot)
    }

    /// 취소 확인을 기록합니다. 스트림으로 이미 취소가 반영되었으면 그대로 돌려줍니다.
    pub(crate) fn mark_cancelled(&self, client_order_id: &str) -> KsetResult<Order> {
        let emitter = self.listeners.begin_emit();
        let mut book = lock(&self.book);
        let order = book.get_mut(client_order_id)?;
        if order.status == OrderStatus::Cancelled {
            return Ok(order.clone());
        }
        order.mark_cancelled()?;
        let snapshot = order.clone();
        drop(book);

        info!(client_order_id, "주문 취소");
        emitter.deliver(&OrderEvent::Cancelled(snapshot.clone()));
        Ok(snapshot)
    }

    /// 증권사 업데이트를 병합합니다.
    ///
    /// 반영되었으면 병합 후 스냅샷을, 모르는 주문이거나 폐기되었으면 `None`을 돌려줍니다.
    pub(crate) fn apply_update(&self, update: &OrderState) -> Option<Order> {
        let emitter = self.listeners.begin_emit();
        let book = lock(&self.book);
        let Some(client_order_id) = book.resolve(update) else {
            debug!(order_id = %update.provider_order_id, "세션 밖의 주문 업데이트 무시");
            return None;
        };
        Self::merge(emitter, book, &client_order_id, update)
    }

    /// 조회 결과를 지정한 주문에 병합합니다.
    ///
    /// 증권사가 클라이언트 주문 ID를 돌려주지 않아도 접수 전 주문을 맞출 수 있습니다.
    pub(crate) fn reconcile(&self, client_order_id: &str, update: &OrderState) -> Option<Order> {
        let emitter = self.listeners.begin_emit();
        let book = lock(&self.book);
        Self::merge(emitter, book, client_order_id, update)
    }

    fn merge(
        emitter: Emitter<'_, OrderEvent>,
        mut book: MutexGuard<'_, OrderBook>,
        client_order_id: &str,
        update: &OrderState,
    ) -> Option<Order> {
        let order = book.orders.get_mut(client_order_id)?;
        let previous = match order.apply_update(update) {
            UpdateOutcome::Applied { previous } => previous,
            UpdateOutcome::Discarded(reason) => {
                debug!(
                    client_order_id = %client_order_id,
                    order_id = %update.provider_order_id,
                    reason = ?reason,
                    "주문 업데이트 폐기"
                );
                return None;
            }
        };
        let snapshot = order.clone();
        book.index(&snapshot);

        let notify = snapshot.status != previous || snapshot.status == OrderStatus::PartiallyFilled;
        drop(book);

        debug!(
            client_order_id = %client_order_id,
            from = %previous,
            to = %snapshot.status,
            filled = %snapshot.filled_quantity,
            "주문 업데이트 반영"
        );
        if notify {
            emitter.deliver(&OrderEvent::for_order(snapshot.clone()));
        }
        Some(snapshot)
    }

    /// 주문 스냅샷.
    pub(crate) fn get(&self, client_order_id: &str) -> Option<Order> {
        lock(&self.book).orders.get(client_order_id).cloned()
    }

    /// 주문 스냅샷을 찾습니다.
    ///
    /// # Errors
    ///
    /// 알 수 없는 주문이면 `InvalidState`.
    pub(crate) fn require(&self, client_order_id: &str) -> KsetResult<Order> {
        self.get(client_order_id)
            .ok_or_else(|| unknown_order(client_order_id))
    }

    /// 생성 순서대로 모든 주문.
    pub(crate) fn list(&self) -> Vec<Order> {
        let book = lock(&self.book);
        book.sequence
            .iter()
            .filter_map(|id| book.orders.get(id).cloned())
            .collect()
    }

    /// 최종 상태가 아닌 주문.
    pub(crate) fn active(&self) -> Vec<Order> {
        self.list().into_iter().filter(|o| !o.is_terminal()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use kset_core::{ErrorKind, OrderRequest, Symbol};
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn tracked(tracker: &OrderTracker, client_id: &str) -> Order {
        let request = OrderRequest::limit_buy(Symbol::kr("005930"), dec!(10), dec!(80000));
        tracker
            .insert(Order::from_request(request, client_id))
            .unwrap()
    }

    fn ack(id: &str) -> OrderAck {
        OrderAck {
            provider_order_id: id.to_string(),
            accepted_at: Utc::now(),
        }
    }

    fn state(id: &str, status: OrderStatus, filled: rust_decimal::Decimal) -> OrderState {
        OrderState {
            provider_order_id: id.to_string(),
            client_order_id: None,
            status,
            filled_quantity: filled,
            average_fill_price: Some(dec!(80000)),
            updated_at: Utc::now(),
        }
    }

    fn recorder(tracker: &OrderTracker) -> Arc<Mutex<Vec<OrderEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        tracker
            .listeners()
            .add(Arc::new(move |e: &OrderEvent| sink.lock().unwrap().push(e.clone())));
        seen
    }

    #[test]
    fn test_duplicate_client_id() {
        let tracker = OrderTracker::default();
        tracked(&tracker, "c-1");
        let request = OrderRequest::market_buy(Symbol::kr("005930"), dec!(1));
        let err = tracker
            .insert(Order::from_request(request, "c-1"))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);
    }

    #[test]
    fn test_update_resolved_by_provider_id() {
        let tracker = OrderTracker::default();
        tracked(&tracker, "c-1");
        let seen = recorder(&tracker);

        tracker.mark_submitted("c-1", &ack("0000000001")).unwrap();
        let merged = tracker
            .apply_update(&state("0000000001", OrderStatus::PartiallyFilled, dec!(4)))
            .unwrap();
        assert_eq!(merged.status, OrderStatus::PartiallyFilled);

        let events = seen.lock().unwrap();
        assert!(matches!(events[0], OrderEvent::Submitted(_)));
        assert!(matches!(events[1], OrderEvent::PartiallyFilled(_)));
    }

    #[test]
    fn test_stream_before_ack() {
        let tracker = OrderTracker::default();
        tracked(&tracker, "c-1");

        let mut early = state("0000000007", OrderStatus::Submitted, dec!(0));
        early.client_order_id = Some("c-1".to_string());
        early.average_fill_price = None;
        let merged = tracker.apply_update(&early).unwrap();
        assert_eq!(merged.status, OrderStatus::Submitted);

        let order = tracker.mark_submitted("c-1", &ack("0000000007")).unwrap();
        assert_eq!(order.provider_order_id.as_deref(), Some("0000000007"));
    }

    #[test]
    fn test_discarded_updates_emit_nothing() {
        let tracker = OrderTracker::default();
        tracked(&tracker, "c-1");
        tracker.mark_submitted("c-1", &ack("1")).unwrap();
        tracker
            .apply_update(&state("1", OrderStatus::PartiallyFilled, dec!(6)))
            .unwrap();
        let seen = recorder(&tracker);

        let mut stale = state("1", OrderStatus::PartiallyFilled, dec!(4));
        stale.updated_at = Utc::now() - Duration::seconds(5);
        assert!(tracker.apply_update(&stale).is_none());
        assert!(tracker
            .apply_update(&state("unknown", OrderStatus::Filled, dec!(10)))
            .is_none());
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(tracker.get("c-1").unwrap().filled_quantity, dec!(6));
    }

    #[test]
    fn test_cancel_after_stream_cancel() {
        let tracker = OrderTracker::default();
        tracked(&tracker, "c-1");
        tracker.mark_submitted("c-1", &ack("1")).unwrap();
        tracker
            .apply_update(&state("1", OrderStatus::Cancelled, dec!(0)))
            .unwrap();

        let order = tracker.mark_cancelled("c-1").unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(tracker.active().len(), 0);
        assert_eq!(tracker.list().len(), 1);
    }

    #[test]
    fn test_event_wire_format() {
        let tracker = OrderTracker::default();
        let order = tracked(&tracker, "c-1");
        let json = serde_json::to_value(OrderEvent::for_order(order)).unwrap();
        assert_eq!(json["type"], "created");
        assert_eq!(json["order"]["client_order_id"], "c-1");
    }

    fn arb_status() -> impl Strategy<Value = OrderStatus> {
        prop_oneof![
            Just(OrderStatus::Submitted),
            Just(OrderStatus::PartiallyFilled),
            Just(OrderStatus::Filled),
            Just(OrderStatus::Cancelled),
            Just(OrderStatus::Rejected),
        ]
    }

    proptest! {
        #[test]
        fn prop_merged_fills_never_regress(
            updates in proptest::collection::vec((arb_status(), 0u32..=12, -3i64..3), 1..20)
        ) {
            let tracker = OrderTracker::default();
            tracked(&tracker, "c-1");
            tracker.mark_submitted("c-1", &ack("1")).unwrap();
            let base = Utc::now();

            let mut previous = tracker.get("c-1").unwrap();
            for (status, filled, skew) in updates {
                let mut update = state("1", status, rust_decimal::Decimal::from(filled));
                update.updated_at = base + Duration::seconds(skew);
                tracker.apply_update(&update);

                let current = tracker.get("c-1").unwrap();
                prop_assert!(current.filled_quantity >= previous.filled_quantity);
                prop_assert!(current.filled_quantity <= current.quantity);
                if previous.is_terminal() {
                    prop_assert_eq!(current.status, previous.status);
                }
                previous = current;
            }
        }
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = generate_client_order_id();
        let b = generate_client_order_id();
        assert_ne!(a, b);
        assert!(a.starts_with("kset-"));
    }
}
