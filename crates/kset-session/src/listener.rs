//! 이벤트 리스너 집합.
//!
//! 전달은 발행 게이트 아래에서 직렬화됩니다. `clear`는 진행 중인 전달이
//! 끝날 때까지 기다리므로, `clear`가 반환된 뒤에는 어떤 리스너도 호출되지 않습니다.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// 이벤트 수신자.
pub trait Listener<E>: Send + Sync + 'static {
    /// 이벤트를 처리합니다. 발행 게이트 아래에서 호출되므로 빨리 반환해야 합니다.
    ///
    /// 세션의 조회(스냅샷) 메서드는 호출해도 됩니다.
    fn on_event(&self, event: &E);
}

impl<E, F> Listener<E> for F
where
    F: Fn(&E) + Send + Sync + 'static,
{
    fn on_event(&self, event: &E) {
        self(event)
    }
}

/// 리스너 식별자 (프로세스 내 고유).
pub type ListenerId = u64;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

fn next_listener_id() -> ListenerId {
    NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Registered<E> {
    listeners: Vec<(ListenerId, Arc<dyn Listener<E>>)>,
    closed: bool,
}

/// 리스너 집합.
pub struct ListenerSet<E> {
    registered: Mutex<Registered<E>>,
    emit_gate: Mutex<()>,
}

impl<E> Default for ListenerSet<E> {
    fn default() -> Self {
        Self {
            registered: Mutex::new(Registered {
                listeners: Vec::new(),
                closed: false,
            }),
            emit_gate: Mutex::new(()),
        }
    }
}

impl<E: 'static> ListenerSet<E> {
    /// 리스너를 추가합니다. 이미 닫힌 집합이면 `None`.
    pub fn add(&self, listener: Arc<dyn Listener<E>>) -> Option<ListenerId> {
        let mut registered = lock(&self.registered);
        if registered.closed {
            return None;
        }
        let id = next_listener_id();
        registered.listeners.push((id, listener));
        Some(id)
    }

    /// 리스너를 추가하면서 그 리스너에게만 `replay`를 먼저 전달합니다.
    ///
    /// 재생과 추가가 발행 게이트 아래에서 일어나므로 이후 이벤트보다 항상 먼저 도착합니다.
    pub fn add_with_replay(
        &self,
        listener: Arc<dyn Listener<E>>,
        replay: Option<&E>,
    ) -> Option<ListenerId> {
        let _gate = lock(&self.emit_gate);
        let id = self.add(listener.clone())?;
        if let Some(event) = replay {
            listener.on_event(event);
        }
        Some(id)
    }

    /// 리스너를 제거합니다. 있었으면 `true`.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut registered = lock(&self.registered);
        let before = registered.listeners.len();
        registered.listeners.retain(|(lid, _)| *lid != id);
        registered.listeners.len() != before
    }

    /// 등록된 리스너 수.
    pub fn len(&self) -> usize {
        lock(&self.registered).listeners.len()
    }

    /// 비어 있는지 확인합니다.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 모든 리스너에게 전달합니다.
    pub fn emit(&self, event: &E) {
        self.begin_emit().deliver(event);
    }

    /// 발행 게이트를 잡습니다.
    ///
    /// 호출자는 자신의 상태 락보다 먼저 게이트를 얻고, 상태 락을 푼 뒤 `deliver`합니다.
    /// 이벤트 순서가 상태 변경 순서와 같아지고, 리스너는 그 상태를 다시 읽을 수 있습니다.
    pub fn begin_emit(&self) -> Emitter<'_, E> {
        let gate = lock(&self.emit_gate);
        let listeners = lock(&self.registered)
            .listeners
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        Emitter {
            _gate: gate,
            listeners,
        }
    }

    /// 모든 리스너를 제거하고 집합을 닫습니다. 진행 중인 전달이 끝날 때까지 기다립니다.
    pub fn clear(&self) {
        let _gate = lock(&self.emit_gate);
        let mut registered = lock(&self.registered);
        registered.closed = true;
        registered.listeners.clear();
    }

    /// 닫혔는지 확인합니다.
    pub fn is_closed(&self) -> bool {
        lock(&self.registered).closed
    }
}

/// 발행 게이트를 잡은 전달자.
pub struct Emitter<'a, E> {
    _gate: MutexGuard<'a, ()>,
    listeners: Vec<Arc<dyn Listener<E>>>,
}

impl<E: 'static> Emitter<'_, E> {
    /// 게이트를 잡은 시점의 리스너들에게 전달합니다.
    pub fn deliver(&self, event: &E) {
        for listener in &self.listeners {
            listener.on_event(event);
        }
    }
}

/// 리스너 등록 핸들. 드롭하거나 `unsubscribe`하면 리스너가 제거됩니다.
#[must_use = "핸들을 버리면 리스너가 즉시 제거됩니다"]
pub struct ListenerHandle<E: 'static> {
    set: Weak<ListenerSet<E>>,
    id: Option<ListenerId>,
}

impl<E: 'static> ListenerHandle<E> {
    pub(crate) fn new(set: &Arc<ListenerSet<E>>, id: Option<ListenerId>) -> Self {
        Self {
            set: Arc::downgrade(set),
            id,
        }
    }

    /// 리스너가 등록되어 있는지 확인합니다. 닫힌 세션에 등록하면 `false`.
    pub fn is_active(&self) -> bool {
        match (self.id, self.set.upgrade()) {
            (Some(_), Some(set)) => !set.is_closed(),
            _ => false,
        }
    }

    /// 리스너를 제거합니다.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let (Some(id), Some(set)) = (self.id.take(), self.set.upgrade()) {
            set.remove(id);
        }
    }
}

impl<E: 'static> Drop for ListenerHandle<E> {
    fn drop(&mut self) {
        self.release();
    }
}
