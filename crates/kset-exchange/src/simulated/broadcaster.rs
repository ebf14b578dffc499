//! 시뮬레이션 증권사를 위한 스트림 브로드캐스터.

use kset_core::ErrorRecord;

use crate::feed::{self, FeedSender, ProviderFeed};

/// 여러 구독자 스트림에 같은 데이터를 보냅니다.
///
/// 소비자가 닫은 스트림은 다음 전송 때 정리됩니다.
#[derive(Debug)]
pub struct FeedBroadcaster<T> {
    senders: Vec<FeedSender<T>>,
}

impl<T> Default for FeedBroadcaster<T> {
    fn default() -> Self {
        Self {
            senders: Vec::new(),
        }
    }
}

impl<T: Clone> FeedBroadcaster<T> {
    /// 새 구독 스트림을 엽니다.
    pub fn subscribe(&mut self, buffer_size: usize) -> ProviderFeed<T> {
        let (tx, rx) = feed::channel(buffer_size);
        self.senders.push(tx);
        rx
    }

    /// 모든 구독자에게 보냅니다. 버퍼가 가득 찬 구독자는 이번 데이터를 놓칩니다.
    pub fn broadcast(&mut self, item: &T) {
        self.senders.retain(|sender| !sender.is_closed());
        for sender in &self.senders {
            sender.try_send(item.clone());
        }
    }

    /// 모든 구독자에게 장애를 알리고 연결을 끊습니다.
    pub fn fault_all(&mut self, error: &ErrorRecord) {
        for sender in self.senders.drain(..) {
            sender.try_fault(error.clone());
        }
    }

    /// 모든 구독을 끊습니다 (소비자는 스트림 종료를 봅니다).
    pub fn close_all(&mut self) {
        self.senders.clear();
    }

    /// 열려 있는 구독 수.
    pub fn open_count(&self) -> usize {
        self.senders.iter().filter(|s| !s.is_closed()).count()
    }
}
