//! 증권사 스트림 핸들.
//!
//! `ProviderFeed`는 취소 가능한 구독 객체입니다. 소비자가 핸들을 닫거나
//! 드롭하면 생산자는 `FeedSender::is_closed`/`closed`로 이를 감지하고 멈춥니다.

use futures::Stream;
use kset_core::ErrorRecord;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// 스트림 메시지.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage<T> {
    /// 데이터
    Item(T),
    /// 스트림 장애 (이후 스트림은 종료된 것으로 간주)
    Fault(ErrorRecord),
}

/// 소비자 측 스트림 핸들.
#[derive(Debug)]
pub struct ProviderFeed<T> {
    rx: mpsc::Receiver<FeedMessage<T>>,
    cancel: CancellationToken,
}

/// 생산자 측 송신기.
#[derive(Debug)]
pub struct FeedSender<T> {
    tx: mpsc::Sender<FeedMessage<T>>,
    cancel: CancellationToken,
}

impl<T> Clone for FeedSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

/// 스트림 핸들을 소유하지 않고 닫을 수 있는 핸들.
#[derive(Debug, Clone)]
pub struct FeedCloser {
    cancel: CancellationToken,
}

impl FeedCloser {
    /// 스트림을 닫습니다.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// 닫혔는지 확인합니다.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// 버퍼 크기 `capacity`의 스트림 채널을 생성합니다.
pub fn channel<T>(capacity: usize) -> (FeedSender<T>, ProviderFeed<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let cancel = CancellationToken::new();
    (
        FeedSender {
            tx,
            cancel: cancel.clone(),
        },
        ProviderFeed { rx, cancel },
    )
}

impl<T> ProviderFeed<T> {
    /// 다음 메시지를 기다립니다. 닫혔거나 생산자가 끝나면 `None`.
    pub async fn next(&mut self) -> Option<FeedMessage<T>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            msg = self.rx.recv() => msg,
        }
    }

    /// 닫기 전용 핸들.
    pub fn closer(&self) -> FeedCloser {
        FeedCloser {
            cancel: self.cancel.clone(),
        }
    }

    /// 스트림을 닫습니다.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// 닫혔는지 확인합니다.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl<T> Drop for ProviderFeed<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<T> Stream for ProviderFeed<T> {
    type Item = FeedMessage<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        self.rx.poll_recv(cx)
    }
}

impl<T> FeedSender<T> {
    /// 데이터를 보냅니다. 소비자가 닫았으면 `false`.
    pub async fn send(&self, item: T) -> bool {
        self.deliver(FeedMessage::Item(item)).await
    }

    /// 장애를 알립니다.
    pub async fn fault(&self, error: ErrorRecord) -> bool {
        self.deliver(FeedMessage::Fault(error)).await
    }

    /// 대기 없이 데이터를 보냅니다. 버퍼가 가득 차면 버립니다.
    pub fn try_send(&self, item: T) -> bool {
        self.try_deliver(FeedMessage::Item(item))
    }

    /// 대기 없이 장애를 알립니다.
    pub fn try_fault(&self, error: ErrorRecord) -> bool {
        self.try_deliver(FeedMessage::Fault(error))
    }

    /// 소비자가 닫았는지 확인합니다.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    /// 소비자가 닫을 때까지 기다립니다.
    pub async fn closed(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.tx.closed() => {}
        }
    }

    async fn deliver(&self, msg: FeedMessage<T>) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(msg) => sent.is_ok(),
        }
    }

    fn try_deliver(&self, msg: FeedMessage<T>) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.tx.try_send(msg).is_ok()
    }
}
