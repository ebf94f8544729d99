//! Cancellable snapshot subscriptions and the per-conversation message feed.
//!
//! A [`Subscription`] yields the full current state every time the remote side
//! changes. Cancelling it is synchronous: once [`CancelHandle::cancel`] returns,
//! `next()` yields `None` and any producer task has been aborted.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;

use crate::api::models::{ConversationId, Message};
use crate::api::RemoteStore;
use crate::error::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent<T> {
    Snapshot(T),
    Error(Error),
}

/// Shared cancel switch for a subscription and everything feeding it.
#[derive(Clone)]
pub struct CancelHandle {
    flag: Arc<watch::Sender<bool>>,
    linked: Arc<Mutex<Linked>>,
}

#[derive(Default)]
struct Linked {
    tasks: Vec<AbortHandle>,
    upstream: Vec<CancelHandle>,
}

impl CancelHandle {
    fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            flag: Arc::new(flag),
            linked: Arc::new(Mutex::new(Linked::default())),
        }
    }

    /// Stop all further emissions. Idempotent.
    pub fn cancel(&self) {
        if self.flag.send_replace(true) {
            return;
        }
        let linked = match self.linked.lock() {
            Ok(mut linked) => std::mem::take(&mut *linked),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for upstream in linked.upstream {
            upstream.cancel();
        }
        for task in linked.tasks {
            task.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.flag.borrow()
    }

    /// Tie a producer task to this subscription; it is aborted on cancel.
    pub fn bind_task(&self, task: AbortHandle) {
        match self.linked.lock() {
            Ok(mut linked) if !self.is_cancelled() => linked.tasks.push(task),
            _ => task.abort(),
        }
    }

    /// Cancel `upstream` together with this handle.
    pub fn bind_upstream(&self, upstream: CancelHandle) {
        match self.linked.lock() {
            Ok(mut linked) if !self.is_cancelled() => linked.upstream.push(upstream),
            _ => upstream.cancel(),
        }
    }
}

/// Producer side of a subscription.
pub struct FeedSender<T> {
    tx: mpsc::UnboundedSender<FeedEvent<T>>,
    cancelled: watch::Receiver<bool>,
}

impl<T> Clone for FeedSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            cancelled: self.cancelled.clone(),
        }
    }
}

impl<T> FeedSender<T> {
    /// Deliver an event. Returns false once the consumer is gone or cancelled.
    pub fn send(&self, event: FeedEvent<T>) -> bool {
        if self.is_closed() {
            return false;
        }
        self.tx.send(event).is_ok()
    }

    pub fn snapshot(&self, value: T) -> bool {
        self.send(FeedEvent::Snapshot(value))
    }

    pub fn error(&self, err: Error) -> bool {
        self.send(FeedEvent::Error(err))
    }

    pub fn is_closed(&self) -> bool {
        *self.cancelled.borrow() || self.tx.is_closed()
    }

    /// Resolves when the consumer cancels or drops the subscription.
    pub async fn closed(&self) {
        let mut cancelled = self.cancelled.clone();
        tokio::select! {
            _ = self.tx.closed() => {}
            _ = cancelled.wait_for(|c| *c) => {}
        }
    }
}

pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<FeedEvent<T>>,
    cancelled: watch::Receiver<bool>,
    handle: CancelHandle,
}

pub fn channel<T>() -> (FeedSender<T>, Subscription<T>) {
    let handle = CancelHandle::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let sender = FeedSender {
        tx,
        cancelled: handle.flag.subscribe(),
    };
    let sub = Subscription {
        rx,
        cancelled: handle.flag.subscribe(),
        handle,
    };
    (sender, sub)
}

impl<T> Subscription<T> {
    /// Next snapshot or error. `None` after cancellation or once the producer is gone.
    pub async fn next(&mut self) -> Option<FeedEvent<T>> {
        if *self.cancelled.borrow_and_update() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancelled.wait_for(|c| *c) => None,
            event = self.rx.recv() => {
                if self.handle.is_cancelled() { None } else { event }
            }
        }
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.handle.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }
}

impl<T: Send + 'static> Subscription<T> {
    /// Transform every snapshot on a relay task. Cancelling the returned
    /// subscription tears down this one too. An upstream that ends without being
    /// cancelled is reported as a transport error instead of going quiet.
    pub fn map_snapshots<U, F>(self, mut f: F) -> Subscription<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        self.then_snapshots(move |value| std::future::ready(f(value)))
    }

    /// Like [`Subscription::map_snapshots`] with an async transform. Snapshots are
    /// transformed one at a time, in arrival order.
    pub fn then_snapshots<U, F, Fut>(mut self, mut f: F) -> Subscription<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = U> + Send,
    {
        let (tx, out) = channel();
        out.handle.bind_upstream(self.cancel_handle());
        let task = tokio::spawn(async move {
            while let Some(event) = self.next().await {
                let event = match event {
                    FeedEvent::Snapshot(value) => FeedEvent::Snapshot(f(value).await),
                    FeedEvent::Error(err) => FeedEvent::Error(err),
                };
                if !tx.send(event) {
                    return;
                }
            }
            tx.error(Error::transport("subscription closed by remote"));
        });
        out.handle.bind_task(task.abort_handle());
        out
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}

/// Ascending by timestamp, ties by store sequence. Stable.
pub fn order_messages(messages: &mut [Message]) {
    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.seq.cmp(&b.seq)));
}

/// Subscribes to one conversation's message stream and normalizes every record.
#[derive(Clone)]
pub struct ChangeFeedSubscriber {
    store: Arc<dyn RemoteStore>,
}

impl ChangeFeedSubscriber {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self { store }
    }

    pub fn subscribe(&self, conversation_id: &ConversationId) -> Subscription<Vec<Message>> {
        log::debug!("subscribing to messages of {conversation_id}");
        let expected = conversation_id.clone();
        self.store
            .subscribe_messages(conversation_id)
            .map_snapshots(move |records| {
                let mut messages: Vec<Message> = records
                    .into_iter()
                    .filter(|r| r.conversation_id == expected)
                    .filter_map(|r| r.normalize())
                    .collect();
                order_messages(&mut messages);
                messages
            })
    }
}
