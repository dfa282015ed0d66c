//! A bounded message queue with a configurable overflow policy.
//!
//! `tokio::sync::mpsc` is bounded but has no notion of "drop the oldest
//! entry when full" — callers only get back-pressure or an outright
//! rejection. The drop policies in `spec` §4.8 need all three behaviors
//! selectable at construction time, so this wraps a `VecDeque` behind a
//! `parking_lot::Mutex` with a `Notify` pair for waking blocked
//! producers/consumers, in the same spirit as the daemon's `Locker`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    Block,
    DropOldest,
    DropNew,
}

impl Default for DropPolicy {
    fn default() -> Self {
        DropPolicy::Block
    }
}

pub struct MessageQueue {
    inner: Mutex<VecDeque<Message>>,
    capacity: usize,
    policy: DropPolicy,
    not_empty: Notify,
    not_full: Notify,
    closed: AtomicBool,
    depth: AtomicUsize,
    dropped: AtomicU64,
}

impl MessageQueue {
    pub fn new(capacity: usize, policy: DropPolicy) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            policy,
            not_empty: Notify::new(),
            not_full: Notify::new(),
            closed: AtomicBool::new(false),
            depth: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueues `msg` per the configured policy. Returns `true` if the
    /// message was accepted, `false` if it was dropped (only possible under
    /// [`DropPolicy::DropNew`]).
    pub async fn push(&self, msg: Message) -> bool {
        loop {
            {
                let mut q = self.inner.lock();
                if q.len() < self.capacity {
                    q.push_back(msg);
                    self.depth.store(q.len(), Ordering::SeqCst);
                    self.not_empty.notify_one();
                    return true;
                }

                match self.policy {
                    DropPolicy::DropOldest => {
                        q.pop_front();
                        q.push_back(msg);
                        self.dropped.fetch_add(1, Ordering::SeqCst);
                        self.depth.store(q.len(), Ordering::SeqCst);
                        self.not_empty.notify_one();
                        return true;
                    }
                    DropPolicy::DropNew => {
                        self.dropped.fetch_add(1, Ordering::SeqCst);
                        return false;
                    }
                    DropPolicy::Block => {}
                }
            }

            self.not_full.notified().await;
        }
    }

    /// Pops the next message, waiting for one if the queue is empty. Returns
    /// `None` once the queue has been closed and drained.
    pub async fn pop(&self) -> Option<Message> {
        loop {
            {
                let mut q = self.inner.lock();
                if let Some(msg) = q.pop_front() {
                    self.depth.store(q.len(), Ordering::SeqCst);
                    self.not_full.notify_one();
                    return Some(msg);
                }
                if self.closed.load(Ordering::SeqCst) {
                    return None;
                }
            }

            self.not_empty.notified().await;
        }
    }

    /// Drains whatever remains without blocking, discarding it and
    /// incrementing the drop counter. Used once `drain_timeout` elapses
    /// during `Stop()`.
    pub fn discard_remaining(&self) -> usize {
        let mut q = self.inner.lock();
        let remaining = q.len();
        q.clear();
        self.depth.store(0, Ordering::SeqCst);
        self.dropped.fetch_add(remaining as u64, Ordering::SeqCst);
        self.not_full.notify_waiters();
        remaining
    }

    /// Marks the queue closed: pending and future `pop()` calls return
    /// `None` once the queue is empty, but anything already queued is still
    /// delivered.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.not_empty.notify_waiters();
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drop_new_rejects_when_full() {
        let q = MessageQueue::new(1, DropPolicy::DropNew);
        assert!(q.push(Message::new("a".into(), 1)).await);
        assert!(!q.push(Message::new("b".into(), 2)).await);
        assert_eq!(q.depth(), 1);
        assert_eq!(q.dropped(), 1);
    }

    #[tokio::test]
    async fn drop_oldest_evicts_front() {
        let q = MessageQueue::new(1, DropPolicy::DropOldest);
        assert!(q.push(Message::new("a".into(), 1)).await);
        assert!(q.push(Message::new("b".into(), 2)).await);
        let popped = q.pop().await.unwrap();
        assert_eq!(popped.content, "b");
    }

    #[tokio::test]
    async fn fifo_order_preserved() {
        let q = MessageQueue::new(8, DropPolicy::Block);
        for i in 0..5u64 {
            q.push(Message::new(i.to_string(), i)).await;
        }
        for i in 0..5u64 {
            assert_eq!(q.pop().await.unwrap().sequence, i);
        }
    }

    #[tokio::test]
    async fn close_drains_then_returns_none() {
        let q = MessageQueue::new(4, DropPolicy::Block);
        q.push(Message::new("a".into(), 1)).await;
        q.close();
        assert_eq!(q.pop().await.unwrap().content, "a");
        assert!(q.pop().await.is_none());
    }
}
