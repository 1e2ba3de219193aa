//! Fan-out publish/subscribe bus for status and staking-address changes.
//!
//! Every subscriber owns a bounded [`tokio::sync::mpsc`] queue. [`Dispatcher::publish`]
//! uses `try_send`, so a subscriber whose queue is full simply misses the event and
//! the publisher never blocks. Subscribers that need the latest value regardless of
//! drops read [`Dispatcher::current`].

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;

use crate::staking::StakingAddress;
use crate::status::NodeStatus;

/// Queue capacity of each subscriber.
pub const SUBSCRIBER_CAPACITY: usize = 10;

pub type StatusDispatcher = Dispatcher<NodeStatus>;
pub type AddressChangedDispatcher = Dispatcher<Vec<StakingAddress>>;

struct Subscriber<E> {
    id: u64,
    name: String,
    tx: mpsc::Sender<E>,
    /// `None` means every event.
    interest: Option<Vec<E>>,
}

struct Inner<E> {
    current: E,
    next_id: u64,
    subscribers: Vec<Subscriber<E>>,
}

/// Typed fan-out bus. Cloning yields another handle to the same bus.
pub struct Dispatcher<E> {
    inner: Arc<RwLock<Inner<E>>>,
}

impl<E> Clone for Dispatcher<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Clone + PartialEq + Send + 'static> Dispatcher<E> {
    pub fn new(initial: E) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                current: initial,
                next_id: 0,
                subscribers: Vec::new(),
            })),
        }
    }

    /// Record `event` as current and deliver it to every interested subscriber.
    pub fn publish(&self, event: E) {
        let mut inner = self.write();
        inner.current = event.clone();
        for sub in &inner.subscribers {
            let interested = sub
                .interest
                .as_ref()
                .map_or(true, |interest| interest.contains(&event));
            if !interested {
                continue;
            }
            if let Err(e) = sub.tx.try_send(event.clone()) {
                tracing::debug!(subscriber = %sub.name, reason = %e, "dropping event for subscriber");
            }
        }
    }

    /// Subscribe to the events listed in `interest` only.
    pub fn subscribe(&self, interest: &[E], name: &str) -> (mpsc::Receiver<E>, Unsubscribe<E>) {
        self.register(Some(interest.to_vec()), name)
    }

    /// Subscribe to every published event.
    pub fn subscribe_all(&self, name: &str) -> (mpsc::Receiver<E>, Unsubscribe<E>) {
        self.register(None, name)
    }

    pub fn current(&self) -> E {
        self.read().current.clone()
    }

    pub fn has_subscribers(&self) -> bool {
        !self.read().subscribers.is_empty()
    }

    pub fn subscriber_count(&self) -> usize {
        self.read().subscribers.len()
    }

    fn register(&self, interest: Option<Vec<E>>, name: &str) -> (mpsc::Receiver<E>, Unsubscribe<E>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let mut inner = self.write();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push(Subscriber {
            id,
            name: name.to_string(),
            tx,
            interest,
        });
        tracing::debug!(subscriber = name, "subscribed");
        let handle = Unsubscribe {
            inner: Arc::clone(&self.inner),
            id,
        };
        (rx, handle)
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner<E>> {
        self.inner.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner<E>> {
        self.inner.write().unwrap_or_else(|p| p.into_inner())
    }
}

/// Removes one subscriber from its bus, which drops its sender and closes the
/// receiver's queue. Calling it more than once is a no-op.
pub struct Unsubscribe<E> {
    inner: Arc<RwLock<Inner<E>>>,
    id: u64,
}

impl<E> Unsubscribe<E> {
    pub fn unsubscribe(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
        if let Some(pos) = inner.subscribers.iter().position(|sub| sub.id == self.id) {
            let sub = inner.subscribers.remove(pos);
            tracing::debug!(subscriber = %sub.name, "unsubscribed");
        }
    }
}
