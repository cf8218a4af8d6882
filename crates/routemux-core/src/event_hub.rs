//! Event hub - non-blocking in-process pub/sub.
//!
//! The hub is the backbone of routemux's event delivery: storage back-ends
//! emit every committed state change, and each watch subscription pulls its
//! own copy. Every subscriber owns a bounded queue, so a slow consumer
//! overflows alone instead of backing up the publisher or its peers; a full
//! queue kills that one subscription with [`RoutingError::Overflow`].
//!
//! Within a subscriber, events arrive in emission order, and all
//! subscribers observe the same global order (minus the prefix emitted
//! before they subscribed).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{RoutingError, RoutingResult};

/// Default per-subscriber buffer capacity.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

struct SubscriberSlot<T> {
    tx: mpsc::Sender<T>,
    overflowed: Arc<AtomicBool>,
    token: CancellationToken,
}

struct HubInner<T> {
    subscribers: Mutex<Vec<SubscriberSlot<T>>>,
    capacity: usize,
    closed: AtomicBool,
}

/// A pub/sub hub for one event family.
///
/// Cheaply cloneable; clones share the subscriber list.
pub struct EventHub<T> {
    inner: Arc<HubInner<T>>,
}

impl<T> Clone for EventHub<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> EventHub<T> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "hub buffer capacity must be positive");
        Self {
            inner: Arc::new(HubInner {
                subscribers: Mutex::new(Vec::new()),
                capacity,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Publish an event to every live subscriber.
    ///
    /// Returns immediately and never blocks: a subscriber whose buffer is
    /// full is marked overflowed and dropped from the list, and delivery
    /// to the others continues. Holding the subscriber-list lock across
    /// the loop is what gives all subscribers the same global order.
    pub fn emit(&self, event: T) {
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|slot| {
            if slot.token.is_cancelled() || slot.tx.is_closed() {
                return false;
            }
            match slot.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("[EventHub] subscriber overflowed, dropping subscription");
                    slot.overflowed.store(true, Ordering::Release);
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Register a new subscriber.
    ///
    /// The subscription yields only events emitted after this call. On a
    /// hub that has been closed with [`EventHub::close_all`], the returned
    /// subscription is already terminated.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let overflowed = Arc::new(AtomicBool::new(false));
        let token = CancellationToken::new();

        if self.inner.closed.load(Ordering::Acquire) {
            token.cancel();
            return Subscription {
                rx,
                overflowed,
                token,
            };
        }

        self.inner.subscribers.lock().push(SubscriberSlot {
            tx,
            overflowed: overflowed.clone(),
            token: token.clone(),
        });

        Subscription {
            rx,
            overflowed,
            token,
        }
    }

    /// Terminate every subscription and refuse new ones.
    ///
    /// Idempotent. Pending `next()` calls wake with
    /// [`RoutingError::Closed`].
    pub fn close_all(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let drained = std::mem::take(&mut *self.inner.subscribers.lock());
        for slot in drained {
            slot.token.cancel();
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .iter()
            .filter(|s| !s.token.is_cancelled())
            .count()
    }
}

impl<T: Clone + Send + 'static> Default for EventHub<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// One subscriber's cursor into a hub.
pub struct Subscription<T> {
    rx: mpsc::Receiver<T>,
    overflowed: Arc<AtomicBool>,
    token: CancellationToken,
}

impl<T> Subscription<T> {
    /// Wait for the next event.
    ///
    /// Terminal errors: [`RoutingError::Overflow`] once the buffer has
    /// filled, [`RoutingError::Closed`] after [`Subscription::close`] or
    /// a hub-wide close.
    pub async fn next(&mut self) -> RoutingResult<T> {
        if self.overflowed.load(Ordering::Acquire) {
            return Err(RoutingError::Overflow);
        }
        if self.token.is_cancelled() {
            return Err(RoutingError::Closed);
        }

        tokio::select! {
            _ = self.token.cancelled() => Err(RoutingError::Closed),
            event = self.rx.recv() => match event {
                Some(event) => Ok(event),
                None => {
                    if self.overflowed.load(Ordering::Acquire) {
                        Err(RoutingError::Overflow)
                    } else {
                        Err(RoutingError::Closed)
                    }
                }
            },
        }
    }

    /// Close the subscription. Idempotent; wakes a pending `next()`.
    pub fn close(&self) {
        self.token.cancel();
    }
}
