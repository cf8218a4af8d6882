//! Embedded hierarchical key-value store with native TTL leases.
//!
//! Keys are slash-separated paths; watchers follow a path prefix and
//! receive every put/delete under it in commit order. A put may attach a
//! lease; when the lease lapses the key disappears from reads at once and
//! the expirer task turns it into a delete event flagged `expired`. The
//! tree lock is held across mutate-and-dispatch, which is what makes the
//! event order equal the commit order.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Buffered events per watcher; a watcher that stops draining is dropped.
const WATCH_BUFFER: usize = 256;

/// A change under a watched prefix.
#[derive(Debug, Clone, PartialEq)]
pub enum KvEvent {
    Put {
        key: String,
        value: String,
        /// Value this put replaced, if the key was live.
        prev: Option<String>,
    },
    Delete {
        key: String,
        value: String,
        /// True when the delete is a lapsed lease rather than an explicit
        /// removal.
        expired: bool,
    },
}

struct KvEntry {
    value: String,
    /// Lease deadline; `None` means the key never expires.
    lease_deadline: Option<Instant>,
}

impl KvEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.lease_deadline.is_some_and(|deadline| deadline <= now)
    }
}

struct WatcherSlot {
    prefix: String,
    tx: mpsc::Sender<KvEvent>,
}

struct KvInner {
    tree: Mutex<BTreeMap<String, KvEntry>>,
    watchers: Mutex<Vec<WatcherSlot>>,
    lease_wake: Notify,
}

impl KvInner {
    /// Deliver an event to every watcher whose prefix covers the key.
    /// Called with the tree lock held; never blocks.
    fn dispatch(&self, event: KvEvent) {
        let key = match &event {
            KvEvent::Put { key, .. } | KvEvent::Delete { key, .. } => key.clone(),
        };
        self.watchers.lock().retain(|slot| {
            if !key.starts_with(&slot.prefix) {
                return true;
            }
            match slot.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("[KvStore] watcher on '{}' stalled, dropping it", slot.prefix);
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Remove every lapsed lease and emit its expired delete.
    fn reap(&self, now: Instant) -> usize {
        let mut tree = self.tree.lock();
        let lapsed: Vec<String> = tree
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &lapsed {
            if let Some(entry) = tree.remove(key) {
                self.dispatch(KvEvent::Delete {
                    key: key.clone(),
                    value: entry.value,
                    expired: true,
                });
            }
        }
        lapsed.len()
    }

    fn earliest_deadline(&self) -> Option<Instant> {
        self.tree
            .lock()
            .values()
            .filter_map(|entry| entry.lease_deadline)
            .min()
    }
}

/// Handle to a watched subtree.
pub struct KvWatcher {
    rx: mpsc::Receiver<KvEvent>,
}

impl KvWatcher {
    /// Next event under the prefix; `None` once the store shuts down.
    pub async fn recv(&mut self) -> Option<KvEvent> {
        self.rx.recv().await
    }
}

/// The store itself. Owns the expirer task; dropping the store stops it.
pub struct KvStore {
    inner: Arc<KvInner>,
    expirer_token: CancellationToken,
}

impl KvStore {
    /// Create an empty store and start its lease expirer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        let inner = Arc::new(KvInner {
            tree: Mutex::new(BTreeMap::new()),
            watchers: Mutex::new(Vec::new()),
            lease_wake: Notify::new(),
        });
        let expirer_token = CancellationToken::new();

        tokio::spawn(run_expirer(inner.clone(), expirer_token.clone()));

        Self {
            inner,
            expirer_token,
        }
    }

    /// Live value at `key`, if any. A lapsed lease is invisible even
    /// before the expirer reaps it.
    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let tree = self.inner.tree.lock();
        let entry = tree.get(key)?;
        if entry.is_expired(now) {
            return None;
        }
        Some(entry.value.clone())
    }

    /// All live `(key, value)` pairs under a prefix, in key order.
    pub fn range(&self, prefix: &str) -> Vec<(String, String)> {
        let now = Instant::now();
        self.inner
            .tree
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }

    /// Write `key`, optionally under a lease. Returns the live value the
    /// put replaced.
    ///
    /// Overwriting a lapsed-but-unreaped key first emits its expired
    /// delete, so a lease history never loses its terminal event.
    pub fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Option<String> {
        let now = Instant::now();
        let lease_deadline = ttl.map(|ttl| now + ttl);

        let prev = {
            let mut tree = self.inner.tree.lock();
            let prev = match tree.remove(key) {
                Some(entry) if entry.is_expired(now) => {
                    self.inner.dispatch(KvEvent::Delete {
                        key: key.to_string(),
                        value: entry.value,
                        expired: true,
                    });
                    None
                }
                Some(entry) => Some(entry.value),
                None => None,
            };

            tree.insert(
                key.to_string(),
                KvEntry {
                    value: value.clone(),
                    lease_deadline,
                },
            );
            self.inner.dispatch(KvEvent::Put {
                key: key.to_string(),
                value,
                prev: prev.clone(),
            });
            prev
        };

        // the new lease may be the earliest; re-arm the expirer
        if lease_deadline.is_some() {
            self.inner.lease_wake.notify_one();
        }
        prev
    }

    /// Remove a live key. Returns its value, or `None` when the key is
    /// absent or its lease has lapsed (the expirer owns that delete).
    pub fn delete(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let mut tree = self.inner.tree.lock();

        match tree.get(key) {
            Some(entry) if entry.is_expired(now) => None,
            Some(_) => {
                let entry = tree.remove(key)?;
                self.inner.dispatch(KvEvent::Delete {
                    key: key.to_string(),
                    value: entry.value.clone(),
                    expired: false,
                });
                Some(entry.value)
            }
            None => None,
        }
    }

    /// Watch every change under a path prefix.
    pub fn watch(&self, prefix: &str) -> KvWatcher {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        self.inner.watchers.lock().push(WatcherSlot {
            prefix: prefix.to_string(),
            tx,
        });
        KvWatcher { rx }
    }
}

impl Default for KvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for KvStore {
    fn drop(&mut self) {
        self.expirer_token.cancel();
    }
}

/// Sleeps until the earliest lease deadline, reaps, repeats. Puts with a
/// nearer deadline wake it through `lease_wake`.
async fn run_expirer(inner: Arc<KvInner>, token: CancellationToken) {
    loop {
        match inner.earliest_deadline() {
            None => {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = inner.lease_wake.notified() => {}
                }
            }
            Some(deadline) => {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = inner.lease_wake.notified() => {}
                    _ = tokio::time::sleep_until(deadline) => {
                        let reaped = inner.reap(Instant::now());
                        if reaped > 0 {
                            debug!("[KvStore] reaped {reaped} lapsed leases");
                        }
                    }
                }
            }
        }
    }
    // clearing the watcher list closes every watcher channel
    inner.watchers.lock().clear();
    debug!("[KvStore] expirer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = KvStore::new();

        assert!(store.get("/a/b").is_none());
        assert!(store.put("/a/b", "one".into(), None).is_none());
        assert_eq!(store.get("/a/b").unwrap(), "one");

        assert_eq!(store.put("/a/b", "two".into(), None).unwrap(), "one");
        assert_eq!(store.delete("/a/b").unwrap(), "two");
        assert!(store.get("/a/b").is_none());
        assert!(store.delete("/a/b").is_none());
    }

    #[tokio::test]
    async fn test_range_is_prefix_scoped() {
        let store = KvStore::new();
        store.put("/routes/http/a", "1".into(), None);
        store.put("/routes/http/b", "2".into(), None);
        store.put("/routes/tcp/c", "3".into(), None);

        let pairs = store.range("/routes/http/");
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0, "/routes/http/a");
        assert_eq!(pairs[1].0, "/routes/http/b");
    }

    #[tokio::test]
    async fn test_watch_sees_put_prev_and_delete() {
        let store = KvStore::new();
        let mut watcher = store.watch("/r/");

        store.put("/r/x", "one".into(), None);
        store.put("/r/x", "two".into(), None);
        store.delete("/r/x");
        store.put("/other/y", "ignored".into(), None);

        assert_eq!(
            watcher.recv().await.unwrap(),
            KvEvent::Put {
                key: "/r/x".into(),
                value: "one".into(),
                prev: None
            }
        );
        assert_eq!(
            watcher.recv().await.unwrap(),
            KvEvent::Put {
                key: "/r/x".into(),
                value: "two".into(),
                prev: Some("one".into())
            }
        );
        assert_eq!(
            watcher.recv().await.unwrap(),
            KvEvent::Delete {
                key: "/r/x".into(),
                value: "two".into(),
                expired: false
            }
        );
    }

    #[tokio::test]
    async fn test_lease_expiry_is_native() {
        let store = KvStore::new();
        let mut watcher = store.watch("/r/");

        store.put("/r/leased", "v".into(), Some(Duration::from_millis(50)));

        // visible while the lease holds
        assert_eq!(store.get("/r/leased").unwrap(), "v");

        let put = watcher.recv().await.unwrap();
        assert!(matches!(put, KvEvent::Put { .. }));

        let expired = tokio::time::timeout(Duration::from_secs(2), watcher.recv())
            .await
            .expect("expiry within the lease window")
            .unwrap();
        assert_eq!(
            expired,
            KvEvent::Delete {
                key: "/r/leased".into(),
                value: "v".into(),
                expired: true
            }
        );
        assert!(store.get("/r/leased").is_none());
    }

    #[tokio::test]
    async fn test_lapsed_key_is_invisible_before_reap() {
        let store = KvStore::new();
        store.put("/r/k", "v".into(), Some(Duration::from_millis(10)));

        tokio::time::sleep(Duration::from_millis(30)).await;

        // even if the expirer has not run yet, reads and deletes treat the
        // key as gone
        assert!(store.get("/r/k").is_none());
        assert!(store.delete("/r/k").is_none());
        assert!(store.range("/r/").is_empty());
    }

    #[tokio::test]
    async fn test_overwriting_a_lapsed_key_ends_its_lease_first() {
        let store = KvStore::new();

        store.put("/r/k", "old".into(), Some(Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(30)).await;

        let mut watcher = store.watch("/r/");
        let prev = store.put("/r/k", "new".into(), Some(Duration::from_secs(60)));
        assert!(prev.is_none(), "a lapsed value is not a predecessor");

        // did the expirer already reap it, or did the put?  either way the
        // watcher attached after the lapse sees the rebirth as a create
        let event = watcher.recv().await.unwrap();
        match event {
            KvEvent::Delete { expired: true, .. } => {
                let put = watcher.recv().await.unwrap();
                assert!(matches!(put, KvEvent::Put { prev: None, .. }));
            }
            KvEvent::Put { prev, .. } => assert!(prev.is_none()),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
