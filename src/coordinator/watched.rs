//! Re-arming subscriptions over one-shot store watches
//!
//! Store watches fire once. [`WatchedValue`] turns them into a durable
//! subscription: on every firing it re-reads the value while arming the next
//! watch in the same store call, then hands the fresh value to the listener.
//! Because read and re-arm are one step, a write landing between two firings
//! always trips the new watch.

use crate::common::{Error, Result};
use crate::store::{decode_optional, CoordinationStore, WatchedEvent, Watcher};
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Receives the value after each change; `None` means the value is absent.
pub trait WatchedValueListener<T>: Send + Sync {
    fn on_watched_value_change(&self, value: Option<T>);
}

impl<T, F> WatchedValueListener<T> for F
where
    F: Fn(Option<T>) + Send + Sync,
{
    fn on_watched_value_change(&self, value: Option<T>) {
        self(value)
    }
}

/// Where a watched value comes from and how it is decoded.
pub trait WatchSource: Send + Sync + 'static {
    type Value: Send + 'static;

    /// Path the watch is armed on (for logging)
    fn path(&self) -> &str;

    /// Read the current value, arming `watcher` in the same store call.
    fn load(
        &self,
        store: &dyn CoordinationStore,
        watcher: Option<Watcher>,
    ) -> Result<Option<Self::Value>>;
}

/// Typed value stored as the data of a single node. A missing node or an
/// empty body both read as `None`.
pub struct NodeValue<T> {
    path: String,
    _value: PhantomData<fn() -> T>,
}

impl<T> NodeValue<T> {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            _value: PhantomData,
        }
    }
}

impl<T> WatchSource for NodeValue<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Value = T;

    fn path(&self) -> &str {
        &self.path
    }

    fn load(&self, store: &dyn CoordinationStore, watcher: Option<Watcher>) -> Result<Option<T>> {
        match store.get_data(&self.path, watcher)? {
            Some((data, _)) => decode_optional(&data),
            None => Ok(None),
        }
    }
}

struct Slot<T> {
    generation: u64,
    listener: Option<Arc<dyn WatchedValueListener<T>>>,
    /// A store watch is outstanding; subscribing again reuses it
    armed: bool,
}

struct Inner<S: WatchSource> {
    store: Arc<dyn CoordinationStore>,
    source: S,
    slot: Mutex<Slot<S::Value>>,
}

impl<S: WatchSource> Inner<S> {
    fn slot(&self) -> MutexGuard<'_, Slot<S::Value>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listener_for(&self, generation: u64) -> Option<Arc<dyn WatchedValueListener<S::Value>>> {
        let slot = self.slot();
        if slot.generation == generation {
            slot.listener.clone()
        } else {
            None
        }
    }

    /// Mark the watch as gone and, if `generation` is still current, drop
    /// its listener and hand it back.
    fn disarm(&self, generation: u64) -> Option<Arc<dyn WatchedValueListener<S::Value>>> {
        let mut slot = self.slot();
        slot.armed = false;
        if slot.generation == generation {
            slot.listener.take()
        } else {
            None
        }
    }

    fn watcher(self: &Arc<Self>) -> Watcher {
        let inner: Weak<Self> = Arc::downgrade(self);
        Box::new(move |event| {
            if let Some(inner) = inner.upgrade() {
                inner.on_fire(event);
            }
        })
    }

    fn on_fire(self: &Arc<Self>, event: WatchedEvent) {
        let generation = {
            let mut slot = self.slot();
            // Cancelled since this watch was armed: let it lapse
            if slot.listener.is_none() {
                slot.armed = false;
                tracing::trace!("Watch on {} lapsed without a listener", self.source.path());
                return;
            }
            slot.generation
        };

        let value = match self.source.load(self.store.as_ref(), Some(self.watcher())) {
            Ok(value) => value,
            Err(Error::SessionEnded(session)) => {
                // Everything this session owned is gone; tell the listener once
                tracing::info!(
                    "Session {:#x} ended, {} reported absent",
                    session,
                    self.source.path()
                );
                if let Some(listener) = self.disarm(generation) {
                    listener.on_watched_value_change(None);
                }
                return;
            }
            Err(e) => {
                tracing::warn!(
                    "Watch on {} could not be re-armed after {:?}, subscription dropped: {}",
                    self.source.path(),
                    event.event_type,
                    e
                );
                self.disarm(generation);
                return;
            }
        };

        tracing::debug!(
            "Watch on {} re-armed after {:?}",
            self.source.path(),
            event.event_type
        );

        // Look the listener up again: it may have been replaced during the read
        if let Some(listener) = self.listener_for(generation) {
            listener.on_watched_value_change(value);
        }
    }
}

/// Durable subscription to one value in the coordination store. At most one
/// listener is active per instance.
pub struct WatchedValue<S: WatchSource> {
    inner: Arc<Inner<S>>,
}

impl<S: WatchSource> WatchedValue<S> {
    pub fn new(store: Arc<dyn CoordinationStore>, source: S) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                source,
                slot: Mutex::new(Slot {
                    generation: 0,
                    listener: None,
                    armed: false,
                }),
            }),
        }
    }

    pub fn path(&self) -> &str {
        self.inner.source.path()
    }

    /// Current value, or `None` when absent
    pub fn read(&self) -> Result<Option<S::Value>> {
        self.inner.source.load(self.inner.store.as_ref(), None)
    }

    /// Install `listener`, replacing any previous one. The listener is not
    /// called until the value next changes.
    pub fn subscribe(&self, listener: Arc<dyn WatchedValueListener<S::Value>>) -> Result<()> {
        let (generation, arm) = {
            let mut slot = self.inner.slot();
            slot.generation += 1;
            slot.listener = Some(listener);
            let arm = !slot.armed;
            slot.armed = true;
            (slot.generation, arm)
        };

        let watcher = arm.then(|| self.inner.watcher());
        if let Err(e) = self.inner.source.load(self.inner.store.as_ref(), watcher) {
            let mut slot = self.inner.slot();
            if arm {
                slot.armed = false;
            }
            if slot.generation == generation {
                slot.listener = None;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Remove the listener. Idempotent. A notification already being
    /// delivered may still complete; none start afterwards.
    pub fn unsubscribe(&self) {
        let mut slot = self.inner.slot();
        slot.generation += 1;
        slot.listener = None;
    }

    pub fn is_subscribed(&self) -> bool {
        self.inner.slot().listener.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{encode, CreateMode, MemoryStore};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn channel_listener(
        tx: mpsc::UnboundedSender<Option<u32>>,
    ) -> Arc<dyn WatchedValueListener<u32>> {
        Arc::new(move |value: Option<u32>| {
            let _ = tx.send(value);
        })
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Option<u32>>) -> Option<u32> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for notification")
            .expect("channel closed")
    }

    async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Option<u32>>) {
        // A dropped listener closes the channel; only a delivered value counts
        let res = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(!matches!(res, Ok(Some(_))), "unexpected notification: {:?}", res);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_read_absent_and_present() {
        let store = MemoryStore::new().unwrap();
        let session = store.connect();
        let value: WatchedValue<NodeValue<u32>> =
            WatchedValue::new(session.clone(), NodeValue::new("/v"));

        assert_eq!(value.read().unwrap(), None);
        session
            .create("/v", encode(&5u32).unwrap(), CreateMode::Persistent)
            .unwrap();
        assert_eq!(value.read().unwrap(), Some(5));

        // Empty body reads as absent
        session.set_data("/v", Vec::new(), None).unwrap();
        assert_eq!(value.read().unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_subscription_survives_many_changes() {
        let store = MemoryStore::new().unwrap();
        let session = store.connect();
        let value = WatchedValue::new(session.clone(), NodeValue::<u32>::new("/v"));
        let (tx, mut rx) = mpsc::unbounded_channel();

        value.subscribe(channel_listener(tx)).unwrap();
        assert_quiet(&mut rx).await;

        session
            .create("/v", encode(&1u32).unwrap(), CreateMode::Persistent)
            .unwrap();
        assert_eq!(next(&mut rx).await, Some(1));

        for i in 2..6u32 {
            session
                .set_data("/v", encode(&i).unwrap(), None)
                .unwrap();
            assert_eq!(next(&mut rx).await, Some(i));
        }

        session.delete("/v", None).unwrap();
        assert_eq!(next(&mut rx).await, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_subscribe_replaces_listener() {
        let store = MemoryStore::new().unwrap();
        let session = store.connect();
        let value = WatchedValue::new(session.clone(), NodeValue::<u32>::new("/v"));
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        value.subscribe(channel_listener(tx1)).unwrap();
        value.subscribe(channel_listener(tx2)).unwrap();

        session
            .create("/v", encode(&7u32).unwrap(), CreateMode::Persistent)
            .unwrap();
        assert_eq!(next(&mut rx2).await, Some(7));
        assert_quiet(&mut rx1).await;

        session.set_data("/v", encode(&8u32).unwrap(), None).unwrap();
        assert_eq!(next(&mut rx2).await, Some(8));
        assert_quiet(&mut rx1).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unsubscribe_is_idempotent() {
        let store = MemoryStore::new().unwrap();
        let session = store.connect();
        let value = WatchedValue::new(session.clone(), NodeValue::<u32>::new("/v"));
        let (tx, mut rx) = mpsc::unbounded_channel();

        value.subscribe(channel_listener(tx)).unwrap();
        assert!(value.is_subscribed());
        value.unsubscribe();
        value.unsubscribe();
        assert!(!value.is_subscribed());

        session
            .create("/v", encode(&1u32).unwrap(), CreateMode::Persistent)
            .unwrap();
        assert_quiet(&mut rx).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_subscribe_on_closed_session_fails() {
        let store = MemoryStore::new().unwrap();
        let session = store.connect();
        let value = WatchedValue::new(session.clone(), NodeValue::<u32>::new("/v"));
        session.close();

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            value.subscribe(channel_listener(tx)),
            Err(Error::SessionEnded(_))
        ));
        assert!(!value.is_subscribed());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_session_end_reports_absent_once() {
        let store = MemoryStore::new().unwrap();
        let session = store.connect();
        session
            .create("/v", encode(&3u32).unwrap(), CreateMode::Ephemeral)
            .unwrap();
        let value = WatchedValue::new(session.clone(), NodeValue::<u32>::new("/v"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        value.subscribe(channel_listener(tx)).unwrap();

        store.expire_session(session.session_id());
        assert_eq!(next(&mut rx).await, None);
        assert!(!value.is_subscribed());
        assert_quiet(&mut rx).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_write_from_listener_is_not_missed() {
        let store = MemoryStore::new().unwrap();
        let session = store.connect();
        session
            .create("/v", encode(&0u32).unwrap(), CreateMode::Persistent)
            .unwrap();
        let value = WatchedValue::new(session.clone(), NodeValue::<u32>::new("/v"));
        let (tx, mut rx) = mpsc::unbounded_channel();

        // Each notification writes the next value before returning
        let writer = session.clone();
        value
            .subscribe(Arc::new(move |v: Option<u32>| {
                if let Some(n) = v.filter(|n| *n < 20) {
                    writer.set_data("/v", encode(&(n + 1)).unwrap(), None).unwrap();
                }
                let _ = tx.send(v);
            }))
            .unwrap();

        session.set_data("/v", encode(&1u32).unwrap(), None).unwrap();
        for expected in 1..=20u32 {
            assert_eq!(next(&mut rx).await, Some(expected));
        }
        assert_quiet(&mut rx).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_back_to_back_writes_end_on_latest() {
        let store = MemoryStore::new().unwrap();
        let session = store.connect();
        session
            .create("/v", encode(&0u32).unwrap(), CreateMode::Persistent)
            .unwrap();
        let value = WatchedValue::new(session.clone(), NodeValue::<u32>::new("/v"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        value.subscribe(channel_listener(tx)).unwrap();

        for i in 1..=50u32 {
            session.set_data("/v", encode(&i).unwrap(), None).unwrap();
        }

        // Writes may coalesce, but values only move forward and end on the last
        let mut last = 0;
        while last < 50 {
            let seen = next(&mut rx).await.expect("value present");
            assert!(seen > last, "{} delivered after {}", seen, last);
            last = seen;
        }
        assert_quiet(&mut rx).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_resubscribing_reuses_armed_watch() {
        let store = MemoryStore::new().unwrap();
        let session = store.connect();
        let value = WatchedValue::new(session.clone(), NodeValue::<u32>::new("/quiet"));

        for _ in 0..100 {
            let (tx, _rx) = mpsc::unbounded_channel();
            value.subscribe(channel_listener(tx)).unwrap();
            value.unsubscribe();
        }
        assert_eq!(store.armed_watches(), 1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        value.subscribe(channel_listener(tx)).unwrap();
        assert_eq!(store.armed_watches(), 1);
        session
            .create("/quiet", encode(&9u32).unwrap(), CreateMode::Persistent)
            .unwrap();
        assert_eq!(next(&mut rx).await, Some(9));
    }
}
