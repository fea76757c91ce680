// Copyright 2020 Joyent, Inc.

//! In-process store.
//!
//! Several `RequestQueue`s sharing one `Arc<MemoryStore>` behave like nodes
//! sharing one Redis: queues, payloads and pulses only meet inside the store.
//! Expiry uses tokio's clock, so tests can drive TTLs with a paused runtime.
//!
//! The store can also misbehave on purpose:
//!
//! * `set_available(false)` refuses every call and drops every subscriber
//!   with `ConnectionLost`, like a lost connection.
//!
//! * `fail_next(n)` fails the next `n` calls with a transient error.
//!
//! * `flush_all()` forgets everything, like a flushed or failed-over server.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{StoreError, StoreResult};
use crate::store::{KeyValueStore, StoreSubscription, SubscriptionEvent};

enum StoredValue {
    Text(String),
    List(VecDeque<String>),
    Hash(HashMap<String, String>),
}

struct Slot {
    value: StoredValue,
    expires_at: Instant,
}

impl Slot {
    fn new(value: StoredValue, ttl: Duration) -> Slot {
        Slot {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

type Data = HashMap<String, Slot>;
type Subscribers = HashMap<String, Vec<mpsc::UnboundedSender<SubscriptionEvent>>>;

/// The slot for `key`, dropping it first if it has expired.
fn live_slot<'a>(data: &'a mut Data, key: &str) -> Option<&'a mut Slot> {
    let now = Instant::now();
    if data.get(key).map_or(false, |slot| !slot.is_live(now)) {
        data.remove(key);
    }
    data.get_mut(key)
}

/// Drops senders whose subscription is gone, and channels left with none.
fn prune_closed(subscribers: &mut Subscribers) {
    subscribers.retain(|_, senders| {
        senders.retain(|s| !s.is_closed());
        !senders.is_empty()
    });
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType {
        key: key.to_string(),
    }
}

#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<Data>,
    subscribers: Mutex<Subscribers>,
    unavailable: AtomicBool,
    failures_pending: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::default())
    }

    /// Simulates losing (or regaining) the connection to the store.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
        if !available {
            let dropped: Vec<_> = self
                .subscribers()
                .drain()
                .flat_map(|(_, senders)| senders)
                .collect();
            for sender in dropped {
                let _ = sender.send(SubscriptionEvent::ConnectionLost);
            }
        }
    }

    /// Fails the next `count` operations with a transient error.
    pub fn fail_next(&self, count: u32) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    /// Forgets every key. Subscriptions survive, as they do on a real
    /// server that was flushed.
    pub fn flush_all(&self) {
        self.data().clear();
    }

    /// Number of live keys.
    pub fn key_count(&self) -> usize {
        let now = Instant::now();
        self.data().values().filter(|slot| slot.is_live(now)).count()
    }

    /// Number of channels with at least one open subscriber.
    pub fn subscribed_channels(&self) -> usize {
        let mut subscribers = self.subscribers();
        prune_closed(&mut subscribers);
        subscribers.len()
    }

    fn data(&self) -> MutexGuard<'_, Data> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn subscribers(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Locks the data after applying any simulated connection trouble.
    fn connect(&self) -> StoreResult<MutexGuard<'_, Data>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(String::from(
                "connection to store lost",
            )));
        }
        let injected = self.failures_pending.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |n| n.checked_sub(1),
        );
        if injected.is_ok() {
            return Err(StoreError::Unavailable(String::from(
                "injected transient failure",
            )));
        }
        Ok(self.data())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn set_string(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<()> {
        let mut data = self.connect()?;
        data.insert(
            key.to_string(),
            Slot::new(StoredValue::Text(value.to_string()), ttl),
        );
        Ok(())
    }

    async fn set_string_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut data = self.connect()?;
        if live_slot(&mut data, key).is_some() {
            return Ok(false);
        }
        data.insert(
            key.to_string(),
            Slot::new(StoredValue::Text(value.to_string()), ttl),
        );
        Ok(true)
    }

    async fn get_string(&self, key: &str) -> StoreResult<Option<String>> {
        let mut data = self.connect()?;
        match live_slot(&mut data, key) {
            None => Ok(None),
            Some(Slot {
                value: StoredValue::Text(text),
                ..
            }) => Ok(Some(text.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn delete_key(&self, key: &str) -> StoreResult<bool> {
        let mut data = self.connect()?;
        let now = Instant::now();
        Ok(data.remove(key).map_or(false, |slot| slot.is_live(now)))
    }

    async fn key_exists(&self, key: &str) -> StoreResult<bool> {
        let mut data = self.connect()?;
        Ok(live_slot(&mut data, key).is_some())
    }

    async fn set_ttl(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut data = self.connect()?;
        match live_slot(&mut data, key) {
            Some(slot) => {
                slot.expires_at = Instant::now() + ttl;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_push(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<()> {
        let mut data = self.connect()?;
        if let Some(slot) = live_slot(&mut data, key) {
            match &mut slot.value {
                StoredValue::List(list) => list.push_back(value.to_string()),
                _ => return Err(wrong_type(key)),
            }
            slot.expires_at = Instant::now() + ttl;
            return Ok(());
        }
        let mut list = VecDeque::new();
        list.push_back(value.to_string());
        data.insert(key.to_string(), Slot::new(StoredValue::List(list), ttl));
        Ok(())
    }

    async fn list_pop(&self, key: &str) -> StoreResult<Option<String>> {
        let mut data = self.connect()?;
        let (popped, now_empty) = match live_slot(&mut data, key) {
            None => return Ok(None),
            Some(Slot {
                value: StoredValue::List(list),
                ..
            }) => {
                let popped = list.pop_front();
                (popped, list.is_empty())
            }
            Some(_) => return Err(wrong_type(key)),
        };
        if now_empty {
            data.remove(key);
        }
        Ok(popped)
    }

    async fn list_len(&self, key: &str) -> StoreResult<u64> {
        let mut data = self.connect()?;
        match live_slot(&mut data, key) {
            None => Ok(0),
            Some(Slot {
                value: StoredValue::List(list),
                ..
            }) => Ok(list.len() as u64),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hash_set(
        &self,
        key: &str,
        field: &str,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<()> {
        let mut data = self.connect()?;
        if let Some(slot) = live_slot(&mut data, key) {
            match &mut slot.value {
                StoredValue::Hash(hash) => {
                    hash.insert(field.to_string(), value.to_string());
                }
                _ => return Err(wrong_type(key)),
            }
            slot.expires_at = Instant::now() + ttl;
            return Ok(());
        }
        let mut hash = HashMap::new();
        hash.insert(field.to_string(), value.to_string());
        data.insert(key.to_string(), Slot::new(StoredValue::Hash(hash), ttl));
        Ok(())
    }

    async fn hash_get(
        &self,
        key: &str,
        field: &str,
    ) -> StoreResult<Option<String>> {
        let mut data = self.connect()?;
        match live_slot(&mut data, key) {
            None => Ok(None),
            Some(Slot {
                value: StoredValue::Hash(hash),
                ..
            }) => Ok(hash.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hash_delete(&self, key: &str, field: &str) -> StoreResult<bool> {
        let mut data = self.connect()?;
        let (removed, now_empty) = match live_slot(&mut data, key) {
            None => return Ok(false),
            Some(Slot {
                value: StoredValue::Hash(hash),
                ..
            }) => {
                let removed = hash.remove(field).is_some();
                (removed, hash.is_empty())
            }
            Some(_) => return Err(wrong_type(key)),
        };
        if now_empty {
            data.remove(key);
        }
        Ok(removed)
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        drop(self.connect()?);
        let mut subscribers = self.subscribers();
        if let Some(senders) = subscribers.get_mut(channel) {
            senders.retain(|s| {
                s.send(SubscriptionEvent::Message(message.to_string())).is_ok()
            });
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<StoreSubscription> {
        drop(self.connect()?);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers();
        prune_closed(&mut subscribers);
        subscribers
            .entry(channel.to_string())
            .or_insert_with(Vec::new)
            .push(tx);
        Ok(StoreSubscription::new(rx))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn dropped_subscriptions_do_not_pile_up() {
        let store = MemoryStore::new();
        for n in 0..100 {
            let sub = store.subscribe(&format!("short-lived-{}", n)).await.unwrap();
            drop(sub);
        }
        let _kept = store.subscribe("long-lived").await.unwrap();

        let subscribers = store.subscribers();
        assert_eq!(subscribers.len(), 1);
        assert_eq!(subscribers.get("long-lived").map(Vec::len), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn strings_expire_after_their_ttl() {
        let store = MemoryStore::new();
        assert_ok!(store.set_string("k", "v", Duration::from_secs(10)).await);
        assert_eq!(store.get_string("k").await.unwrap(), Some("v".to_string()));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.get_string("k").await.unwrap(), None);
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn set_if_absent_keeps_the_first_value() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(10);
        assert!(store.set_string_if_absent("k", "first", ttl).await.unwrap());
        assert!(!store.set_string_if_absent("k", "second", ttl).await.unwrap());
        assert_eq!(
            store.get_string("k").await.unwrap(),
            Some("first".to_string())
        );
    }

    #[tokio::test]
    async fn lists_pop_in_push_order() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(10);
        store.list_push("l", "a", ttl).await.unwrap();
        store.list_push("l", "b", ttl).await.unwrap();
        assert_eq!(store.list_len("l").await.unwrap(), 2);
        assert_eq!(store.list_pop("l").await.unwrap(), Some("a".to_string()));
        assert_eq!(store.list_pop("l").await.unwrap(), Some("b".to_string()));
        assert_eq!(store.list_pop("l").await.unwrap(), None);
    }

    #[tokio::test]
    async fn hash_delete_succeeds_once() {
        let store = MemoryStore::new();
        store
            .hash_set("h", "f", "v", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(store.hash_delete("h", "f").await.unwrap());
        assert!(!store.hash_delete("h", "f").await.unwrap());
        assert!(!store.key_exists("h").await.unwrap());
    }

    #[tokio::test]
    async fn wrong_type_is_reported() {
        let store = MemoryStore::new();
        store.set_string("k", "v", Duration::from_secs(10)).await.unwrap();
        let result = store.list_pop("k").await;
        assert!(matches!(result, Err(StoreError::WrongType { .. })));
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let store = MemoryStore::new();
        let mut first = store.subscribe("c").await.unwrap();
        let mut second = store.subscribe("c").await.unwrap();
        store.publish("c", "hello").await.unwrap();
        for sub in [&mut first, &mut second].iter_mut() {
            assert_eq!(
                sub.next_event().await,
                Some(SubscriptionEvent::Message("hello".to_string()))
            );
        }
    }

    #[tokio::test]
    async fn losing_the_connection_fails_calls_and_drops_subscribers() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe("c").await.unwrap();

        store.set_available(false);
        assert_err!(store.get_string("k").await);
        assert_eq!(sub.next_event().await, Some(SubscriptionEvent::ConnectionLost));
        assert_eq!(sub.next_event().await, None);

        store.set_available(true);
        assert_ok!(store.get_string("k").await);
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let store = MemoryStore::new();
        store.fail_next(2);
        let first = store.get_string("k").await;
        assert!(first.as_ref().map_err(|e| e.is_transient()).unwrap_err());
        assert_err!(store.get_string("k").await);
        assert_ok!(store.get_string("k").await);
    }

    #[tokio::test]
    async fn flush_forgets_everything() {
        let store = MemoryStore::new();
        store.set_string("a", "1", Duration::from_secs(10)).await.unwrap();
        store
            .list_push("b", "2", Duration::from_secs(10))
            .await
            .unwrap();
        store.flush_all();
        assert_eq!(store.key_count(), 0);
    }
}
