// Copyright 2020 Joyent, Inc.

//! The shared store boundary.
//!
//! Everything the queue knows about the store is the [`KeyValueStore`]
//! trait: TTL'd strings, lists, hashes and publish/subscribe. Backends make
//! no attempt at retrying; that is `KeyValueChannel`'s job.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::StoreResult;

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use self::memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// Something a raw store subscription reports.
#[derive(Clone, Debug, PartialEq)]
pub enum SubscriptionEvent {
    Message(String),
    /// The connection carrying the subscription failed. No further messages
    /// arrive on this subscription.
    ConnectionLost,
}

/// A raw subscription to one channel.
///
/// Dropping it unsubscribes.
pub struct StoreSubscription {
    events: mpsc::UnboundedReceiver<SubscriptionEvent>,
}

impl StoreSubscription {
    pub fn new(events: mpsc::UnboundedReceiver<SubscriptionEvent>) -> Self {
        StoreSubscription { events }
    }

    /// Waits for the next event. `None` means the backend closed the
    /// subscription, which callers should treat like `ConnectionLost`.
    pub async fn next_event(&mut self) -> Option<SubscriptionEvent> {
        self.events.recv().await
    }
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn set_string(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<()>;

    /// Sets the key only when it does not already exist. Returns whether the
    /// value was written.
    async fn set_string_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<bool>;

    async fn get_string(&self, key: &str) -> StoreResult<Option<String>>;

    /// Deletes any kind of key. Returns whether something was deleted.
    async fn delete_key(&self, key: &str) -> StoreResult<bool>;

    async fn key_exists(&self, key: &str) -> StoreResult<bool>;

    /// Resets the TTL of an existing key. Returns false if the key is absent.
    async fn set_ttl(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Appends to the tail of a list and resets the list's TTL.
    async fn list_push(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<()>;

    /// Removes and returns the head of a list without blocking.
    async fn list_pop(&self, key: &str) -> StoreResult<Option<String>>;

    async fn list_len(&self, key: &str) -> StoreResult<u64>;

    /// Sets one field of a hash and resets the hash's TTL.
    async fn hash_set(
        &self,
        key: &str,
        field: &str,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<()>;

    async fn hash_get(&self, key: &str, field: &str)
        -> StoreResult<Option<String>>;

    /// Removes one field of a hash. Returns whether the field was present;
    /// exactly one of several concurrent callers sees `true`.
    async fn hash_delete(&self, key: &str, field: &str) -> StoreResult<bool>;

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()>;

    async fn subscribe(&self, channel: &str) -> StoreResult<StoreSubscription>;
}
