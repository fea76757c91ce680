// Copyright 2020 Joyent, Inc.

//! Redis backend, enabled with the `redis` feature.
//!
//! Commands go through a `ConnectionManager`, which reconnects on its own.
//! Each subscription gets a dedicated pub/sub connection; when that
//! connection drops the subscription reports `ConnectionLost` and
//! `KeyValueChannel` subscribes again.

use std::convert::TryFrom;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis_rs::aio::ConnectionManager;
use redis_rs::{Client, RedisError};
use tokio::sync::mpsc;

use crate::error::{StoreError, StoreResult};
use crate::store::{KeyValueStore, StoreSubscription, SubscriptionEvent};

impl From<RedisError> for StoreError {
    fn from(e: RedisError) -> Self {
        if e.is_io_error()
            || e.is_connection_dropped()
            || e.is_connection_refusal()
            || e.is_timeout()
        {
            StoreError::Unavailable(e.to_string())
        } else {
            StoreError::Protocol(e.to_string())
        }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    connection: ConnectionManager,
}

impl RedisStore {
    /// Connects to a `redis://` URL.
    pub async fn connect(url: &str) -> StoreResult<RedisStore> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client.clone()).await?;
        Ok(RedisStore { client, connection })
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn set_string(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<()> {
        let mut con = self.connection.clone();
        let _: () = redis_rs::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut con)
            .await?;
        Ok(())
    }

    async fn set_string_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut con = self.connection.clone();
        let reply: Option<String> = redis_rs::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .arg("NX")
            .query_async(&mut con)
            .await?;
        Ok(reply.is_some())
    }

    async fn get_string(&self, key: &str) -> StoreResult<Option<String>> {
        let mut con = self.connection.clone();
        let value: Option<String> =
            redis_rs::cmd("GET").arg(key).query_async(&mut con).await?;
        Ok(value)
    }

    async fn delete_key(&self, key: &str) -> StoreResult<bool> {
        let mut con = self.connection.clone();
        let deleted: i64 =
            redis_rs::cmd("DEL").arg(key).query_async(&mut con).await?;
        Ok(deleted > 0)
    }

    async fn key_exists(&self, key: &str) -> StoreResult<bool> {
        let mut con = self.connection.clone();
        let count: i64 =
            redis_rs::cmd("EXISTS").arg(key).query_async(&mut con).await?;
        Ok(count > 0)
    }

    async fn set_ttl(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut con = self.connection.clone();
        let set: i64 = redis_rs::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query_async(&mut con)
            .await?;
        Ok(set == 1)
    }

    async fn list_push(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<()> {
        let mut con = self.connection.clone();
        let _: () = redis_rs::pipe()
            .atomic()
            .cmd("RPUSH")
            .arg(key)
            .arg(value)
            .ignore()
            .cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .ignore()
            .query_async(&mut con)
            .await?;
        Ok(())
    }

    async fn list_pop(&self, key: &str) -> StoreResult<Option<String>> {
        let mut con = self.connection.clone();
        let value: Option<String> =
            redis_rs::cmd("LPOP").arg(key).query_async(&mut con).await?;
        Ok(value)
    }

    async fn list_len(&self, key: &str) -> StoreResult<u64> {
        let mut con = self.connection.clone();
        let len: u64 =
            redis_rs::cmd("LLEN").arg(key).query_async(&mut con).await?;
        Ok(len)
    }

    async fn hash_set(
        &self,
        key: &str,
        field: &str,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<()> {
        let mut con = self.connection.clone();
        let _: () = redis_rs::pipe()
            .atomic()
            .cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .ignore()
            .cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .ignore()
            .query_async(&mut con)
            .await?;
        Ok(())
    }

    async fn hash_get(
        &self,
        key: &str,
        field: &str,
    ) -> StoreResult<Option<String>> {
        let mut con = self.connection.clone();
        let value: Option<String> = redis_rs::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut con)
            .await?;
        Ok(value)
    }

    async fn hash_delete(&self, key: &str, field: &str) -> StoreResult<bool> {
        let mut con = self.connection.clone();
        let removed: i64 = redis_rs::cmd("HDEL")
            .arg(key)
            .arg(field)
            .query_async(&mut con)
            .await?;
        Ok(removed > 0)
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        let mut con = self.connection.clone();
        let _: i64 = redis_rs::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async(&mut con)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<StoreSubscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            loop {
                tokio::select! {
                    _ = tx.closed() => return,
                    msg = messages.next() => match msg {
                        Some(msg) => {
                            let payload: String =
                                msg.get_payload().unwrap_or_default();
                            if tx.send(SubscriptionEvent::Message(payload)).is_err() {
                                return;
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = tx.send(SubscriptionEvent::ConnectionLost);
        });

        Ok(StoreSubscription::new(rx))
    }
}
