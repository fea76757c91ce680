// Copyright 2020 Joyent, Inc.

//! Endpoint-scoped queue operations on top of [`KeyValueChannel`].
//!
//! Every pulse published here has a durable counterpart that can be polled:
//! work pulses pair with the request id list, response pulses with the
//! response key, cancellation pulses with the cancellation marker. Only
//! heartbeats are pulse-only, and their absence is what the liveness watcher
//! measures.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use slog::{debug, o, warn, Logger};
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelSubscription, KeyValueChannel};
use crate::config::QueueSettings;
use crate::error::QueueError;
use crate::keys::{KeySpace, REQUEST_FIELD};
use crate::protocol::{ActivityId, Endpoint, HeartbeatRole};

const PULSE: &str = "1";
const CANCELLED: &str = "cancelled";

/// Body of a heartbeat pulse.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Heartbeat {
    pub role: HeartbeatRole,
    pub sent_at: DateTime<Utc>,
}

pub struct QueueTransport {
    channel: Arc<KeyValueChannel>,
    keys: KeySpace,
    settings: Arc<QueueSettings>,
    log: Logger,
}

impl QueueTransport {
    pub fn new(
        channel: Arc<KeyValueChannel>,
        settings: Arc<QueueSettings>,
        log: Option<&Logger>,
    ) -> QueueTransport {
        let log = crate::channel::logger_or_default(log)
            .new(o!("component" => "queue-transport"));
        QueueTransport {
            channel,
            keys: KeySpace::new(settings.namespace.clone()),
            settings,
            log,
        }
    }

    pub fn channel(&self) -> &Arc<KeyValueChannel> {
        &self.channel
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub async fn push_request_id(
        &self,
        endpoint: &Endpoint,
        id: ActivityId,
        cancel: &CancellationToken,
    ) -> Result<(), QueueError> {
        self.channel
            .list_push(
                &self.keys.request_ids(endpoint),
                &id.to_string(),
                self.settings.request_ttl(),
                cancel,
            )
            .await
    }

    /// Pops the next id without blocking. Ids that cannot be parsed are
    /// logged and skipped.
    pub async fn pop_request_id(
        &self,
        endpoint: &Endpoint,
        cancel: &CancellationToken,
    ) -> Result<Option<ActivityId>, QueueError> {
        let key = self.keys.request_ids(endpoint);
        loop {
            let raw = match self.channel.list_pop(&key, cancel).await? {
                Some(raw) => raw,
                None => return Ok(None),
            };
            match raw.parse::<ActivityId>() {
                Ok(id) => return Ok(Some(id)),
                Err(e) => {
                    warn!(self.log, "discarding malformed request id";
                        "endpoint" => %endpoint, "error" => %e);
                }
            }
        }
    }

    pub async fn queue_length(
        &self,
        endpoint: &Endpoint,
        cancel: &CancellationToken,
    ) -> Result<u64, QueueError> {
        self.channel
            .list_len(&self.keys.request_ids(endpoint), cancel)
            .await
    }

    pub async fn put_request(
        &self,
        endpoint: &Endpoint,
        id: ActivityId,
        payload: &str,
        ttl: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), QueueError> {
        self.channel
            .hash_set(
                &self.keys.request(endpoint, id),
                REQUEST_FIELD,
                payload,
                ttl,
                cancel,
            )
            .await
    }

    /// Reads and deletes a request payload. The delete is the claim: a
    /// payload is only returned to the caller whose delete removed it.
    pub async fn try_take_request(
        &self,
        endpoint: &Endpoint,
        id: ActivityId,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, QueueError> {
        let key = self.keys.request(endpoint, id);
        let payload = match self.channel.hash_get(&key, REQUEST_FIELD, cancel).await? {
            Some(payload) => payload,
            None => return Ok(None),
        };
        if self.channel.hash_delete(&key, REQUEST_FIELD, cancel).await? {
            Ok(Some(payload))
        } else {
            debug!(self.log, "request already claimed";
                "endpoint" => %endpoint, "activity_id" => %id);
            Ok(None)
        }
    }

    /// Whether the request payload is still waiting to be collected.
    pub async fn request_exists(
        &self,
        endpoint: &Endpoint,
        id: ActivityId,
        cancel: &CancellationToken,
    ) -> Result<bool, QueueError> {
        self.channel
            .key_exists(&self.keys.request(endpoint, id), cancel)
            .await
    }

    pub async fn publish_work_available(
        &self,
        endpoint: &Endpoint,
        cancel: &CancellationToken,
    ) -> Result<(), QueueError> {
        self.channel
            .publish(&self.keys.request_pulse_channel(endpoint), PULSE, cancel)
            .await
    }

    pub async fn subscribe_work_available(
        &self,
        endpoint: &Endpoint,
        cancel: &CancellationToken,
    ) -> Result<ChannelSubscription, QueueError> {
        self.channel
            .subscribe(&self.keys.request_pulse_channel(endpoint), cancel)
            .await
    }

    /// Stores a response unless one is already stored for the same id.
    /// Returns whether this call wrote it.
    pub async fn put_response(
        &self,
        id: ActivityId,
        payload: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, QueueError> {
        self.channel
            .set_string_if_absent(
                &self.keys.response(id),
                payload,
                self.settings.response_ttl,
                cancel,
            )
            .await
    }

    pub async fn try_take_response(
        &self,
        id: ActivityId,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, QueueError> {
        let key = self.keys.response(id);
        let payload = self.channel.get_string(&key, cancel).await?;
        if payload.is_some() {
            self.channel.delete_key(&key, cancel).await?;
        }
        Ok(payload)
    }

    pub async fn publish_response_available(
        &self,
        id: ActivityId,
        cancel: &CancellationToken,
    ) -> Result<(), QueueError> {
        self.channel
            .publish(&self.keys.response_channel(id), PULSE, cancel)
            .await
    }

    pub async fn subscribe_response_available(
        &self,
        id: ActivityId,
        cancel: &CancellationToken,
    ) -> Result<ChannelSubscription, QueueError> {
        self.channel
            .subscribe(&self.keys.response_channel(id), cancel)
            .await
    }

    /// Writes the durable cancellation marker, then pulses.
    pub async fn publish_cancellation(
        &self,
        endpoint: &Endpoint,
        id: ActivityId,
        cancel: &CancellationToken,
    ) -> Result<(), QueueError> {
        self.mark_cancelled(endpoint, id, cancel).await?;
        self.channel
            .publish(&self.keys.cancellation_channel(endpoint, id), PULSE, cancel)
            .await
    }

    pub async fn mark_cancelled(
        &self,
        endpoint: &Endpoint,
        id: ActivityId,
        cancel: &CancellationToken,
    ) -> Result<(), QueueError> {
        self.channel
            .set_string(
                &self.keys.cancelled(endpoint, id),
                CANCELLED,
                self.settings.processing_timeout,
                cancel,
            )
            .await
    }

    pub async fn is_marked_cancelled(
        &self,
        endpoint: &Endpoint,
        id: ActivityId,
        cancel: &CancellationToken,
    ) -> Result<bool, QueueError> {
        self.channel
            .key_exists(&self.keys.cancelled(endpoint, id), cancel)
            .await
    }

    pub async fn subscribe_cancellation(
        &self,
        endpoint: &Endpoint,
        id: ActivityId,
        cancel: &CancellationToken,
    ) -> Result<ChannelSubscription, QueueError> {
        self.channel
            .subscribe(&self.keys.cancellation_channel(endpoint, id), cancel)
            .await
    }

    /// Publishes one heartbeat, without retrying.
    pub async fn publish_heartbeat(
        &self,
        endpoint: &Endpoint,
        id: ActivityId,
        role: HeartbeatRole,
        cancel: &CancellationToken,
    ) -> Result<(), QueueError> {
        let heartbeat = Heartbeat {
            role,
            sent_at: Utc::now(),
        };
        let body = serde_json::to_string(&heartbeat)?;
        self.channel
            .publish_once(
                &self.keys.heartbeat_channel(endpoint, id, role),
                &body,
                cancel,
            )
            .await
    }

    pub async fn subscribe_heartbeat(
        &self,
        endpoint: &Endpoint,
        id: ActivityId,
        role: HeartbeatRole,
        cancel: &CancellationToken,
    ) -> Result<ChannelSubscription, QueueError> {
        self.channel
            .subscribe(&self.keys.heartbeat_channel(endpoint, id, role), cancel)
            .await
    }

    pub async fn put_canary(
        &self,
        guid: &str,
        value: &str,
        ttl: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), QueueError> {
        self.channel
            .set_string(&self.keys.canary(guid), value, ttl, cancel)
            .await
    }

    pub async fn get_canary(
        &self,
        guid: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, QueueError> {
        self.channel.get_string(&self.keys.canary(guid), cancel).await
    }

    pub async fn refresh_canary(
        &self,
        guid: &str,
        ttl: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool, QueueError> {
        self.channel
            .set_ttl(&self.keys.canary(guid), ttl, cancel)
            .await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::channel::RetryPolicy;
    use crate::store::MemoryStore;

    fn transport_over(store: Arc<MemoryStore>) -> QueueTransport {
        let settings = Arc::new(QueueSettings::default());
        let channel = Arc::new(KeyValueChannel::new(
            store,
            RetryPolicy::from_settings(&settings),
            None,
        ));
        QueueTransport::new(channel, settings, None)
    }

    #[tokio::test]
    async fn request_ids_pop_in_order_and_skip_garbage() {
        let store = MemoryStore::new();
        let transport = transport_over(Arc::clone(&store));
        let cancel = CancellationToken::new();
        let endpoint = Endpoint::new("poll://a/");
        let first = ActivityId::new();
        let second = ActivityId::new();

        transport.push_request_id(&endpoint, first, &cancel).await.unwrap();
        crate::store::KeyValueStore::list_push(
            &*store,
            &transport.keys().request_ids(&endpoint),
            "garbage",
            Duration::from_secs(60),
        )
        .await
        .unwrap();
        transport.push_request_id(&endpoint, second, &cancel).await.unwrap();

        assert_eq!(transport.queue_length(&endpoint, &cancel).await.unwrap(), 3);
        assert_eq!(
            transport.pop_request_id(&endpoint, &cancel).await.unwrap(),
            Some(first)
        );
        assert_eq!(
            transport.pop_request_id(&endpoint, &cancel).await.unwrap(),
            Some(second)
        );
        assert_eq!(transport.pop_request_id(&endpoint, &cancel).await.unwrap(), None);
    }

    #[tokio::test]
    async fn concurrent_takes_yield_exactly_one_payload() {
        let store = MemoryStore::new();
        let transport = Arc::new(transport_over(Arc::clone(&store)));
        let endpoint = Endpoint::new("poll://a/");
        let id = ActivityId::new();
        let cancel = CancellationToken::new();
        transport
            .put_request(&endpoint, id, "payload", Duration::from_secs(60), &cancel)
            .await
            .unwrap();

        let mut takers = Vec::new();
        for _ in 0..16 {
            let transport = Arc::clone(&transport);
            let endpoint = endpoint.clone();
            takers.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                transport.try_take_request(&endpoint, id, &cancel).await
            }));
        }

        let mut winners = 0;
        for taker in takers {
            if taker.await.unwrap().unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(!transport.request_exists(&endpoint, id, &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn first_response_wins() {
        let store = MemoryStore::new();
        let transport = transport_over(store);
        let cancel = CancellationToken::new();
        let id = ActivityId::new();

        assert!(transport.put_response(id, "first", &cancel).await.unwrap());
        assert!(!transport.put_response(id, "second", &cancel).await.unwrap());
        assert_eq!(
            transport.try_take_response(id, &cancel).await.unwrap(),
            Some("first".to_string())
        );
        assert_eq!(transport.try_take_response(id, &cancel).await.unwrap(), None);
    }

    #[tokio::test]
    async fn cancellation_is_durable_and_pulsed() {
        let store = MemoryStore::new();
        let transport = transport_over(store);
        let cancel = CancellationToken::new();
        let endpoint = Endpoint::new("poll://a/");
        let id = ActivityId::new();

        let mut pulses = transport
            .subscribe_cancellation(&endpoint, id, &cancel)
            .await
            .unwrap();
        assert!(!transport.is_marked_cancelled(&endpoint, id, &cancel).await.unwrap());

        transport.publish_cancellation(&endpoint, id, &cancel).await.unwrap();
        assert!(transport.is_marked_cancelled(&endpoint, id, &cancel).await.unwrap());
        assert!(pulses.recv().await.is_some());
    }

    #[tokio::test]
    async fn heartbeats_are_scoped_by_role() {
        let store = MemoryStore::new();
        let transport = transport_over(store);
        let cancel = CancellationToken::new();
        let endpoint = Endpoint::new("poll://a/");
        let id = ActivityId::new();

        let mut receiver_beats = transport
            .subscribe_heartbeat(&endpoint, id, HeartbeatRole::Receiver, &cancel)
            .await
            .unwrap();
        transport
            .publish_heartbeat(&endpoint, id, HeartbeatRole::Sender, &cancel)
            .await
            .unwrap();
        transport
            .publish_heartbeat(&endpoint, id, HeartbeatRole::Receiver, &cancel)
            .await
            .unwrap();

        let raw = receiver_beats.recv().await.expect("heartbeat");
        let beat: Heartbeat = serde_json::from_str(&raw).expect("heartbeat json");
        assert_eq!(beat.role, HeartbeatRole::Receiver);
        assert!(!receiver_beats.drain());
    }
}
