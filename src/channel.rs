// Copyright 2020 Joyent, Inc.

//! Retrying access to the shared store.
//!
//! Each store call made through [`KeyValueChannel`] is retried after a fixed
//! delay while its error is transient, until the retry budget is spent or
//! the caller's cancellation fires. Subscriptions made through it survive
//! connection loss: a background task subscribes again whenever the
//! backend reports the connection gone.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use slog::{debug, error, o, warn, Drain, Logger};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::QueueSettings;
use crate::error::{QueueError, StoreResult};
use crate::store::{KeyValueStore, StoreSubscription, SubscriptionEvent};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    pub delay: Duration,
    pub budget: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &QueueSettings) -> Self {
        RetryPolicy {
            delay: settings.store_retry_delay,
            budget: settings.store_retry_budget,
        }
    }
}

/// Falls back to the `log` crate when no logger is supplied.
pub(crate) fn logger_or_default(log: Option<&Logger>) -> Logger {
    log.cloned()
        .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
}

pub struct KeyValueChannel {
    store: Arc<dyn KeyValueStore>,
    retry: RetryPolicy,
    healthy: watch::Sender<bool>,
    log: Logger,
}

impl KeyValueChannel {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        retry: RetryPolicy,
        log: Option<&Logger>,
    ) -> KeyValueChannel {
        let (healthy, _) = watch::channel(true);
        KeyValueChannel {
            store,
            retry,
            healthy,
            log: logger_or_default(log).new(o!("component" => "kv-channel")),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Whether the most recent store call succeeded.
    pub fn is_healthy(&self) -> bool {
        *self.healthy.borrow()
    }

    /// Follows connection health as store calls succeed and fail.
    pub fn health(&self) -> watch::Receiver<bool> {
        self.healthy.subscribe()
    }

    fn record_health(&self, healthy: bool) {
        self.healthy.send_if_modified(|current| {
            if *current == healthy {
                false
            } else {
                *current = healthy;
                true
            }
        });
    }

    /// Runs `op` until it succeeds, fails permanently, exhausts the retry
    /// budget, or `cancel` fires.
    pub async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, QueueError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let started = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
                result = op() => result,
            };

            let err = match result {
                Ok(value) => {
                    self.record_health(true);
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_transient() {
                error!(self.log, "store operation failed";
                    "operation" => operation, "error" => %err);
                return Err(QueueError::TransportUnavailable {
                    operation,
                    attempts,
                    source: err,
                });
            }

            self.record_health(false);
            if started.elapsed() + self.retry.delay > self.retry.budget {
                error!(self.log, "store operation retry budget exhausted";
                    "operation" => operation,
                    "attempts" => attempts,
                    "error" => %err);
                return Err(QueueError::TransportUnavailable {
                    operation,
                    attempts,
                    source: err,
                });
            }

            warn!(self.log, "store operation failed, retrying";
                "operation" => operation,
                "attempt" => attempts,
                "error" => %err);

            tokio::select! {
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
                _ = sleep(self.retry.delay) => (),
            }
        }
    }

    /// A single attempt, for callers that run their own retry schedule.
    pub async fn once<T, Fut>(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
        op: Fut,
    ) -> Result<T, QueueError>
    where
        Fut: Future<Output = StoreResult<T>>,
    {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(QueueError::Cancelled),
            result = op => result,
        };
        match result {
            Ok(value) => {
                self.record_health(true);
                Ok(value)
            }
            Err(err) => {
                if err.is_transient() {
                    self.record_health(false);
                }
                Err(QueueError::TransportUnavailable {
                    operation,
                    attempts: 1,
                    source: err,
                })
            }
        }
    }

    pub async fn set_string(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), QueueError> {
        let store = &self.store;
        self.with_retry("set_string", cancel, move || {
            store.set_string(key, value, ttl)
        })
        .await
    }

    pub async fn set_string_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool, QueueError> {
        let store = &self.store;
        self.with_retry("set_string_if_absent", cancel, move || {
            store.set_string_if_absent(key, value, ttl)
        })
        .await
    }

    pub async fn get_string(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, QueueError> {
        let store = &self.store;
        self.with_retry("get_string", cancel, move || store.get_string(key))
            .await
    }

    pub async fn delete_key(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, QueueError> {
        let store = &self.store;
        self.with_retry("delete_key", cancel, move || store.delete_key(key))
            .await
    }

    pub async fn key_exists(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, QueueError> {
        let store = &self.store;
        self.with_retry("key_exists", cancel, move || store.key_exists(key))
            .await
    }

    pub async fn set_ttl(
        &self,
        key: &str,
        ttl: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool, QueueError> {
        let store = &self.store;
        self.with_retry("set_ttl", cancel, move || store.set_ttl(key, ttl))
            .await
    }

    pub async fn list_push(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), QueueError> {
        let store = &self.store;
        self.with_retry("list_push", cancel, move || {
            store.list_push(key, value, ttl)
        })
        .await
    }

    pub async fn list_pop(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, QueueError> {
        let store = &self.store;
        self.with_retry("list_pop", cancel, move || store.list_pop(key))
            .await
    }

    pub async fn list_len(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<u64, QueueError> {
        let store = &self.store;
        self.with_retry("list_len", cancel, move || store.list_len(key))
            .await
    }

    pub async fn hash_set(
        &self,
        key: &str,
        field: &str,
        value: &str,
        ttl: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), QueueError> {
        let store = &self.store;
        self.with_retry("hash_set", cancel, move || {
            store.hash_set(key, field, value, ttl)
        })
        .await
    }

    pub async fn hash_get(
        &self,
        key: &str,
        field: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, QueueError> {
        let store = &self.store;
        self.with_retry("hash_get", cancel, move || store.hash_get(key, field))
            .await
    }

    pub async fn hash_delete(
        &self,
        key: &str,
        field: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, QueueError> {
        let store = &self.store;
        self.with_retry("hash_delete", cancel, move || {
            store.hash_delete(key, field)
        })
        .await
    }

    pub async fn publish(
        &self,
        channel: &str,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<(), QueueError> {
        let store = &self.store;
        self.with_retry("publish", cancel, move || store.publish(channel, message))
            .await
    }

    /// Publishes without retrying. Used by heartbeats, which keep their own
    /// schedule.
    pub async fn publish_once(
        &self,
        channel: &str,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<(), QueueError> {
        self.once("publish", cancel, self.store.publish(channel, message))
            .await
    }

    /// Subscribes to `channel`, resubscribing whenever the connection is
    /// lost, until the returned subscription is closed or dropped or
    /// `cancel` fires.
    ///
    /// The first subscribe is retried like any other call and its failure is
    /// returned; later resubscribes are retried indefinitely in the
    /// background.
    pub async fn subscribe(
        &self,
        channel: &str,
        cancel: &CancellationToken,
    ) -> Result<ChannelSubscription, QueueError> {
        let store = &self.store;
        let first = self
            .with_retry("subscribe", cancel, move || store.subscribe(channel))
            .await?;

        let stop = cancel.child_token();
        let (tx, rx) = mpsc::unbounded_channel();
        let log = self.log.new(o!("channel" => channel.to_string()));
        let pump = tokio::spawn(pump_subscription(
            Arc::clone(&self.store),
            channel.to_string(),
            first,
            tx,
            stop.clone(),
            self.retry.delay,
            log,
        ));

        Ok(ChannelSubscription {
            messages: rx,
            stop,
            pump: Some(pump),
        })
    }
}

async fn pump_subscription(
    store: Arc<dyn KeyValueStore>,
    channel: String,
    mut subscription: StoreSubscription,
    tx: mpsc::UnboundedSender<String>,
    stop: CancellationToken,
    resubscribe_delay: Duration,
    log: Logger,
) {
    loop {
        let event = tokio::select! {
            _ = stop.cancelled() => return,
            _ = tx.closed() => return,
            event = subscription.next_event() => event,
        };

        match event {
            Some(SubscriptionEvent::Message(msg)) => {
                if tx.send(msg).is_err() {
                    return;
                }
                continue;
            }
            Some(SubscriptionEvent::ConnectionLost) | None => {
                warn!(log, "subscription lost, resubscribing");
            }
        }

        subscription = loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = sleep(resubscribe_delay) => (),
            }
            match store.subscribe(&channel).await {
                Ok(resubscribed) => {
                    debug!(log, "resubscribed");
                    break resubscribed;
                }
                Err(err) => {
                    warn!(log, "resubscribe failed"; "error" => %err);
                }
            }
        };
    }
}

/// Messages published on one channel.
///
/// Delivery is best effort: messages published while the connection is down
/// are lost, so every consumer pairs a subscription with polling.
pub struct ChannelSubscription {
    messages: mpsc::UnboundedReceiver<String>,
    stop: CancellationToken,
    pump: Option<JoinHandle<()>>,
}

impl ChannelSubscription {
    /// Waits for the next message. Returns `None` once the subscription has
    /// been stopped.
    pub async fn recv(&mut self) -> Option<String> {
        self.messages.recv().await
    }

    /// Whether a message is waiting, without blocking. Drains everything
    /// already queued.
    pub fn drain(&mut self) -> bool {
        let mut any = false;
        while self.messages.try_recv().is_ok() {
            any = true;
        }
        any
    }

    /// Unsubscribes and waits for the background task to exit.
    pub async fn close(mut self) {
        self.stop.cancel();
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }
    }
}

impl Drop for ChannelSubscription {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use tokio::time::timeout;
    use tokio_test::assert_ok;

    use crate::store::MemoryStore;

    fn channel_over(store: Arc<MemoryStore>) -> KeyValueChannel {
        KeyValueChannel::new(
            store,
            RetryPolicy {
                delay: Duration::from_secs(1),
                budget: Duration::from_secs(30),
            },
            None,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let store = MemoryStore::new();
        let channel = channel_over(Arc::clone(&store));
        let cancel = CancellationToken::new();

        store.fail_next(3);
        let started = Instant::now();
        assert_ok!(
            channel
                .set_string("k", "v", Duration::from_secs(60), &cancel)
                .await
        );
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(channel.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_surfaces_transport_unavailable() {
        let store = MemoryStore::new();
        let channel = channel_over(Arc::clone(&store));
        let cancel = CancellationToken::new();

        store.set_available(false);
        let result = channel.get_string("k", &cancel).await;
        match result {
            Err(QueueError::TransportUnavailable { attempts, .. }) => {
                assert!(attempts >= 30);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(!channel.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_retrying() {
        let store = MemoryStore::new();
        let channel = channel_over(Arc::clone(&store));
        let cancel = CancellationToken::new();

        store.set_available(false);
        let canceller = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(2)).await;
            canceller.cancel();
        });
        let result = channel.get_string("k", &cancel).await;
        assert!(matches!(result, Err(QueueError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn subscriptions_survive_connection_loss() {
        let store = MemoryStore::new();
        let channel = channel_over(Arc::clone(&store));
        let cancel = CancellationToken::new();

        let mut sub = channel.subscribe("pulse", &cancel).await.unwrap();
        store.set_available(false);
        sleep(Duration::from_secs(3)).await;
        store.set_available(true);
        sleep(Duration::from_secs(2)).await;

        channel.publish("pulse", "after", &cancel).await.unwrap();
        let got = timeout(Duration::from_secs(5), sub.recv()).await;
        assert_eq!(got.ok().flatten(), Some("after".to_string()));

        sub.close().await;
        assert_eq!(store.subscribed_channels(), 0);
    }
}
