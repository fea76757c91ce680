// Copyright 2020 Joyent, Inc.

//! The per-endpoint request queue and the factory that hands them out.
//!
//! The sending half lives in `client`, the worker half in `server`; both are
//! inherent methods on [`RequestQueue`].

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use slog::{debug, info, o, Logger};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::{logger_or_default, KeyValueChannel, RetryPolicy};
use crate::config::QueueSettings;
use crate::error::QueueError;
use crate::liveness::HeartbeatSender;
use crate::pending::PendingRequest;
use crate::protocol::{
    ActivityId, Endpoint, JsonMessageSerializer, MessageSerializer,
};
use crate::sentinel::DataLossSentinel;
use crate::store::KeyValueStore;
use crate::transport::QueueTransport;

/// Background work owned by one request: an optional heartbeat sender plus
/// any number of spawned loops, all stopped by one token.
pub(crate) struct TaskGroup {
    stop: CancellationToken,
    heartbeats: Option<HeartbeatSender>,
    tasks: Vec<JoinHandle<()>>,
}

impl TaskGroup {
    pub(crate) fn new(stop: CancellationToken) -> TaskGroup {
        TaskGroup {
            stop,
            heartbeats: None,
            tasks: Vec::new(),
        }
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.stop
    }

    pub(crate) fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.push(tokio::spawn(task));
    }

    pub(crate) fn set_heartbeats(&mut self, heartbeats: HeartbeatSender) {
        self.heartbeats = Some(heartbeats);
    }

    /// Stops every task and waits for all of them to exit.
    pub(crate) async fn shutdown(mut self) {
        self.stop.cancel();
        if let Some(heartbeats) = self.heartbeats.take() {
            heartbeats.stop().await;
        }
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Drop for TaskGroup {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Queue for one endpoint.
///
/// Any number of processes may hold a `RequestQueue` for the same endpoint;
/// the store is the only state they share. In-process bookkeeping is kept in
/// concurrent maps keyed by ActivityId and no map entry is ever held across
/// a store call.
pub struct RequestQueue {
    pub(crate) endpoint: Endpoint,
    pub(crate) transport: Arc<QueueTransport>,
    pub(crate) serializer: Arc<dyn MessageSerializer>,
    pub(crate) sentinel: Arc<DataLossSentinel>,
    /// Requests this process is waiting on.
    pub(crate) in_flight: DashMap<ActivityId, Arc<PendingRequest>>,
    /// Requests this process has collected and not yet answered or
    /// cancelled. Shared with the guards, which remove themselves.
    pub(crate) processing: Arc<DashMap<ActivityId, TaskGroup>>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) log: Logger,
}

impl RequestQueue {
    pub fn new(
        endpoint: Endpoint,
        transport: Arc<QueueTransport>,
        serializer: Arc<dyn MessageSerializer>,
        sentinel: Arc<DataLossSentinel>,
        log: Option<&Logger>,
    ) -> RequestQueue {
        let log = logger_or_default(log)
            .new(o!("endpoint" => endpoint.to_string()));
        RequestQueue {
            endpoint,
            transport,
            serializer,
            sentinel,
            in_flight: DashMap::new(),
            processing: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
            log,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn transport(&self) -> &Arc<QueueTransport> {
        &self.transport
    }

    /// Number of request ids waiting in the store for this endpoint. Ids of
    /// requests that have since expired or been claimed back are counted
    /// until a worker pops them.
    pub async fn len(&self) -> Result<u64, QueueError> {
        self.transport
            .queue_length(&self.endpoint, &self.shutdown)
            .await
            .map_err(|e| self.on_shutdown(e))
    }

    pub async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len().await? == 0)
    }

    /// Requests this process is currently waiting on.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Requests this process has dequeued and not yet responded to.
    pub fn processing_count(&self) -> usize {
        self.processing.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Cancels every wait and every processing guard owned by this queue and
    /// waits for the guards still registered to exit. Pending `queue_and_wait` calls return
    /// `QueueError::ShutDown`; dequeued requests see their cancellation
    /// token fire.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        let ids: Vec<ActivityId> =
            self.processing.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, guard)) = self.processing.remove(&id) {
                guard.shutdown().await;
            }
        }
        info!(self.log, "request queue shut down";
            "abandoned_waits" => self.in_flight.len());
    }

    /// Reports cancellation caused by our own shutdown as `ShutDown`.
    pub(crate) fn on_shutdown(&self, e: QueueError) -> QueueError {
        if e.is_cancelled() && self.shutdown.is_cancelled() {
            QueueError::ShutDown
        } else {
            e
        }
    }
}

/// Builds and caches one [`RequestQueue`] per endpoint, all sharing one
/// store connection, serializer and data loss sentinel.
pub struct RequestQueueFactory {
    transport: Arc<QueueTransport>,
    serializer: Arc<dyn MessageSerializer>,
    sentinel: Arc<DataLossSentinel>,
    queues: DashMap<Endpoint, Arc<RequestQueue>>,
    log: Logger,
}

impl RequestQueueFactory {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        settings: QueueSettings,
        log: Option<&Logger>,
    ) -> Result<RequestQueueFactory, QueueError> {
        settings.validate()?;
        let log = logger_or_default(log)
            .new(o!("namespace" => settings.namespace.clone()));
        let settings = Arc::new(settings);
        let channel = Arc::new(KeyValueChannel::new(
            store,
            RetryPolicy::from_settings(&settings),
            Some(&log),
        ));
        let transport =
            Arc::new(QueueTransport::new(channel, settings, Some(&log)));
        let sentinel = DataLossSentinel::new(Arc::clone(&transport), Some(&log));

        Ok(RequestQueueFactory {
            transport,
            serializer: Arc::new(JsonMessageSerializer),
            sentinel,
            queues: DashMap::new(),
            log,
        })
    }

    /// Replaces the JSON serializer. Queues already handed out keep the one
    /// they were built with.
    pub fn with_serializer(
        mut self,
        serializer: Arc<dyn MessageSerializer>,
    ) -> RequestQueueFactory {
        self.serializer = serializer;
        self
    }

    /// Starts the data loss sentinel. Senders wait for it to be armed before
    /// queueing anything.
    pub fn start(&self) {
        self.sentinel.start();
    }

    pub fn settings(&self) -> &QueueSettings {
        self.transport.settings()
    }

    pub fn sentinel(&self) -> &Arc<DataLossSentinel> {
        &self.sentinel
    }

    pub fn queue(&self, endpoint: &Endpoint) -> Arc<RequestQueue> {
        if let Some(queue) = self.queues.get(endpoint) {
            return Arc::clone(queue.value());
        }
        let queue = self
            .queues
            .entry(endpoint.clone())
            .or_insert_with(|| {
                debug!(self.log, "creating request queue";
                    "endpoint" => %endpoint);
                Arc::new(RequestQueue::new(
                    endpoint.clone(),
                    Arc::clone(&self.transport),
                    Arc::clone(&self.serializer),
                    Arc::clone(&self.sentinel),
                    Some(&self.log),
                ))
            });
        Arc::clone(queue.value())
    }

    /// Shuts down every queue handed out so far, then the sentinel.
    pub async fn shutdown(&self) {
        let queues: Vec<Arc<RequestQueue>> = self
            .queues
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for queue in queues {
            queue.shutdown().await;
        }
        self.sentinel.stop().await;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::time::Duration;

    use crate::error::ConfigError;
    use crate::store::MemoryStore;

    #[test]
    fn invalid_settings_are_rejected() {
        let settings = QueueSettings::default().with_heartbeats(
            Duration::from_secs(30),
            Duration::from_secs(10),
        );
        let result = RequestQueueFactory::new(MemoryStore::new(), settings, None);
        assert!(matches!(
            result,
            Err(QueueError::Config(ConfigError::HeartbeatWindow { .. }))
        ));
    }

    #[tokio::test]
    async fn one_queue_per_endpoint() {
        let factory = RequestQueueFactory::new(
            MemoryStore::new(),
            QueueSettings::default(),
            None,
        )
        .expect("valid settings");
        let a = Endpoint::new("poll://a/");
        let b = Endpoint::new("poll://b/");

        let first = factory.queue(&a);
        assert!(Arc::ptr_eq(&first, &factory.queue(&a)));
        assert!(!Arc::ptr_eq(&first, &factory.queue(&b)));
        assert_eq!(first.endpoint(), &a);
        assert!(first.is_empty().await.expect("queue length"));
    }

    #[tokio::test]
    async fn shutdown_is_reported_distinctly() {
        let factory = RequestQueueFactory::new(
            MemoryStore::new(),
            QueueSettings::default(),
            None,
        )
        .expect("valid settings");
        let queue = factory.queue(&Endpoint::new("poll://a/"));
        factory.shutdown().await;

        assert!(queue.is_shut_down());
        assert!(matches!(queue.len().await, Err(QueueError::ShutDown)));
    }

    #[tokio::test]
    async fn task_group_joins_its_tasks() {
        let stop = CancellationToken::new();
        let mut group = TaskGroup::new(stop.clone());
        let (tx, rx) = tokio::sync::oneshot::channel();
        let token = group.token().clone();
        group.spawn(async move {
            token.cancelled().await;
            let _ = tx.send(());
        });
        group.shutdown().await;
        assert!(stop.is_cancelled());
        assert!(rx.await.is_ok());
    }
}
