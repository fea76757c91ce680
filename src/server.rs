// Copyright 2020 Joyent, Inc.

//! Worker side of a [`RequestQueue`].
//!
//! A worker long-polls with `dequeue`. Claiming a request starts a
//! processing guard for it: heartbeats so the sender knows the worker is
//! alive, and watchers that fire the request's cancellation token when the
//! sender gives up, either explicitly or by going silent, or when the store
//! loses its data. `respond` writes the response and tears the guard down.
//! A guard whose token fired tears itself down.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use slog::{debug, info, o, warn, Logger};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::backoff::LinearBackoff;
use crate::cancel::LinkedCancellation;
use crate::error::QueueError;
use crate::liveness::{
    watch_for_disconnect, HeartbeatSender, WatchOptions, WatchOutcome,
    WatchState,
};
use crate::protocol::{
    ActivityId, Endpoint, HeartbeatRole, RequestMessage, ResponseMessage,
    StoredMessage,
};
use crate::queue::{RequestQueue, TaskGroup};
use crate::transport::QueueTransport;

/// A request claimed by this worker.
#[derive(Debug)]
pub struct DequeuedRequest {
    pub message: RequestMessage,
    /// Fires when the sender cancels the request or stops heartbeating, when
    /// the store loses its data, and when the queue shuts down.
    pub cancellation: CancellationToken,
}

impl DequeuedRequest {
    pub fn id(&self) -> ActivityId {
        self.message.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

impl RequestQueue {
    /// Claims the next request for this endpoint.
    ///
    /// If nothing is queued, waits up to `wait_timeout` for a work pulse and
    /// tries once more. `Ok(None)` means there was nothing to do.
    ///
    /// Like `queue_and_wait`, this first waits for the data loss sentinel to
    /// arm, so the factory must have been started.
    pub async fn dequeue(
        &self,
        wait_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<DequeuedRequest>, QueueError> {
        if self.shutdown.is_cancelled() {
            return Err(QueueError::ShutDown);
        }
        let data_loss = self
            .sentinel
            .await_readiness(self.transport.settings().sentinel_ready_timeout)
            .await?;
        let linked =
            LinkedCancellation::new(vec![cancel.clone(), self.shutdown.clone()]);
        let result = self
            .long_poll(wait_timeout, &data_loss, linked.token())
            .await;
        result.map_err(|e| self.on_shutdown(e))
    }

    async fn long_poll(
        &self,
        wait_timeout: Duration,
        data_loss: &CancellationToken,
        token: &CancellationToken,
    ) -> Result<Option<DequeuedRequest>, QueueError> {
        let mut pulses = self
            .transport
            .subscribe_work_available(&self.endpoint, token)
            .await?;

        if let Some(request) = self.try_collect(data_loss, token).await? {
            pulses.close().await;
            return Ok(Some(request));
        }

        let woken = async {
            if pulses.recv().await.is_none() {
                // Closed subscriptions leave only the timer.
                futures::future::pending::<()>().await;
            }
        };
        tokio::select! {
            _ = token.cancelled() => return Err(QueueError::Cancelled),
            _ = woken => (),
            _ = sleep(wait_timeout) => (),
        }
        pulses.close().await;

        self.try_collect(data_loss, token).await
    }

    /// Pops ids until one can be claimed or the list is empty.
    async fn try_collect(
        &self,
        data_loss: &CancellationToken,
        token: &CancellationToken,
    ) -> Result<Option<DequeuedRequest>, QueueError> {
        loop {
            let id = match self.transport.pop_request_id(&self.endpoint, token).await? {
                Some(id) => id,
                None => return Ok(None),
            };
            let raw = match self
                .transport
                .try_take_request(&self.endpoint, id, token)
                .await?
            {
                Some(raw) => raw,
                None => {
                    debug!(self.log, "request already claimed or expired";
                        "activity_id" => %id);
                    continue;
                }
            };
            if self
                .transport
                .is_marked_cancelled(&self.endpoint, id, token)
                .await?
            {
                debug!(self.log, "skipping cancelled request";
                    "activity_id" => %id);
                continue;
            }
            match self.read_request(id, &raw) {
                Ok(message) => {
                    return Ok(Some(self.begin_processing(message, data_loss)))
                }
                Err(e) => {
                    warn!(self.log, "discarding unreadable request";
                        "activity_id" => %id, "error" => %e);
                }
            }
        }
    }

    fn read_request(
        &self,
        id: ActivityId,
        raw: &str,
    ) -> Result<RequestMessage, QueueError> {
        let stored = StoredMessage::decode(raw)?;
        let message = self.serializer.read_request(&stored.payload_json)?;
        if stored.request_id != id || message.id != id {
            return Err(QueueError::InvalidPayload(format!(
                "request stored under {} carries id {}",
                id, message.id
            )));
        }
        Ok(message)
    }

    fn begin_processing(
        &self,
        message: RequestMessage,
        data_loss: &CancellationToken,
    ) -> DequeuedRequest {
        let id = message.id;
        let settings = self.transport.settings();
        let log = self.log.new(o!("activity_id" => id.to_string()));
        let cancellation = self.shutdown.child_token();
        // Everything the guard runs stops once the request is cancelled.
        let mut guard = TaskGroup::new(cancellation.child_token());

        guard.set_heartbeats(HeartbeatSender::start(
            Arc::clone(&self.transport),
            self.endpoint.clone(),
            id,
            HeartbeatRole::Receiver,
            settings.heartbeat_interval,
            guard.token(),
            &log,
        ));

        guard.spawn(watch_for_cancellation(
            Arc::clone(&self.transport),
            self.endpoint.clone(),
            id,
            LinearBackoff::from_settings(settings),
            cancellation.clone(),
            guard.token().clone(),
            log.clone(),
        ));

        let sender_watch = WatchOptions {
            peer: HeartbeatRole::Sender,
            start: WatchState::Watching,
            heartbeat_timeout: settings.heartbeat_timeout,
            collection_poll: LinearBackoff::from_settings(settings),
        };
        let watch = watch_for_disconnect(
            Arc::clone(&self.transport),
            self.endpoint.clone(),
            id,
            sender_watch,
            guard.token().clone(),
            log.clone(),
            || (),
        );
        let abandoned = cancellation.clone();
        let watch_log = log.clone();
        guard.spawn(async move {
            if let WatchOutcome::Disconnected { .. } = watch.await {
                info!(watch_log, "sender went silent, cancelling request");
                abandoned.cancel();
            }
        });

        let release = release_when_settled(
            Arc::clone(&self.processing),
            id,
            data_loss.clone(),
            cancellation.clone(),
            guard.token().clone(),
            log.clone(),
        );
        self.processing.insert(id, guard);
        // The release task must find the guard in the map.
        if let Some(mut guard) = self.processing.get_mut(&id) {
            guard.spawn(release);
        }
        debug!(log, "request collected");

        DequeuedRequest {
            message,
            cancellation,
        }
    }

    /// Stores the response and wakes the sender.
    ///
    /// Only the first response for an ActivityId is kept; later calls
    /// succeed without changing anything. The processing guard for the
    /// request is stopped either way.
    pub async fn respond(
        &self,
        response: ResponseMessage,
        cancel: &CancellationToken,
    ) -> Result<(), QueueError> {
        let id = response.id;
        let result = self.store_response(&response, cancel).await;
        if let Some((_, guard)) = self.processing.remove(&id) {
            guard.shutdown().await;
        }
        result
    }

    async fn store_response(
        &self,
        response: &ResponseMessage,
        cancel: &CancellationToken,
    ) -> Result<(), QueueError> {
        let id = response.id;
        let stored = StoredMessage {
            request_id: id,
            payload_json: self.serializer.prepare_response(response)?,
        };
        let payload = stored.encode()?;

        if !self.transport.put_response(id, &payload, cancel).await? {
            debug!(self.log, "response already stored"; "activity_id" => %id);
            return Ok(());
        }
        if let Err(e) = self.transport.publish_response_available(id, cancel).await {
            if e.is_cancelled() {
                return Err(e);
            }
            warn!(self.log, "response pulse not published, sender will poll";
                "activity_id" => %id, "error" => %e);
        }
        Ok(())
    }
}

/// Fires `cancellation` if the store loses its data, then drops the
/// processing guard once its token has fired for any reason.
async fn release_when_settled(
    processing: Arc<DashMap<ActivityId, TaskGroup>>,
    id: ActivityId,
    data_loss: CancellationToken,
    cancellation: CancellationToken,
    stop: CancellationToken,
    log: Logger,
) {
    tokio::select! {
        _ = stop.cancelled() => (),
        _ = data_loss.cancelled() => {
            warn!(log, "store lost its data, cancelling request");
            cancellation.cancel();
        }
    }
    if processing.remove(&id).is_some() {
        debug!(log, "processing guard released");
    }
}

/// Fires `cancellation` once the sender marks the request cancelled.
async fn watch_for_cancellation(
    transport: Arc<QueueTransport>,
    endpoint: Endpoint,
    id: ActivityId,
    mut poll: LinearBackoff,
    cancellation: CancellationToken,
    stop: CancellationToken,
    log: Logger,
) {
    let mut pulses = loop {
        match transport.subscribe_cancellation(&endpoint, id, &stop).await {
            Ok(pulses) => break Some(pulses),
            Err(QueueError::Cancelled) => return,
            Err(e) => {
                warn!(log, "cancellation subscription failed, polling only";
                    "error" => %e);
                break None;
            }
        }
    };

    loop {
        match transport.is_marked_cancelled(&endpoint, id, &stop).await {
            Ok(true) => {
                info!(log, "request cancelled by sender");
                cancellation.cancel();
                break;
            }
            Ok(false) => (),
            Err(QueueError::Cancelled) => break,
            Err(e) => warn!(log, "cancellation poll failed"; "error" => %e),
        }

        let open = pulses.is_some();
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = cancellation.cancelled() => break,
            got = async {
                match pulses.as_mut() {
                    Some(sub) => sub.recv().await,
                    None => None,
                }
            }, if open => {
                if got.is_none() {
                    pulses = None;
                }
            }
            _ = sleep(poll.next_delay()) => (),
        }
    }

    if let Some(pulses) = pulses {
        pulses.close().await;
    }
}
