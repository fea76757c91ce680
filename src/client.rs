// Copyright 2020 Joyent, Inc.

//! Sending side of a [`RequestQueue`].
//!
//! `queue_and_wait` writes the request, then waits on three things at once:
//! the response (pulse plus poll), the worker's heartbeats, and the two
//! phase timeout of [`PendingRequest`]. Whichever settles the request first
//! wins and everything else is torn down before the call returns.

use std::sync::Arc;

use slog::{debug, info, o, warn, Logger};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::backoff::LinearBackoff;
use crate::cancel::LinkedCancellation;
use crate::channel::ChannelSubscription;
use crate::error::QueueError;
use crate::liveness::{
    watch_for_disconnect, HeartbeatSender, WatchOptions, WatchOutcome,
    WatchState,
};
use crate::pending::{PendingRequest, WaitTimeouts};
use crate::protocol::{
    ActivityId, HeartbeatRole, MessageSerializer, RequestMessage,
    ResponseMessage, ServerError, ServerErrorKind, StoredMessage,
};
use crate::queue::{RequestQueue, TaskGroup};
use crate::transport::QueueTransport;

impl RequestQueue {
    /// Queues `request` and waits for its response.
    ///
    /// Timeouts and a vanished worker are not errors: they come back as a
    /// response carrying a [`ServerError`]. Errors are reserved for the
    /// request's fate being unknown: the store being unreachable past the
    /// retry budget, the store losing its data, the caller cancelling, or
    /// this queue shutting down.
    pub async fn queue_and_wait(
        &self,
        request: RequestMessage,
        cancel: &CancellationToken,
    ) -> Result<ResponseMessage, QueueError> {
        if self.shutdown.is_cancelled() {
            return Err(QueueError::ShutDown);
        }
        if request.endpoint != self.endpoint {
            return Err(QueueError::InvalidPayload(format!(
                "request for {} queued on {}",
                request.endpoint, self.endpoint
            )));
        }

        let settings = self.transport.settings();
        let data_loss = self
            .sentinel
            .await_readiness(settings.sentinel_ready_timeout)
            .await?;

        let id = request.id;
        let log = self.log.new(o!("activity_id" => id.to_string()));
        let stored = StoredMessage {
            request_id: id,
            payload_json: self.serializer.prepare_request(&request)?,
        };
        let payload = stored.encode()?;

        let linked = LinkedCancellation::new(vec![
            cancel.clone(),
            data_loss.clone(),
            self.shutdown.clone(),
        ]);
        let pending = Arc::new(PendingRequest::new(request));
        self.in_flight.insert(id, Arc::clone(&pending));

        let mut tasks = TaskGroup::new(linked.token().child_token());
        let result = self
            .send_and_wait(&pending, &payload, linked.token(), &mut tasks, &log)
            .await;
        tasks.shutdown().await;
        self.in_flight.remove(&id);
        drop(linked);

        match result {
            Ok(response) => {
                debug!(log, "request completed"; "error" => response.is_error());
                Ok(response)
            }
            Err(e) if e.is_cancelled() => {
                if data_loss.is_cancelled() {
                    warn!(log, "abandoning request after store data loss");
                    Err(QueueError::DataLossDetected)
                } else if self.shutdown.is_cancelled() {
                    Err(QueueError::ShutDown)
                } else {
                    info!(log, "request cancelled by caller");
                    drop(self.abandon(id, &log));
                    Err(QueueError::Cancelled)
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn send_and_wait(
        &self,
        pending: &Arc<PendingRequest>,
        payload: &str,
        token: &CancellationToken,
        tasks: &mut TaskGroup,
        log: &Logger,
    ) -> Result<ResponseMessage, QueueError> {
        let id = pending.request().id;
        let settings = self.transport.settings();

        // Armed before anything announces the request.
        let responses = self
            .transport
            .subscribe_response_available(id, token)
            .await?;
        tasks.spawn(watch_for_response(
            Arc::clone(&self.transport),
            Arc::clone(&self.serializer),
            Arc::clone(pending),
            responses,
            LinearBackoff::from_settings(settings),
            tasks.token().clone(),
            log.clone(),
        ));

        self.transport
            .put_request(&self.endpoint, id, payload, settings.request_ttl(), token)
            .await?;
        self.transport
            .push_request_id(&self.endpoint, id, token)
            .await?;
        if let Err(e) = self
            .transport
            .publish_work_available(&self.endpoint, token)
            .await
        {
            if e.is_cancelled() {
                return Err(e);
            }
            warn!(log, "work pulse not published, workers will poll";
                "error" => %e);
        }
        debug!(log, "request queued");

        // Started once the payload exists, so its absence means collection.
        let worker_watch = WatchOptions {
            peer: HeartbeatRole::Receiver,
            start: WatchState::WaitingForCollection,
            heartbeat_timeout: settings.heartbeat_timeout,
            collection_poll: LinearBackoff::from_settings(settings),
        };
        let watched = Arc::clone(pending);
        let collected = Arc::clone(pending);
        let watch = watch_for_disconnect(
            Arc::clone(&self.transport),
            self.endpoint.clone(),
            id,
            worker_watch,
            tasks.token().clone(),
            log.clone(),
            move || {
                collected.mark_collected();
            },
        );
        tasks.spawn(async move {
            if let WatchOutcome::Disconnected { silent_for } = watch.await {
                watched.set_response(ResponseMessage::peer_disconnected(
                    watched.request(),
                    silent_for.as_millis(),
                ));
            }
        });

        tasks.set_heartbeats(HeartbeatSender::start(
            Arc::clone(&self.transport),
            self.endpoint.clone(),
            id,
            HeartbeatRole::Sender,
            settings.heartbeat_interval,
            tasks.token(),
            log,
        ));

        let timeouts = WaitTimeouts {
            queue: settings.request_pickup_timeout,
            collected_grace: settings.processing_timeout,
        };
        let transport = Arc::clone(&self.transport);
        let endpoint = self.endpoint.clone();
        pending
            .wait_until_complete(timeouts, token, move || async move {
                let claimed =
                    transport.try_take_request(&endpoint, id, token).await?;
                Ok::<bool, QueueError>(claimed.is_some())
            })
            .await
    }

    /// Removes a cancelled request from the store and tells whichever
    /// worker may hold it. Runs in the background so the caller is released
    /// at once; bounded by the retry budget and by queue shutdown.
    ///
    /// The cancellation is published even if the payload could not be
    /// withdrawn, since a worker may already hold it.
    fn abandon(&self, id: ActivityId, log: &Logger) -> JoinHandle<()> {
        let transport = Arc::clone(&self.transport);
        let endpoint = self.endpoint.clone();
        let stop = self.shutdown.child_token();
        let budget = transport.settings().store_retry_budget;
        let log = log.clone();

        tokio::spawn(async move {
            let propagate = async {
                if let Err(e) = transport.try_take_request(&endpoint, id, &stop).await {
                    if e.is_cancelled() {
                        return Err(e);
                    }
                    warn!(log, "failed to withdraw cancelled request";
                        "error" => %e);
                }
                transport.publish_cancellation(&endpoint, id, &stop).await
            };
            match tokio::time::timeout(budget, propagate).await {
                Ok(Ok(())) => debug!(log, "cancellation propagated"),
                Ok(Err(e)) => {
                    warn!(log, "failed to propagate cancellation"; "error" => %e)
                }
                Err(_) => warn!(log, "timed out propagating cancellation"),
            }
        })
    }
}

/// Waits for the response key to appear, waking on pulses and polling on a
/// backoff in case a pulse is missed.
async fn watch_for_response(
    transport: Arc<QueueTransport>,
    serializer: Arc<dyn MessageSerializer>,
    pending: Arc<PendingRequest>,
    mut pulses: ChannelSubscription,
    mut poll: LinearBackoff,
    stop: CancellationToken,
    log: Logger,
) {
    let id = pending.request().id;
    let mut open = true;

    loop {
        match transport.try_take_response(id, &stop).await {
            Ok(Some(raw)) => {
                let response = read_response(serializer.as_ref(), id, &raw)
                    .unwrap_or_else(|e| {
                        warn!(log, "unreadable response"; "error" => %e);
                        ResponseMessage::from_error(
                            id,
                            ServerError::new(
                                ServerErrorKind::RemoteFailure,
                                "the response could not be read",
                            )
                            .with_details(e.to_string()),
                        )
                    });
                if pending.set_response(response) {
                    debug!(log, "response received");
                }
                break;
            }
            Ok(None) => (),
            Err(QueueError::Cancelled) => break,
            Err(e) => warn!(log, "response poll failed"; "error" => %e),
        }

        tokio::select! {
            _ = stop.cancelled() => break,
            pulse = pulses.recv(), if open => {
                if pulse.is_none() {
                    open = false;
                }
                pulses.drain();
            }
            _ = sleep(poll.next_delay()) => (),
        }
    }

    pulses.close().await;
}

fn read_response(
    serializer: &dyn MessageSerializer,
    id: ActivityId,
    raw: &str,
) -> Result<ResponseMessage, QueueError> {
    let stored = StoredMessage::decode(raw)?;
    if stored.request_id != id {
        return Err(QueueError::InvalidPayload(format!(
            "response for {} stored under {}",
            stored.request_id, id
        )));
    }
    serializer.read_response(&stored.payload_json)
}

#[cfg(test)]
mod test {
    use super::*;

    use std::time::Duration;

    use slog::Discard;

    use crate::config::QueueSettings;
    use crate::protocol::Endpoint;
    use crate::queue::RequestQueueFactory;
    use crate::store::{KeyValueStore, MemoryStore};

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_published_when_the_payload_cannot_be_withdrawn() {
        let store = MemoryStore::new();
        let factory =
            RequestQueueFactory::new(store.clone(), QueueSettings::default(), None)
                .expect("valid settings");
        let endpoint = Endpoint::new("poll://worker-c/");
        let queue = factory.queue(&endpoint);
        let transport = queue.transport();
        let id = ActivityId::new();
        let cancel = CancellationToken::new();

        // A string where the request hash belongs makes the claim-back fail.
        store
            .set_string(
                &transport.keys().request(&endpoint, id),
                "garbage",
                Duration::from_secs(60),
            )
            .await
            .expect("store reachable");
        assert!(transport.try_take_request(&endpoint, id, &cancel).await.is_err());

        let log = Logger::root(Discard, o!());
        queue.abandon(id, &log).await.expect("abandon task");

        assert!(transport
            .is_marked_cancelled(&endpoint, id, &cancel)
            .await
            .expect("store reachable"));
    }
}
