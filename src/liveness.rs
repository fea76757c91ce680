// Copyright 2020 Joyent, Inc.

//! Heartbeats between the two sides of a request.
//!
//! Whoever is doing something for a request publishes heartbeats under its
//! own role: the worker while it processes, the sender while it waits.
//! Whoever depends on the other side runs [`watch_for_disconnect`] on the
//! peer's role.
//!
//! The watcher moves through
//!
//! ```text
//! WaitingForCollection ──► Watching ──► Disconnected
//!            └──────────────────┴─────► CancelledExternally
//! ```
//!
//! Collection is confirmed by the first heartbeat or by seeing the request
//! payload gone from the store. Once watching, a heartbeat only pushes the
//! deadline out; nothing but silence or cancellation ends the watch.

use std::sync::Arc;
use std::time::Duration;

use slog::{debug, info, o, warn, Logger};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::backoff::LinearBackoff;
use crate::channel::ChannelSubscription;
use crate::error::QueueError;
use crate::protocol::{ActivityId, Endpoint, HeartbeatRole};
use crate::transport::QueueTransport;

/// Publishes heartbeats for one request until stopped, dropped, or until
/// the token it was started under is cancelled.
pub struct HeartbeatSender {
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl HeartbeatSender {
    pub fn start(
        transport: Arc<QueueTransport>,
        endpoint: Endpoint,
        id: ActivityId,
        role: HeartbeatRole,
        interval: Duration,
        parent: &CancellationToken,
        log: &Logger,
    ) -> HeartbeatSender {
        let stop = parent.child_token();
        let log = log.new(o!("heartbeat_role" => role.as_str()));
        let task = tokio::spawn(send_heartbeats(
            transport,
            endpoint,
            id,
            role,
            interval,
            stop.clone(),
            log,
        ));
        HeartbeatSender {
            stop,
            task: Some(task),
        }
    }

    /// Stops publishing and waits for the loop to exit.
    pub async fn stop(mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for HeartbeatSender {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// The shortest interval panic mode will shrink to, as a fraction of the
/// normal interval.
const PANIC_FLOOR_DIVISOR: u32 = 8;

async fn send_heartbeats(
    transport: Arc<QueueTransport>,
    endpoint: Endpoint,
    id: ActivityId,
    role: HeartbeatRole,
    interval: Duration,
    stop: CancellationToken,
    log: Logger,
) {
    let floor = interval / PANIC_FLOOR_DIVISOR;
    let mut delay = interval;

    loop {
        match transport.publish_heartbeat(&endpoint, id, role, &stop).await {
            Ok(()) => {
                if delay != interval {
                    info!(log, "heartbeat publishing recovered");
                }
                delay = interval;
            }
            Err(QueueError::Cancelled) => return,
            Err(e) => {
                delay = (delay / 2).max(floor);
                warn!(log, "failed to publish heartbeat";
                    "error" => %e,
                    "next_attempt_ms" => delay.as_millis() as u64);
            }
        }

        tokio::select! {
            _ = stop.cancelled() => return,
            _ = sleep(delay) => (),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchState {
    WaitingForCollection,
    Watching,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchOutcome {
    /// No heartbeat arrived for `silent_for`.
    Disconnected { silent_for: Duration },
    CancelledExternally,
}

#[derive(Clone, Debug)]
pub struct WatchOptions {
    /// Role whose heartbeats are watched.
    pub peer: HeartbeatRole,
    pub start: WatchState,
    pub heartbeat_timeout: Duration,
    /// Polling schedule for the collection check.
    pub collection_poll: LinearBackoff,
}

/// Watches the peer's heartbeats until it goes quiet or `cancel` fires.
///
/// `on_collected` runs once, when collection is confirmed; it does not run
/// if the watch starts in `Watching`.
pub async fn watch_for_disconnect<C>(
    transport: Arc<QueueTransport>,
    endpoint: Endpoint,
    id: ActivityId,
    options: WatchOptions,
    cancel: CancellationToken,
    log: Logger,
    on_collected: C,
) -> WatchOutcome
where
    C: FnOnce(),
{
    let log = log.new(o!("watching" => options.peer.as_str()));
    let mut heartbeats = match subscribe_until_cancelled(
        &transport, &endpoint, id, options.peer, &cancel, &log,
    )
    .await
    {
        Some(sub) => sub,
        None => return WatchOutcome::CancelledExternally,
    };

    let mut poll = options.collection_poll.clone();
    let mut open = true;

    if options.start == WatchState::WaitingForCollection {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    heartbeats.close().await;
                    return WatchOutcome::CancelledExternally;
                }
                beat = heartbeats.recv(), if open => {
                    if beat.is_some() {
                        debug!(log, "collection confirmed by heartbeat");
                        break;
                    }
                    open = false;
                }
                _ = sleep(poll.next_delay()) => {
                    match transport.request_exists(&endpoint, id, &cancel).await {
                        Ok(false) => {
                            debug!(log, "collection confirmed by absent payload");
                            break;
                        }
                        Ok(true) => (),
                        Err(QueueError::Cancelled) => (),
                        Err(e) => {
                            warn!(log, "collection check failed"; "error" => %e);
                        }
                    }
                }
            }
        }
        on_collected();
    }

    let mut last_heartbeat = Instant::now();
    let outcome = loop {
        let deadline = last_heartbeat + options.heartbeat_timeout;
        tokio::select! {
            _ = cancel.cancelled() => break WatchOutcome::CancelledExternally,
            beat = heartbeats.recv(), if open => match beat {
                Some(_) => last_heartbeat = Instant::now(),
                None => open = false,
            },
            _ = sleep_until(deadline) => {
                let silent_for = last_heartbeat.elapsed();
                warn!(log, "peer may have disconnected";
                    "silent_ms" => silent_for.as_millis() as u64);
                break WatchOutcome::Disconnected { silent_for };
            }
        }
    };

    heartbeats.close().await;
    outcome
}

/// Subscribes to the peer's heartbeats, retrying past store outages.
async fn subscribe_until_cancelled(
    transport: &QueueTransport,
    endpoint: &Endpoint,
    id: ActivityId,
    role: HeartbeatRole,
    cancel: &CancellationToken,
    log: &Logger,
) -> Option<ChannelSubscription> {
    let retry_delay = transport.channel().retry_policy().delay;
    loop {
        match transport.subscribe_heartbeat(endpoint, id, role, cancel).await {
            Ok(sub) => return Some(sub),
            Err(QueueError::Cancelled) => return None,
            Err(e) => {
                warn!(log, "heartbeat subscription failed, retrying"; "error" => %e);
                tokio::select! {
                    _ = cancel.cancelled() => return None,
                    _ = sleep(retry_delay) => (),
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};

    use slog::{o, Discard};

    use crate::channel::{KeyValueChannel, RetryPolicy};
    use crate::config::QueueSettings;
    use crate::store::MemoryStore;

    fn transport_over(store: Arc<MemoryStore>) -> Arc<QueueTransport> {
        let settings = Arc::new(QueueSettings::default());
        let channel = Arc::new(KeyValueChannel::new(
            store,
            RetryPolicy::from_settings(&settings),
            None,
        ));
        Arc::new(QueueTransport::new(channel, settings, None))
    }

    fn quiet() -> Logger {
        Logger::root(Discard, o!())
    }

    fn options(start: WatchState) -> WatchOptions {
        WatchOptions {
            peer: HeartbeatRole::Receiver,
            start,
            heartbeat_timeout: Duration::from_secs(60),
            collection_poll: LinearBackoff::new(
                Duration::from_secs(15),
                Duration::from_secs(15),
                Duration::from_secs(120),
            ),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silence_after_collection_is_a_disconnect() {
        let store = MemoryStore::new();
        let transport = transport_over(store);
        let endpoint = Endpoint::new("poll://a/");
        let id = ActivityId::new();
        let collected = Arc::new(AtomicBool::new(false));

        let watcher = {
            let transport = Arc::clone(&transport);
            let endpoint = endpoint.clone();
            let collected = Arc::clone(&collected);
            tokio::spawn(watch_for_disconnect(
                transport,
                endpoint,
                id,
                options(WatchState::WaitingForCollection),
                CancellationToken::new(),
                quiet(),
                move || collected.store(true, Ordering::SeqCst),
            ))
        };

        // One heartbeat confirms collection, then the worker goes quiet.
        sleep(Duration::from_secs(1)).await;
        let cancel = CancellationToken::new();
        transport
            .publish_heartbeat(&endpoint, id, HeartbeatRole::Receiver, &cancel)
            .await
            .unwrap();

        let started = Instant::now();
        let outcome = watcher.await.unwrap();
        assert!(collected.load(Ordering::SeqCst));
        assert!(matches!(outcome, WatchOutcome::Disconnected { .. }));
        assert!(started.elapsed() >= Duration::from_secs(59));
    }

    #[tokio::test(start_paused = true)]
    async fn absent_payload_confirms_collection_without_heartbeats() {
        let store = MemoryStore::new();
        let transport = transport_over(store);
        let collected = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&collected);

        // The payload was never written, so it already looks collected.
        let outcome = watch_for_disconnect(
            transport,
            Endpoint::new("poll://a/"),
            ActivityId::new(),
            options(WatchState::WaitingForCollection),
            CancellationToken::new(),
            quiet(),
            move || flag.store(true, Ordering::SeqCst),
        )
        .await;

        assert!(collected.load(Ordering::SeqCst));
        assert!(matches!(outcome, WatchOutcome::Disconnected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn steady_heartbeats_keep_the_watch_open() {
        let store = MemoryStore::new();
        let transport = transport_over(store);
        let endpoint = Endpoint::new("poll://a/");
        let id = ActivityId::new();
        let cancel = CancellationToken::new();

        let sender = HeartbeatSender::start(
            Arc::clone(&transport),
            endpoint.clone(),
            id,
            HeartbeatRole::Receiver,
            Duration::from_secs(15),
            &cancel,
            &quiet(),
        );

        let watcher = tokio::spawn(watch_for_disconnect(
            Arc::clone(&transport),
            endpoint,
            id,
            options(WatchState::Watching),
            cancel.clone(),
            quiet(),
            || (),
        ));

        sleep(Duration::from_secs(300)).await;
        assert!(!watcher.is_finished());
        cancel.cancel();
        assert_eq!(watcher.await.unwrap(), WatchOutcome::CancelledExternally);
        sender.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_stop_with_their_owner() {
        let store = MemoryStore::new();
        let transport = transport_over(store);
        let endpoint = Endpoint::new("poll://a/");
        let id = ActivityId::new();
        let owner = CancellationToken::new();
        let listen = CancellationToken::new();

        let mut beats = transport
            .subscribe_heartbeat(&endpoint, id, HeartbeatRole::Receiver, &listen)
            .await
            .unwrap();
        let _sender = HeartbeatSender::start(
            Arc::clone(&transport),
            endpoint,
            id,
            HeartbeatRole::Receiver,
            Duration::from_secs(15),
            &owner,
            &quiet(),
        );
        let first = tokio::time::timeout(Duration::from_secs(20), beats.recv()).await;
        assert!(first.ok().flatten().is_some());

        owner.cancel();
        sleep(Duration::from_secs(1)).await;
        beats.drain();
        let later = tokio::time::timeout(Duration::from_secs(600), beats.recv()).await;
        assert!(later.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_sender_keeps_trying_through_outages() {
        let store = MemoryStore::new();
        let transport = transport_over(Arc::clone(&store));
        let endpoint = Endpoint::new("poll://a/");
        let id = ActivityId::new();
        let cancel = CancellationToken::new();

        let mut beats = transport
            .subscribe_heartbeat(&endpoint, id, HeartbeatRole::Sender, &cancel)
            .await
            .unwrap();

        store.fail_next(3);
        let sender = HeartbeatSender::start(
            Arc::clone(&transport),
            endpoint,
            id,
            HeartbeatRole::Sender,
            Duration::from_secs(16),
            &cancel,
            &quiet(),
        );

        // Three failures in panic mode take 8 + 4 + 2 seconds.
        let got = tokio::time::timeout(Duration::from_secs(20), beats.recv()).await;
        assert!(got.ok().flatten().is_some());
        sender.stop().await;
    }
}
