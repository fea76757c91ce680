// Copyright 2020 Joyent, Inc.

//! Detection of the shared store silently losing its data.
//!
//! The sentinel writes a canary under a fresh guid and re-reads it on an
//! interval. If the value changes or disappears, the store has been flushed,
//! restarted without persistence or failed over to an empty replica. Every
//! request waiting on that store is then waiting for state that no longer
//! exists, so the sentinel cancels the signal it handed out and arms a new
//! canary with a new signal.
//!
//! Store errors while reading the canary are not data loss; they only mean
//! the check is skipped until the store answers again.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use slog::{debug, error, info, o, warn, Logger};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::channel::logger_or_default;
use crate::error::QueueError;
use crate::transport::QueueTransport;

#[derive(Clone, Debug)]
enum SentinelState {
    Arming,
    Monitoring(CancellationToken),
    Stopped,
}

pub struct DataLossSentinel {
    transport: Arc<QueueTransport>,
    state: watch::Sender<SentinelState>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    log: Logger,
}

impl DataLossSentinel {
    pub fn new(
        transport: Arc<QueueTransport>,
        log: Option<&Logger>,
    ) -> Arc<DataLossSentinel> {
        let (state, _) = watch::channel(SentinelState::Arming);
        Arc::new(DataLossSentinel {
            transport,
            state,
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
            log: logger_or_default(log).new(o!("component" => "data-loss-sentinel")),
        })
    }

    /// Starts the background watch. Calling it again while it runs has no
    /// effect.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() || self.shutdown.is_cancelled() {
            return;
        }
        let sentinel = Arc::clone(self);
        *task = Some(tokio::spawn(async move { sentinel.run().await }));
    }

    /// Stops the watch and waits for it to exit. Signals already handed out
    /// are left as they are.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.state.send_replace(SentinelState::Stopped);
    }

    pub fn is_monitoring(&self) -> bool {
        matches!(*self.state.borrow(), SentinelState::Monitoring(_))
    }

    /// Waits until a canary is armed and returns the signal that fires if
    /// the store loses its data.
    pub async fn await_readiness(
        &self,
        timeout: Duration,
    ) -> Result<CancellationToken, QueueError> {
        let mut state = self.state.subscribe();
        let ready = async move {
            let current = state
                .wait_for(|s| !matches!(s, SentinelState::Arming))
                .await
                .map(|s| s.clone());
            match current {
                Ok(SentinelState::Monitoring(signal)) => Ok(signal),
                _ => Err(QueueError::ShutDown),
            }
        };
        let waited = tokio::time::timeout(timeout, ready).await;
        match waited {
            Ok(result) => result,
            Err(_) => Err(QueueError::SentinelNotReady(timeout)),
        }
    }

    async fn run(self: Arc<Self>) {
        let settings = self.transport.settings().clone();
        let retry_delay = settings.store_retry_delay;

        info!(self.log, "data loss sentinel started");
        'arm: loop {
            let guid = Uuid::new_v4().to_string();
            let expected = format!("{:016x}", rand::thread_rng().gen::<u64>());

            loop {
                match self
                    .transport
                    .put_canary(&guid, &expected, settings.canary_ttl, &self.shutdown)
                    .await
                {
                    Ok(()) => break,
                    Err(QueueError::Cancelled) => break 'arm,
                    Err(e) => {
                        warn!(self.log, "failed to arm canary"; "error" => %e);
                        tokio::select! {
                            _ = self.shutdown.cancelled() => break 'arm,
                            _ = sleep(retry_delay) => (),
                        }
                    }
                }
            }

            let signal = CancellationToken::new();
            self.state
                .send_replace(SentinelState::Monitoring(signal.clone()));
            debug!(self.log, "canary armed"; "canary" => &guid);

            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break 'arm,
                    _ = sleep(settings.canary_check_interval) => (),
                }

                match self.transport.get_canary(&guid, &self.shutdown).await {
                    Ok(Some(ref value)) if *value == expected => {
                        if let Err(e) = self
                            .transport
                            .refresh_canary(&guid, settings.canary_ttl, &self.shutdown)
                            .await
                        {
                            debug!(self.log, "failed to refresh canary ttl";
                                "error" => %e);
                        }
                    }
                    Ok(found) => {
                        error!(self.log, "shared store lost its data";
                            "canary" => &guid,
                            "found" => found.is_some());
                        self.state.send_replace(SentinelState::Arming);
                        signal.cancel();
                        continue 'arm;
                    }
                    Err(QueueError::Cancelled) => break 'arm,
                    Err(e) => {
                        warn!(self.log, "canary check skipped"; "error" => %e);
                    }
                }
            }
        }
        info!(self.log, "data loss sentinel stopped");
    }
}
