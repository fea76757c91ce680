// Copyright 2020 Joyent, Inc.

//! Sender-side state of one in-flight request.
//!
//! ```text
//! Queued ──► Collected ──► Completed
//!    └───────────────────────▲
//! ```
//!
//! Completed is terminal and its response never changes once set. Waiting
//! is split in two phases. First the sender waits up to the queue timeout.
//! If the request has not been collected by then, the sender tries to claim
//! the payload back from the store. Winning that claim means no worker can
//! ever see the request, so the sender answers itself with
//! `RequestNotCollected`. Losing it means a worker already took it, and the
//! sender keeps waiting for the collected grace period. Only one of a
//! synthetic timeout and the real response can ever be delivered.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::QueueError;
use crate::protocol::{RequestMessage, ResponseMessage};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Queued,
    Collected,
    Completed,
}

#[derive(Clone, Debug)]
struct PendingState {
    phase: Phase,
    collected_at: Option<Instant>,
    response: Option<ResponseMessage>,
}

#[derive(Clone, Copy, Debug)]
pub struct WaitTimeouts {
    /// How long the request may wait to be collected.
    pub queue: Duration,
    /// How long to wait for a response after collection.
    pub collected_grace: Duration,
}

pub struct PendingRequest {
    request: RequestMessage,
    state: watch::Sender<PendingState>,
}

impl PendingRequest {
    pub fn new(request: RequestMessage) -> PendingRequest {
        let (state, _) = watch::channel(PendingState {
            phase: Phase::Queued,
            collected_at: None,
            response: None,
        });
        PendingRequest { request, state }
    }

    pub fn request(&self) -> &RequestMessage {
        &self.request
    }

    pub fn phase(&self) -> Phase {
        self.state.borrow().phase
    }

    pub fn is_collected(&self) -> bool {
        self.phase() != Phase::Queued
    }

    pub fn is_completed(&self) -> bool {
        self.phase() == Phase::Completed
    }

    pub fn response(&self) -> Option<ResponseMessage> {
        self.state.borrow().response.clone()
    }

    /// Queued -> Collected. Returns false if the request had already
    /// completed, in which case it must not be processed.
    pub fn mark_collected(&self) -> bool {
        let mut completed = false;
        self.state.send_if_modified(|state| match state.phase {
            Phase::Queued => {
                state.phase = Phase::Collected;
                state.collected_at = Some(Instant::now());
                true
            }
            Phase::Collected => false,
            Phase::Completed => {
                completed = true;
                false
            }
        });
        !completed
    }

    /// Completes the request. The first response wins; later calls change
    /// nothing and return false.
    pub fn set_response(&self, response: ResponseMessage) -> bool {
        self.state.send_if_modified(|state| {
            if state.phase == Phase::Completed {
                return false;
            }
            state.phase = Phase::Completed;
            state.response = Some(response);
            true
        })
    }

    /// Waits until the request completes or runs out of time.
    ///
    /// `try_claim` is called at most once, when the queue timeout passes
    /// while the request still looks uncollected. It must atomically remove
    /// the request from the store and return whether it did so.
    pub async fn wait_until_complete<F, Fut>(
        &self,
        timeouts: WaitTimeouts,
        cancel: &CancellationToken,
        try_claim: F,
    ) -> Result<ResponseMessage, QueueError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<bool, QueueError>>,
    {
        let started = Instant::now();
        let queue_deadline = started + timeouts.queue;

        if self.wait_for_completion(queue_deadline, cancel).await? {
            return self.completed_response();
        }

        if self.phase() == Phase::Queued {
            if try_claim().await? {
                let waited = started.elapsed().as_millis();
                self.set_response(ResponseMessage::not_collected(
                    &self.request,
                    waited,
                ));
                return self.completed_response();
            }
            // Someone else removed the payload first, so it was collected.
            self.mark_collected();
        }

        let collected_at = self
            .state
            .borrow()
            .collected_at
            .unwrap_or_else(Instant::now);
        let grace_deadline = collected_at + timeouts.collected_grace;
        if self.wait_for_completion(grace_deadline, cancel).await? {
            return self.completed_response();
        }

        let waited = collected_at.elapsed().as_millis();
        self.set_response(ResponseMessage::collected_without_response(
            &self.request,
            waited,
        ));
        self.completed_response()
    }

    /// Returns true once completed, false if the deadline passed first.
    async fn wait_for_completion(
        &self,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<bool, QueueError> {
        let mut state = self.state.subscribe();
        let completed = async {
            state
                .wait_for(|s| s.phase == Phase::Completed)
                .await
                .is_ok()
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(QueueError::Cancelled),
            _ = sleep_until(deadline) => Ok(self.is_completed()),
            done = completed => Ok(done),
        }
    }

    fn completed_response(&self) -> Result<ResponseMessage, QueueError> {
        self.response().ok_or_else(|| {
            QueueError::InvalidPayload(String::from(
                "completed request has no response",
            ))
        })
    }
}
