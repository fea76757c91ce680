// Copyright 2020 Joyent, Inc.

//! Halibut queue: a distributed pending request queue
//!
//! A request issued on one process is collected and answered by a
//! different, independently failing process. The two sides never talk to
//! each other directly; they coordinate only through a shared key-value
//! store that offers TTL'd keys, lists, hashes and publish/subscribe
//! channels (Redis, or the in-process `MemoryStore`).
//!
//! Request life cycle
//!
//! * The sender calls `RequestQueue::queue_and_wait`. The request payload is
//!   written to the store, its ActivityId is pushed onto the endpoint's work
//!   list and a "work available" pulse is published.
//!
//! * A worker calls `RequestQueue::dequeue`. It pops an id and claims the
//!   payload by deleting it. Exactly one worker wins the delete. From then
//!   on the worker publishes heartbeats for that ActivityId.
//!
//! * The worker calls `RequestQueue::respond`. The response is written and a
//!   "response available" pulse wakes the sender, which may be a different
//!   process than the worker.
//!
//! Pulses are advisory. Every waiter also polls the durable key behind the
//! pulse, so a missed notification only costs latency.
//!
//! Failure handling
//!
//! * Not collected within the queue timeout: the sender claims the payload
//!   back and answers itself with a `RequestNotCollected` error response.
//!
//! * Collected but silent: the sender watches the worker's heartbeats and
//!   answers itself with `PeerDisconnected` once they stop, or with
//!   `CollectedButNoResponse` once the grace period runs out.
//!
//! * The store loses its data: `DataLossSentinel` notices its canary is
//!   gone and cancels every wait tied to it.
//!
//! Store keys and channels
//!
//! | Purpose             | Shape                                          |
//! |---------------------|------------------------------------------------|
//! | work pulse          | channel `requestpulse::{endpoint}`             |
//! | request id list     | list `requestids::{endpoint}`                  |
//! | request payload     | hash `request::{endpoint}::{activity}`         |
//! | response payload    | string `response::{activity}`                  |
//! | response pulse      | channel `responseavail::{activity}`            |
//! | cancellation marker | string `cancelled::{endpoint}::{activity}`     |
//! | heartbeat           | channel `heartbeat::{endpoint}::{activity}::{role}` |
//! | canary              | string `canary::{guid}`                        |
//!
//! Every key is prefixed with the configured namespace.

pub mod backoff;
pub mod cancel;
pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod keys;
pub mod liveness;
pub mod pending;
pub mod protocol;
pub mod queue;
pub mod sentinel;
pub mod server;
pub mod store;
pub mod transport;

pub use crate::config::QueueSettings;
pub use crate::error::{QueueError, StoreError};
pub use crate::protocol::{
    ActivityId, Endpoint, HeartbeatRole, RequestMessage, ResponseMessage,
    ServerError, ServerErrorKind,
};
pub use crate::queue::{RequestQueue, RequestQueueFactory};
pub use crate::server::DequeuedRequest;
pub use crate::store::{KeyValueStore, MemoryStore};
