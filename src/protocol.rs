// Copyright 2020 Joyent, Inc.

//! Message types carried through the shared store.
//!
//! A request or response never crosses the store as a bare message. It is
//! first turned into a payload string by a [`MessageSerializer`] and then
//! wrapped in a [`StoredMessage`], whose JSON form is:
//!
//! ```text
//! { "requestId": "<guid>", "payloadJson": "<serializer output>" }
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::QueueError;

/// Correlates one request with its response, heartbeats and cancellation.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ActivityId(Uuid);

impl ActivityId {
    pub fn new() -> ActivityId {
        ActivityId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ActivityId {
    fn default() -> Self {
        ActivityId::new()
    }
}

impl From<Uuid> for ActivityId {
    fn from(id: Uuid) -> Self {
        ActivityId(id)
    }
}

impl fmt::Display for ActivityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_hyphenated())
    }
}

impl FromStr for ActivityId {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(ActivityId).map_err(|e| {
            QueueError::InvalidPayload(format!(
                "invalid activity id '{}': {}",
                s, e
            ))
        })
    }
}

/// Logical address a worker polls against. Opaque to the queue.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Endpoint(String);

impl Endpoint {
    pub fn new<S: Into<String>>(uri: S) -> Endpoint {
        Endpoint(uri.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Endpoint {
    fn from(uri: &str) -> Self {
        Endpoint::new(uri)
    }
}

/// Which side of a request a heartbeat channel belongs to.
///
/// `Sender` is the node that queued the request and is waiting for it;
/// `Receiver` is the node that collected it and is processing it. Each side
/// publishes on its own role and watches the other.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatRole {
    Sender,
    Receiver,
}

impl HeartbeatRole {
    pub fn as_str(self) -> &'static str {
        match self {
            HeartbeatRole::Sender => "sender",
            HeartbeatRole::Receiver => "receiver",
        }
    }

    /// The role on the other end of the same request.
    pub fn peer(self) -> HeartbeatRole {
        match self {
            HeartbeatRole::Sender => HeartbeatRole::Receiver,
            HeartbeatRole::Receiver => HeartbeatRole::Sender,
        }
    }
}

impl fmt::Display for HeartbeatRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Microseconds since the unix epoch.
pub fn now_micros() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    now.as_secs() * 1_000_000 + u64::from(now.subsec_micros())
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RequestMetaData {
    pub uts: u64,
    pub service: String,
    pub method: String,
}

impl RequestMetaData {
    pub fn new(service: String, method: String) -> RequestMetaData {
        RequestMetaData {
            uts: now_micros(),
            service,
            method,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RequestMessage {
    pub id: ActivityId,
    pub endpoint: Endpoint,
    pub m: RequestMetaData,
    pub params: Value,
}

impl RequestMessage {
    pub fn new<S: Into<String>>(
        endpoint: Endpoint,
        service: S,
        method: S,
        params: Value,
    ) -> RequestMessage {
        RequestMessage {
            id: ActivityId::new(),
            endpoint,
            m: RequestMetaData::new(service.into(), method.into()),
            params,
        }
    }

    pub fn activity_id(&self) -> ActivityId {
        self.id
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerErrorKind {
    /// Nobody collected the request before the queue timeout.
    RequestNotCollected,
    /// The request left the queue but no response arrived in time. The work
    /// may have partially executed.
    CollectedButNoResponse,
    /// The node processing the request stopped sending heartbeats.
    PeerDisconnected,
    /// The worker itself reported a failure.
    RemoteFailure,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ServerError {
    pub kind: ServerErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ServerError {
    pub fn new<S: Into<String>>(kind: ServerErrorKind, message: S) -> Self {
        ServerError {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details<S: Into<String>>(mut self, details: S) -> Self {
        self.details = Some(details.into());
        self
    }

    /// True for errors produced locally by a timeout or a lost peer rather
    /// than reported by the worker.
    pub fn is_synthesized(&self) -> bool {
        self.kind != ServerErrorKind::RemoteFailure
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ResponseMessage {
    pub id: ActivityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ServerError>,
}

impl ResponseMessage {
    pub fn ok(id: ActivityId, result: Value) -> ResponseMessage {
        ResponseMessage {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn from_error(id: ActivityId, error: ServerError) -> ResponseMessage {
        ResponseMessage {
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn not_collected(request: &RequestMessage, waited_ms: u128) -> Self {
        let msg = format!(
            "request {} to {} was not collected by a worker within {}ms",
            request.id, request.endpoint, waited_ms
        );
        ResponseMessage::from_error(
            request.id,
            ServerError::new(ServerErrorKind::RequestNotCollected, msg),
        )
    }

    pub fn collected_without_response(
        request: &RequestMessage,
        waited_ms: u128,
    ) -> Self {
        let msg = format!(
            "request {} to {} was collected but no response arrived within \
             {}ms; the request may have partially executed",
            request.id, request.endpoint, waited_ms
        );
        ResponseMessage::from_error(
            request.id,
            ServerError::new(ServerErrorKind::CollectedButNoResponse, msg),
        )
    }

    pub fn peer_disconnected(
        request: &RequestMessage,
        silent_ms: u128,
    ) -> Self {
        let msg = format!(
            "the node processing request {} to {} sent no heartbeat for {}ms \
             and may have disconnected",
            request.id, request.endpoint, silent_ms
        );
        ResponseMessage::from_error(
            request.id,
            ServerError::new(ServerErrorKind::PeerDisconnected, msg),
        )
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error_kind(&self) -> Option<ServerErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// The envelope written to the store for both requests and responses.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub request_id: ActivityId,
    pub payload_json: String,
}

impl StoredMessage {
    pub fn encode(&self) -> Result<String, QueueError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<StoredMessage, QueueError> {
        serde_json::from_str(raw).map_err(|e| {
            QueueError::InvalidPayload(format!(
                "failed to parse stored message as JSON: {}",
                e
            ))
        })
    }
}

/// Turns messages into payload strings and back.
///
/// Implementations own any stream rehydration their payloads need; the queue
/// only moves the strings.
pub trait MessageSerializer: Send + Sync {
    fn prepare_request(
        &self,
        request: &RequestMessage,
    ) -> Result<String, QueueError>;

    fn read_request(&self, payload: &str) -> Result<RequestMessage, QueueError>;

    fn prepare_response(
        &self,
        response: &ResponseMessage,
    ) -> Result<String, QueueError>;

    fn read_response(
        &self,
        payload: &str,
    ) -> Result<ResponseMessage, QueueError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JsonMessageSerializer;

impl MessageSerializer for JsonMessageSerializer {
    fn prepare_request(
        &self,
        request: &RequestMessage,
    ) -> Result<String, QueueError> {
        Ok(serde_json::to_string(request)?)
    }

    fn read_request(&self, payload: &str) -> Result<RequestMessage, QueueError> {
        serde_json::from_str(payload).map_err(|e| {
            QueueError::InvalidPayload(format!(
                "failed to parse request payload: {}",
                e
            ))
        })
    }

    fn prepare_response(
        &self,
        response: &ResponseMessage,
    ) -> Result<String, QueueError> {
        Ok(serde_json::to_string(response)?)
    }

    fn read_response(
        &self,
        payload: &str,
    ) -> Result<ResponseMessage, QueueError> {
        serde_json::from_str(payload).map_err(|e| {
            QueueError::InvalidPayload(format!(
                "failed to parse response payload: {}",
                e
            ))
        })
    }
}
