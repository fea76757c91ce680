// Copyright 2020 Joyent, Inc.

use crate::protocol::{ActivityId, Endpoint, HeartbeatRole};

/// Builds every key and channel name under one namespace prefix.
#[derive(Clone, Debug)]
pub struct KeySpace {
    namespace: String,
}

/// Field under which a request payload is stored inside its hash.
pub const REQUEST_FIELD: &str = "request";

impl KeySpace {
    pub fn new<S: Into<String>>(namespace: S) -> KeySpace {
        KeySpace {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn key(&self, parts: &[&str]) -> String {
        let mut key = self.namespace.clone();
        for part in parts {
            key.push_str("::");
            key.push_str(part);
        }
        key
    }

    pub fn request_pulse_channel(&self, endpoint: &Endpoint) -> String {
        self.key(&["requestpulse", endpoint.as_str()])
    }

    pub fn request_ids(&self, endpoint: &Endpoint) -> String {
        self.key(&["requestids", endpoint.as_str()])
    }

    pub fn request(&self, endpoint: &Endpoint, id: ActivityId) -> String {
        self.key(&["request", endpoint.as_str(), &id.to_string()])
    }

    pub fn response(&self, id: ActivityId) -> String {
        self.key(&["response", &id.to_string()])
    }

    pub fn response_channel(&self, id: ActivityId) -> String {
        self.key(&["responseavail", &id.to_string()])
    }

    pub fn cancelled(&self, endpoint: &Endpoint, id: ActivityId) -> String {
        self.key(&["cancelled", endpoint.as_str(), &id.to_string()])
    }

    pub fn cancellation_channel(
        &self,
        endpoint: &Endpoint,
        id: ActivityId,
    ) -> String {
        self.key(&["cancelpulse", endpoint.as_str(), &id.to_string()])
    }

    pub fn heartbeat_channel(
        &self,
        endpoint: &Endpoint,
        id: ActivityId,
        role: HeartbeatRole,
    ) -> String {
        self.key(&["heartbeat", endpoint.as_str(), &id.to_string(), role.as_str()])
    }

    pub fn canary(&self, guid: &str) -> String {
        self.key(&["canary", guid])
    }
}
