//! Per-key idempotency state as persisted in a [`RecordStore`](crate::store::RecordStore).

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Response headers that describe the transfer rather than the result.
/// They are recomputed on replay and never stored.
const UNREPLAYABLE_HEADERS: &[&str] = &["content-length", "transfer-encoding", "connection", "date"];

/// One record per idempotency key.
///
/// `fingerprint` goes from empty to set exactly once and `completed` goes
/// from false to true exactly once; neither is ever reverted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default)]
    pub completed: bool,
    pub status: Option<u16>,
    #[serde(default, with = "base64_body")]
    pub body: Option<Vec<u8>>,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// A fresh record with no fingerprint, living for `ttl` from now.
    pub fn new(ttl: Duration) -> Self {
        let created_at = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(300));
        Self {
            fingerprint: String::new(),
            completed: false,
            status: None,
            body: None,
            headers: Vec::new(),
            created_at,
            expires_at: created_at + ttl,
        }
    }

    /// True until the first request for this key has stamped its fingerprint.
    pub fn is_fresh(&self) -> bool {
        self.fingerprint.is_empty()
    }

    /// Time left before the record expires, never less than one second so
    /// a write near the deadline still lands with a positive TTL.
    pub fn remaining_ttl(&self) -> Duration {
        (self.expires_at - Utc::now())
            .to_std()
            .unwrap_or_default()
            .max(Duration::from_secs(1))
    }

    /// Mark the original request as finished and store its outcome.
    pub fn complete(&mut self, response: CachedResponse) {
        self.completed = true;
        self.status = Some(response.status);
        self.body = if response.body.is_empty() {
            None
        } else {
            Some(response.body)
        };
        self.headers = response.headers;
    }

    /// The stored outcome, available once the record is completed.
    pub fn cached_response(&self) -> Option<CachedResponse> {
        if !self.completed {
            return None;
        }
        Some(CachedResponse {
            status: self.status?,
            headers: self.headers.clone(),
            body: self.body.clone().unwrap_or_default(),
        })
    }
}

/// A handler outcome captured for replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CachedResponse {
    /// Capture a response, keeping only headers that make sense to replay.
    pub fn capture(status: u16, headers: &axum::http::HeaderMap, body: Vec<u8>) -> Self {
        let headers = headers
            .iter()
            .filter(|(name, _)| !UNREPLAYABLE_HEADERS.contains(&name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        Self {
            status,
            headers,
            body,
        }
    }
}

/// Bodies are stored as base64 so JSON-backed stores keep them compact.
mod base64_body {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match body {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
