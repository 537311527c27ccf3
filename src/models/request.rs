use std::time::Duration;

use axum::http::{HeaderMap, Method};
use serde_json::Value;

/// One logical argument of a request that may take part in fingerprinting.
#[derive(Debug, Clone, PartialEq)]
pub struct BodyArgument {
    pub name: String,
    pub value: Value,
    /// Top-level field names removed before hashing.
    pub excludes: Vec<String>,
    /// When set, the argument does not take part in fingerprinting at all.
    pub ignore: bool,
}

impl BodyArgument {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            excludes: Vec::new(),
            ignore: false,
        }
    }

    pub fn excluding<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excludes.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn ignored(mut self, ignore: bool) -> Self {
        self.ignore = ignore;
        self
    }
}

/// Everything the decision engine needs to classify one request.
#[derive(Debug, Clone)]
pub struct IdempotentRequest {
    /// Value of the idempotency header; empty when the client sent none.
    pub key: String,
    pub method: Method,
    pub headers: HeaderMap,
    pub arguments: Vec<BodyArgument>,
    /// Route-level TTL override for a newly created record.
    pub ttl: Option<Duration>,
}

impl IdempotentRequest {
    pub fn new(key: impl Into<String>, method: Method) -> Self {
        Self {
            key: key.into(),
            method,
            headers: HeaderMap::new(),
            arguments: Vec::new(),
            ttl: None,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_argument(mut self, argument: BodyArgument) -> Self {
        self.arguments.push(argument);
        self
    }

    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Per-route idempotency settings, declared when the adapter is attached.
#[derive(Debug, Clone, Default)]
pub struct RouteDescriptor {
    /// Route label used in logs.
    pub name: String,
    /// Body fields left out of the fingerprint. Comma-separated entries are split.
    pub excludes: Vec<String>,
    /// Leave the body out of the fingerprint entirely.
    pub ignore_body: bool,
    /// Record TTL for this route instead of the engine default.
    pub ttl: Option<Duration>,
}

impl RouteDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn exclude<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for field in fields {
            self.excludes.extend(
                field
                    .as_ref()
                    .split(',')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(String::from),
            );
        }
        self
    }

    pub fn ignore_body(mut self) -> Self {
        self.ignore_body = true;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}
