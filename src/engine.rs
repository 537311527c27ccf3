//! The idempotency decision engine.
//!
//! Classifies each request against the per-key record:
//!
//! ```text
//! method not eligible            -> NotApplicable
//! key empty                      -> HeaderMissing
//! lock(key); record = get_or_create(key)
//!   record fresh                 -> stamp fingerprint, persist, CacheMiss
//! unlock
//!   fingerprint differs          -> Reuse
//!   not completed                -> Retried
//!   completed                    -> CacheHit(stored response)
//! ```
//!
//! After a `CacheMiss` the caller runs its handler and reports the outcome
//! through [`DecisionEngine::complete`].

use std::time::Instant;

use axum::http::Method;

use crate::cache::IdempotencyCache;
use crate::config::IdempotencyOptions;
use crate::errors::AppError;
use crate::fingerprint::{Fingerprint, FingerprintBuilder};
use crate::lock::{KeyLockTable, LockHandle};
use crate::metrics::IdempotencyMetrics;
use crate::models::{CachedResponse, IdempotencyRecord, IdempotentRequest};
use crate::sanitize::sanitize_key;
use crate::store::StoreError;

/// How the caller should treat one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Method is not subject to idempotency; run the handler untouched.
    NotApplicable,
    /// Eligible request without a key; reject before doing any work.
    HeaderMissing,
    /// First request for this key; run the handler, then `complete`.
    CacheMiss,
    /// Same request is in flight or never finished; reject as a conflict.
    Retried,
    /// Key reused with a different payload; reject, never cache.
    Reuse,
    /// Same request already finished; replay its response.
    CacheHit(CachedResponse),
}

impl Decision {
    /// Metric label.
    pub fn outcome(&self) -> &'static str {
        match self {
            Decision::NotApplicable => "not_applicable",
            Decision::HeaderMissing => "header_missing",
            Decision::CacheMiss => "cache_miss",
            Decision::Retried => "retried",
            Decision::Reuse => "reuse",
            Decision::CacheHit(_) => "cache_hit",
        }
    }

    /// Whether the caller should execute its handler.
    pub fn proceeds(&self) -> bool {
        matches!(self, Decision::NotApplicable | Decision::CacheMiss)
    }
}

pub struct DecisionEngine {
    cache: IdempotencyCache,
    locks: KeyLockTable,
    fingerprints: FingerprintBuilder,
    options: IdempotencyOptions,
    metrics: IdempotencyMetrics,
}

impl DecisionEngine {
    pub fn new(cache: IdempotencyCache, options: IdempotencyOptions) -> Self {
        Self {
            fingerprints: FingerprintBuilder::new(&options.include_headers),
            cache,
            locks: KeyLockTable::new(),
            options,
            metrics: IdempotencyMetrics::new(),
        }
    }

    /// Share a lock table with other engines over the same store.
    pub fn with_lock_table(mut self, locks: KeyLockTable) -> Self {
        self.locks = locks;
        self
    }

    pub fn options(&self) -> &IdempotencyOptions {
        &self.options
    }

    pub fn metrics(&self) -> &IdempotencyMetrics {
        &self.metrics
    }

    pub fn locks(&self) -> &KeyLockTable {
        &self.locks
    }

    pub fn cache(&self) -> &IdempotencyCache {
        &self.cache
    }

    pub fn is_eligible(&self, method: &Method) -> bool {
        self.options.methods.contains(method)
    }

    /// The decisions that need neither the body nor the store.
    pub fn precheck(&self, method: &Method, key: &str) -> Option<Decision> {
        if !self.is_eligible(method) {
            return Some(Decision::NotApplicable);
        }
        if !is_valid_key(key) {
            return Some(Decision::HeaderMissing);
        }
        None
    }

    pub fn fingerprint(&self, request: &IdempotentRequest) -> Fingerprint {
        self.fingerprints
            .build(&request.key, &request.headers, &request.arguments)
    }

    #[tracing::instrument(skip_all, fields(key = %sanitize_key(&request.key)))]
    pub async fn process(&self, request: &IdempotentRequest) -> Result<Decision, AppError> {
        if let Some(decision) = self.precheck(&request.method, &request.key) {
            if decision == Decision::HeaderMissing {
                tracing::info!("idempotency key header is missing");
            }
            self.metrics.record_decision(decision.outcome());
            return Ok(decision);
        }

        let fingerprint = self.fingerprint(request);

        let lock = self.lock(&request.key).await?;
        let mut record = self
            .cache
            .get_or_create(&request.key, request.ttl)
            .await
            .map_err(|e| self.store_failure(e))?;

        if record.is_fresh() {
            record.fingerprint = fingerprint.into_string();
            self.cache
                .set(&request.key, &record)
                .await
                .map_err(|e| self.store_failure(e))?;
            lock.release();

            tracing::info!("idempotency cache miss, proceeding to execute handler");
            self.metrics.record_decision(Decision::CacheMiss.outcome());
            return Ok(Decision::CacheMiss);
        }
        lock.release();

        // fingerprint and completed only move forward, so classifying a copy
        // outside the lock can at worst answer Retried for a just-completed key
        let decision = classify(&record, fingerprint.as_str());
        match &decision {
            Decision::Reuse => tracing::info!("idempotency key reused with different request data"),
            Decision::Retried => tracing::info!("retried request for outstanding idempotency key"),
            Decision::CacheHit(_) => tracing::info!("idempotency cache hit, replaying stored response"),
            _ => {}
        }
        self.metrics.record_decision(decision.outcome());
        Ok(decision)
    }

    /// Store the handler's outcome for a key that was a `CacheMiss`.
    ///
    /// `fingerprint` is the one of the request that got the `CacheMiss`. The
    /// outcome lands only on the record that request stamped: a record that
    /// expired meanwhile is not recreated, a newer request's record under the
    /// same key is left alone, and a completed record is left as is.
    #[tracing::instrument(skip_all, fields(key = %sanitize_key(key), status = response.status))]
    pub async fn complete(
        &self,
        key: &str,
        fingerprint: &Fingerprint,
        response: CachedResponse,
    ) -> Result<(), AppError> {
        let _lock = self.lock(key).await?;
        let Some(mut record) = self.cache.get(key).await.map_err(|e| self.store_failure(e))? else {
            tracing::warn!("idempotency record expired before completion, response not cached");
            return Ok(());
        };
        if record.fingerprint != fingerprint.as_str() {
            tracing::warn!("idempotency record was replaced by a newer request, response not cached");
            return Ok(());
        }
        if record.completed {
            tracing::debug!("idempotency record already completed");
            return Ok(());
        }

        record.complete(response);
        self.cache
            .set(key, &record)
            .await
            .map_err(|e| self.store_failure(e))?;
        tracing::debug!("idempotency record completed");
        Ok(())
    }

    async fn lock(&self, key: &str) -> Result<LockHandle, AppError> {
        let started = Instant::now();
        let handle = self
            .locks
            .acquire_timeout(key, self.options.lock_timeout)
            .await?;
        self.metrics.observe_lock_wait(started.elapsed());
        Ok(handle)
    }

    fn store_failure(&self, e: StoreError) -> AppError {
        self.metrics.record_store_error();
        tracing::error!(backend = self.cache.backend(), "idempotency store failure: {}", e);
        AppError::Store(e)
    }
}

/// Keys must be non-blank visible ASCII. Anything else could not be told
/// apart reliably once decoded, so it counts as no key at all.
fn is_valid_key(key: &str) -> bool {
    !key.trim().is_empty() && key.bytes().all(|b| (0x20..=0x7e).contains(&b))
}

/// Classify an existing record. The fingerprint alone separates `Reuse`
/// from `Retried`/`CacheHit`.
fn classify(record: &IdempotencyRecord, fingerprint: &str) -> Decision {
    if record.fingerprint != fingerprint {
        return Decision::Reuse;
    }
    match record.cached_response() {
        Some(response) => Decision::CacheHit(response),
        None => Decision::Retried,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::cache::DEFAULT_KEY_PREFIX;
    use crate::models::BodyArgument;
    use crate::store::{MemoryStore, RecordStore};

    fn engine_with(store: Arc<dyn RecordStore>, options: IdempotencyOptions) -> DecisionEngine {
        let cache = IdempotencyCache::new(store, DEFAULT_KEY_PREFIX, options.ttl);
        DecisionEngine::new(cache, options)
    }

    fn engine() -> DecisionEngine {
        engine_with(Arc::new(MemoryStore::default()), IdempotencyOptions::default())
    }

    fn post(key: &str, body: serde_json::Value) -> IdempotentRequest {
        IdempotentRequest::new(key, Method::POST).with_argument(BodyArgument::new("body", body))
    }

    fn created(body: &str) -> CachedResponse {
        CachedResponse {
            status: 201,
            headers: vec![("content-type".into(), "application/json".into())],
            body: body.as_bytes().to_vec(),
        }
    }

    struct FailingStore;

    #[async_trait]
    impl RecordStore for FailingStore {
        async fn get(&self, _key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
            Err(serde_json::from_str::<serde_json::Value>("{").unwrap_err().into())
        }

        async fn put(&self, _key: &str, _record: &IdempotencyRecord, _ttl: Duration) -> Result<(), StoreError> {
            Err(serde_json::from_str::<serde_json::Value>("{").unwrap_err().into())
        }

        fn backend(&self) -> &'static str {
            "failing"
        }
    }

    #[tokio::test]
    async fn test_get_is_not_applicable() {
        let engine = engine();
        let request = IdempotentRequest::new("k", Method::GET);
        assert_eq!(engine.process(&request).await.unwrap(), Decision::NotApplicable);
        assert!(engine.cache().get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_key_is_header_missing() {
        let engine = engine();
        let decision = engine.process(&post("", json!({"id": 1}))).await.unwrap();
        assert_eq!(decision, Decision::HeaderMissing);
        assert!(!decision.proceeds());

        let decision = engine.process(&post("   ", json!({"id": 1}))).await.unwrap();
        assert_eq!(decision, Decision::HeaderMissing);
    }

    #[tokio::test]
    async fn test_todo_lifecycle_miss_retried_hit() {
        let engine = engine();
        let request = post("k1", json!({"id": 1, "title": "Buy Milk"}));

        assert_eq!(engine.process(&request).await.unwrap(), Decision::CacheMiss);
        assert_eq!(engine.process(&request).await.unwrap(), Decision::Retried);

        engine
            .complete("k1", &engine.fingerprint(&request), created(r#"{"id":1,"title":"Buy Milk"}"#))
            .await
            .unwrap();

        match engine.process(&request).await.unwrap() {
            Decision::CacheHit(response) => {
                assert_eq!(response.status, 201);
                assert_eq!(response.body, br#"{"id":1,"title":"Buy Milk"}"#.to_vec());
            }
            other => panic!("expected CacheHit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_different_payload_after_completion_is_reuse() {
        let engine = engine();
        let first = post("k2", json!({"id": 1}));
        assert_eq!(engine.process(&first).await.unwrap(), Decision::CacheMiss);
        engine
            .complete("k2", &engine.fingerprint(&first), created(r#"{"id":1}"#))
            .await
            .unwrap();

        assert_eq!(engine.process(&post("k2", json!({"id": 2}))).await.unwrap(), Decision::Reuse);
    }

    #[tokio::test]
    async fn test_different_payload_while_in_flight_is_reuse() {
        let engine = engine();
        assert_eq!(engine.process(&post("k", json!({"id": 1}))).await.unwrap(), Decision::CacheMiss);
        assert_eq!(engine.process(&post("k", json!({"id": 2}))).await.unwrap(), Decision::Reuse);
    }

    #[tokio::test]
    async fn test_reuse_does_not_touch_record() {
        let engine = engine();
        engine.process(&post("k", json!({"id": 1}))).await.unwrap();
        let before = engine.cache().get("k").await.unwrap().unwrap();

        engine.process(&post("k", json!({"id": 2}))).await.unwrap();
        assert_eq!(engine.cache().get("k").await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn test_excluded_field_is_same_request() {
        let engine = engine();
        let request = |ts: &str| {
            IdempotentRequest::new("k", Method::POST).with_argument(
                BodyArgument::new("body", json!({"money": 100, "timestamp": ts})).excluding(["Timestamp"]),
            )
        };

        assert_eq!(engine.process(&request("t1")).await.unwrap(), Decision::CacheMiss);
        let fingerprint = engine.fingerprint(&request("t1"));
        engine.complete("k", &fingerprint, created("{}")).await.unwrap();
        assert!(matches!(engine.process(&request("t2")).await.unwrap(), Decision::CacheHit(_)));
    }

    #[tokio::test]
    async fn test_complete_keeps_first_outcome() {
        let engine = engine();
        let request = post("k", json!({}));
        let fingerprint = engine.fingerprint(&request);
        engine.process(&request).await.unwrap();
        engine.complete("k", &fingerprint, created("first")).await.unwrap();
        engine.complete("k", &fingerprint, created("second")).await.unwrap();

        let record = engine.cache().get("k").await.unwrap().unwrap();
        assert_eq!(record.body, Some(b"first".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_record_behaves_as_never_seen() {
        let options = IdempotencyOptions {
            ttl: Duration::from_secs(5),
            ..Default::default()
        };
        let engine = engine_with(Arc::new(MemoryStore::default()), options);

        let first = post("k", json!({"id": 1}));
        assert_eq!(engine.process(&first).await.unwrap(), Decision::CacheMiss);
        tokio::time::advance(Duration::from_secs(6)).await;

        // completion of the expired attempt is dropped
        engine
            .complete("k", &engine.fingerprint(&first), created("{}"))
            .await
            .unwrap();
        assert!(engine.cache().get("k").await.unwrap().is_none());

        assert_eq!(engine.process(&post("k", json!({"id": 2}))).await.unwrap(), Decision::CacheMiss);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_completion_does_not_land_on_newer_record() {
        let options = IdempotencyOptions {
            ttl: Duration::from_secs(5),
            ..Default::default()
        };
        let engine = engine_with(Arc::new(MemoryStore::default()), options);
        let alice = post("k", json!({"to": "alice"}));
        let bob = post("k", json!({"to": "bob"}));

        assert_eq!(engine.process(&alice).await.unwrap(), Decision::CacheMiss);
        // alice's handler outlives the record; bob takes the key over
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(engine.process(&bob).await.unwrap(), Decision::CacheMiss);

        engine
            .complete("k", &engine.fingerprint(&alice), created("alice-result"))
            .await
            .unwrap();
        assert_eq!(engine.process(&bob).await.unwrap(), Decision::Retried);

        engine
            .complete("k", &engine.fingerprint(&bob), created("bob-result"))
            .await
            .unwrap();
        match engine.process(&bob).await.unwrap() {
            Decision::CacheHit(response) => assert_eq!(response.body, b"bob-result".to_vec()),
            other => panic!("expected CacheHit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_ascii_key_is_header_missing() {
        let engine = engine();
        assert_eq!(engine.process(&post("k\u{e9}", json!({}))).await.unwrap(), Decision::HeaderMissing);
        assert_eq!(engine.process(&post("k\u{fffd}", json!({}))).await.unwrap(), Decision::HeaderMissing);
        assert_eq!(engine.process(&post("k\n1", json!({}))).await.unwrap(), Decision::HeaderMissing);
        assert_eq!(engine.process(&post("order 42", json!({}))).await.unwrap(), Decision::CacheMiss);
    }

    #[tokio::test]
    async fn test_store_failure_is_an_error_not_a_miss() {
        let engine = engine_with(Arc::new(FailingStore), IdempotencyOptions::default());
        let result = engine.process(&post("k", json!({"id": 1}))).await;
        assert!(matches!(result, Err(AppError::Store(_))));
        assert_eq!(engine.metrics().store_errors(), 1);
        assert_eq!(engine.metrics().decisions("cache_miss"), 0);
        assert_eq!(engine.locks().active_keys(), 0);
    }

    #[tokio::test]
    async fn test_lock_timeout_is_an_error() {
        let options = IdempotencyOptions {
            lock_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let engine = engine_with(Arc::new(MemoryStore::default()), options);
        let held = engine.locks().acquire("k").await;

        let result = engine.process(&post("k", json!({}))).await;
        assert!(matches!(result, Err(AppError::LockTimeout(_))));

        drop(held);
        assert_eq!(engine.locks().active_keys(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicates_exactly_one_miss() {
        let engine = Arc::new(engine());
        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    engine
                        .process(&post("same", json!({"id": 7})))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let decisions: Vec<Decision> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        let misses = decisions.iter().filter(|d| **d == Decision::CacheMiss).count();
        let retried = decisions.iter().filter(|d| **d == Decision::Retried).count();
        assert_eq!(misses, 1);
        assert_eq!(retried, 31);
        assert_eq!(engine.locks().active_keys(), 0);

        let fingerprint = engine.fingerprint(&post("same", json!({"id": 7})));
        engine.complete("same", &fingerprint, created("{}")).await.unwrap();
        assert!(matches!(
            engine.process(&post("same", json!({"id": 7}))).await.unwrap(),
            Decision::CacheHit(_)
        ));
    }

    #[tokio::test]
    async fn test_custom_methods() {
        let options = IdempotencyOptions {
            methods: vec![Method::PUT],
            ..Default::default()
        };
        let engine = engine_with(Arc::new(MemoryStore::default()), options);
        assert_eq!(engine.process(&post("k", json!({}))).await.unwrap(), Decision::NotApplicable);

        let put = IdempotentRequest::new("k", Method::PUT);
        assert_eq!(engine.process(&put).await.unwrap(), Decision::CacheMiss);
    }

    #[tokio::test]
    async fn test_metrics_count_outcomes() {
        let engine = engine();
        let request = post("k", json!({"id": 1}));
        engine.process(&request).await.unwrap();
        engine.process(&request).await.unwrap();
        engine.process(&post("", json!({}))).await.unwrap();

        assert_eq!(engine.metrics().decisions("cache_miss"), 1);
        assert_eq!(engine.metrics().decisions("retried"), 1);
        assert_eq!(engine.metrics().decisions("header_missing"), 1);
    }

    #[test]
    fn test_decision_proceeds() {
        assert!(Decision::CacheMiss.proceeds());
        assert!(Decision::NotApplicable.proceeds());
        assert!(!Decision::Retried.proceeds());
        assert!(!Decision::Reuse.proceeds());
        assert!(!Decision::CacheHit(created("{}")).proceeds());
    }
}
