use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderName};
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::metrics::Metrics;

pub static X_CACHE_HIT: HeaderName = HeaderName::from_static("x-cache-hit");

/// Client-requested cache behavior, taken from the inbound
/// `Cache-Control` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Serve from cache when possible (default).
    Public,
    /// Drop any stored entry, fetch fresh, store the result.
    NoCache,
    /// Bypass the cache entirely for this request.
    NoStore,
}

impl CachePolicy {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let Some(value) = headers
            .get(header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
        else {
            return CachePolicy::Public;
        };
        let value = value.to_ascii_lowercase();
        if value.contains("no-store") {
            CachePolicy::NoStore
        } else if value.contains("no-cache") {
            CachePolicy::NoCache
        } else {
            CachePolicy::Public
        }
    }
}

/// Per-operation time-to-live override.
#[derive(Debug, Clone, Copy)]
pub enum CacheTtl {
    /// Use the configured default.
    Default,
    Seconds(u64),
    /// The operation opts out of caching altogether.
    Disabled,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    value: Value,
    stored_at: DateTime<Utc>,
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), AppError>;
    async fn delete(&self, key: &str) -> Result<(), AppError>;
    /// Time left before the entry expires, if the backend tracks it.
    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, AppError>;
}

/// Redis-backed store. Keys are namespaced under `omniapi:` so a shared
/// instance stays inspectable.
pub struct RedisBackend {
    client: redis::Client,
}

impl RedisBackend {
    pub fn connect(uri: &str) -> Result<Self, AppError> {
        let client = redis::Client::open(uri)
            .map_err(|e| AppError::Uncaught(anyhow::anyhow!("invalid redis uri: {e}")))?;
        Ok(Self { client })
    }

    fn full_key(key: &str) -> String {
        format!("omniapi:endpoint:{key}")
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, AppError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| AppError::Uncaught(anyhow::anyhow!("redis connection failed: {e}")))
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let mut conn = self.connection().await?;
        let data: Option<String> = conn
            .get(Self::full_key(key))
            .await
            .map_err(|e| AppError::Uncaught(anyhow::anyhow!("redis get failed: {e}")))?;
        Ok(data)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), AppError> {
        let mut conn = self.connection().await?;
        conn.set_ex::<_, _, ()>(Self::full_key(key), value, ttl.as_secs())
            .await
            .map_err(|e| AppError::Uncaught(anyhow::anyhow!("redis setex failed: {e}")))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(Self::full_key(key))
            .await
            .map_err(|e| AppError::Uncaught(anyhow::anyhow!("redis del failed: {e}")))?;
        Ok(())
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, AppError> {
        let mut conn = self.connection().await?;
        let ttl: i64 = conn
            .ttl(Self::full_key(key))
            .await
            .map_err(|e| AppError::Uncaught(anyhow::anyhow!("redis ttl failed: {e}")))?;
        if ttl >= 0 {
            Ok(Some(Duration::from_secs(ttl as u64)))
        } else {
            Ok(None)
        }
    }
}

struct MemoryEntry {
    value: String,
    expires_at: DateTime<Utc>,
}

/// In-process store for single-instance deployments and tests. Expired
/// entries are dropped lazily on access.
#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, MemoryEntry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.expires_at > Utc::now() => {
                    return Ok(Some(entry.value.clone()))
                }
                Some(_) => {}
                None => return Ok(None),
            }
        }
        self.entries.write().await.remove(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), AppError> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl)
                .map_err(|e| AppError::Uncaught(anyhow::anyhow!("ttl out of range: {e}")))?;
        self.entries
            .write()
            .await
            .insert(key.to_string(), MemoryEntry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, AppError> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(entry) => {
                let left = (entry.expires_at - Utc::now()).num_seconds();
                if left > 0 {
                    Ok(Some(Duration::from_secs(left as u64)))
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }
}

/// Serializes a value with object keys sorted at every level, so the
/// cache key is stable regardless of how an argument struct orders its
/// fields.
pub fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::to_string(key).unwrap_or_default());
                    out.push(':');
                    write(&map[key.as_str()], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }
    let mut out = String::new();
    write(value, &mut out);
    out
}

/// Result of running an operation through the cache. Carries the hit
/// marker and freshness window so the handler can surface them as
/// response headers.
#[derive(Debug)]
pub struct CacheOutcome {
    pub value: Value,
    /// Cache key, set only when the value came out of the cache.
    pub hit: Option<String>,
    /// Freshness window in seconds, advertised on hits and fresh stores.
    pub max_age: Option<u64>,
}

impl CacheOutcome {
    fn passthrough(value: Value) -> Self {
        Self {
            value,
            hit: None,
            max_age: None,
        }
    }
}

impl IntoResponse for CacheOutcome {
    fn into_response(self) -> Response {
        let mut response = Json(self.value).into_response();
        if let Some(key) = self.hit {
            if let Ok(value) = key.parse() {
                response.headers_mut().insert(X_CACHE_HIT.clone(), value);
            }
        }
        if let Some(max_age) = self.max_age {
            if let Ok(value) = format!("max-age={max_age}").parse() {
                response.headers_mut().insert(header::CACHE_CONTROL, value);
            }
        }
        response
    }
}

/// Read-through cache sitting in front of upstream operations.
pub struct Cache {
    backend: Arc<dyn CacheBackend>,
    enabled: bool,
    default_ttl: Duration,
    metrics: Metrics,
}

impl Cache {
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        enabled: bool,
        default_ttl: Duration,
        metrics: Metrics,
    ) -> Self {
        Self {
            backend,
            enabled,
            default_ttl,
            metrics,
        }
    }

    fn cache_key<A: Serialize>(op: &str, args: &A) -> Result<String, AppError> {
        let value = serde_json::to_value(args)
            .map_err(|e| AppError::Uncaught(anyhow::anyhow!("unserializable cache args: {e}")))?;
        let digest = Md5::digest(canonical_json(&value).as_bytes());
        Ok(format!("{op}:{}", hex::encode(digest)))
    }

    /// Runs `f` through the cache. Only successful results are written
    /// back, so a failure never poisons the key.
    pub async fn cached<A, F, Fut>(
        &self,
        op: &str,
        ttl: CacheTtl,
        policy: CachePolicy,
        args: &A,
        f: F,
    ) -> Result<CacheOutcome, AppError>
    where
        A: Serialize,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Value, AppError>>,
    {
        let ttl = match ttl {
            CacheTtl::Default => self.default_ttl,
            CacheTtl::Seconds(secs) => Duration::from_secs(secs),
            CacheTtl::Disabled => return Ok(CacheOutcome::passthrough(f().await?)),
        };
        if !self.enabled || policy == CachePolicy::NoStore {
            return Ok(CacheOutcome::passthrough(f().await?));
        }

        let key = Self::cache_key(op, args)?;
        if policy == CachePolicy::NoCache {
            self.backend.delete(&key).await?;
        } else if let Some(raw) = self.backend.get(&key).await? {
            match serde_json::from_str::<CacheEntry>(&raw) {
                Ok(entry) => {
                    self.metrics.record_cache_hit();
                    debug!(op, key = %key, "cache hit");
                    let max_age = match self.backend.remaining_ttl(&key).await? {
                        Some(left) => left.as_secs(),
                        None => ttl.as_secs(),
                    };
                    return Ok(CacheOutcome {
                        value: entry.value,
                        hit: Some(key),
                        max_age: Some(max_age),
                    });
                }
                Err(e) => {
                    warn!(op, key = %key, error = %e, "dropping undecodable cache entry");
                    self.backend.delete(&key).await?;
                }
            }
        }

        self.metrics.record_cache_miss();
        let value = f().await?;
        let entry = CacheEntry {
            value,
            stored_at: Utc::now(),
        };
        let raw = serde_json::to_string(&entry)
            .map_err(|e| AppError::Uncaught(anyhow::anyhow!("unserializable cache entry: {e}")))?;
        self.backend.set(&key, raw, ttl).await?;
        self.metrics.record_cache_store();
        debug!(op, key = %key, ttl_secs = ttl.as_secs(), "cache store");
        Ok(CacheOutcome {
            value: entry.value,
            hit: None,
            max_age: Some(ttl.as_secs()),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;

    use super::*;

    fn test_cache() -> Cache {
        Cache::new(
            Arc::new(MemoryBackend::new()),
            true,
            Duration::from_secs(60),
            Metrics::new().unwrap(),
        )
    }

    #[tokio::test]
    async fn second_read_is_served_from_cache() {
        let cache = test_cache();
        let calls = Arc::new(AtomicU32::new(0));
        let args = json!({"aid": 2});

        for round in 0..2 {
            let calls = calls.clone();
            let outcome = cache
                .cached(
                    "bilibili:view",
                    CacheTtl::Default,
                    CachePolicy::Public,
                    &args,
                    || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(json!({"title": "ok"}))
                    },
                )
                .await
                .unwrap();
            assert_eq!(outcome.value, json!({"title": "ok"}));
            assert_eq!(outcome.hit.is_some(), round == 1);
            // the freshness window is advertised on the store and the hit
            assert!(outcome.max_age.is_some());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_store_bypasses_the_cache() {
        let cache = test_cache();
        let calls = Arc::new(AtomicU32::new(0));
        let args = json!({"kw": "rust"});

        for _ in 0..2 {
            let calls = calls.clone();
            let outcome = cache
                .cached(
                    "tieba:post_list",
                    CacheTtl::Default,
                    CachePolicy::NoStore,
                    &args,
                    || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(json!(1))
                    },
                )
                .await
                .unwrap();
            assert_eq!(outcome.hit, None);
            assert_eq!(outcome.max_age, None);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn no_cache_refetches_and_overwrites() {
        let cache = test_cache();
        let args = json!({"id": 7});

        cache
            .cached("op", CacheTtl::Default, CachePolicy::Public, &args, || async {
                Ok(json!("stale"))
            })
            .await
            .unwrap();

        let fresh = cache
            .cached("op", CacheTtl::Default, CachePolicy::NoCache, &args, || async {
                Ok(json!("fresh"))
            })
            .await
            .unwrap();
        assert_eq!(fresh.value, json!("fresh"));
        assert!(fresh.hit.is_none());
        assert_eq!(fresh.max_age, Some(60));

        let hit = cache
            .cached("op", CacheTtl::Default, CachePolicy::Public, &args, || async {
                Ok(json!("never"))
            })
            .await
            .unwrap();
        assert_eq!(hit.value, json!("fresh"));
        assert!(hit.hit.is_some());
    }

    #[tokio::test]
    async fn failures_are_not_stored() {
        let cache = test_cache();
        let args = json!({"id": 1});

        let err = cache
            .cached("op", CacheTtl::Default, CachePolicy::Public, &args, || async {
                Err(AppError::upstream("boom".to_string()))
            })
            .await;
        assert!(err.is_err());

        let outcome = cache
            .cached("op", CacheTtl::Default, CachePolicy::Public, &args, || async {
                Ok(json!("recovered"))
            })
            .await
            .unwrap();
        assert_eq!(outcome.value, json!("recovered"));
        assert!(outcome.hit.is_none());
    }

    #[tokio::test]
    async fn disabled_ttl_always_calls_through() {
        let cache = test_cache();
        let calls = Arc::new(AtomicU32::new(0));
        let args = json!({"url": "https://example.com/a.png"});

        for _ in 0..2 {
            let calls = calls.clone();
            let outcome = cache
                .cached(
                    "sauce:search",
                    CacheTtl::Disabled,
                    CachePolicy::Public,
                    &args,
                    || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(json!(null))
                    },
                )
                .await
                .unwrap();
            assert_eq!(outcome.hit, None);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn memory_backend_expires_entries() {
        let backend = MemoryBackend::new();
        backend
            .set("k", "v".to_string(), Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some("v".to_string()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert_eq!(backend.remaining_ttl("k").await.unwrap(), None);
    }

    #[test]
    fn canonical_json_sorts_keys_at_every_level() {
        let value = json!({"b": {"y": 1, "x": [2, {"q": 3, "p": 4}]}, "a": true});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":true,"b":{"x":[2,{"p":4,"q":3}],"y":1}}"#
        );
    }

    #[test]
    fn cache_key_is_stable_for_equal_args() {
        #[derive(Serialize)]
        struct A {
            kw: String,
            page: u32,
        }
        #[derive(Serialize)]
        struct B {
            page: u32,
            kw: String,
        }
        let a = Cache::cache_key("op", &A { kw: "rust".into(), page: 1 }).unwrap();
        let b = Cache::cache_key("op", &B { page: 1, kw: "rust".into() }).unwrap();
        assert_eq!(a, b);
        assert_ne!(
            a,
            Cache::cache_key("other", &A { kw: "rust".into(), page: 1 }).unwrap()
        );
    }

    #[test]
    fn cache_control_header_selects_policy() {
        let mut headers = HeaderMap::new();
        assert_eq!(CachePolicy::from_headers(&headers), CachePolicy::Public);
        headers.insert(header::CACHE_CONTROL, "no-cache".parse().unwrap());
        assert_eq!(CachePolicy::from_headers(&headers), CachePolicy::NoCache);
        headers.insert(header::CACHE_CONTROL, "No-Store".parse().unwrap());
        assert_eq!(CachePolicy::from_headers(&headers), CachePolicy::NoStore);
        headers.insert(header::CACHE_CONTROL, "max-age=0".parse().unwrap());
        assert_eq!(CachePolicy::from_headers(&headers), CachePolicy::Public);
    }
}
