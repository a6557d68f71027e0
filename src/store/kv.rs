//! Shared key-value abstraction.
//!
//! The rate limiter and token cache coordinate through a [`KvStore`] with
//! compare-and-set semantics so multiple gateway processes can share one
//! backend. [`MemoryKv`] is the single-process fallback used when no
//! external store is configured; it honors the same contract, including TTL
//! expiry and CAS.

use crate::error::Result;
#[cfg(test)]
use crate::error::GatewayError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[async_trait]
pub trait KvStore: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Unconditional write. `ttl = None` means the entry does not expire.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;

    /// Atomic compare-and-set. `expected = None` asserts absence. Returns
    /// false (without writing) when the current value does not match.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool>;

    /// Delete a key; returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    async fn health_check(&self) -> bool;
}

// ─── In-memory fallback ──────────────────────────────────────────────────────

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Map guarded by a lock, keyed by entry id. No await point ever holds the
/// lock.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expired(now) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.read(key))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let current = match entries.get(key) {
            Some(entry) if entry.expired(now) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.as_slice()),
            None => None,
        };
        if current != expected {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.lock().remove(key).is_some())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| !entry.expired(now));
        Ok(entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> bool {
        true
    }
}

/// A KV wrapper that fails every call, for exercising fail-open paths in
/// tests.
#[cfg(test)]
pub struct BrokenKv;

#[cfg(test)]
#[async_trait]
impl KvStore for BrokenKv {
    fn name(&self) -> &str {
        "broken"
    }

    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        Err(GatewayError::connection("kv backend unavailable"))
    }

    async fn set(&self, _key: &str, _value: &[u8], _ttl: Option<Duration>) -> Result<()> {
        Err(GatewayError::connection("kv backend unavailable"))
    }

    async fn compare_and_set(
        &self,
        _key: &str,
        _expected: Option<&[u8]>,
        _value: &[u8],
        _ttl: Option<Duration>,
    ) -> Result<bool> {
        Err(GatewayError::connection("kv backend unavailable"))
    }

    async fn delete(&self, _key: &str) -> Result<bool> {
        Err(GatewayError::connection("kv backend unavailable"))
    }

    async fn keys_with_prefix(&self, _prefix: &str) -> Result<Vec<String>> {
        Err(GatewayError::connection("kv backend unavailable"))
    }

    async fn health_check(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete_round_trip() {
        let kv = MemoryKv::new();
        kv.set("k", b"v", None).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert!(kv.delete("k").await.unwrap());
        assert_eq!(kv.get("k").await.unwrap(), None);
        assert!(!kv.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn ttl_expires_entries() {
        let kv = MemoryKv::new();
        kv.set("k", b"v", Some(Duration::from_millis(5)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn cas_asserts_absence_and_value() {
        let kv = MemoryKv::new();
        // Absence assertion succeeds once.
        assert!(kv.compare_and_set("k", None, b"a", None).await.unwrap());
        assert!(!kv.compare_and_set("k", None, b"b", None).await.unwrap());
        // Value assertion.
        assert!(kv
            .compare_and_set("k", Some(b"a"), b"b", None)
            .await
            .unwrap());
        assert!(!kv
            .compare_and_set("k", Some(b"a"), b"c", None)
            .await
            .unwrap());
        assert_eq!(kv.get("k").await.unwrap(), Some(b"b".to_vec()));
    }

    #[tokio::test]
    async fn prefix_scan_skips_expired() {
        let kv = MemoryKv::new();
        kv.set("oauth:u1:github", b"x", None).await.unwrap();
        kv.set("oauth:u1:gitlab", b"y", Some(Duration::from_millis(1)))
            .await
            .unwrap();
        kv.set("bucket:u1", b"z", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let mut keys = kv.keys_with_prefix("oauth:u1:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["oauth:u1:github"]);
    }
}
