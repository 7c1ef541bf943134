use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::{IdempotencyResult, IdempotencyStore};

/// Process-local store for tests and single-instance deployments.
///
/// Expiry follows `tokio::time`, so paused-clock tests can advance past a TTL.
#[derive(Clone, Default)]
pub struct InMemoryIdempotencyStore {
    entries: Arc<Mutex<HashMap<String, (String, Instant)>>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unexpired keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .expect("Mutex should not be poisoned")
            .values()
            .filter(|(_, expires_at)| *expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> IdempotencyResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("Mutex should not be poisoned");
        entries.retain(|_, (_, expires_at)| *expires_at > now);

        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(true)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> IdempotencyResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("Mutex should not be poisoned");
        match entries.get_mut(key) {
            Some(entry) if entry.1 > now && entry.0 == expected => {
                *entry = (value.to_string(), now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> IdempotencyResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("Mutex should not be poisoned");
        let owned = matches!(
            entries.get(key),
            Some((value, expires_at)) if *expires_at > now && value == expected
        );
        if owned {
            entries.remove(key);
        }
        Ok(owned)
    }
}
