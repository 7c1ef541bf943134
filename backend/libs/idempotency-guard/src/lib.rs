//! # Idempotency Guard
//!
//! Atomic check-and-record of client-supplied idempotency keys in front of a
//! write path.
//!
//! ## Lifecycle
//!
//! ```text
//! reserve ──► (write succeeds) ──► commit   key kept for the completed TTL
//!    │
//!    └──────► (write fails)    ──► release  key deleted, a retry may proceed
//! ```
//!
//! A reservation starts with a short *pending* TTL. If the process dies
//! between `reserve` and `commit`/`release`, the key frees itself once that
//! TTL elapses instead of blocking the client for a day. Only `commit` makes
//! it sticky.
//!
//! Of any number of concurrent callers presenting the same key, exactly one
//! observes `already_reserved == false`. The store's conditional insert
//! (`SET NX` on Redis, a mutex-held map in memory) provides the atomicity.
//!
//! Each reservation stores a random owner token. `commit` and `release` are
//! compare-and-swap on that token, so a caller whose reservation lapsed can
//! never overwrite or delete a later caller's. While [`IdempotencyGuard::run_once`]
//! waits on the write it refreshes the pending TTL every third of its length,
//! so a live write keeps its key however long it takes.
//!
//! ## Usage
//!
//! ```ignore
//! use idempotency_guard::{Guarded, IdempotencyGuard, RedisIdempotencyStore};
//! use std::sync::Arc;
//!
//! # async fn example(conn: redis::aio::ConnectionManager) -> anyhow::Result<()> {
//! let guard = IdempotencyGuard::new(Arc::new(RedisIdempotencyStore::new(conn)));
//!
//! match guard.run_once("user-1:req-42", || async { send().await }).await? {
//!     Guarded::Completed(id) => println!("sent {id}"),
//!     Guarded::Duplicate => println!("already sent"),
//! }
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

mod error;
mod memory;
mod redis_store;

pub use error::{IdempotencyError, IdempotencyResult};
pub use memory::InMemoryIdempotencyStore;
pub use redis_store::RedisIdempotencyStore;

/// Longest accepted key, before the prefix is applied.
pub const MAX_KEY_LEN: usize = 255;

const PENDING_MARKER: &str = "pending";
const COMPLETED_MARKER: &str = "completed";

fn marker(state: &str, token: &str) -> String {
    format!("{state}:{token}")
}

/// Key-value backend for the guard.
///
/// Every method must be atomic with respect to concurrent callers on the
/// same key.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Create `key` with `value` unless it exists. Returns `true` if this call created it.
    async fn put_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> IdempotencyResult<bool>;

    /// Set `key` to `value` with a fresh `ttl` only if it currently holds
    /// `expected`. Returns `false` if the key expired or belongs to someone else.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: &str,
        ttl: Duration,
    ) -> IdempotencyResult<bool>;

    /// Delete `key` only if it currently holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> IdempotencyResult<bool>;
}

/// Outcome of [`IdempotencyGuard::reserve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// `true` when another caller holds (or completed) this key; the caller
    /// must not mutate state.
    pub already_reserved: bool,
    token: String,
}

impl Reservation {
    /// Owner token stored with the key. Only meaningful when this caller won.
    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Outcome of [`IdempotencyGuard::run_once`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guarded<T> {
    /// The guarded operation ran and succeeded; the key is now sticky.
    Completed(T),
    /// The key was already reserved; the operation did not run.
    Duplicate,
}

pub struct IdempotencyGuard<S: IdempotencyStore> {
    store: Arc<S>,
    key_prefix: String,
    pending_ttl: Duration,
    completed_ttl: Duration,
}

impl<S: IdempotencyStore> Clone for IdempotencyGuard<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            key_prefix: self.key_prefix.clone(),
            pending_ttl: self.pending_ttl,
            completed_ttl: self.completed_ttl,
        }
    }
}

impl<S: IdempotencyStore> IdempotencyGuard<S> {
    pub const DEFAULT_PREFIX: &'static str = "idempotency:";
    pub const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(30);
    pub const DEFAULT_COMPLETED_TTL: Duration = Duration::from_secs(24 * 60 * 60);

    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            key_prefix: Self::DEFAULT_PREFIX.to_string(),
            pending_ttl: Self::DEFAULT_PENDING_TTL,
            completed_ttl: Self::DEFAULT_COMPLETED_TTL,
        }
    }

    pub fn with_ttls(mut self, pending_ttl: Duration, completed_ttl: Duration) -> Self {
        self.pending_ttl = pending_ttl;
        self.completed_ttl = completed_ttl;
        self
    }

    pub fn with_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = key_prefix.into();
        self
    }

    /// A guard whose keys live under `<prefix><scope>:`, so equal client keys
    /// from different callers never collide. Key validation still applies to
    /// the unscoped key.
    pub fn scoped(&self, scope: impl std::fmt::Display) -> Self {
        let mut guard = self.clone();
        guard.key_prefix = format!("{}{}:", self.key_prefix, scope);
        guard
    }

    pub fn pending_ttl(&self) -> Duration {
        self.pending_ttl
    }

    pub fn completed_ttl(&self) -> Duration {
        self.completed_ttl
    }

    /// Reject keys that are empty or longer than [`MAX_KEY_LEN`].
    pub fn validate_key(key: &str) -> IdempotencyResult<()> {
        if key.is_empty() {
            return Err(IdempotencyError::InvalidKey(
                "idempotency key cannot be empty".to_string(),
            ));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(IdempotencyError::InvalidKey(format!(
                "idempotency key exceeds {MAX_KEY_LEN} bytes (got {})",
                key.len()
            )));
        }
        Ok(())
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// Atomically reserve `key` for `ttl`.
    pub async fn reserve(&self, key: &str, ttl: Duration) -> IdempotencyResult<Reservation> {
        Self::validate_key(key)?;

        let token = Uuid::new_v4().simple().to_string();
        let created = self
            .store
            .put_if_absent(&self.storage_key(key), &marker(PENDING_MARKER, &token), ttl)
            .await?;

        if created {
            debug!(idempotency_key = %key, "Idempotency key reserved");
        } else {
            debug!(idempotency_key = %key, "Idempotency key already reserved");
        }

        Ok(Reservation {
            already_reserved: !created,
            token,
        })
    }

    /// Make `reservation` sticky for the completed TTL.
    ///
    /// If the pending reservation already expired and nobody else took the
    /// key, it is recreated so later duplicates are still rejected. A key now
    /// held by another caller is left untouched.
    pub async fn commit(&self, key: &str, reservation: &Reservation) -> IdempotencyResult<()> {
        let storage_key = self.storage_key(key);
        let completed = marker(COMPLETED_MARKER, &reservation.token);
        let swapped = self
            .store
            .compare_and_set(
                &storage_key,
                &marker(PENDING_MARKER, &reservation.token),
                &completed,
                self.completed_ttl,
            )
            .await?;
        if swapped {
            return Ok(());
        }

        let recreated = self
            .store
            .put_if_absent(&storage_key, &completed, self.completed_ttl)
            .await?;
        if recreated {
            warn!(idempotency_key = %key, "Reservation expired before commit; re-recorded");
        } else {
            warn!(idempotency_key = %key, "Reservation lost to another caller before commit");
        }
        Ok(())
    }

    /// Drop `reservation` so a retry with the same key can proceed. Returns
    /// `false` when the key no longer belongs to this reservation.
    pub async fn release(&self, key: &str, reservation: &Reservation) -> IdempotencyResult<bool> {
        let released = self
            .store
            .compare_and_delete(
                &self.storage_key(key),
                &marker(PENDING_MARKER, &reservation.token),
            )
            .await?;
        if released {
            debug!(idempotency_key = %key, "Idempotency key released");
        } else {
            debug!(idempotency_key = %key, "Reservation no longer held; nothing to release");
        }
        Ok(released)
    }

    /// Push the pending TTL of a held reservation forward. Returns `false`
    /// when the reservation was lost.
    pub async fn refresh(&self, key: &str, reservation: &Reservation) -> IdempotencyResult<bool> {
        let pending = marker(PENDING_MARKER, &reservation.token);
        self.store
            .compare_and_set(&self.storage_key(key), &pending, &pending, self.pending_ttl)
            .await
    }

    fn refresh_period(&self) -> Duration {
        (self.pending_ttl / 3).max(Duration::from_millis(1))
    }

    /// Reserve `key`, run `operation`, then commit on success or release on failure.
    ///
    /// The reservation is refreshed while `operation` runs. Failures to
    /// refresh, commit or release are logged rather than returned: the
    /// operation's own outcome is what the caller needs.
    pub async fn run_once<T, E, F, Fut>(&self, key: &str, operation: F) -> Result<Guarded<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<IdempotencyError>,
    {
        let reservation = self.reserve(key, self.pending_ttl).await?;
        if reservation.already_reserved {
            return Ok(Guarded::Duplicate);
        }

        let period = self.refresh_period();
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let operation = operation();
        tokio::pin!(operation);

        let outcome = loop {
            tokio::select! {
                result = &mut operation => break result,
                _ = heartbeat.tick() => match self.refresh(key, &reservation).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(idempotency_key = %key, "Reservation lost while write in flight");
                    }
                    Err(e) => {
                        warn!(idempotency_key = %key, error = %e, "Failed to refresh idempotency key");
                    }
                },
            }
        };

        match outcome {
            Ok(value) => {
                if let Err(e) = self.commit(key, &reservation).await {
                    warn!(idempotency_key = %key, error = %e, "Failed to commit idempotency key");
                }
                Ok(Guarded::Completed(value))
            }
            Err(err) => {
                if let Err(e) = self.release(key, &reservation).await {
                    warn!(idempotency_key = %key, error = %e, "Failed to release idempotency key");
                }
                Err(err)
            }
        }
    }
}
