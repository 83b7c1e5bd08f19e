//! Per-object locks
//!
//! A lock is an exclusive, time-bounded claim keyed by object id and owner.
//! Expired claims are re-acquirable, so a crashed holder cannot wedge an object.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::errors::{LiveError, LiveResult};
use crate::object::{Identity, ObjectId};

/// Initial pause between acquisition attempts
const POLL_START: Duration = Duration::from_millis(2);
/// Longest pause between acquisition attempts
const POLL_MAX: Duration = Duration::from_millis(50);

/// How long a lock is held and how long a writer waits for it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTiming {
    pub ttl: Duration,
    pub wait: Duration,
}

impl Default for LockTiming {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(5000),
            wait: Duration::from_millis(250),
        }
    }
}

/// Lock key derived from object id and owner
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey(String);

impl LockKey {
    pub fn new(id: &ObjectId, owner: &Identity) -> Self {
        Self(format!("{}:{}", id, owner))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Proof of holding a lock, required to release it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(String);

/// Exclusive time-bounded locks
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Try once to take the lock for `ttl`
    async fn try_acquire(&self, key: &LockKey, ttl: Duration) -> LiveResult<Option<LockToken>>;

    /// Release a held lock. Returns false if it had expired or changed hands.
    async fn release(&self, key: &LockKey, token: &LockToken) -> LiveResult<bool>;
}

/// Take a lock, polling with bounded backoff for at most `wait`.
/// Fails with `Conflict` when the wait elapses.
pub async fn acquire(
    locks: &dyn LockManager,
    key: &LockKey,
    ttl: Duration,
    wait: Duration,
) -> LiveResult<LockToken> {
    let deadline = Instant::now() + wait;
    let mut pause = POLL_START;

    loop {
        if let Some(token) = locks.try_acquire(key, ttl).await? {
            return Ok(token);
        }
        let now = Instant::now();
        if now >= deadline {
            debug!(key = key.as_str(), "Lock wait elapsed");
            return Err(LiveError::conflict(format!(
                "object is locked by another writer ({})",
                key.as_str()
            )));
        }
        tokio::time::sleep(pause.min(deadline - now)).await;
        pause = (pause * 2).min(POLL_MAX);
    }
}

#[derive(Debug)]
struct Claim {
    token: LockToken,
    expires_at: Instant,
}

/// In-process lock manager
#[derive(Debug, Default)]
pub struct MemoryLockManager {
    claims: Mutex<HashMap<LockKey, Claim>>,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the key is currently held
    pub fn is_held(&self, key: &LockKey) -> bool {
        self.claims
            .lock()
            .map(|claims| {
                claims
                    .get(key)
                    .map_or(false, |claim| claim.expires_at > Instant::now())
            })
            .unwrap_or(false)
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn try_acquire(&self, key: &LockKey, ttl: Duration) -> LiveResult<Option<LockToken>> {
        let mut claims = self
            .claims
            .lock()
            .map_err(|_| LiveError::Internal("Lock poisoned".into()))?;
        let now = Instant::now();

        if let Some(claim) = claims.get(key) {
            if claim.expires_at > now {
                return Ok(None);
            }
            debug!(key = key.as_str(), "Reclaiming expired lock");
        }

        let token = LockToken(Uuid::new_v4().to_string());
        claims.insert(
            key.clone(),
            Claim {
                token: token.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(Some(token))
    }

    async fn release(&self, key: &LockKey, token: &LockToken) -> LiveResult<bool> {
        let mut claims = self
            .claims
            .lock()
            .map_err(|_| LiveError::Internal("Lock poisoned".into()))?;
        match claims.get(key) {
            Some(claim) if &claim.token == token => {
                claims.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
