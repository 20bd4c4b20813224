//! Namespaced token storage with lazy TTL expiry

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::jwt;
use crate::error::StorageError;
use crate::storage::KeyValueBackend;

/// Wall-clock source, in milliseconds since the UNIX epoch.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Access token record as written to the volatile backend.
///
/// Token and stamp share one key so a write can never leave them out of step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    pub token: String,
    /// Milliseconds since the UNIX epoch.
    pub stored_at: u64,
    /// Per-token lifetime in milliseconds, derived from the token's `exp`.
    /// `None` means the store's default TTL applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

impl StoredToken {
    /// Wall-clock expiry in ms, or `None` if the token never expires.
    /// A per-token TTL of zero means already expired; a default TTL of zero
    /// means no expiry.
    pub fn expires_at(&self, default_ttl: Duration) -> Option<u64> {
        match self.ttl {
            Some(ttl) => Some(self.stored_at.saturating_add(ttl)),
            None if default_ttl.is_zero() => None,
            None => Some(
                self.stored_at
                    .saturating_add(default_ttl.as_millis() as u64),
            ),
        }
    }

    pub fn is_expired(&self, default_ttl: Duration, now_ms: u64) -> bool {
        self.expires_at(default_ttl)
            .is_some_and(|expires_at| now_ms >= expires_at)
    }
}

/// Per-namespace custody of one access token and one refresh token.
///
/// Two stores built over the same backends with the same namespace see the
/// same values; different namespaces never collide.
pub struct TokenStore {
    namespace: String,
    access: Arc<dyn KeyValueBackend>,
    refresh: Arc<dyn KeyValueBackend>,
    clock: Arc<dyn Clock>,
    default_ttl: RwLock<Duration>,
    per_token_ttl: bool,
}

impl TokenStore {
    pub fn new(
        namespace: impl Into<String>,
        access: Arc<dyn KeyValueBackend>,
        refresh: Arc<dyn KeyValueBackend>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            access,
            refresh,
            clock: Arc::new(SystemClock),
            default_ttl: RwLock::new(Duration::ZERO),
            per_token_ttl: false,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_access_token_ttl(self, ttl: Duration) -> Self {
        self.set_access_token_ttl(ttl);
        self
    }

    /// Derive each access token's TTL from its own `exp` claim when present.
    pub fn with_per_token_ttl(mut self, enabled: bool) -> Self {
        self.per_token_ttl = enabled;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn access_key(&self) -> String {
        format!("{}.access_token", self.namespace)
    }

    fn refresh_key(&self) -> String {
        format!("{}.refresh_token", self.namespace)
    }

    /// Default TTL applied to tokens without a per-token lifetime.
    pub fn access_token_ttl(&self) -> Duration {
        *self.default_ttl.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Change the default TTL. Takes effect on the next read; records that
    /// cached a per-token TTL keep it until rewritten.
    pub fn set_access_token_ttl(&self, ttl: Duration) {
        *self.default_ttl.write().unwrap_or_else(|e| e.into_inner()) = ttl;
    }

    async fn read_access_record(&self) -> Result<Option<StoredToken>, StorageError> {
        match self.access.get(&self.access_key()).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StorageError::Decode(e.to_string())),
            None => Ok(None),
        }
    }

    /// Stored access token, or `None` if absent or past its TTL.
    pub async fn get_access_token(&self) -> Result<Option<String>, StorageError> {
        let now = self.clock.now_ms();
        let ttl = self.access_token_ttl();
        Ok(self
            .read_access_record()
            .await?
            .filter(|record| !record.is_expired(ttl, now))
            .map(|record| record.token))
    }

    /// Wall-clock expiry (ms) of the stored access token. `None` when there is
    /// no token or it never expires.
    pub async fn access_token_expires_at(&self) -> Result<Option<u64>, StorageError> {
        let ttl = self.access_token_ttl();
        Ok(self
            .read_access_record()
            .await?
            .and_then(|record| record.expires_at(ttl)))
    }

    pub async fn set_access_token(&self, token: &str) -> Result<bool, StorageError> {
        let now = self.clock.now_ms();
        let ttl = if self.per_token_ttl {
            jwt::parse_payload(token)
                .and_then(|claims| jwt::token_ttl(&claims, now))
                .map(|ttl| ttl.as_millis() as u64)
        } else {
            None
        };

        let record = StoredToken {
            token: token.to_string(),
            stored_at: now,
            ttl,
        };
        let raw = serde_json::to_string(&record).map_err(|e| StorageError::Encode(e.to_string()))?;

        tracing::debug!("[{}] storing access token", self.namespace);
        self.access.set(&self.access_key(), &raw).await
    }

    pub async fn get_refresh_token(&self) -> Result<Option<String>, StorageError> {
        self.refresh.get(&self.refresh_key()).await
    }

    pub async fn set_refresh_token(&self, token: &str) -> Result<bool, StorageError> {
        tracing::debug!("[{}] storing refresh token", self.namespace);
        self.refresh.set(&self.refresh_key(), token).await
    }

    /// Write both tokens, refresh token first. The access slot is only
    /// written once the refresh token has been kept.
    pub async fn set_tokens(&self, access: &str, refresh: &str) -> Result<bool, StorageError> {
        if !self.set_refresh_token(refresh).await? {
            return Ok(false);
        }
        self.set_access_token(access).await
    }

    pub async fn clear_access_token(&self) -> Result<bool, StorageError> {
        self.access.remove(&self.access_key()).await
    }

    pub async fn clear_refresh_token(&self) -> Result<bool, StorageError> {
        self.refresh.remove(&self.refresh_key()).await
    }

    /// Empty both slots. Both removals are issued; succeeds only if both do.
    pub async fn clear(&self) -> Result<bool, StorageError> {
        tracing::debug!("[{}] clearing token store", self.namespace);
        let (access_ok, refresh_ok) =
            futures::join!(self.clear_access_token(), self.clear_refresh_token());
        Ok(access_ok? && refresh_ok?)
    }
}
