//! Access token cache
//!
//! Caches derived upstream access tokens (Baidu OAuth, Vertex AI service
//! account exchange) keyed by credential identity. A token close to expiry is
//! still served while exactly one background refresh replaces it. Cold
//! fetches for the same key are serialized so concurrent callers share one
//! upstream exchange.

use crate::utils::error::AppResult;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

/// Time source, injectable for tests
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A token together with its absolute expiry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Longest lifetime accepted from an upstream `expires_in`
const MAX_LIFETIME_SECS: i64 = 90 * 24 * 3600;

impl TokenGrant {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    /// Grant valid for `expires_in` seconds after `issued_at`, clamped to a sane range
    pub fn expiring_in(
        token: impl Into<String>,
        issued_at: DateTime<Utc>,
        expires_in: i64,
    ) -> Self {
        let lifetime = Duration::seconds(expires_in.clamp(0, MAX_LIFETIME_SECS));
        Self::new(token, issued_at + lifetime)
    }
}

pub struct TokenCache {
    entries: RwLock<HashMap<String, TokenGrant>>,
    refreshing: Mutex<HashSet<String>>,
    /// Per-key gates for blocking fetches
    fetching: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    clock: Arc<dyn Clock>,
}

impl TokenCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            refreshing: Mutex::new(HashSet::new()),
            fetching: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn with_system_clock() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn get(&self, key: &str) -> Option<TokenGrant> {
        self.entries.read().ok().and_then(|entries| entries.get(key).cloned())
    }

    pub fn insert(&self, key: &str, grant: TokenGrant) {
        if let Ok(mut entries) = self.entries.write() {
            debug!("Caching access token for {} until {}", key, grant.expires_at);
            entries.insert(key.to_string(), grant);
        }
    }

    /// Drop a token the upstream rejected
    pub fn invalidate(&self, key: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(key);
        }
    }

    /// Return a usable token for `key`.
    ///
    /// A fresh token is returned as is. A token within `refresh_window` of its
    /// expiry is returned while one background refresh is started. A missing
    /// or expired token is fetched before returning; concurrent callers for
    /// the same key wait for that one fetch.
    pub async fn get_or_refresh<F, Fut>(
        self: &Arc<Self>,
        key: &str,
        refresh_window: Duration,
        fetch: F,
    ) -> AppResult<String>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = AppResult<TokenGrant>> + Send + 'static,
    {
        let now = self.now();

        if let Some(grant) = self.get(key) {
            if grant.expires_at > now {
                if grant.expires_at - refresh_window <= now {
                    self.spawn_refresh(key, fetch);
                }
                return Ok(grant.token);
            }
        }

        let gate = self.fetch_gate(key);
        let _guard = gate.lock().await;

        // another caller may have fetched while this one waited
        if let Some(grant) = self.get(key) {
            if grant.expires_at > self.now() {
                return Ok(grant.token);
            }
        }

        let grant = fetch().await?;
        let token = grant.token.clone();
        self.insert(key, grant);
        Ok(token)
    }

    fn fetch_gate(&self, key: &str) -> Arc<AsyncMutex<()>> {
        match self.fetching.lock() {
            Ok(mut fetching) => fetching.entry(key.to_string()).or_default().clone(),
            Err(_) => Arc::new(AsyncMutex::new(())),
        }
    }

    fn spawn_refresh<F, Fut>(self: &Arc<Self>, key: &str, fetch: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = AppResult<TokenGrant>> + Send + 'static,
    {
        match self.refreshing.lock() {
            Ok(mut refreshing) => {
                if !refreshing.insert(key.to_string()) {
                    return;
                }
            }
            Err(_) => return,
        }

        debug!("Refreshing access token for {} in background", key);
        let cache = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            match fetch().await {
                Ok(grant) => cache.insert(&key, grant),
                Err(e) => warn!("Background token refresh for {} failed: {}", key, e),
            }
            if let Ok(mut refreshing) = cache.refreshing.lock() {
                refreshing.remove(&key);
            }
        });
    }
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let size = self.entries.read().map(|e| e.len()).unwrap_or(0);
        f.debug_struct("TokenCache").field("entries", &size).finish()
    }
}
