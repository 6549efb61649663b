//! Time-bounded cache for external configuration parameters.
//!
//! Values are refreshed lazily on access once their TTL has passed. When a
//! value is stale exactly one caller refreshes it; every other caller keeps
//! getting the previous value without waiting. A failed refresh keeps the
//! previous value in service.

use crate::error::Result;
use std::collections::{HashMap, HashSet};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Source of configuration parameters (e.g. SSM Parameter Store)
#[async_trait::async_trait]
pub trait ParameterSource: Send + Sync {
    /// Fetch a string parameter, `ParameterMissing` if absent
    async fn get_string(&self, path: &str) -> Result<String>;
}

/// A fetched value and when it was fetched
#[derive(Debug, Clone)]
pub struct CachedParameter {
    pub value: String,
    pub fetched_at: Instant,
}

impl CachedParameter {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }
}

/// Process-wide parameter cache
pub struct ParameterCache {
    source: Arc<dyn ParameterSource>,
    ttl: Duration,
    entries: RwLock<HashMap<String, CachedParameter>>,
    /// Paths with a refresh in flight
    refreshing: Mutex<HashSet<String>>,
}

/// Releases the refresh slot for a path, even if the refresh is dropped
struct RefreshSlot<'a> {
    refreshing: &'a Mutex<HashSet<String>>,
    path: &'a str,
}

impl Drop for RefreshSlot<'_> {
    fn drop(&mut self) {
        self.refreshing.lock().remove(self.path);
    }
}

impl ParameterCache {
    pub fn new(source: Arc<dyn ParameterSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            entries: RwLock::new(HashMap::new()),
            refreshing: Mutex::new(HashSet::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Get a parameter, refreshing it if stale
    pub async fn get(&self, path: &str) -> Result<String> {
        let cached = self.cached(path);
        if let Some(entry) = &cached {
            if entry.is_fresh(self.ttl) {
                debug!(path = %path, "Parameter cache hit");
                return Ok(entry.value.clone());
            }
        }

        let slot = self.try_claim_refresh(path);
        match (slot, cached) {
            (None, Some(stale)) => {
                debug!(path = %path, "Refresh in flight, serving previous value");
                Ok(stale.value)
            }
            (slot, cached) => {
                let _slot = slot;
                self.refresh(path, cached).await
            }
        }
    }

    /// Get a parameter, falling back to `default` when missing, empty or unavailable
    pub async fn get_or_default(&self, path: &str, default: &str) -> String {
        match self.get(path).await {
            Ok(value) if !value.is_empty() => value,
            Ok(_) => default.to_string(),
            Err(e) => {
                debug!(path = %path, error = %e, default = %default, "Using default parameter value");
                default.to_string()
            }
        }
    }

    async fn refresh(&self, path: &str, previous: Option<CachedParameter>) -> Result<String> {
        match self.source.get_string(path).await {
            Ok(value) => {
                debug!(path = %path, "Parameter refreshed");
                self.entries.write().insert(
                        path.to_string(),
                        CachedParameter {
                            value: value.clone(),
                            fetched_at: Instant::now(),
                        },
                    );
                Ok(value)
            }
            Err(e) => match previous {
                Some(previous) => {
                    warn!(path = %path, error = %e, "Parameter refresh failed, keeping previous value");
                    Ok(previous.value)
                }
                None => Err(e),
            },
        }
    }

    fn cached(&self, path: &str) -> Option<CachedParameter> {
        self.entries.read().get(path).cloned()
    }

    fn try_claim_refresh<'a>(&'a self, path: &'a str) -> Option<RefreshSlot<'a>> {
        let claimed = self.refreshing.lock().insert(path.to_string());
        claimed.then(|| RefreshSlot {
            refreshing: &self.refreshing,
            path,
        })
    }
}
