//! Identity cache sitting in front of the external authority.
//!
//! This module provides an in-memory store of resolved identities with a
//! fixed expiry, so repeated joins from the same connection do not call the
//! external authority every time.
//!
//! # Keys
//!
//! Rows are looked up by `(token, session_id)` but upserted by
//! `(external_user_id, session_id)`. Both keys are indexes over the same
//! row table, guarded by one lock, so a token rotation for a user/session
//! pair rewrites the existing row instead of creating a second one.
//!
//! # Expiry
//!
//! `expires_at` is checked on every read and is the only thing that decides
//! whether a row is usable. [`IdentityCache::evict_expired`] exists to bound
//! memory and can run at any time without affecting correctness.
//!
//! # Example
//!
//! ```rust
//! use chrono::{Duration, Utc};
//! use herald_server::identity::{IdentityCache, IdentityCacheConfig};
//! use herald_server::types::{ActorType, IdentityRecord};
//!
//! let cache = IdentityCache::new(IdentityCacheConfig::default());
//! cache
//!     .store(IdentityRecord {
//!         id: 0,
//!         external_user_id: "42".to_string(),
//!         session_id: "s1".to_string(),
//!         token: "t1".to_string(),
//!         actor_type: ActorType::User,
//!         display_name: None,
//!         expires_at: Utc::now() + Duration::hours(1),
//!     })
//!     .expect("cache has capacity");
//!
//! assert!(cache.lookup("t1", "s1", ActorType::User).is_some());
//! assert!(cache.lookup("t1", "s1", ActorType::Worker).is_none());
//! ```

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::types::{ActorType, IdentityRecord};

/// Maximum number of cached identities.
const DEFAULT_MAX_CAPACITY: usize = 100_000;

/// Errors that can occur when writing to the identity cache.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityCacheError {
    /// The cache is full of live rows.
    #[error("identity cache at maximum capacity ({max_capacity} rows)")]
    AtCapacity {
        /// The maximum number of rows allowed.
        max_capacity: usize,
    },
}

/// Configuration for the identity cache.
#[derive(Debug, Clone)]
pub struct IdentityCacheConfig {
    /// Maximum number of rows, live or expired.
    pub max_capacity: usize,
}

impl Default for IdentityCacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: DEFAULT_MAX_CAPACITY,
        }
    }
}

/// Outcome of a cache probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheProbe {
    /// Live row with the requested actor type.
    Hit(IdentityRecord),

    /// No live row for the token/session pair.
    Miss,

    /// A live row exists but was issued for another actor type.
    ActorMismatch {
        /// Actor type stored in the row.
        cached: ActorType,
    },
}

type OwnerKey = (String, String);
type TokenKey = (String, String);

#[derive(Debug, Default)]
struct Tables {
    rows: HashMap<u64, IdentityRecord>,
    /// (external_user_id, session_id) -> row id. Upsert key.
    by_owner: HashMap<OwnerKey, u64>,
    /// (token, session_id) -> row id. Lookup key; the latest write wins.
    by_token: HashMap<TokenKey, u64>,
    next_id: u64,
}

impl Tables {
    fn unlink_token(&mut self, key: &TokenKey, id: u64) {
        if self.by_token.get(key) == Some(&id) {
            self.by_token.remove(key);
        }
    }

    fn remove_row(&mut self, id: u64) -> Option<IdentityRecord> {
        let row = self.rows.remove(&id)?;
        self.unlink_token(&(row.token.clone(), row.session_id.clone()), id);
        let owner = (row.external_user_id.clone(), row.session_id.clone());
        if self.by_owner.get(&owner) == Some(&id) {
            self.by_owner.remove(&owner);
        }
        Some(row)
    }

    fn evict_expired(&mut self, now: DateTime<Utc>) -> usize {
        let expired: Vec<u64> = self
            .rows
            .iter()
            .filter(|(_, row)| !row.is_live_at(now))
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            self.remove_row(*id);
        }

        expired.len()
    }
}

/// Thread-safe in-memory identity cache.
pub struct IdentityCache {
    tables: RwLock<Tables>,
    config: IdentityCacheConfig,
}

impl IdentityCache {
    /// Creates a new, empty identity cache.
    pub fn new(config: IdentityCacheConfig) -> Self {
        debug!(
            max_capacity = config.max_capacity,
            "Creating new identity cache"
        );
        Self {
            tables: RwLock::new(Tables {
                next_id: 1,
                ..Tables::default()
            }),
            config,
        }
    }

    /// Looks up a live identity for the token/session pair and actor type.
    ///
    /// Anything other than a live row with a matching actor type is a miss.
    pub fn lookup(
        &self,
        token: &str,
        session_id: &str,
        actor_type: ActorType,
    ) -> Option<IdentityRecord> {
        match self.probe(token, session_id, actor_type) {
            CacheProbe::Hit(record) => Some(record),
            CacheProbe::Miss | CacheProbe::ActorMismatch { .. } => None,
        }
    }

    /// Like [`lookup`](Self::lookup), but tells an actor-type mismatch apart
    /// from a plain miss.
    pub fn probe(&self, token: &str, session_id: &str, actor_type: ActorType) -> CacheProbe {
        self.probe_at(token, session_id, actor_type, Utc::now())
    }

    fn probe_at(
        &self,
        token: &str,
        session_id: &str,
        actor_type: ActorType,
        now: DateTime<Utc>,
    ) -> CacheProbe {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);

        let key = (token.to_string(), session_id.to_string());
        let Some(row) = tables.by_token.get(&key).and_then(|id| tables.rows.get(id)) else {
            trace!("Identity cache miss");
            return CacheProbe::Miss;
        };

        if !row.is_live_at(now) {
            trace!(row_id = row.id, "Cached identity expired");
            return CacheProbe::Miss;
        }

        if row.actor_type != actor_type {
            return CacheProbe::ActorMismatch {
                cached: row.actor_type,
            };
        }

        trace!(
            row_id = row.id,
            user_id = %row.external_user_id,
            "Identity cache hit"
        );
        CacheProbe::Hit(row.clone())
    }

    /// Upserts a record keyed by `(external_user_id, session_id)`.
    ///
    /// An existing row for the pair has its token, expiry, actor type and
    /// display name overwritten and keeps its id. Returns the stored row.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityCacheError::AtCapacity`] if a new row is needed and
    /// the cache is full even after dropping expired rows.
    pub fn store(&self, record: IdentityRecord) -> Result<IdentityRecord, IdentityCacheError> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);

        let owner = (record.external_user_id.clone(), record.session_id.clone());
        let token_key = (record.token.clone(), record.session_id.clone());

        let id = match tables.by_owner.get(&owner).copied() {
            Some(id) => {
                if let Some(previous) = tables.rows.get(&id) {
                    let old_key = (previous.token.clone(), previous.session_id.clone());
                    tables.unlink_token(&old_key, id);
                }
                trace!(row_id = id, user_id = %record.external_user_id, "Refreshing cached identity");
                id
            }
            None => {
                if tables.rows.len() >= self.config.max_capacity {
                    let evicted = tables.evict_expired(Utc::now());
                    if tables.rows.len() >= self.config.max_capacity {
                        warn!(
                            rows = tables.rows.len(),
                            max_capacity = self.config.max_capacity,
                            "Identity cache at capacity, not caching"
                        );
                        return Err(IdentityCacheError::AtCapacity {
                            max_capacity: self.config.max_capacity,
                        });
                    }
                    debug!(evicted, "Evicted expired identities to make room");
                }
                let id = tables.next_id;
                tables.next_id += 1;
                tables.by_owner.insert(owner, id);
                trace!(row_id = id, user_id = %record.external_user_id, "Caching new identity");
                id
            }
        };

        let stored = IdentityRecord { id, ..record };
        tables.by_token.insert(token_key, id);
        tables.rows.insert(id, stored.clone());

        Ok(stored)
    }

    /// Returns a row by id, expired or not.
    pub fn get(&self, id: u64) -> Option<IdentityRecord> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables.rows.get(&id).cloned()
    }

    /// Returns the number of rows, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .rows
            .len()
    }

    /// Returns true if the cache holds no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every expired row. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(Utc::now())
    }

    fn evict_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let removed = tables.evict_expired(now);

        if removed > 0 {
            debug!(
                removed_count = removed,
                remaining_count = tables.rows.len(),
                "Evicted expired identities"
            );
        }

        removed
    }

    /// Spawns a background task that periodically evicts expired rows.
    ///
    /// # Returns
    ///
    /// A `JoinHandle` for the spawned task. Abort it on shutdown.
    pub fn spawn_eviction_task(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                cache.evict_expired();
            }
        })
    }
}

impl Default for IdentityCache {
    fn default() -> Self {
        Self::new(IdentityCacheConfig::default())
    }
}

impl std::fmt::Debug for IdentityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityCache")
            .field("row_count", &self.len())
            .field("config", &self.config)
            .finish()
    }
}
