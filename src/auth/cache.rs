//! Validation-result cache for credentials.
//!
//! Entries are keyed by the SHA-256 of the raw token so the hot path
//! never re-runs signature verification. An entry never outlives the
//! credential it caches: its TTL is capped at the token expiry.
//! Deactivating a subject evicts all of its entries at once.

use super::AuthContext;
use chrono::Utc;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Configuration for the credential cache.
#[derive(Debug, Clone)]
pub struct AuthCacheConfig {
    /// Upper bound on entry lifetime; actual TTL is the smaller of this
    /// and the remaining token validity.
    pub ttl: Duration,
    /// Maximum entries held; oldest-expiring entries are evicted first.
    pub max_entries: usize,
}

impl Default for AuthCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_entries: 4096,
        }
    }
}

struct CacheEntry {
    context: AuthContext,
    expires_at: Instant,
}

/// Cache of successful credential validations.
pub struct AuthCache {
    config: AuthCacheConfig,
    entries: RwLock<HashMap<[u8; 32], CacheEntry>>,
}

impl AuthCache {
    pub fn new(config: AuthCacheConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn key(token: &str) -> [u8; 32] {
        Sha256::digest(token.as_bytes()).into()
    }

    /// Look up a previously validated token.
    pub fn get(&self, token: &str) -> Option<AuthContext> {
        let key = Self::key(token);
        let entries = self.entries.read();
        let entry = entries.get(&key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.context.clone())
    }

    /// Cache a successful validation.
    pub fn insert(&self, token: &str, context: AuthContext) {
        let remaining = (context.expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let ttl = self.config.ttl.min(remaining);
        if ttl.is_zero() {
            return;
        }

        let mut entries = self.entries.write();
        if entries.len() >= self.config.max_entries {
            Self::evict_oldest(&mut entries);
        }
        entries.insert(
            Self::key(token),
            CacheEntry {
                context,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Drop every entry belonging to a subject. Called when an agent is
    /// deactivated so stale sessions cannot ride out the TTL.
    pub fn invalidate_subject(&self, subject: &str) {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.context.subject != subject);
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(subject, evicted, "Evicted cached credentials for subject");
        }
    }

    /// Remove entries whose TTL has lapsed.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.write().retain(|_, e| e.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn evict_oldest(entries: &mut HashMap<[u8; 32], CacheEntry>) {
        if let Some(key) = entries
            .iter()
            .min_by_key(|(_, e)| e.expires_at)
            .map(|(k, _)| *k)
        {
            entries.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Permissions;
    use chrono::Duration as ChronoDuration;

    fn context(subject: &str, valid_for_secs: i64) -> AuthContext {
        AuthContext {
            subject: subject.to_string(),
            role: "worker".to_string(),
            permissions: Permissions::SEND,
            token_id: format!("jti-{subject}"),
            expires_at: Utc::now() + ChronoDuration::seconds(valid_for_secs),
        }
    }

    #[test]
    fn test_hit_and_miss() {
        let cache = AuthCache::new(AuthCacheConfig::default());
        cache.insert("token-a", context("agent-1", 600));

        assert_eq!(cache.get("token-a").unwrap().subject, "agent-1");
        assert!(cache.get("token-b").is_none());
    }

    #[test]
    fn test_ttl_capped_at_token_expiry() {
        let cache = AuthCache::new(AuthCacheConfig {
            ttl: Duration::from_secs(300),
            ..Default::default()
        });

        // Token already expired: nothing to cache.
        cache.insert("stale", context("agent-1", -5));
        assert!(cache.get("stale").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_subject() {
        let cache = AuthCache::new(AuthCacheConfig::default());
        cache.insert("t1", context("agent-1", 600));
        cache.insert("t2", context("agent-1", 600));
        cache.insert("t3", context("agent-2", 600));

        cache.invalidate_subject("agent-1");
        assert!(cache.get("t1").is_none());
        assert!(cache.get("t2").is_none());
        assert_eq!(cache.get("t3").unwrap().subject, "agent-2");
    }

    #[test]
    fn test_capacity_eviction() {
        let cache = AuthCache::new(AuthCacheConfig {
            max_entries: 2,
            ..Default::default()
        });
        cache.insert("t1", context("a", 600));
        cache.insert("t2", context("b", 600));
        cache.insert("t3", context("c", 600));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("t3").is_some());
    }

    #[test]
    fn test_purge_expired() {
        let cache = AuthCache::new(AuthCacheConfig {
            ttl: Duration::from_millis(1),
            ..Default::default()
        });
        cache.insert("t1", context("a", 600));
        std::thread::sleep(Duration::from_millis(5));

        cache.purge_expired();
        assert!(cache.is_empty());
    }
}
