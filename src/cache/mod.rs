//! Per-instance materialised views.
//!
//! Five keyed slices per instance: *info* (auth snapshot), *config*
//! (rendered text), *heartbeat* (manifest JSON), *files* (path → descriptor
//! reverse index) and *lastseen*. Everything here is a regenerable hint;
//! the entity store stays authoritative and the invalidator drops slices
//! on mutation. Scalar slices carry a TTL; the files hash does not, since
//! its membership is purely a function of instance declaration.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::CacheError;

pub const TTL_USER_INFO: Duration = Duration::from_secs(60 * 60);
pub const TTL_INSTANCE_INFO: Duration = Duration::from_secs(60 * 60);
pub const TTL_INSTANCE_CONFIG: Duration = Duration::from_secs(12 * 60 * 60);
pub const TTL_INSTANCE_HEARTBEAT: Duration = Duration::from_secs(60 * 60);
pub const TTL_INSTANCE_LASTSEEN: Duration = Duration::from_secs(12 * 60 * 60);

pub fn user_info_key(id: i64) -> String {
    format!("cdn:user:info:{id}")
}

pub fn instance_info_key(id: i64) -> String {
    format!("cdn:instance:info:{id}")
}

pub fn instance_config_key(id: i64) -> String {
    format!("cdn:instance:config:{id}")
}

pub fn instance_files_key(id: i64) -> String {
    format!("cdn:instance:files:{id}")
}

pub fn instance_heartbeat_key(id: i64) -> String {
    format!("cdn:instance:heartbeat:{id}")
}

pub fn instance_lastseen_key(id: i64) -> String {
    format!("cdn:instance:lastseen:{id}")
}

#[derive(Debug, Clone)]
struct CacheEntry {
    data: Vec<u8>,
    expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// In-process cache store with single-key atomic operations.
#[derive(Default)]
pub struct CacheStore {
    entries: DashMap<String, CacheEntry>,
    hashes: DashMap<String, HashMap<String, Vec<u8>>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a scalar slice; an expired entry counts as a miss and is
    /// evicted lazily.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = Utc::now();
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                return Some(entry.data.clone());
            }
        } else {
            return None;
        }

        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        None
    }

    pub fn set(&self, key: &str, data: Vec<u8>, ttl: Option<Duration>) {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                data,
                expires_at: ttl.map(|t| Utc::now() + t),
            },
        );
    }

    /// Drop a slice, scalar or hash.
    pub fn del(&self, key: &str) {
        self.entries.remove(key);
        self.hashes.remove(key);
    }

    pub fn hash_exists(&self, key: &str) -> bool {
        self.hashes.contains_key(key)
    }

    /// Merge fields into a hash slice, creating it when absent.
    pub fn hset_all(&self, key: &str, fields: HashMap<String, Vec<u8>>) {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .extend(fields);
    }

    pub fn hget(&self, key: &str, field: &str) -> Option<Vec<u8>> {
        self.hashes
            .get(key)
            .and_then(|hash| hash.get(field).cloned())
    }

    pub fn hdel(&self, key: &str, field: &str) {
        if let Some(mut hash) = self.hashes.get_mut(key) {
            hash.remove(field);
        }
    }

    /// Move one field of a hash slice to a new name. Returns whether an
    /// entry was moved; a missing hash or field is not an error.
    pub fn hrename(&self, key: &str, from: &str, to: &str) -> Result<bool, CacheError> {
        let Some(mut hash) = self.hashes.get_mut(key) else {
            return Ok(false);
        };

        match hash.remove(from) {
            Some(value) => {
                hash.insert(to.to_string(), value);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_roundtrip_and_del() {
        let cache = CacheStore::new();
        cache.set("cdn:instance:config:1", b"config".to_vec(), None);
        assert_eq!(cache.get("cdn:instance:config:1"), Some(b"config".to_vec()));

        cache.del("cdn:instance:config:1");
        assert_eq!(cache.get("cdn:instance:config:1"), None);
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let cache = CacheStore::new();
        cache.set("k", b"v".to_vec(), Some(Duration::from_secs(0)));
        assert_eq!(cache.get("k"), None);

        cache.set("k", b"v".to_vec(), Some(Duration::from_secs(3600)));
        assert_eq!(cache.get("k"), Some(b"v".to_vec()));
    }

    #[test]
    fn test_hash_rename_moves_field() {
        let cache = CacheStore::new();
        let mut fields = HashMap::new();
        fields.insert("/data/cdn/afiles/x.txt".to_string(), b"meta".to_vec());
        cache.hset_all("cdn:instance:files:1", fields);

        let moved = cache
            .hrename(
                "cdn:instance:files:1",
                "/data/cdn/afiles/x.txt",
                "/data/cdn/afiles/y.txt",
            )
            .unwrap();
        assert!(moved);
        assert_eq!(cache.hget("cdn:instance:files:1", "/data/cdn/afiles/x.txt"), None);
        assert_eq!(
            cache.hget("cdn:instance:files:1", "/data/cdn/afiles/y.txt"),
            Some(b"meta".to_vec())
        );

        // renaming something that is not there is not an error
        assert!(!cache.hrename("cdn:instance:files:1", "gone", "away").unwrap());
        assert!(!cache.hrename("cdn:instance:files:9", "gone", "away").unwrap());
    }
}
