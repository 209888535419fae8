use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::config::SessionConfig;

#[derive(Debug, Clone)]
struct SessionEntry {
    correlation_id: String,
    expires_at: Instant,
}

/// `(model, user) -> correlation id` used for upstream cache affinity.
///
/// Entries are replaced, never extended, once expired. Concurrent first use of
/// a key may mint two ids; the last insert wins.
pub struct SessionCache {
    entries: RwLock<FxHashMap<(String, String), SessionEntry>>,
    ttl: Duration,
    purge_threshold: usize,
}

impl SessionCache {
    #[must_use]
    pub fn new(ttl: Duration, purge_threshold: usize) -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
            ttl,
            purge_threshold: purge_threshold.max(1),
        }
    }

    #[must_use]
    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(Duration::from_secs(config.ttl_secs), config.purge_threshold)
    }

    /// The live correlation id for `(model, user)`, minting a new one if needed.
    pub fn get(&self, model: &str, user: &str) -> String {
        self.get_at(model, user, Instant::now())
    }

    fn get_at(&self, model: &str, user: &str, now: Instant) -> String {
        let key = (model.to_string(), user.to_string());
        if let Some(entry) = self.entries.read().get(&key) {
            if entry.expires_at > now {
                return entry.correlation_id.clone();
            }
        }

        let correlation_id = uuid::Uuid::new_v4().to_string();
        let mut entries = self.entries.write();
        if entries.len() >= self.purge_threshold {
            let before = entries.len();
            entries.retain(|_, entry| entry.expires_at > now);
            tracing::debug!(purged = before - entries.len(), "session cache purge");
        }
        entries.insert(
            key,
            SessionEntry {
                correlation_id: correlation_id.clone(),
                expires_at: now + self.ttl,
            },
        );
        correlation_id
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
