use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// In-process one-shot nonce registry.
///
/// A nonce registers successfully exactly once and stays blocked until its
/// TTL elapses; by then the token carrying it has expired anyway. Expired
/// entries are swept lazily on access, so the map stays bounded by the
/// connection rate times the token lifetime.
pub struct NonceStore {
    entries: Mutex<HashMap<String, Instant>>,
}

impl NonceStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register a nonce for `ttl`. Returns false when the nonce is already
    /// present and still alive (a replay).
    pub fn register(&self, nonce: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, expires| *expires > now);

        match entries.get(nonce) {
            Some(_) => false,
            None => {
                entries.insert(nonce.to_string(), now + ttl);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, expires| *expires > now);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for NonceStore {
    fn default() -> Self {
        Self::new()
    }
}
