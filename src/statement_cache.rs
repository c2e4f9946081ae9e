//! Per-session registry of prepared statements keyed by SQL fingerprint.
//!
//! PostgreSQL prepared statements are scoped to their backend, so the
//! cache lives inside a [`crate::pool::Session`] and dies with it. The
//! LRU bound keeps per-backend prepared-statement memory predictable on
//! the server.

use lru::LruCache;
use std::num::NonZeroUsize;

/// Stable fingerprint of a parameterized SQL string: whitespace runs
/// collapsed, placeholders canonicalized. Equality defines
/// prepared-statement reuse.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatementKey(String);

impl StatementKey {
    pub fn new(sql: &str) -> Self {
        Self(normalize(sql))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn normalize(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.trim().chars().peekable();
    let mut last_was_space = false;
    while let Some(c) = chars.next() {
        if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
            continue;
        }
        last_was_space = false;
        if c == '$' && chars.peek().is_some_and(|n| n.is_ascii_digit()) {
            while chars.peek().is_some_and(|n| n.is_ascii_digit()) {
                chars.next();
            }
            out.push_str("$?");
            continue;
        }
        out.push(c);
    }
    out
}

/// LRU map from fingerprint to a driver-level prepared handle.
///
/// Generic over the handle type; the pool instantiates it with
/// `tokio_postgres::Statement`, whose drop closes the server-side
/// statement, so eviction is also deallocation.
#[derive(Debug)]
pub struct StatementCache<V> {
    entries: LruCache<StatementKey, V>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<V: Clone> StatementCache<V> {
    pub fn new(cap: usize) -> Self {
        let cap = NonZeroUsize::new(cap.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(cap),
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    pub fn get(&mut self, key: &StatementKey) -> Option<V> {
        match self.entries.get(key) {
            Some(v) => {
                self.hits += 1;
                Some(v.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Inserts a prepared handle, returning the evicted entry if the
    /// cache was full.
    pub fn put(&mut self, key: StatementKey, value: V) -> Option<V> {
        let evicted = if self.entries.len() == self.entries.cap().get()
            && !self.entries.contains(&key)
        {
            self.entries.pop_lru().map(|(_, v)| v)
        } else {
            None
        };
        if evicted.is_some() {
            self.evictions += 1;
        }
        self.entries.put(key, value);
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }
}
