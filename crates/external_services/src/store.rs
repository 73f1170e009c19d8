//! Shared store abstraction.
//!
//! The gateway keeps all cross-process state (rate windows, usage counters,
//! the access ledger and the protected set) in one key-value store. The store
//! guarantees read-your-writes on a single key and nothing across keys.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Key-value operations the gateway needs from its shared store.
///
/// Method names follow the Redis commands they map to.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Check the store is reachable.
    async fn ping(&self) -> Result<()>;

    /// Atomically increment a counter, creating it at 0 first. Returns the new value.
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Set a time-to-live on an existing key.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Read a counter. Missing keys read as `None`.
    async fn get_counter(&self, key: &str) -> Result<Option<i64>>;

    /// List keys matching a `*` glob pattern.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Set one field of a hash.
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    /// Read every field of a hash. Missing keys read as empty.
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Remove one field of a hash.
    async fn hdel(&self, key: &str, field: &str) -> Result<()>;

    /// Replace a list with `values`, in order.
    async fn replace_list(&self, key: &str, values: &[String]) -> Result<()>;

    /// Read an inclusive index range of a list; negative indices count from the end.
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;
}

/// Match `key` against a glob where `*` matches any run of characters.
///
/// Iterative single pass with one backtrack point, so long keys cannot blow the stack.
pub fn glob_match(pattern: &str, key: &str) -> bool {
    let p = pattern.as_bytes();
    let k = key.as_bytes();
    let (mut pi, mut ki) = (0, 0);
    let mut star: Option<usize> = None;
    let mut star_ki = 0;

    while ki < k.len() {
        if pi < p.len() && p[pi] == b'*' {
            star = Some(pi);
            star_ki = ki;
            pi += 1;
        } else if pi < p.len() && p[pi] == k[ki] {
            pi += 1;
            ki += 1;
        } else if let Some(sp) = star {
            pi = sp + 1;
            star_ki += 1;
            ki = star_ki;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}
