//! In-process [`SharedStore`] used by tests and single-node deployments.
//!
//! State lives only as long as the process, so counters and persisted
//! subscriptions do not survive a restart.

use crate::error::{Error, Result};
use crate::store::{glob_match, SharedStore};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
enum Value {
    Counter(i64),
    Hash(HashMap<String, String>),
    List(Vec<String>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Counter(_) => "counter",
            Value::Hash(_) => "hash",
            Value::List(_) => "list",
        }
    }
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Smallest map size that triggers a sweep of expired entries.
const SWEEP_FLOOR: usize = 64;

/// Mutex-guarded map with Redis-like semantics: expired keys read as absent
/// and operating on a key of the wrong type is an error.
///
/// Expired entries are dropped when touched, and the whole map is swept once
/// it reaches twice the size it had after the previous sweep, so keys that are
/// never read again do not accumulate.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    sweep_at: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`Error::StoreUnavailable`] until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Remaining time-to-live of a key, if it has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.lock();
        entries
            .get(key)
            .filter(|e| e.is_live(now))
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Number of entries held, including expired ones not yet swept.
    pub fn stored_keys(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock the map after checking availability, dropping the entry for `key` if expired.
    fn live(&self, key: &str) -> Result<MutexGuard<'_, HashMap<String, Entry>>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("memory store marked unavailable".to_string()));
        }
        let mut entries = self.lock();
        let now = Instant::now();
        if entries.len() >= self.sweep_at.load(Ordering::Relaxed) {
            let before = entries.len();
            entries.retain(|_, e| e.is_live(now));
            self.sweep_at
                .store((entries.len() * 2).max(SWEEP_FLOOR), Ordering::Relaxed);
            if before > entries.len() {
                debug!("Swept {} expired keys", before - entries.len());
            }
        } else if entries.get(key).is_some_and(|e| !e.is_live(now)) {
            entries.remove(key);
        }
        Ok(entries)
    }
}

fn wrong_type(key: &str, value: &Value) -> Error {
    Error::WrongType(format!("{} holds a {}", key, value.kind()))
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        self.live("")?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut entries = self.live(key)?;
        let entry = entries.entry(key.to_string()).or_insert(Entry {
            value: Value::Counter(0),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Counter(n) => {
                *n += 1;
                Ok(*n)
            }
            other => Err(wrong_type(key, other)),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.live(key)?;
        if ttl.is_zero() {
            entries.remove(key);
        } else if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn get_counter(&self, key: &str) -> Result<Option<i64>> {
        let entries = self.live(key)?;
        match entries.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Counter(n)) => Ok(Some(*n)),
            Some(other) => Err(wrong_type(key, other)),
        }
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let entries = self.live("")?;
        let now = Instant::now();
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(k, e)| e.is_live(now) && glob_match(pattern, k))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut entries = self.live(key)?;
        let entry = entries.entry(key.to_string()).or_insert(Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Hash(h) => {
                h.insert(field.to_string(), value.to_string());
                Ok(())
            }
            other => Err(wrong_type(key, other)),
        }
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let entries = self.live(key)?;
        match entries.get(key).map(|e| &e.value) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(h)) => Ok(h.clone()),
            Some(other) => Err(wrong_type(key, other)),
        }
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let mut entries = self.live(key)?;
        let now_empty = match entries.get_mut(key).map(|e| &mut e.value) {
            None => return Ok(()),
            Some(Value::Hash(h)) => {
                h.remove(field);
                h.is_empty()
            }
            Some(other) => return Err(wrong_type(key, other)),
        };
        if now_empty {
            entries.remove(key);
        }
        Ok(())
    }

    async fn replace_list(&self, key: &str, values: &[String]) -> Result<()> {
        let mut entries = self.live(key)?;
        if values.is_empty() {
            entries.remove(key);
        } else {
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::List(values.to_vec()),
                    expires_at: None,
                },
            );
        }
        Ok(())
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let entries = self.live(key)?;
        let list = match entries.get(key).map(|e| &e.value) {
            None => return Ok(Vec::new()),
            Some(Value::List(l)) => l,
            Some(other) => return Err(wrong_type(key, other)),
        };

        let len = list.len() as isize;
        let norm = |i: isize| if i < 0 { len + i } else { i };
        let start = norm(start).max(0);
        let stop = norm(stop).min(len - 1);
        if start > stop {
            return Ok(Vec::new());
        }
        Ok(list[start as usize..=stop as usize].to_vec())
    }
}
