//! Subscription lifecycle: a fixed protected set plus on-demand dynamic codes.
//!
//! Access times live in the shared store so a restart keeps the ledger, and
//! the protected set is persisted as an ordered list. Dynamic codes that go
//! unrequested for longer than `stale_after` are pruned; protected codes never are.

use crate::error::Result;
use crate::traits::{PriceStream, RankingSource};
use external_services::SharedStore;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Hash of code → last access unix seconds.
pub const DYNAMIC_PAIRS_KEY: &str = "p4ai:ws:dynamic_pairs";

/// Ordered list holding the protected set.
pub const PROTECTED_SET_KEY: &str = "p4ai:ws:top10";

const DEFAULT_SYMBOLS: [&str; 10] = [
    "BTC", "ETH", "BNB", "XRP", "SOL", "DOGE", "ADA", "TRX", "AVAX", "SHIB",
];

/// Map a coin symbol to its USDT instrument code.
pub fn code_for_symbol(symbol: &str) -> String {
    format!("Crypto:ALL:{}/USDT", symbol.to_uppercase())
}

/// Protected set used when the store holds none.
pub fn default_protected_set() -> Vec<String> {
    DEFAULT_SYMBOLS.iter().map(|s| code_for_symbol(s)).collect()
}

/// Code → "actively streamed" flag.
///
/// Shared by the stream cache (which resubscribes every code after a
/// reconnect) and the subscription manager (which adds and prunes codes).
/// A `false` flag marks a code whose subscribe request is still in flight.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionSet {
    inner: Arc<RwLock<HashMap<String, bool>>>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every tracked code, pending included, sorted.
    pub fn codes(&self) -> Vec<String> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut codes: Vec<String> = map.keys().cloned().collect();
        codes.sort();
        codes
    }

    pub fn is_subscribed(&self, code: &str) -> bool {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.get(code).copied().unwrap_or(false)
    }

    pub fn contains(&self, code: &str) -> bool {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.contains_key(code)
    }

    pub fn len(&self) -> usize {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claim `code` as pending. Returns false if it was already tracked.
    pub fn claim(&self, code: &str) -> bool {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(code) {
            return false;
        }
        map.insert(code.to_string(), false);
        true
    }

    /// Mark a claimed code as streamed.
    pub fn confirm(&self, code: &str) {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(flag) = map.get_mut(code) {
            *flag = true;
        }
    }

    /// Drop a claim whose subscribe failed. Confirmed codes are left alone.
    pub fn release(&self, code: &str) {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if map.get(code) == Some(&false) {
            map.remove(code);
        }
    }

    pub fn mark_active(&self, codes: &[String]) {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        for code in codes {
            map.insert(code.clone(), true);
        }
    }

    pub fn remove(&self, code: &str) -> bool {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        map.remove(code).is_some()
    }
}

/// Configuration for the subscription manager.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Cardinality of the protected set.
    pub protected_size: usize,
    /// How often stale dynamic codes are pruned.
    pub prune_interval: Duration,
    /// Age after which an unrequested dynamic code is stale.
    pub stale_after: Duration,
    /// How often the protected set is refreshed from the ranking source.
    pub refresh_interval: Duration,
    /// Drop cached quotes of pruned codes so they are refetched on next access.
    pub evict_pruned_quotes: bool,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            protected_size: 10,
            prune_interval: Duration::from_secs(60 * 60),
            stale_after: Duration::from_secs(24 * 60 * 60),
            refresh_interval: Duration::from_secs(24 * 60 * 60),
            evict_pruned_quotes: true,
        }
    }
}

/// Snapshot for health and admin reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionStats {
    pub protected_count: usize,
    pub total_subscribed: usize,
    pub protected: Vec<String>,
}

/// Decides which codes stay streamed.
pub struct SubscriptionManager {
    store: Arc<dyn SharedStore>,
    stream: Arc<dyn PriceStream>,
    ranking: Option<Arc<dyn RankingSource>>,
    subscriptions: SubscriptionSet,
    protected: RwLock<Vec<String>>,
    config: SubscriptionConfig,
    shutdown: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SubscriptionManager {
    pub fn new(
        store: Arc<dyn SharedStore>,
        stream: Arc<dyn PriceStream>,
        subscriptions: SubscriptionSet,
        config: SubscriptionConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            stream,
            ranking: None,
            subscriptions,
            protected: RwLock::new(Vec::new()),
            config,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Refresh the protected set from `ranking` on every `refresh_interval`.
    pub fn with_ranking(mut self, ranking: Arc<dyn RankingSource>) -> Self {
        self.ranking = Some(ranking);
        self
    }

    /// Load (or seed) the protected set, subscribe it and spawn the background loops.
    pub async fn start(self: &Arc<Self>) {
        let protected = self.load_protected_set().await;
        info!("Protected set: {:?}", protected);

        self.set_protected(protected.clone());
        self.subscriptions.mark_active(&protected);
        if let Err(e) = self.stream.subscribe(&protected).await {
            warn!("Failed to subscribe protected set: {}", e);
        }

        let this = Arc::clone(self);
        let mut handles = vec![tokio::spawn(async move { this.prune_loop().await })];

        if self.ranking.is_some() {
            let this = Arc::clone(self);
            handles.push(tokio::spawn(async move { this.refresh_loop().await }));
        }
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);
    }

    /// Wait for the background loops to exit after shutdown is signalled.
    pub async fn join(&self) {
        let handles: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Subscription task ended abnormally: {}", e);
            }
        }
    }

    async fn load_protected_set(&self) -> Vec<String> {
        let n = self.config.protected_size;
        match self
            .store
            .lrange(PROTECTED_SET_KEY, 0, n as isize - 1)
            .await
        {
            Ok(codes) if codes.len() == n => return codes,
            Ok(codes) => debug!("Stored protected set has {} entries, seeding defaults", codes.len()),
            Err(e) => warn!("Failed to load protected set: {}", e),
        }

        let defaults: Vec<String> = default_protected_set().into_iter().take(n).collect();
        if let Err(e) = self.store.replace_list(PROTECTED_SET_KEY, &defaults).await {
            warn!("Failed to persist default protected set: {}", e);
        }
        defaults
    }

    /// Note an access to `code`, subscribing it if it is not yet tracked.
    pub async fn record_access(&self, code: &str) {
        self.record_access_at(code, chrono::Utc::now().timestamp())
            .await
    }

    pub async fn record_access_at(&self, code: &str, now: i64) {
        if let Err(e) = self
            .store
            .hset(DYNAMIC_PAIRS_KEY, code, &now.to_string())
            .await
        {
            warn!("Failed to record access for {}: {}", code, e);
        }

        if !self.subscriptions.claim(code) {
            return;
        }

        match self.stream.subscribe(&[code.to_string()]).await {
            Ok(()) => {
                self.subscriptions.confirm(code);
                info!(
                    "Dynamic subscribe: {} (total: {})",
                    code,
                    self.subscriptions.len()
                );
            }
            Err(e) => {
                self.subscriptions.release(code);
                warn!("Failed to subscribe to {}: {}", code, e);
            }
        }
    }

    /// Replace the protected set with the first `protected_size` of `codes`.
    ///
    /// Shorter lists are ignored. Codes dropped from the set are written to the
    /// access ledger so pruning ages them out like any dynamic code.
    pub async fn update_protected_set(&self, codes: &[String]) -> Result<()> {
        self.update_protected_set_at(codes, chrono::Utc::now().timestamp())
            .await
    }

    pub async fn update_protected_set_at(&self, codes: &[String], now: i64) -> Result<()> {
        let n = self.config.protected_size;
        if codes.len() < n {
            debug!("Ignoring protected set update with {} < {} codes", codes.len(), n);
            return Ok(());
        }
        let top: Vec<String> = codes[..n].to_vec();

        if let Err(e) = self.store.replace_list(PROTECTED_SET_KEY, &top).await {
            warn!("Failed to persist protected set: {}", e);
        }

        let previous = self.set_protected(top.clone());
        for code in previous.iter().filter(|c| !top.contains(c)) {
            if let Err(e) = self
                .store
                .hset(DYNAMIC_PAIRS_KEY, code, &now.to_string())
                .await
            {
                warn!("Failed to demote {}: {}", code, e);
            }
        }

        self.subscriptions.mark_active(&top);
        self.stream.subscribe(&top).await?;
        info!("Updated protected set: {:?}", top);
        Ok(())
    }

    /// Refresh the protected set from the ranking source, if one is configured.
    pub async fn refresh_protected_set(&self) -> Result<()> {
        let Some(ranking) = &self.ranking else {
            return Ok(());
        };
        let symbols = ranking.top_symbols(self.config.protected_size).await?;
        let codes: Vec<String> = symbols.iter().map(|s| code_for_symbol(s)).collect();
        self.update_protected_set(&codes).await
    }

    /// Remove ledger entries older than `stale_after`.
    ///
    /// Returns the codes dropped from the subscription set. Protected codes
    /// lose their ledger entry but stay subscribed.
    pub async fn prune_stale(&self) -> Result<Vec<String>> {
        self.prune_stale_at(chrono::Utc::now().timestamp()).await
    }

    pub async fn prune_stale_at(&self, now: i64) -> Result<Vec<String>> {
        let cutoff = now - self.config.stale_after.as_secs() as i64;
        let ledger = self.store.hgetall(DYNAMIC_PAIRS_KEY).await?;
        let protected: HashSet<String> = self.protected_set().into_iter().collect();

        let mut pruned = Vec::new();
        for (code, last_access) in ledger {
            // Unparseable timestamps count as stale
            let last_access: i64 = last_access.parse().unwrap_or(0);
            if last_access >= cutoff {
                continue;
            }
            if let Err(e) = self.store.hdel(DYNAMIC_PAIRS_KEY, &code).await {
                warn!("Failed to remove {} from ledger: {}", code, e);
                continue;
            }
            if protected.contains(&code) {
                continue;
            }
            if self.subscriptions.remove(&code) {
                info!("Removed stale pair: {}", code);
                pruned.push(code);
            }
        }

        if self.config.evict_pruned_quotes && !pruned.is_empty() {
            self.stream.evict(&pruned);
        }
        Ok(pruned)
    }

    async fn prune_loop(&self) {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return;
        }
        let mut ticker = interval(self.config.prune_interval);
        ticker.reset();

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        result = self.prune_stale() => match result {
                            Ok(pruned) => debug!("Prune pass removed {} pairs", pruned.len()),
                            Err(e) => warn!("Prune pass failed: {}", e),
                        },
                    }
                }
            }
        }
        debug!("Prune loop stopped");
    }

    async fn refresh_loop(&self) {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return;
        }
        let mut ticker = interval(self.config.refresh_interval);
        ticker.reset();

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    // Shutdown also interrupts an in-flight refresh
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        result = self.refresh_protected_set() => {
                            if let Err(e) = result {
                                warn!("Protected set refresh failed: {}", e);
                            }
                        }
                    }
                }
            }
        }
        debug!("Refresh loop stopped");
    }

    pub fn protected_set(&self) -> Vec<String> {
        self.protected
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_protected(&self, codes: Vec<String>) -> Vec<String> {
        let mut guard = self.protected.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, codes)
    }

    pub fn is_subscribed(&self, code: &str) -> bool {
        self.subscriptions.is_subscribed(code)
    }

    pub fn stats(&self) -> SubscriptionStats {
        let protected = self.protected_set();
        SubscriptionStats {
            protected_count: protected.len(),
            total_subscribed: self.subscriptions.len(),
            protected,
        }
    }
}
