//! Usage accounting at three granularities: lifetime, per day and per hour.
//!
//! Aggregates are computed at read time by summing buckets, so a missing or
//! expired bucket simply contributes zero.

use crate::error::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use external_services::SharedStore;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

const DAILY_TTL: Duration = Duration::from_secs(8 * 24 * 60 * 60);
const HOURLY_TTL: Duration = Duration::from_secs(25 * 60 * 60);

fn total_key(key: &str) -> String {
    format!("usage:total:{}", key)
}

fn daily_key(key: &str, at: DateTime<Utc>) -> String {
    format!("usage:daily:{}:{}", key, at.format("%Y%m%d"))
}

fn hourly_key(key: &str, at: DateTime<Utc>) -> String {
    format!("usage:hourly:{}:{}", key, at.format("%Y%m%d%H"))
}

/// Show only the first 12 characters of a client key.
pub fn mask_key(key: &str) -> String {
    let prefix: String = key.chars().take(12).collect();
    format!("{}...", prefix)
}

/// Request count for one calendar day (`YYYY-MM-DD`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyCount {
    pub date: String,
    pub count: i64,
}

/// Per-client summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageStats {
    pub api_key: String,
    pub total: i64,
    pub last_24h: i64,
    pub last_7_days: i64,
}

/// Totals across all clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GlobalStats {
    pub total_api_keys: usize,
    pub total_hits: i64,
    pub today_hits: i64,
}

pub struct UsageTracker {
    store: Arc<dyn SharedStore>,
}

impl UsageTracker {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    /// Count one processed request for `key`.
    pub async fn record_usage(&self, key: &str) -> Result<()> {
        self.record_usage_at(key, Utc::now()).await
    }

    pub async fn record_usage_at(&self, key: &str, now: DateTime<Utc>) -> Result<()> {
        self.store.incr(&total_key(key)).await?;

        let day = daily_key(key, now);
        self.store.incr(&day).await?;
        self.store.expire(&day, DAILY_TTL).await?;

        let hour = hourly_key(key, now);
        self.store.incr(&hour).await?;
        self.store.expire(&hour, HOURLY_TTL).await?;
        Ok(())
    }

    /// Lifetime request count.
    pub async fn usage(&self, key: &str) -> Result<i64> {
        self.counter(&total_key(key)).await
    }

    pub async fn daily_usage(&self, key: &str, date: DateTime<Utc>) -> Result<i64> {
        self.counter(&daily_key(key, date)).await
    }

    pub async fn last_24_hours_usage(&self, key: &str) -> Result<i64> {
        self.last_24_hours_usage_at(key, Utc::now()).await
    }

    /// Sum of the current hour bucket and the 23 before it.
    pub async fn last_24_hours_usage_at(&self, key: &str, now: DateTime<Utc>) -> Result<i64> {
        let mut total = 0;
        for i in 0..24 {
            let at = now - ChronoDuration::hours(i);
            total += self.counter(&hourly_key(key, at)).await?;
        }
        Ok(total)
    }

    pub async fn last_7_days_usage(&self, key: &str) -> Result<i64> {
        self.last_7_days_usage_at(key, Utc::now()).await
    }

    /// Sum of today's bucket and the six days before it.
    pub async fn last_7_days_usage_at(&self, key: &str, now: DateTime<Utc>) -> Result<i64> {
        let mut total = 0;
        for i in 0..7 {
            let at = now - ChronoDuration::days(i);
            total += self.counter(&daily_key(key, at)).await?;
        }
        Ok(total)
    }

    pub async fn daily_breakdown(&self, key: &str, days: u32) -> Result<Vec<DailyCount>> {
        self.daily_breakdown_at(key, days, Utc::now()).await
    }

    /// Per-day counts for the last `days` days, oldest first.
    pub async fn daily_breakdown_at(
        &self,
        key: &str,
        days: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<DailyCount>> {
        let mut breakdown = Vec::with_capacity(days as usize);
        for i in (0..i64::from(days)).rev() {
            let at = now - ChronoDuration::days(i);
            breakdown.push(DailyCount {
                date: at.format("%Y-%m-%d").to_string(),
                count: self.counter(&daily_key(key, at)).await?,
            });
        }
        Ok(breakdown)
    }

    pub async fn global_daily_breakdown(&self, days: u32) -> Result<Vec<DailyCount>> {
        self.global_daily_breakdown_at(days, Utc::now()).await
    }

    /// Per-day counts across every client, oldest first.
    pub async fn global_daily_breakdown_at(
        &self,
        days: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<DailyCount>> {
        let mut breakdown = Vec::with_capacity(days as usize);
        for i in (0..i64::from(days)).rev() {
            let at = now - ChronoDuration::days(i);
            let pattern = format!("usage:daily:*:{}", at.format("%Y%m%d"));
            breakdown.push(DailyCount {
                date: at.format("%Y-%m-%d").to_string(),
                count: self.sum_matching(&pattern).await?,
            });
        }
        Ok(breakdown)
    }

    pub async fn global_stats(&self) -> Result<GlobalStats> {
        self.global_stats_at(Utc::now()).await
    }

    pub async fn global_stats_at(&self, now: DateTime<Utc>) -> Result<GlobalStats> {
        let keys = self.store.keys("usage:total:*").await?;
        let mut total_hits = 0;
        for k in &keys {
            total_hits += self.counter(k).await?;
        }
        let today = format!("usage:daily:*:{}", now.format("%Y%m%d"));
        Ok(GlobalStats {
            total_api_keys: keys.len(),
            total_hits,
            today_hits: self.sum_matching(&today).await?,
        })
    }

    pub async fn usage_stats(&self, keys: &[String]) -> Result<Vec<UsageStats>> {
        let now = Utc::now();
        let mut stats = Vec::with_capacity(keys.len());
        for key in keys {
            stats.push(UsageStats {
                api_key: mask_key(key),
                total: self.usage(key).await?,
                last_24h: self.last_24_hours_usage_at(key, now).await?,
                last_7_days: self.last_7_days_usage_at(key, now).await?,
            });
        }
        Ok(stats)
    }

    /// First client key (in sort order) starting with `prefix` that has any usage.
    pub async fn find_key(&self, prefix: &str) -> Result<Option<String>> {
        let pattern = format!("{}*", total_key(prefix));
        let mut keys = self.store.keys(&pattern).await?;
        keys.sort();
        Ok(keys
            .into_iter()
            .next()
            .and_then(|k| k.strip_prefix("usage:total:").map(str::to_string)))
    }

    async fn counter(&self, key: &str) -> Result<i64> {
        Ok(self.store.get_counter(key).await?.unwrap_or(0))
    }

    async fn sum_matching(&self, pattern: &str) -> Result<i64> {
        let mut total = 0;
        for k in self.store.keys(pattern).await? {
            total += self.counter(&k).await?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use external_services::MemoryStore;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn tracker() -> (UsageTracker, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (UsageTracker::new(store.clone()), store)
    }

    #[test]
    fn test_key_layout() {
        let t = at(2024, 3, 5, 7);
        assert_eq!(daily_key("k", t), "usage:daily:k:20240305");
        assert_eq!(hourly_key("k", t), "usage:hourly:k:2024030507");
        assert_eq!(mask_key("abcdefghijklmnop"), "abcdefghijkl...");
        assert_eq!(mask_key("short"), "short...");
    }

    #[tokio::test]
    async fn test_usage_over_two_days() {
        let (usage, _) = tracker();
        let day1 = at(2024, 3, 4, 10);
        let day2 = at(2024, 3, 5, 9);
        for _ in 0..3 {
            usage.record_usage_at("k1", day1).await.unwrap();
        }
        for _ in 0..2 {
            usage.record_usage_at("k1", day2).await.unwrap();
        }

        assert_eq!(usage.usage("k1").await.unwrap(), 5);
        assert_eq!(usage.last_7_days_usage_at("k1", day2).await.unwrap(), 5);
        let d1 = usage.daily_usage("k1", day1).await.unwrap();
        let d2 = usage.daily_usage("k1", day2).await.unwrap();
        assert_eq!((d1, d2), (3, 2));
        assert_eq!(d1 + d2, 5);

        // 23 hours span both days' buckets
        assert_eq!(usage.last_24_hours_usage_at("k1", day2).await.unwrap(), 5);
        // Two hours later the day-1 bucket has left the 24 hour range
        let later = at(2024, 3, 5, 11);
        assert_eq!(usage.last_24_hours_usage_at("k1", later).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_bucket_ttls() {
        let (usage, store) = tracker();
        let t = at(2024, 3, 5, 7);
        usage.record_usage_at("k1", t).await.unwrap();

        assert!(store.ttl("usage:total:k1").is_none());
        let daily = store.ttl("usage:daily:k1:20240305").unwrap();
        assert!(daily > Duration::from_secs(7 * 24 * 3600) && daily <= DAILY_TTL);
        let hourly = store.ttl("usage:hourly:k1:2024030507").unwrap();
        assert!(hourly > Duration::from_secs(24 * 3600) && hourly <= HOURLY_TTL);
    }

    #[tokio::test]
    async fn test_daily_breakdown_oldest_first() {
        let (usage, _) = tracker();
        let now = at(2024, 3, 5, 12);
        usage.record_usage_at("k1", at(2024, 3, 3, 1)).await.unwrap();
        usage.record_usage_at("k1", now).await.unwrap();
        usage.record_usage_at("k1", now).await.unwrap();

        let breakdown = usage.daily_breakdown_at("k1", 3, now).await.unwrap();
        assert_eq!(
            breakdown,
            vec![
                DailyCount { date: "2024-03-03".to_string(), count: 1 },
                DailyCount { date: "2024-03-04".to_string(), count: 0 },
                DailyCount { date: "2024-03-05".to_string(), count: 2 },
            ]
        );
    }

    #[tokio::test]
    async fn test_global_views() {
        let (usage, _) = tracker();
        let now = at(2024, 3, 5, 12);
        let yesterday = at(2024, 3, 4, 12);
        usage.record_usage_at("alpha", now).await.unwrap();
        usage.record_usage_at("beta", now).await.unwrap();
        usage.record_usage_at("beta", yesterday).await.unwrap();

        let stats = usage.global_stats_at(now).await.unwrap();
        assert_eq!(
            stats,
            GlobalStats {
                total_api_keys: 2,
                total_hits: 3,
                today_hits: 2
            }
        );

        let breakdown = usage.global_daily_breakdown_at(2, now).await.unwrap();
        assert_eq!(breakdown[0].count, 1);
        assert_eq!(breakdown[1].count, 2);
    }

    #[tokio::test]
    async fn test_usage_stats_and_lookup() {
        let (usage, _) = tracker();
        usage.record_usage("p4ai_0123456789abcdef").await.unwrap();

        let stats = usage
            .usage_stats(&["p4ai_0123456789abcdef".to_string()])
            .await
            .unwrap();
        assert_eq!(stats[0].api_key, "p4ai_0123456...");
        assert_eq!(stats[0].total, 1);
        assert_eq!(stats[0].last_24h, 1);
        assert_eq!(stats[0].last_7_days, 1);

        assert_eq!(
            usage.find_key("p4ai_0123").await.unwrap(),
            Some("p4ai_0123456789abcdef".to_string())
        );
        assert_eq!(usage.find_key("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_buckets_read_zero() {
        let (usage, _) = tracker();
        assert_eq!(usage.usage("ghost").await.unwrap(), 0);
        assert_eq!(usage.last_7_days_usage("ghost").await.unwrap(), 0);
        assert!(usage.global_daily_breakdown(3).await.unwrap().iter().all(|d| d.count == 0));
    }
}
