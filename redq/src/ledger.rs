use std::{collections::HashMap, hash::Hash};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 3600;

/// Running totals for one identity between two flushes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct UsageStat {
    pub ingress: u64,
    pub egress: u64,
    /// Bytes seen in the most recent drain only.
    pub ingress_rate: u64,
    pub egress_rate: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl UsageStat {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            ingress: 0,
            egress: 0,
            ingress_rate: 0,
            egress_rate: 0,
            first_seen: now,
            last_seen: now,
        }
    }
}

/// A flushed usage window, ready to be handed to whatever stores reports.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct UsageRecord<K> {
    pub key: K,
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub ingress: u64,
    pub egress: u64,
}

/// Folds periodic table drains into per-identity windows.
///
/// A window closes once its identity has been idle for `idle_timeout`, or
/// once it has been open for `flush_interval` even if traffic continues.
pub struct UsageLedger<K> {
    entries: HashMap<K, UsageStat>,
    idle_timeout: TimeDelta,
    flush_interval: TimeDelta,
}

impl<K: Copy + Eq + Hash> UsageLedger<K> {
    pub fn new(idle_timeout: TimeDelta, flush_interval: TimeDelta) -> Self {
        Self {
            entries: HashMap::new(),
            idle_timeout,
            flush_interval,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &K) -> Option<&UsageStat> {
        self.entries.get(key)
    }

    /// Adds one drain of both tables. Rates of every identity are reset first,
    /// so an identity absent from this drain reports zero for the interval.
    pub fn absorb(&mut self, ingress: &[(K, u64)], egress: &[(K, u64)], now: DateTime<Utc>) {
        for stat in self.entries.values_mut() {
            stat.ingress_rate = 0;
            stat.egress_rate = 0;
        }

        for &(key, bytes) in ingress.iter().filter(|(_, bytes)| *bytes != 0) {
            let stat = self.entries.entry(key).or_insert_with(|| UsageStat::new(now));
            stat.ingress = stat.ingress.wrapping_add(bytes);
            stat.ingress_rate = stat.ingress_rate.wrapping_add(bytes);
            stat.last_seen = now;
        }
        for &(key, bytes) in egress.iter().filter(|(_, bytes)| *bytes != 0) {
            let stat = self.entries.entry(key).or_insert_with(|| UsageStat::new(now));
            stat.egress = stat.egress.wrapping_add(bytes);
            stat.egress_rate = stat.egress_rate.wrapping_add(bytes);
            stat.last_seen = now;
        }
    }

    fn expired(&self, stat: &UsageStat, now: DateTime<Utc>) -> bool {
        now - stat.last_seen > self.idle_timeout || now - stat.first_seen > self.flush_interval
    }

    pub fn take_expired(&mut self, now: DateTime<Utc>) -> Vec<UsageRecord<K>> {
        let keys: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, stat)| self.expired(stat, now))
            .map(|(key, _)| *key)
            .collect();
        keys.into_iter()
            .filter_map(|key| self.entries.remove(&key).map(|stat| record(key, stat)))
            .collect()
    }

    pub fn take_all(&mut self) -> Vec<UsageRecord<K>> {
        self.entries
            .drain()
            .map(|(key, stat)| record(key, stat))
            .collect()
    }

    /// Identities with traffic in the most recent drain, busiest first.
    pub fn top_rates(&self, limit: usize) -> Vec<(K, u64, u64)> {
        let mut rates: Vec<(K, u64, u64)> = self
            .entries
            .iter()
            .filter(|(_, stat)| stat.ingress_rate != 0 || stat.egress_rate != 0)
            .map(|(key, stat)| (*key, stat.ingress_rate, stat.egress_rate))
            .collect();
        rates.sort_unstable_by_key(|(_, ingress, egress)| {
            std::cmp::Reverse(ingress.saturating_add(*egress))
        });
        rates.truncate(limit);
        rates
    }
}

fn record<K>(key: K, stat: UsageStat) -> UsageRecord<K> {
    UsageRecord {
        key,
        start: stat.first_seen,
        stop: stat.last_seen,
        ingress: stat.ingress,
        egress: stat.egress,
    }
}
