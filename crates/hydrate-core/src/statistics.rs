//! Load and cache statistics.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Hit/miss/put counters of one cache region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionStatistics {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
}

/// Point-in-time copy of [`Statistics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    /// Entities hydrated from a result set.
    pub entity_loads: u64,
    /// Load statements executed on behalf of a single entity or batch.
    pub entity_fetches: u64,
    pub prepared_statements: u64,
    pub closed_statements: u64,
    pub second_level_cache_hits: u64,
    pub second_level_cache_misses: u64,
    pub second_level_cache_puts: u64,
    pub optimistic_failures: u64,
    pub regions: HashMap<String, RegionStatistics>,
}

/// Factory-wide counters. Nothing is recorded while disabled.
#[derive(Debug, Default)]
pub struct Statistics {
    enabled: AtomicBool,
    entity_loads: AtomicU64,
    entity_fetches: AtomicU64,
    prepared_statements: AtomicU64,
    closed_statements: AtomicU64,
    second_level_cache_hits: AtomicU64,
    second_level_cache_misses: AtomicU64,
    second_level_cache_puts: AtomicU64,
    optimistic_failures: AtomicU64,
    regions: Mutex<HashMap<String, RegionStatistics>>,
}

impl Statistics {
    pub fn new(enabled: bool) -> Self {
        let stats = Self::default();
        stats.enabled.store(enabled, Ordering::Relaxed);
        stats
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn bump(&self, counter: &AtomicU64) {
        if self.is_enabled() {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn bump_region(&self, region: &str, update: impl FnOnce(&mut RegionStatistics)) {
        if !self.is_enabled() {
            return;
        }
        let mut regions = self.regions.lock().unwrap_or_else(PoisonError::into_inner);
        update(regions.entry(region.to_string()).or_default());
    }

    pub fn entity_loaded(&self) {
        self.bump(&self.entity_loads);
    }

    pub fn entity_fetched(&self) {
        self.bump(&self.entity_fetches);
    }

    pub fn statement_prepared(&self) {
        self.bump(&self.prepared_statements);
    }

    pub fn statement_closed(&self) {
        self.bump(&self.closed_statements);
    }

    pub fn second_level_cache_hit(&self, region: &str) {
        self.bump(&self.second_level_cache_hits);
        self.bump_region(region, |r| r.hits += 1);
    }

    pub fn second_level_cache_miss(&self, region: &str) {
        self.bump(&self.second_level_cache_misses);
        self.bump_region(region, |r| r.misses += 1);
    }

    pub fn second_level_cache_put(&self, region: &str) {
        self.bump(&self.second_level_cache_puts);
        self.bump_region(region, |r| r.puts += 1);
    }

    pub fn optimistic_failure(&self) {
        self.bump(&self.optimistic_failures);
    }

    pub fn region(&self, region: &str) -> RegionStatistics {
        self.regions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(region)
            .copied()
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            entity_loads: self.entity_loads.load(Ordering::Relaxed),
            entity_fetches: self.entity_fetches.load(Ordering::Relaxed),
            prepared_statements: self.prepared_statements.load(Ordering::Relaxed),
            closed_statements: self.closed_statements.load(Ordering::Relaxed),
            second_level_cache_hits: self.second_level_cache_hits.load(Ordering::Relaxed),
            second_level_cache_misses: self.second_level_cache_misses.load(Ordering::Relaxed),
            second_level_cache_puts: self.second_level_cache_puts.load(Ordering::Relaxed),
            optimistic_failures: self.optimistic_failures.load(Ordering::Relaxed),
            regions: self
                .regions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    pub fn clear(&self) {
        for counter in [
            &self.entity_loads,
            &self.entity_fetches,
            &self.prepared_statements,
            &self.closed_statements,
            &self.second_level_cache_hits,
            &self.second_level_cache_misses,
            &self.second_level_cache_puts,
            &self.optimistic_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.regions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
