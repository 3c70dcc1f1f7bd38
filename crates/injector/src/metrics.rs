//! Container-wide counters and resolution latency percentiles.

use std::{
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};

use crate::events::ResolutionOutcome;

#[derive(Default)]
struct AtomicCounters {
    resolutions: AtomicU64,
    constructions: AtomicU64,
    cache_hits: AtomicU64,
    fast_path_hits: AtomicU64,
    fallbacks: AtomicU64,
    failures: AtomicU64,
    registrations: AtomicU64,
}

impl AtomicCounters {
    fn reset(&self) {
        for counter in [
            &self.resolutions,
            &self.constructions,
            &self.cache_hits,
            &self.fast_path_hits,
            &self.fallbacks,
            &self.failures,
            &self.registrations,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Recent resolution latencies in a fixed ring, recorded without locking.
///
/// Slots hold `nanos + 1`; zero marks a slot not yet written. Writers claim
/// slots round-robin, so the window is the most recent `capacity` samples.
struct LatencyWindow {
    slots: Box<[AtomicU64]>,
    cursor: AtomicUsize,
    /// All-time minimum in nanos, `u64::MAX` when empty.
    min: AtomicU64,
    /// All-time maximum as `nanos + 1`, zero when empty.
    max: AtomicU64,
}

fn nanos(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_nanos()).map_or(u64::MAX - 1, |nanos| nanos.min(u64::MAX - 1))
}

impl LatencyWindow {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity.max(1)).map(|_| AtomicU64::new(0)).collect(),
            cursor: AtomicUsize::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
        }
    }

    fn record(&self, elapsed: Duration) {
        let nanos = nanos(elapsed);
        self.min.fetch_min(nanos, Ordering::Relaxed);
        self.max.fetch_max(nanos + 1, Ordering::Relaxed);

        let slot = self.cursor.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        self.slots[slot].store(nanos + 1, Ordering::Relaxed);
    }

    fn percentiles(&self) -> LatencyPercentiles {
        let mut sorted: Vec<Duration> = self
            .slots
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .filter(|stored| *stored != 0)
            .map(|stored| Duration::from_nanos(stored - 1))
            .collect();
        if sorted.is_empty() {
            return LatencyPercentiles::default();
        }
        sorted.sort_unstable();
        let at = |percentile: f64| {
            let index = (sorted.len() as f64 * percentile / 100.0) as usize;
            sorted.get(index.min(sorted.len() - 1)).copied()
        };

        let min = self.min.load(Ordering::Relaxed);
        let max = self.max.load(Ordering::Relaxed);
        LatencyPercentiles {
            p50: at(50.0),
            p95: at(95.0),
            p99: at(99.0),
            min: (min != u64::MAX).then(|| Duration::from_nanos(min)),
            max: (max != 0).then(|| Duration::from_nanos(max - 1)),
            samples: sorted.len(),
        }
    }

    fn clear(&self) {
        for slot in self.slots.iter() {
            slot.store(0, Ordering::Relaxed);
        }
        self.cursor.store(0, Ordering::Relaxed);
        self.min.store(u64::MAX, Ordering::Relaxed);
        self.max.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatencyPercentiles {
    pub p50: Option<Duration>,
    pub p95: Option<Duration>,
    pub p99: Option<Duration>,
    pub min: Option<Duration>,
    pub max: Option<Duration>,
    pub samples: usize,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub resolutions: u64,
    pub constructions: u64,
    pub cache_hits: u64,
    pub fast_path_hits: u64,
    pub fallbacks: u64,
    pub failures: u64,
    pub registrations: u64,
    pub latency: LatencyPercentiles,
}

impl MetricsSnapshot {
    /// Share of successful resolutions served without constructing.
    pub fn hit_rate(&self) -> f64 {
        if self.resolutions == 0 {
            0.0
        } else {
            (self.cache_hits + self.fast_path_hits) as f64 / self.resolutions as f64
        }
    }
}

pub struct ContainerMetrics {
    counters: AtomicCounters,
    latency: LatencyWindow,
}

impl ContainerMetrics {
    pub fn new(latency_window: usize) -> Self {
        Self {
            counters: AtomicCounters::default(),
            latency: LatencyWindow::new(latency_window),
        }
    }

    pub fn record_resolution(&self, outcome: ResolutionOutcome, elapsed: Duration) {
        self.counters.resolutions.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            ResolutionOutcome::Constructed => &self.counters.constructions,
            ResolutionOutcome::CacheHit => &self.counters.cache_hits,
            ResolutionOutcome::FastPathHit => &self.counters.fast_path_hits,
            ResolutionOutcome::Fallback => &self.counters.fallbacks,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.latency.record(elapsed);
    }

    pub fn record_failure(&self) {
        self.counters.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_registration(&self, count: u64) {
        self.counters.registrations.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            resolutions: load(&self.counters.resolutions),
            constructions: load(&self.counters.constructions),
            cache_hits: load(&self.counters.cache_hits),
            fast_path_hits: load(&self.counters.fast_path_hits),
            fallbacks: load(&self.counters.fallbacks),
            failures: load(&self.counters.failures),
            registrations: load(&self.counters.registrations),
            latency: self.latency.percentiles(),
        }
    }

    pub fn reset(&self) {
        self.counters.reset();
        self.latency.clear();
    }
}
