//! Concurrency domains and the domain-hop optimizer.
//!
//! A [`Domain`] is an explicit tag threaded through every resolution. The
//! optimizer only observes: it counts which domain asks for which type and
//! how long hand-offs into a type's home domain take, and turns that into
//! [`OptimizationSuggestion`]s. Nothing here changes how resolution behaves
//! until the caller applies a suggestion.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, VecDeque},
    fmt,
    time::Duration,
};
use tracing::debug;

use crate::{config::OptimizerConfig, graph::mean_duration, identity::TypeIdentity};

/// Execution domain a resolution originates from or is pinned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Domain {
    /// The single-threaded, UI-affine domain.
    Main,
    /// A background worker domain.
    Background(u16),
}

impl Default for Domain {
    fn default() -> Self {
        Domain::Main
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Domain::Main => f.write_str("main"),
            Domain::Background(n) => write!(f, "background-{n}"),
        }
    }
}

/// Runs construction work inside a domain.
pub trait DomainExecutor: Send + Sync + 'static {
    fn execute(&self, task: BoxFuture<'static, ()>);
}

impl DomainExecutor for tokio::runtime::Handle {
    fn execute(&self, task: BoxFuture<'static, ()>) {
        drop(self.spawn(task));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuggestionKind {
    /// Construct the type in `domain`, where most requests come from.
    PinToDomain,
    /// Serve the type from the per-domain fast-path cache.
    FastPath,
}

/// Advisory output of the optimizer.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationSuggestion {
    pub identity: TypeIdentity,
    pub kind: SuggestionKind,
    pub domain: Domain,
    /// Share of recent resolutions requested from `domain`.
    pub share: f64,
    pub average_hop: Duration,
    pub samples: usize,
}

impl fmt::Display for OptimizationSuggestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SuggestionKind::PinToDomain => write!(
                f,
                "pin {} to {} ({:.0}% of {} recent resolutions, avg hop {:?})",
                self.identity,
                self.domain,
                self.share * 100.0,
                self.samples,
                self.average_hop
            ),
            SuggestionKind::FastPath => write!(
                f,
                "serve {} from the {} fast path ({:.0}% of {} recent resolutions)",
                self.identity,
                self.domain,
                self.share * 100.0,
                self.samples
            ),
        }
    }
}

/// What the optimizer needs to know about a type besides its observations.
#[derive(Debug, Clone, Copy, Default)]
pub struct TypeProfile {
    /// Domain construction currently runs in, if any.
    pub home: Option<Domain>,
    /// Whether the type is singleton scoped (eligible for the fast path).
    pub singleton: bool,
    pub fast_path_enabled_in: Option<Domain>,
}

#[derive(Debug, Default, Clone)]
struct HopCounters {
    hops: u64,
    total_hop: Duration,
}

#[derive(Debug, Default)]
struct DomainUsage {
    recent: VecDeque<Domain>,
    total: u64,
    per_domain: HashMap<Domain, u64>,
    hops: HopCounters,
}

impl DomainUsage {
    fn record(&mut self, domain: Domain, hop: Option<Duration>, window: usize) {
        self.recent.push_back(domain);
        while self.recent.len() > window {
            self.recent.pop_front();
        }
        self.total += 1;
        *self.per_domain.entry(domain).or_default() += 1;

        if let Some(hop) = hop {
            self.hops.hops += 1;
            self.hops.total_hop += hop;
        }
    }

    /// Dominant domain over the recent window with its share.
    fn dominant(&self) -> Option<(Domain, f64)> {
        let mut counts: HashMap<Domain, usize> = HashMap::new();
        for domain in &self.recent {
            *counts.entry(*domain).or_default() += 1;
        }
        counts
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
            .map(|(domain, count)| (domain, count as f64 / self.recent.len() as f64))
    }

    fn average_hop(&self) -> Duration {
        mean_duration(self.hops.total_hop, self.hops.hops)
    }
}

/// Per-domain resolution counts of one type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DomainUsageReport {
    pub total: u64,
    pub per_domain: HashMap<Domain, u64>,
    pub hops: u64,
    pub average_hop: Duration,
}

/// Classifies types by requesting domain and hop cost.
pub struct DomainHopOptimizer {
    usage: HashMap<TypeIdentity, DomainUsage>,
    config: OptimizerConfig,
}

impl DomainHopOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self {
            usage: HashMap::new(),
            config,
        }
    }

    /// Record one resolution of `identity` requested from `domain`.
    pub fn record(&mut self, identity: TypeIdentity, domain: Domain, hop: Option<Duration>) {
        let window = self.config.window;
        self.usage
            .entry(identity)
            .or_default()
            .record(domain, hop, window);
    }

    pub fn usage(&self, identity: TypeIdentity) -> Option<DomainUsageReport> {
        self.usage.get(&identity).map(|usage| DomainUsageReport {
            total: usage.total,
            per_domain: usage.per_domain.clone(),
            hops: usage.hops.hops,
            average_hop: usage.average_hop(),
        })
    }

    pub fn suggest(&self, identity: TypeIdentity, profile: TypeProfile) -> Option<OptimizationSuggestion> {
        let usage = self.usage.get(&identity)?;
        let samples = usage.recent.len();
        if samples < self.config.min_samples {
            return None;
        }

        let (domain, share) = usage.dominant()?;
        if share < self.config.dominance_ratio {
            return None;
        }

        let average_hop = usage.average_hop();
        let suggestion = |kind| OptimizationSuggestion {
            identity,
            kind,
            domain,
            share,
            average_hop,
            samples,
        };

        if let Some(home) = profile.home {
            if home != domain && average_hop >= self.config.hop_overhead_threshold() {
                debug!(
                    identity = %identity,
                    from = %home,
                    to = %domain,
                    "domain pin suggested"
                );
                return Some(suggestion(SuggestionKind::PinToDomain));
            }
            if home != domain {
                return None;
            }
        }

        let hot = usage.total >= self.config.hot_threshold;
        if hot && profile.singleton && profile.fast_path_enabled_in != Some(domain) {
            return Some(suggestion(SuggestionKind::FastPath));
        }

        None
    }

    pub fn suggestions<F>(&self, profile_of: F) -> Vec<OptimizationSuggestion>
    where
        F: Fn(TypeIdentity) -> TypeProfile,
    {
        let mut identities: Vec<_> = self.usage.keys().copied().collect();
        identities.sort();
        identities
            .into_iter()
            .filter_map(|identity| self.suggest(identity, profile_of(identity)))
            .collect()
    }

    pub fn clear(&mut self) {
        self.usage.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Renderer;
    struct Parser;

    fn config() -> OptimizerConfig {
        OptimizerConfig {
            window: 10,
            min_samples: 5,
            dominance_ratio: 0.8,
            hop_overhead_threshold_us: 100,
            hot_threshold: 20,
        }
    }

    fn home(domain: Domain) -> TypeProfile {
        TypeProfile {
            home: Some(domain),
            singleton: true,
            fast_path_enabled_in: None,
        }
    }

    #[test]
    fn no_suggestion_below_min_samples() {
        let mut optimizer = DomainHopOptimizer::new(config());
        let id = TypeIdentity::of::<Renderer>();
        for _ in 0..4 {
            optimizer.record(id, Domain::Background(1), Some(Duration::from_millis(1)));
        }
        assert_eq!(optimizer.suggest(id, home(Domain::Main)), None);
    }

    #[test]
    fn suggests_pin_when_dominant_domain_pays_hops() {
        let mut optimizer = DomainHopOptimizer::new(config());
        let id = TypeIdentity::of::<Renderer>();
        for _ in 0..9 {
            optimizer.record(id, Domain::Background(1), Some(Duration::from_millis(1)));
        }
        optimizer.record(id, Domain::Main, None);

        let suggestion = optimizer.suggest(id, home(Domain::Main)).expect("suggestion");
        assert_eq!(suggestion.kind, SuggestionKind::PinToDomain);
        assert_eq!(suggestion.domain, Domain::Background(1));
        assert!((suggestion.share - 0.9).abs() < f64::EPSILON);
        assert_eq!(suggestion.samples, 10);
    }

    #[test]
    fn cheap_hops_do_not_justify_pinning() {
        let mut optimizer = DomainHopOptimizer::new(config());
        let id = TypeIdentity::of::<Renderer>();
        for _ in 0..10 {
            optimizer.record(id, Domain::Background(1), Some(Duration::from_micros(5)));
        }
        assert_eq!(optimizer.suggest(id, home(Domain::Main)), None);
    }

    #[test]
    fn mixed_domains_are_not_dominant() {
        let mut optimizer = DomainHopOptimizer::new(config());
        let id = TypeIdentity::of::<Parser>();
        for i in 0..10 {
            let domain = if i % 2 == 0 { Domain::Main } else { Domain::Background(2) };
            optimizer.record(id, domain, Some(Duration::from_millis(1)));
        }
        assert_eq!(optimizer.suggest(id, home(Domain::Main)), None);
    }

    #[test]
    fn window_only_counts_recent_resolutions() {
        let mut optimizer = DomainHopOptimizer::new(config());
        let id = TypeIdentity::of::<Parser>();
        for _ in 0..50 {
            optimizer.record(id, Domain::Main, None);
        }
        for _ in 0..10 {
            optimizer.record(id, Domain::Background(3), Some(Duration::from_millis(2)));
        }

        let suggestion = optimizer.suggest(id, home(Domain::Main)).expect("suggestion");
        assert_eq!(suggestion.domain, Domain::Background(3));
        assert!((suggestion.share - 1.0).abs() < f64::EPSILON);

        let usage = optimizer.usage(id).expect("usage");
        assert_eq!(usage.total, 60);
        assert_eq!(usage.per_domain[&Domain::Main], 50);
        assert_eq!(usage.hops, 10);
    }

    #[test]
    fn hot_singleton_without_home_gets_fast_path() {
        let mut optimizer = DomainHopOptimizer::new(config());
        let id = TypeIdentity::of::<Parser>();
        for _ in 0..25 {
            optimizer.record(id, Domain::Background(1), None);
        }

        let profile = TypeProfile {
            home: None,
            singleton: true,
            fast_path_enabled_in: None,
        };
        let suggestion = optimizer.suggest(id, profile).expect("suggestion");
        assert_eq!(suggestion.kind, SuggestionKind::FastPath);

        let applied = TypeProfile {
            fast_path_enabled_in: Some(Domain::Background(1)),
            ..profile
        };
        assert_eq!(optimizer.suggest(id, applied), None);

        let transient = TypeProfile {
            singleton: false,
            ..profile
        };
        assert_eq!(optimizer.suggest(id, transient), None);
    }

    #[test]
    fn average_hop_survives_counts_past_u32() {
        let usage = DomainUsage {
            hops: HopCounters {
                hops: 1 << 32,
                total_hop: Duration::from_micros(250) * 4 * (1 << 30),
            },
            ..DomainUsage::default()
        };
        assert_eq!(usage.average_hop(), Duration::from_micros(250));
        assert_eq!(DomainUsage::default().average_hop(), Duration::ZERO);
    }
}
