//! The container: published registration store, scope context, caches,
//! bootstrap and diagnostics.
//!
//! [`Container`] is a cheap `Clone` handle. All writers (bootstrap, live
//! registration, teardown) are serialized and publish a complete
//! [`RegistrationStore`] with one pointer swap; readers only ever clone the
//! current `Arc`.

use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::{
    collections::{HashMap, HashSet},
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, error, info, warn};

use crate::{
    cache::{CacheEntrySnapshot, ScopeCache},
    config::ContainerConfiguration,
    domain::{
        Domain, DomainExecutor, DomainHopOptimizer, DomainUsageReport, OptimizationSuggestion,
        SuggestionKind, TypeProfile,
    },
    errors::DiError,
    events::{EventSink, ResolutionEvent},
    graph::{CircularDependencyRecord, DependencyGraph, DependencyGraphSnapshot, UsageStats},
    hot_path::FastPathCache,
    identity::{InjectionKey, TypeIdentity},
    lazy::Lazy,
    logging::LogVerbosity,
    metrics::{ContainerMetrics, LatencyPercentiles, MetricsSnapshot},
    registration::{Registration, RegistrationStore},
    resolver::Resolver,
    scope::{EffectiveScope, ScopeContext, ScopeId, ScopeKind},
};

/// A registration store as seen by resolvers.
pub(crate) struct PublishedStore {
    pub(crate) registrations: RegistrationStore,
    /// Bumped by bootstrap and teardown; part of every cache key.
    pub(crate) generation: u64,
}

struct Analysis {
    graph: DependencyGraph,
    optimizer: DomainHopOptimizer,
    reported_cycles: HashSet<CircularDependencyRecord>,
}

impl Analysis {
    fn absorb(&mut self, events: Vec<ResolutionEvent>, optimization_enabled: bool) {
        for event in events {
            match event {
                ResolutionEvent::Edge { from, to, at } => self.graph.add_edge(from, to, at),
                ResolutionEvent::Resolved {
                    identity,
                    domain,
                    outcome,
                    elapsed,
                    hop,
                    at,
                } => {
                    self.graph.record_resolution(identity, outcome, elapsed, at);
                    if optimization_enabled {
                        self.optimizer.record(identity, domain, hop);
                    }
                }
                ResolutionEvent::Failed { identity, at, .. } => {
                    self.graph.record_failure(identity, at)
                }
            }
        }
    }
}

pub(crate) struct ContainerInner {
    pub(crate) config: ContainerConfiguration,
    store: RwLock<Arc<PublishedStore>>,
    writer: Mutex<()>,
    bootstrapped: AtomicBool,
    scopes: ScopeContext,
    pub(crate) cache: ScopeCache,
    pub(crate) fast_path: FastPathCache,
    affinity: DashMap<TypeIdentity, Domain>,
    executors: DashMap<Domain, Arc<dyn DomainExecutor>>,
    pub(crate) events: EventSink,
    analysis: Mutex<Analysis>,
    pub(crate) metrics: ContainerMetrics,
    degraded: DashSet<(TypeIdentity, ScopeKind)>,
}

impl ContainerInner {
    fn new(config: ContainerConfiguration) -> Self {
        Self {
            store: RwLock::new(Arc::new(PublishedStore {
                registrations: RegistrationStore::new(),
                generation: 0,
            })),
            writer: Mutex::new(()),
            bootstrapped: AtomicBool::new(false),
            scopes: ScopeContext::new(),
            cache: ScopeCache::new(),
            fast_path: FastPathCache::new(config.hot_path.clone()),
            affinity: DashMap::new(),
            executors: DashMap::new(),
            events: EventSink::new(config.diagnostics.event_buffer),
            analysis: Mutex::new(Analysis {
                graph: DependencyGraph::new(),
                optimizer: DomainHopOptimizer::new(config.optimizer.clone()),
                reported_cycles: HashSet::new(),
            }),
            metrics: ContainerMetrics::new(config.diagnostics.latency_window),
            degraded: DashSet::new(),
            config,
        }
    }

    pub(crate) fn published(&self) -> Arc<PublishedStore> {
        Arc::clone(&self.store.read())
    }

    pub(crate) fn verbosity(&self) -> LogVerbosity {
        self.config.log_level
    }

    /// Pinned domain, falling back to the domain declared at registration.
    pub(crate) fn home_domain(&self, registration: &Registration) -> Option<Domain> {
        self.affinity
            .get(&registration.identity())
            .map(|domain| *domain)
            .or_else(|| registration.home_domain())
    }

    pub(crate) fn executor(&self, domain: Domain) -> Option<Arc<dyn DomainExecutor>> {
        self.executors
            .get(&domain)
            .map(|executor| Arc::clone(executor.value()))
    }

    pub(crate) fn effective_scope(&self, registration: &Registration) -> EffectiveScope {
        let effective = self.scopes.effective(registration.scope());
        if let EffectiveScope::Uncached {
            degraded_from: Some(kind),
        } = &effective
        {
            let identity = registration.identity();
            if self.config.warn_on_scope_degradation
                && self.verbosity().errors()
                && self.degraded.insert((identity, *kind))
            {
                warn!(
                    identity = %identity,
                    scope = %kind,
                    "no current {kind} scope, resolving as transient"
                );
            }
        }
        effective
    }

    /// Hand `event` to analysis without blocking the resolution path.
    ///
    /// A full buffer is absorbed in place when the analysis lock is free;
    /// only when another thread holds it do the oldest pending events give way.
    pub(crate) fn emit(&self, event: ResolutionEvent) {
        let Some(event) = self.events.offer(event) else {
            return;
        };
        match self.analysis.try_lock() {
            Some(mut analysis) => {
                let mut events = self.events.drain();
                events.push(event);
                analysis.absorb(events, self.config.optimization_enabled);
            }
            None => self.events.record(event),
        }
    }

    fn analyze(&self) -> MutexGuard<'_, Analysis> {
        let mut analysis = self.analysis.lock();
        let events = self.events.drain();
        if !events.is_empty() {
            analysis.absorb(events, self.config.optimization_enabled);
        }
        analysis
    }

    fn profile(&self, store: &PublishedStore, identity: TypeIdentity) -> TypeProfile {
        match store.registrations.get(identity) {
            Some(registration) => TypeProfile {
                home: self.home_domain(registration),
                singleton: registration.scope() == ScopeKind::Singleton,
                fast_path_enabled_in: self.fast_path.enabled_in(identity),
            },
            None => TypeProfile::default(),
        }
    }
}

/// Dependency resolution container.
///
/// ```
/// use injector::{Container, ScopeKind};
///
/// struct Logger;
/// struct UserService {
///     logger: std::sync::Arc<Logger>,
/// }
///
/// let container = Container::new();
/// container
///     .bootstrap(|store| {
///         store.register(|_| Ok(Logger));
///         store.register_scoped(ScopeKind::Transient, |r| {
///             Ok(UserService { logger: r.resolve::<Logger>()? })
///         });
///     })
///     .unwrap();
///
/// let first = container.resolve_required::<UserService>();
/// let second = container.resolve_required::<UserService>();
/// assert!(!std::sync::Arc::ptr_eq(&first, &second));
/// assert!(std::sync::Arc::ptr_eq(&first.logger, &second.logger));
/// ```
#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

impl Container {
    pub fn new() -> Self {
        Self::with_configuration(ContainerConfiguration::default())
    }

    pub fn with_configuration(config: ContainerConfiguration) -> Self {
        if config.log_level.registrations() {
            info!(name = %config.name, log_level = %config.log_level, "container created");
        }
        Self {
            inner: Arc::new(ContainerInner::new(config)),
        }
    }

    pub fn production() -> Self {
        Self::with_configuration(ContainerConfiguration::production())
    }

    pub fn development() -> Self {
        Self::with_configuration(ContainerConfiguration::development())
    }

    pub fn minimal() -> Self {
        Self::with_configuration(ContainerConfiguration::minimal())
    }

    pub fn builder() -> ContainerBuilder {
        ContainerBuilder::new()
    }

    pub fn configuration(&self) -> &ContainerConfiguration {
        &self.inner.config
    }

    pub(crate) fn inner(&self) -> &ContainerInner {
        &self.inner
    }

    // === Registration ===

    /// Copy-on-write edit of the published store.
    ///
    /// Cached instances of every identity the edit replaced or removed are
    /// evicted. Do not resolve from this container inside `edit`.
    pub fn modify<R>(&self, edit: impl FnOnce(&mut RegistrationStore) -> R) -> R {
        let _writer = self.inner.writer.lock();
        let current = self.inner.published();
        let mut registrations = current.registrations.clone();
        let result = edit(&mut registrations);

        let changed: Vec<TypeIdentity> = current
            .registrations
            .iter()
            .map(|registration| registration.identity())
            .chain(registrations.identities())
            .collect::<HashSet<_>>()
            .into_iter()
            .filter(|identity| {
                match (current.registrations.get(*identity), registrations.get(*identity)) {
                    (Some(old), Some(new)) => !Arc::ptr_eq(old, new),
                    (None, None) => false,
                    _ => true,
                }
            })
            .collect();

        *self.inner.store.write() = Arc::new(PublishedStore {
            registrations,
            generation: current.generation,
        });

        for identity in &changed {
            self.inner.cache.evict_identity(*identity);
            self.inner.fast_path.invalidate(*identity);
        }
        self.inner.metrics.record_registration(changed.len() as u64);

        if self.inner.verbosity().registrations() {
            for identity in &changed {
                info!(identity = %identity, "registration updated");
            }
        }
        result
    }

    /// Register `T` as a singleton.
    pub fn register<T, F>(&self, factory: F) -> Arc<Registration>
    where
        T: Send + Sync + 'static,
        F: Fn(&Resolver) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.modify(|store| store.register(factory))
    }

    pub fn register_scoped<T, F>(&self, scope: ScopeKind, factory: F) -> Arc<Registration>
    where
        T: Send + Sync + 'static,
        F: Fn(&Resolver) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.modify(|store| store.register_scoped(scope, factory))
    }

    pub fn register_shared<T, F>(&self, scope: ScopeKind, factory: F) -> Arc<Registration>
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&Resolver) -> anyhow::Result<Arc<T>> + Send + Sync + 'static,
    {
        self.modify(|store| store.register_shared(scope, factory))
    }

    pub fn register_async<T, F, Fut>(&self, scope: ScopeKind, factory: F) -> Arc<Registration>
    where
        T: Send + Sync + 'static,
        F: Fn(Resolver) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.modify(|store| store.register_async(scope, factory))
    }

    pub fn register_instance<T: Send + Sync + 'static>(&self, value: T) -> Arc<Registration> {
        self.modify(|store| store.register_instance(value))
    }

    pub fn register_fallback<T, F>(&self, fallback: F) -> Arc<Registration>
    where
        T: Send + Sync + 'static,
        F: Fn(&Resolver) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.modify(|store| store.register_fallback(fallback))
    }

    pub fn register_key<K, F>(&self, scope: ScopeKind, factory: F) -> Arc<Registration>
    where
        K: InjectionKey,
        F: Fn(&Resolver) -> anyhow::Result<Arc<K::Value>> + Send + Sync + 'static,
    {
        self.modify(|store| store.register_key::<K, F>(scope, factory))
    }

    pub fn is_registered<T: ?Sized + 'static>(&self) -> bool {
        self.contains(TypeIdentity::of::<T>())
    }

    pub fn contains(&self, identity: TypeIdentity) -> bool {
        self.inner.published().registrations.contains(identity)
    }

    pub fn registration(&self, identity: TypeIdentity) -> Option<Arc<Registration>> {
        self.inner.published().registrations.get(identity).cloned()
    }

    /// Identities of the currently published store, sorted.
    pub fn registrations(&self) -> Vec<TypeIdentity> {
        self.inner.published().registrations.identities()
    }

    pub fn registration_count(&self) -> usize {
        self.inner.published().registrations.len()
    }

    /// Generation of the published store, bumped by every bootstrap and teardown.
    pub fn generation(&self) -> u64 {
        self.inner.published().generation
    }

    // === Bootstrap ===

    /// Build a fresh store with `configure` and publish it, replacing the
    /// current one entirely.
    pub fn bootstrap<F>(&self, configure: F) -> Result<(), DiError>
    where
        F: FnOnce(&mut RegistrationStore),
    {
        let mut registrations = RegistrationStore::new();
        configure(&mut registrations);

        let writer = self.inner.writer.lock();
        self.publish(&writer, registrations)
    }

    /// Bootstrap unless a bootstrap already published a store.
    ///
    /// `configure` runs while other writers are held off, so it runs at most
    /// once even when called concurrently.
    pub fn bootstrap_if_needed<F>(&self, configure: F) -> Result<bool, DiError>
    where
        F: FnOnce(&mut RegistrationStore),
    {
        let writer = self.inner.writer.lock();
        if self.inner.bootstrapped.load(Ordering::Acquire) {
            return Ok(false);
        }

        let mut registrations = RegistrationStore::new();
        configure(&mut registrations);
        self.publish(&writer, registrations)?;
        Ok(true)
    }

    /// Async bootstrap. On failure the previous store stays published.
    pub async fn bootstrap_async<F, Fut>(&self, configure: F) -> bool
    where
        F: FnOnce(RegistrationStore) -> Fut,
        Fut: Future<Output = anyhow::Result<RegistrationStore>>,
    {
        let registrations = match configure(RegistrationStore::new()).await {
            Ok(registrations) => registrations,
            Err(err) => {
                if self.inner.verbosity().errors() {
                    error!(error = %format!("{err:#}"), "async bootstrap failed");
                }
                return false;
            }
        };

        let writer = self.inner.writer.lock();
        match self.publish(&writer, registrations) {
            Ok(()) => true,
            Err(err) => {
                if self.inner.verbosity().errors() {
                    error!(error = %err, "async bootstrap rejected");
                }
                false
            }
        }
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.inner.bootstrapped.load(Ordering::Acquire)
    }

    fn publish(&self, _writer: &MutexGuard<'_, ()>, registrations: RegistrationStore) -> Result<(), DiError> {
        let verbosity = self.inner.verbosity();
        let validation = registrations.validate(self.inner.config.diagnostics.max_reported_cycles);

        for (dependent, missing) in &validation.missing {
            if verbosity.errors() {
                warn!(dependent = %dependent, missing = %missing, "declared dependency is not registered");
            }
        }
        if let Some(cycle) = validation.cycles.first() {
            if self.inner.config.strict_cycles {
                if verbosity.errors() {
                    error!(cycle = %cycle, "bootstrap aborted: declared dependencies form a cycle");
                }
                let mut chain = cycle.path.clone();
                chain.extend(cycle.path.first().copied());
                return Err(DiError::CircularDependency { chain });
            }
            if verbosity.errors() {
                for cycle in &validation.cycles {
                    warn!(cycle = %cycle, "declared dependencies form a cycle");
                }
            }
        }

        let count = registrations.len();
        let generation = self.inner.store.read().generation + 1;
        *self.inner.store.write() = Arc::new(PublishedStore {
            registrations,
            generation,
        });
        self.inner.bootstrapped.store(true, Ordering::Release);

        self.inner.cache.purge_generations_before(generation);
        self.inner.fast_path.clear();
        self.inner.metrics.record_registration(count as u64);

        if verbosity.registrations() {
            info!(registrations = count, generation, "registration store published");
        }
        Ok(())
    }

    /// Drop every registration and cached instance.
    ///
    /// Resolutions already running finish against the store they started with.
    pub fn unregister_all(&self) {
        let _writer = self.inner.writer.lock();
        let generation = self.inner.store.read().generation + 1;
        *self.inner.store.write() = Arc::new(PublishedStore {
            registrations: RegistrationStore::new(),
            generation,
        });
        self.inner.bootstrapped.store(false, Ordering::Release);
        self.inner.cache.clear();
        self.inner.fast_path.clear();

        if self.inner.verbosity().registrations() {
            info!(generation, "all registrations removed");
        }
    }

    /// Back to a freshly created container: registrations, scopes, pins,
    /// fast paths, diagnostics and metrics.
    pub fn reset(&self) {
        self.unregister_all();
        self.inner.scopes.clear_all();
        self.inner.affinity.clear();
        self.inner.fast_path.reset();
        self.inner.degraded.clear();
        {
            let mut analysis = self.inner.analysis.lock();
            self.inner.events.drain();
            analysis.graph.clear();
            analysis.optimizer.clear();
            analysis.reported_cycles.clear();
        }
        self.inner.metrics.reset();
    }

    // === Scopes ===

    /// Make `id` the current instance of `kind`. Returns the previous id.
    pub fn set_current_scope(
        &self,
        kind: ScopeKind,
        id: impl Into<ScopeId>,
    ) -> Result<Option<ScopeId>, DiError> {
        let id = id.into();
        let previous = self.inner.scopes.set_current(kind, id.clone())?;
        if self.inner.verbosity().all() {
            debug!(scope = %kind, id = %id, "scope entered");
        }
        Ok(previous)
    }

    pub fn current_scope(&self, kind: ScopeKind) -> Option<ScopeId> {
        self.inner.scopes.current(kind)
    }

    /// End the current instance of `kind` and evict its instances.
    ///
    /// For `Singleton` this evicts every singleton. Returns the number of
    /// evicted entries.
    pub fn clear_scope(&self, kind: ScopeKind) -> usize {
        let evicted = match kind {
            ScopeKind::Transient => 0,
            ScopeKind::Singleton => {
                self.inner.fast_path.clear();
                self.inner.cache.evict_kind(kind)
            }
            scoped => match self.inner.scopes.clear(scoped) {
                Some(id) => self.inner.cache.evict(scoped, &id),
                None => 0,
            },
        };
        if self.inner.verbosity().all() {
            debug!(scope = %kind, evicted, "scope cleared");
        }
        evicted
    }

    /// Evict the instances of one scope instance; it stops being current if it was.
    pub fn clear_scope_instance(&self, kind: ScopeKind, id: impl Into<ScopeId>) -> usize {
        let id = id.into();
        self.inner.scopes.clear_if_current(kind, &id);
        let evicted = self.inner.cache.evict(kind, &id);
        if self.inner.verbosity().all() {
            debug!(scope = %kind, id = %id, evicted, "scope instance cleared");
        }
        evicted
    }

    /// Evict one cached instance of one scope instance.
    pub fn evict(&self, kind: ScopeKind, id: impl Into<ScopeId>, identity: TypeIdentity) -> bool {
        let id = id.into();
        if kind == ScopeKind::Singleton {
            self.inner.fast_path.invalidate(identity);
        }
        self.inner.cache.evict_entry(kind, &id, identity)
    }

    /// Set `id` current for the lifetime of the returned guard.
    ///
    /// Dropping the guard evicts the scope instance and restores the id that
    /// was current before, if any.
    pub fn enter_scope(&self, kind: ScopeKind, id: impl Into<ScopeId>) -> Result<ScopeGuard, DiError> {
        let id = id.into();
        let previous = self.set_current_scope(kind, id.clone())?;
        Ok(ScopeGuard {
            container: self.clone(),
            kind,
            id,
            previous,
        })
    }

    // === Resolution ===

    /// Resolver for the main domain.
    pub fn resolver(&self) -> Resolver {
        Resolver::new(self.clone(), Domain::Main)
    }

    /// Resolver for resolutions requested from `domain`.
    pub fn on(&self, domain: Domain) -> Resolver {
        Resolver::new(self.clone(), domain)
    }

    pub fn resolve<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Arc<T>, DiError> {
        self.resolver().resolve::<T>()
    }

    pub fn resolve_optional<T: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.resolver().resolve_optional::<T>()
    }

    #[track_caller]
    pub fn resolve_required<T: ?Sized + Send + Sync + 'static>(&self) -> Arc<T> {
        self.resolver().resolve_required::<T>()
    }

    pub fn resolve_or_default<T: ?Sized + Send + Sync + 'static>(&self, default: Arc<T>) -> Arc<T> {
        self.resolver().resolve_or_default(default)
    }

    pub fn resolve_or_else<T, F>(&self, default: F) -> Arc<T>
    where
        T: ?Sized + Send + Sync + 'static,
        F: FnOnce() -> Arc<T>,
    {
        self.resolver().resolve_or_else(default)
    }

    pub fn resolve_key<K: InjectionKey>(&self) -> Result<Arc<K::Value>, DiError> {
        self.resolver().resolve_key::<K>()
    }

    pub fn resolve_key_optional<K: InjectionKey>(&self) -> Option<Arc<K::Value>> {
        self.resolver().resolve_key_optional::<K>()
    }

    pub async fn resolve_async<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Arc<T>, DiError> {
        self.resolver().resolve_async::<T>().await
    }

    pub async fn resolve_optional_async<T: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.resolver().resolve_optional_async::<T>().await
    }

    pub async fn resolve_required_async<T: ?Sized + Send + Sync + 'static>(&self) -> Arc<T> {
        self.resolver().resolve_required_async::<T>().await
    }

    pub async fn resolve_or_default_async<T: ?Sized + Send + Sync + 'static>(
        &self,
        default: Arc<T>,
    ) -> Arc<T> {
        self.resolver().resolve_or_default_async(default).await
    }

    pub fn lazy<T: ?Sized + Send + Sync + 'static>(&self) -> Lazy<T> {
        self.resolver().lazy::<T>()
    }

    // === Domains ===

    /// Run constructions pinned to `domain` on `executor`.
    pub fn attach_executor<E: DomainExecutor>(&self, domain: Domain, executor: E) {
        self.inner.executors.insert(domain, Arc::new(executor));
        if self.inner.verbosity().registrations() {
            info!(domain = %domain, "domain executor attached");
        }
    }

    pub fn detach_executor(&self, domain: Domain) -> bool {
        self.inner.executors.remove(&domain).is_some()
    }

    /// Construct `identity` in `domain` from now on, overriding its registration.
    pub fn pin_to_domain(&self, identity: TypeIdentity, domain: Domain) {
        self.inner.affinity.insert(identity, domain);
        if self.inner.verbosity().optimizations() {
            info!(identity = %identity, domain = %domain, "pinned to domain");
        }
    }

    pub fn unpin(&self, identity: TypeIdentity) -> Option<Domain> {
        self.inner.affinity.remove(&identity).map(|(_, domain)| domain)
    }

    /// Effective home domain of `identity`, if it has one.
    pub fn home_domain(&self, identity: TypeIdentity) -> Option<Domain> {
        let store = self.inner.published();
        match store.registrations.get(identity) {
            Some(registration) => self.inner.home_domain(registration),
            None => self.inner.affinity.get(&identity).map(|domain| *domain),
        }
    }

    /// Serve singleton `identity` from the `domain` fast path.
    pub fn enable_fast_path(&self, identity: TypeIdentity, domain: Domain) {
        self.inner.fast_path.enable(identity, domain);
        if self.inner.verbosity().optimizations() {
            info!(identity = %identity, domain = %domain, "fast path enabled");
        }
    }

    pub fn disable_fast_path(&self, identity: TypeIdentity) {
        self.inner.fast_path.disable(identity);
    }

    pub fn apply_suggestion(&self, suggestion: &OptimizationSuggestion) {
        match suggestion.kind {
            SuggestionKind::PinToDomain => self.pin_to_domain(suggestion.identity, suggestion.domain),
            SuggestionKind::FastPath => {
                self.enable_fast_path(suggestion.identity, suggestion.domain)
            }
        }
    }

    // === Diagnostics ===

    pub fn dependency_graph(&self) -> DependencyGraphSnapshot {
        self.inner.analyze().graph.snapshot()
    }

    /// Cycles among observed resolutions. New cycles are logged once.
    pub fn circular_dependencies(&self) -> Vec<CircularDependencyRecord> {
        let mut analysis = self.inner.analyze();
        let cycles = analysis
            .graph
            .detect_cycles(self.inner.config.diagnostics.max_reported_cycles);

        let report = self.inner.verbosity().errors();
        for cycle in &cycles {
            if analysis.reported_cycles.insert(cycle.clone()) && report {
                warn!(cycle = %cycle, "circular dependency observed");
            }
        }
        cycles
    }

    pub fn usage_stats(&self) -> HashMap<TypeIdentity, UsageStats> {
        self.inner.analyze().graph.usage_stats()
    }

    pub fn domain_usage(&self, identity: TypeIdentity) -> Option<DomainUsageReport> {
        self.inner.analyze().optimizer.usage(identity)
    }

    /// Advisory suggestions for every observed type. Nothing is applied.
    pub fn domain_hop_suggestions(&self) -> Vec<OptimizationSuggestion> {
        if !self.inner.config.optimization_enabled {
            return Vec::new();
        }
        let store = self.inner.published();
        let suggestions = self
            .inner
            .analyze()
            .optimizer
            .suggestions(|identity| self.inner.profile(&store, identity));

        if self.inner.verbosity().optimizations() {
            for suggestion in &suggestions {
                info!(suggestion = %suggestion, "optimization suggested");
            }
        }
        suggestions
    }

    pub fn suggest(&self, identity: TypeIdentity) -> Option<OptimizationSuggestion> {
        if !self.inner.config.optimization_enabled {
            return None;
        }
        let store = self.inner.published();
        let profile = self.inner.profile(&store, identity);
        self.inner.analyze().optimizer.suggest(identity, profile)
    }

    /// Plain-text report of the observed graph, cycles and usage.
    pub fn dependency_report(&self) -> String {
        let stats = self.stats();
        let graph_report = self
            .inner
            .analyze()
            .graph
            .report(self.inner.config.diagnostics.max_reported_cycles);
        format!("{stats}\n{graph_report}")
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn stats(&self) -> ContainerStats {
        let store = self.inner.published();
        let metrics = self.inner.metrics.snapshot();
        ContainerStats {
            name: self.inner.config.name.clone(),
            generation: store.generation,
            registrations: store.registrations.len(),
            cached_instances: self.inner.cache.len(),
            fast_path_entries: self.inner.fast_path.len(),
            resolutions: metrics.resolutions,
            constructions: metrics.constructions,
            cache_hits: metrics.cache_hits,
            fast_path_hits: metrics.fast_path_hits,
            fallbacks: metrics.fallbacks,
            failures: metrics.failures,
            dropped_events: self.inner.events.dropped(),
            pending_events: self.inner.events.pending(),
            latency: metrics.latency,
        }
    }

    pub fn cache_snapshot(&self) -> Vec<CacheEntrySnapshot> {
        self.inner.cache.snapshot()
    }

    /// Drain diagnostics and check for cycles every `period` until the
    /// container is dropped.
    pub fn spawn_periodic_analysis(&self, period: Duration) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let container = Container { inner };
                container.circular_dependencies();
                if container.inner.verbosity().optimizations() {
                    container.domain_hop_suggestions();
                }
            }
        })
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let store = self.inner.published();
        f.debug_struct("Container")
            .field("name", &self.inner.config.name)
            .field("generation", &store.generation)
            .field("registrations", &store.registrations.len())
            .finish()
    }
}

/// Keeps a scope instance current; see [`Container::enter_scope`].
#[must_use = "the scope ends when the guard is dropped"]
pub struct ScopeGuard {
    container: Container,
    kind: ScopeKind,
    id: ScopeId,
    previous: Option<ScopeId>,
}

impl ScopeGuard {
    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    pub fn id(&self) -> &ScopeId {
        &self.id
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let inner = &self.container.inner;
        inner.cache.evict(self.kind, &self.id);
        if inner.scopes.clear_if_current(self.kind, &self.id) {
            if let Some(previous) = self.previous.take() {
                // kind already accepted an id once, cannot fail
                let _ = inner.scopes.set_current(self.kind, previous);
            }
        }
    }
}

impl fmt::Debug for ScopeGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeGuard")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .finish()
    }
}

/// Point-in-time container statistics.
#[derive(Debug, Clone)]
pub struct ContainerStats {
    pub name: String,
    pub generation: u64,
    pub registrations: usize,
    pub cached_instances: usize,
    pub fast_path_entries: usize,
    pub resolutions: u64,
    pub constructions: u64,
    pub cache_hits: u64,
    pub fast_path_hits: u64,
    pub fallbacks: u64,
    pub failures: u64,
    /// Diagnostic events lost because the buffer was full.
    pub dropped_events: u64,
    pub pending_events: usize,
    pub latency: LatencyPercentiles,
}

impl fmt::Display for ContainerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Container {} (generation {}) ===", self.name, self.generation)?;
        writeln!(
            f,
            "registrations: {}, cached: {}, fast path: {}",
            self.registrations, self.cached_instances, self.fast_path_entries
        )?;
        writeln!(
            f,
            "resolutions: {} (constructed {}, cache hits {}, fast path hits {}, fallbacks {}), failures: {}",
            self.resolutions,
            self.constructions,
            self.cache_hits,
            self.fast_path_hits,
            self.fallbacks,
            self.failures
        )?;
        let fmt_latency = |latency: Option<Duration>| {
            latency
                .map(|d| format!("{:.1}us", d.as_secs_f64() * 1_000_000.0))
                .unwrap_or_else(|| "-".to_string())
        };
        writeln!(
            f,
            "latency p50 {} p95 {} p99 {} ({} samples)",
            fmt_latency(self.latency.p50),
            fmt_latency(self.latency.p95),
            fmt_latency(self.latency.p99),
            self.latency.samples
        )?;
        write!(
            f,
            "events: {} pending, {} dropped",
            self.pending_events, self.dropped_events
        )
    }
}

/// Step-by-step container setup.
pub struct ContainerBuilder {
    configuration: ContainerConfiguration,
    registrations: RegistrationStore,
    executors: Vec<(Domain, Arc<dyn DomainExecutor>)>,
}

impl Default for ContainerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerBuilder {
    pub fn new() -> Self {
        Self {
            configuration: ContainerConfiguration::default(),
            registrations: RegistrationStore::new(),
            executors: Vec::new(),
        }
    }

    pub fn with_configuration(mut self, configuration: ContainerConfiguration) -> Self {
        self.configuration = configuration;
        self
    }

    pub fn with_log_level(mut self, log_level: LogVerbosity) -> Self {
        self.configuration.log_level = log_level;
        self
    }

    pub fn with_strict_cycles(mut self, strict: bool) -> Self {
        self.configuration.strict_cycles = strict;
        self
    }

    pub fn with_optimization(mut self, enabled: bool) -> Self {
        self.configuration.optimization_enabled = enabled;
        self
    }

    pub fn with_construction_timeout(mut self, timeout: Duration) -> Self {
        self.configuration.construction_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_executor<E: DomainExecutor>(mut self, domain: Domain, executor: E) -> Self {
        self.executors.push((domain, Arc::new(executor)));
        self
    }

    /// Registrations published by [`build`](Self::build).
    pub fn configure<F>(mut self, configure: F) -> Self
    where
        F: FnOnce(&mut RegistrationStore),
    {
        configure(&mut self.registrations);
        self
    }

    /// Validate the configuration, create the container and bootstrap it
    /// with the configured registrations, if any.
    pub fn build(self) -> Result<Container, DiError> {
        self.configuration.validate()?;
        let container = Container::with_configuration(self.configuration);
        for (domain, executor) in self.executors {
            container.inner.executors.insert(domain, executor);
        }
        if !self.registrations.is_empty() {
            let registrations = self.registrations;
            container.bootstrap(move |store| *store = registrations)?;
        }
        Ok(container)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Database;
    struct Repository;
    struct Screen;

    #[test]
    fn live_register_evicts_the_replaced_singleton() {
        let container = Container::new();
        container.register(|_| Ok(Database));
        let first = container.resolve_required::<Database>();

        container.register(|_| Ok(Database));
        let second = container.resolve_required::<Database>();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn live_register_keeps_unrelated_instances() {
        let container = Container::new();
        container.register(|_| Ok(Database));
        let database = container.resolve_required::<Database>();

        container.register(|_| Ok(Repository));
        assert!(Arc::ptr_eq(&database, &container.resolve_required::<Database>()));
    }

    #[test]
    fn bootstrap_replaces_instead_of_merging() {
        let container = Container::new();
        container
            .bootstrap(|store| {
                store.register(|_| Ok(Database));
            })
            .unwrap();
        container
            .bootstrap(|store| {
                store.register(|_| Ok(Repository));
            })
            .unwrap();

        assert!(!container.is_registered::<Database>());
        assert!(container.is_registered::<Repository>());
        assert_eq!(container.stats().generation, 2);
    }

    #[test]
    fn bootstrap_if_needed_runs_once() {
        let container = Container::new();
        assert!(container
            .bootstrap_if_needed(|store| {
                store.register(|_| Ok(Database));
            })
            .unwrap());
        assert!(!container
            .bootstrap_if_needed(|store| {
                store.register(|_| Ok(Repository));
            })
            .unwrap());
        assert!(!container.is_registered::<Repository>());

        container.unregister_all();
        assert!(!container.is_bootstrapped());
        assert_eq!(container.registration_count(), 0);
    }

    #[test]
    fn scope_guard_restores_previous_scope() {
        let container = Container::new();
        let constructions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&constructions);
        container.register_scoped(ScopeKind::Screen, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Screen)
        });

        container.set_current_scope(ScopeKind::Screen, "home").unwrap();
        let home = container.resolve_required::<Screen>();
        {
            let _guard = container.enter_scope(ScopeKind::Screen, "settings").unwrap();
            let settings = container.resolve_required::<Screen>();
            assert!(!Arc::ptr_eq(&home, &settings));
        }

        assert_eq!(container.current_scope(ScopeKind::Screen), Some("home".into()));
        assert!(Arc::ptr_eq(&home, &container.resolve_required::<Screen>()));
        assert_eq!(constructions.load(Ordering::SeqCst), 2);
        assert_eq!(container.cache_snapshot().len(), 1);
    }

    #[test]
    fn reset_forgets_diagnostics() {
        let container = Container::development();
        container.register(|_| Ok(Database));
        container.resolve_required::<Database>();
        assert_eq!(container.usage_stats().len(), 1);

        container.reset();
        assert!(container.usage_stats().is_empty());
        assert_eq!(container.metrics().resolutions, 0);
        assert!(container.resolve_optional::<Database>().is_none());
    }

    #[test]
    fn builder_publishes_configured_registrations() {
        let container = Container::builder()
            .with_strict_cycles(true)
            .with_construction_timeout(Duration::from_secs(2))
            .configure(|store| {
                store.register(|_| Ok(Database));
            })
            .build()
            .unwrap();

        assert!(container.is_bootstrapped());
        assert!(container.configuration().strict_cycles);
        assert_eq!(container.configuration().construction_timeout_ms, 2_000);
        assert!(container.resolve::<Database>().is_ok());
    }

    #[test]
    fn stats_render_as_text() {
        let container = Container::new();
        container.register(|_| Ok(Database));
        container.resolve_required::<Database>();
        container.resolve_required::<Database>();

        let stats = container.stats();
        assert_eq!(stats.resolutions, 2);
        assert_eq!(stats.constructions, 1);
        assert_eq!(stats.cached_instances, 1);
        assert!(stats.to_string().contains("registrations: 1"));
    }
}
