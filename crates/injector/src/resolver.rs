//! Resolution path: registration lookup, scope cache, fallbacks, domain hops.
//!
//! A [`Resolver`] is a cheap handle carrying the calling [`Domain`] and the
//! chain of identities currently under construction. Factories receive one
//! and use it for their own dependencies, which is how nested resolutions
//! become graph edges and how re-entrant resolution is caught before it can
//! deadlock on a slot its own caller holds.

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};
use tracing::{debug, error, warn};

use crate::{
    cache::{CacheKey, CacheOutcome},
    container::{Container, PublishedStore},
    domain::{Domain, DomainExecutor},
    errors::DiError,
    events::{ResolutionEvent, ResolutionOutcome},
    identity::{InjectionKey, TypeIdentity},
    lazy::Lazy,
    registration::{downcast, Factory, Instance, Registration},
    scope::{EffectiveScope, ScopeKind},
};

#[derive(Clone)]
pub struct Resolver {
    container: Container,
    domain: Domain,
    chain: Arc<Vec<TypeIdentity>>,
}

/// Outcome of the lookup shared by the sync and async paths.
enum Lookup {
    FastPath(Instance),
    Found {
        store: Arc<PublishedStore>,
        registration: Arc<Registration>,
    },
}

impl Resolver {
    pub(crate) fn new(container: Container, domain: Domain) -> Self {
        Self {
            container,
            domain,
            chain: Arc::new(Vec::new()),
        }
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    /// Domain the resolution is requested from.
    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Identities under construction, outermost first.
    pub fn chain(&self) -> &[TypeIdentity] {
        &self.chain
    }

    /// Identity whose factory holds this resolver, if any.
    pub fn parent(&self) -> Option<TypeIdentity> {
        self.chain.last().copied()
    }

    /// Same chain, different requesting domain.
    pub fn on(&self, domain: Domain) -> Resolver {
        Resolver {
            container: self.container.clone(),
            domain,
            chain: Arc::clone(&self.chain),
        }
    }

    fn child(&self, identity: TypeIdentity, domain: Domain) -> Resolver {
        let mut chain = Vec::with_capacity(self.chain.len() + 1);
        chain.extend_from_slice(&self.chain);
        chain.push(identity);
        Resolver {
            container: self.container.clone(),
            domain,
            chain: Arc::new(chain),
        }
    }

    // ---- typed strategies -------------------------------------------------

    /// Resolve `T`, reporting why it could not be resolved.
    pub fn resolve<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Arc<T>, DiError> {
        let identity = TypeIdentity::of::<T>();
        let instance = self.resolve_instance(identity)?;
        downcast::<T>(identity, &instance)
    }

    pub fn resolve_optional<T: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.resolve::<T>().ok()
    }

    /// Resolve `T` or panic. A missing required dependency is a programming error.
    #[track_caller]
    pub fn resolve_required<T: ?Sized + Send + Sync + 'static>(&self) -> Arc<T> {
        match self.resolve::<T>() {
            Ok(instance) => instance,
            Err(err) => panic!(
                "required dependency {} could not be resolved: {err}",
                TypeIdentity::of::<T>()
            ),
        }
    }

    pub fn resolve_or_default<T: ?Sized + Send + Sync + 'static>(&self, default: Arc<T>) -> Arc<T> {
        self.resolve::<T>().unwrap_or(default)
    }

    pub fn resolve_or_else<T, F>(&self, default: F) -> Arc<T>
    where
        T: ?Sized + Send + Sync + 'static,
        F: FnOnce() -> Arc<T>,
    {
        self.resolve::<T>().unwrap_or_else(|_| default())
    }

    pub fn resolve_key<K: InjectionKey>(&self) -> Result<Arc<K::Value>, DiError> {
        let identity = TypeIdentity::of_key::<K>();
        let instance = self.resolve_instance(identity)?;
        downcast::<K::Value>(identity, &instance)
    }

    pub fn resolve_key_optional<K: InjectionKey>(&self) -> Option<Arc<K::Value>> {
        self.resolve_key::<K>().ok()
    }

    pub async fn resolve_async<T: ?Sized + Send + Sync + 'static>(&self) -> Result<Arc<T>, DiError> {
        let identity = TypeIdentity::of::<T>();
        let instance = self.resolve_instance_async(identity).await?;
        downcast::<T>(identity, &instance)
    }

    pub async fn resolve_optional_async<T: ?Sized + Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.resolve_async::<T>().await.ok()
    }

    pub async fn resolve_required_async<T: ?Sized + Send + Sync + 'static>(&self) -> Arc<T> {
        match self.resolve_async::<T>().await {
            Ok(instance) => instance,
            Err(err) => panic!(
                "required dependency {} could not be resolved: {err}",
                TypeIdentity::of::<T>()
            ),
        }
    }

    pub async fn resolve_or_default_async<T: ?Sized + Send + Sync + 'static>(
        &self,
        default: Arc<T>,
    ) -> Arc<T> {
        self.resolve_async::<T>().await.unwrap_or(default)
    }

    pub async fn resolve_key_async<K: InjectionKey>(&self) -> Result<Arc<K::Value>, DiError> {
        let identity = TypeIdentity::of_key::<K>();
        let instance = self.resolve_instance_async(identity).await?;
        downcast::<K::Value>(identity, &instance)
    }

    /// Deferred accessor that resolves `T` on first use.
    pub fn lazy<T: ?Sized + Send + Sync + 'static>(&self) -> Lazy<T> {
        Lazy::new(self.clone())
    }

    // ---- untyped core -----------------------------------------------------

    pub(crate) fn resolve_instance(&self, identity: TypeIdentity) -> Result<Instance, DiError> {
        let started = Instant::now();
        let result = self.resolve_sync_inner(identity, started);
        if let Err(err) = &result {
            self.record_failure(identity, err);
        }
        result
    }

    pub(crate) async fn resolve_instance_async(
        &self,
        identity: TypeIdentity,
    ) -> Result<Instance, DiError> {
        let started = Instant::now();
        let result = self.resolve_async_inner(identity, started).await;
        if let Err(err) = &result {
            self.record_failure(identity, err);
        }
        result
    }

    fn resolve_sync_inner(&self, identity: TypeIdentity, started: Instant) -> Result<Instance, DiError> {
        let (store, registration) = match self.lookup(identity, started)? {
            Lookup::FastPath(instance) => return Ok(instance),
            Lookup::Found {
                store,
                registration,
            } => (store, registration),
        };

        let factory = match registration.factory() {
            Some(Factory::Sync(factory)) => Arc::clone(factory),
            Some(Factory::Async(_)) => return Err(DiError::AsyncFactoryInSyncContext { identity }),
            None => return self.invoke_fallback(&registration, started),
        };

        let child = self.child(identity, self.domain);
        let construct = || factory(&child).map_err(|err| DiError::construction(identity, err));

        let inner = self.container.inner();
        let (instance, outcome) = match inner.effective_scope(&registration) {
            EffectiveScope::Cached { kind, id } => {
                let key = CacheKey {
                    generation: store.generation,
                    registration: registration.serial(),
                    kind,
                    scope_id: id,
                    identity,
                };
                let (entry, outcome) =
                    inner
                        .cache
                        .get_or_create(&key, inner.config.construction_timeout(), construct)?;
                (Arc::clone(entry.instance()), outcome.into())
            }
            EffectiveScope::Uncached { .. } => (construct()?, ResolutionOutcome::Constructed),
        };

        self.remember_hot(&registration, &instance);
        self.record_success(identity, outcome, started, None);
        Ok(instance)
    }

    async fn resolve_async_inner(
        &self,
        identity: TypeIdentity,
        started: Instant,
    ) -> Result<Instance, DiError> {
        let (store, registration) = match self.lookup(identity, started)? {
            Lookup::FastPath(instance) => return Ok(instance),
            Lookup::Found {
                store,
                registration,
            } => (store, registration),
        };

        let factory = match registration.factory() {
            Some(factory) => factory.clone(),
            None => return self.invoke_fallback(&registration, started),
        };

        let inner = self.container.inner();
        let hop_target = inner
            .home_domain(&registration)
            .filter(|home| *home != self.domain)
            .and_then(|home| inner.executor(home).map(|executor| (home, executor)));

        let mut hop = None;
        let construction = async {
            match hop_target {
                Some((home, executor)) => {
                    let child = self.child(identity, home);
                    let (result, measured) =
                        construct_in_domain(executor, home, identity, factory, child).await;
                    hop = measured;
                    result
                }
                None => {
                    let child = self.child(identity, self.domain);
                    factory
                        .construct_async(child)
                        .await
                        .map_err(|err| DiError::construction(identity, err))
                }
            }
        };

        let (instance, outcome) = match inner.effective_scope(&registration) {
            EffectiveScope::Cached { kind, id } => {
                let key = CacheKey {
                    generation: store.generation,
                    registration: registration.serial(),
                    kind,
                    scope_id: id,
                    identity,
                };
                let (entry, outcome) = inner
                    .cache
                    .get_or_create_async(&key, inner.config.construction_timeout(), || construction)
                    .await?;
                (Arc::clone(entry.instance()), outcome.into())
            }
            EffectiveScope::Uncached { .. } => (construction.await?, ResolutionOutcome::Constructed),
        };

        self.remember_hot(&registration, &instance);
        self.record_success(identity, outcome, started, hop);
        Ok(instance)
    }

    fn lookup(&self, identity: TypeIdentity, started: Instant) -> Result<Lookup, DiError> {
        let inner = self.container.inner();

        if let Some(parent) = self.parent() {
            inner.emit(ResolutionEvent::Edge {
                from: parent,
                to: identity,
                at: SystemTime::now(),
            });
        }
        if let Some(position) = self.chain.iter().position(|entry| *entry == identity) {
            let mut chain = self.chain[position..].to_vec();
            chain.push(identity);
            return Err(DiError::CircularDependency { chain });
        }

        let store = inner.published();
        let registration = match store.registrations.get(identity) {
            Some(registration) => Arc::clone(registration),
            None => return Err(DiError::NotRegistered { identity }),
        };

        if inner.config.optimization_enabled {
            let serial = registration.serial();
            if let Some(instance) = inner.fast_path.get(self.domain, identity, serial) {
                self.record_success(identity, ResolutionOutcome::FastPathHit, started, None);
                return Ok(Lookup::FastPath(instance));
            }
        }

        Ok(Lookup::Found {
            store,
            registration,
        })
    }

    fn invoke_fallback(
        &self,
        registration: &Registration,
        started: Instant,
    ) -> Result<Instance, DiError> {
        let identity = registration.identity();
        let fallback = registration
            .fallback()
            .ok_or(DiError::NotRegistered { identity })?;

        let child = self.child(identity, self.domain);
        let instance = fallback(&child).map_err(|err| DiError::fallback(identity, err))?;
        self.record_success(identity, ResolutionOutcome::Fallback, started, None);
        Ok(instance)
    }

    fn remember_hot(&self, registration: &Registration, instance: &Instance) {
        let inner = self.container.inner();
        if inner.config.optimization_enabled && registration.scope() == ScopeKind::Singleton {
            inner.fast_path.insert(
                self.domain,
                registration.identity(),
                registration.serial(),
                Arc::clone(instance),
            );
        }
    }

    fn record_success(
        &self,
        identity: TypeIdentity,
        outcome: ResolutionOutcome,
        started: Instant,
        hop: Option<Duration>,
    ) {
        let inner = self.container.inner();
        let elapsed = started.elapsed();
        inner.metrics.record_resolution(outcome, elapsed);
        inner.emit(ResolutionEvent::Resolved {
            identity,
            domain: self.domain,
            outcome,
            elapsed,
            hop,
            at: SystemTime::now(),
        });

        if inner.verbosity().all() {
            debug!(
                identity = %identity,
                domain = %self.domain,
                outcome = ?outcome,
                elapsed_us = elapsed.as_micros() as u64,
                "resolved"
            );
        }
    }

    fn record_failure(&self, identity: TypeIdentity, err: &DiError) {
        let inner = self.container.inner();
        inner.metrics.record_failure();
        inner.emit(ResolutionEvent::Failed {
            identity,
            domain: self.domain,
            at: SystemTime::now(),
        });

        let verbosity = inner.verbosity();
        match err {
            DiError::NotRegistered { .. } => {
                if verbosity.all() {
                    debug!(identity = %identity, domain = %self.domain, "not registered");
                }
            }
            DiError::CircularDependency { .. } => {
                if verbosity.errors() {
                    warn!(identity = %identity, error = %err, "re-entrant resolution");
                }
            }
            _ => {
                if verbosity.errors() {
                    error!(identity = %identity, domain = %self.domain, error = %err, "resolution failed");
                }
            }
        }
    }
}

impl From<CacheOutcome> for ResolutionOutcome {
    fn from(outcome: CacheOutcome) -> Self {
        match outcome {
            CacheOutcome::Hit => ResolutionOutcome::CacheHit,
            CacheOutcome::Constructed => ResolutionOutcome::Constructed,
        }
    }
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("container", &self.container.configuration().name)
            .field("domain", &self.domain)
            .field("chain", &self.chain)
            .finish()
    }
}

/// Run `factory` on `executor` and wait for the result.
///
/// Returns the hop overhead: time until the executor picked the task up plus
/// time from completion until the result was received here.
async fn construct_in_domain(
    executor: Arc<dyn DomainExecutor>,
    home: Domain,
    identity: TypeIdentity,
    factory: Factory,
    resolver: Resolver,
) -> (Result<Instance, DiError>, Option<Duration>) {
    let (sender, receiver) = tokio::sync::oneshot::channel();
    let dispatched = Instant::now();

    executor.execute(Box::pin(async move {
        let hop_in = dispatched.elapsed();
        let result = factory.construct_async(resolver).await;
        // The caller may have given up; nothing to do then.
        let _ = sender.send((result, hop_in, Instant::now()));
    }));

    match receiver.await {
        Ok((result, hop_in, finished)) => (
            result.map_err(|err| DiError::construction(identity, err)),
            Some(hop_in + finished.elapsed()),
        ),
        Err(_) => (Err(DiError::DomainUnavailable { domain: home }), None),
    }
}
