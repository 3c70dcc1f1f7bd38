//! Registration store: identity -> factory, scope and fallback.
//!
//! A store is built in isolation (bootstrap) or copied on write (live
//! registration) and is never mutated once the container publishes it.

use futures::future::BoxFuture;
use std::{
    any::Any,
    collections::HashMap,
    fmt,
    future::Future,
    marker::PhantomData,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use crate::{
    domain::Domain,
    errors::DiError,
    graph::{CircularDependencyRecord, DependencyGraph},
    identity::{InjectionKey, TypeIdentity},
    resolver::Resolver,
    scope::ScopeKind,
};

/// Type-erased instance. Always holds an `Arc<T>` for the registered `T`,
/// which keeps `dyn Trait` registrations possible.
pub type Instance = Arc<dyn Any + Send + Sync>;

pub type SyncFactoryFn = dyn Fn(&Resolver) -> anyhow::Result<Instance> + Send + Sync;
pub type AsyncFactoryFn =
    dyn Fn(Resolver) -> BoxFuture<'static, anyhow::Result<Instance>> + Send + Sync;

pub(crate) fn erase<T: ?Sized + Send + Sync + 'static>(value: Arc<T>) -> Instance {
    Arc::new(value)
}

pub(crate) fn downcast<T: ?Sized + Send + Sync + 'static>(
    identity: TypeIdentity,
    instance: &Instance,
) -> Result<Arc<T>, DiError> {
    instance
        .downcast_ref::<Arc<T>>()
        .cloned()
        .ok_or(DiError::TypeMismatch {
            identity,
            expected: std::any::type_name::<T>(),
        })
}

#[derive(Clone)]
pub enum Factory {
    Sync(Arc<SyncFactoryFn>),
    Async(Arc<AsyncFactoryFn>),
}

impl Factory {
    pub fn is_async(&self) -> bool {
        matches!(self, Factory::Async(_))
    }

    /// Construction as a `'static` future, whichever kind of factory this is.
    pub(crate) fn construct_async(
        &self,
        resolver: Resolver,
    ) -> BoxFuture<'static, anyhow::Result<Instance>> {
        match self {
            Factory::Async(factory) => factory(resolver),
            Factory::Sync(factory) => {
                let factory = Arc::clone(factory);
                Box::pin(async move { factory(&resolver) })
            }
        }
    }
}

/// Source of [`Registration::serial`]; never reused within a process.
static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
pub struct Registration {
    identity: TypeIdentity,
    /// Assigned on insert. Cached instances are keyed by it, so an instance
    /// built by an overwritten factory is never served again.
    serial: u64,
    scope: ScopeKind,
    factory: Option<Factory>,
    fallback: Option<Arc<SyncFactoryFn>>,
    home_domain: Option<Domain>,
    dependencies: Vec<TypeIdentity>,
    registered_at: Instant,
}

impl Registration {
    pub fn identity(&self) -> TypeIdentity {
        self.identity
    }

    /// Unique per inserted registration, increasing in insertion order.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn scope(&self) -> ScopeKind {
        self.scope
    }

    pub fn factory(&self) -> Option<&Factory> {
        self.factory.as_ref()
    }

    pub fn fallback(&self) -> Option<&Arc<SyncFactoryFn>> {
        self.fallback.as_ref()
    }

    /// Domain construction is pinned to, if any.
    pub fn home_domain(&self) -> Option<Domain> {
        self.home_domain
    }

    /// Dependencies declared at registration time (used by bootstrap validation).
    pub fn dependencies(&self) -> &[TypeIdentity] {
        &self.dependencies
    }

    pub fn registered_at(&self) -> Instant {
        self.registered_at
    }

    pub fn has_factory(&self) -> bool {
        self.factory.is_some()
    }

    pub fn is_async(&self) -> bool {
        self.factory.as_ref().map(Factory::is_async).unwrap_or(false)
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("identity", &self.identity)
            .field("serial", &self.serial)
            .field("scope", &self.scope)
            .field("factory", &self.factory.as_ref().map(|factory| {
                if factory.is_async() {
                    "async"
                } else {
                    "sync"
                }
            }))
            .field("fallback", &self.fallback.is_some())
            .field("home_domain", &self.home_domain)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

/// Step-by-step registration of a value type `T`.
///
/// ```
/// use injector::{Domain, RegistrationStore, ScopeKind};
///
/// struct Renderer;
///
/// let mut store = RegistrationStore::new();
/// store
///     .bind::<Renderer>()
///     .scope(ScopeKind::Screen)
///     .on_domain(Domain::Main)
///     .to_factory(|_| Ok(Renderer));
/// assert!(store.is_registered::<Renderer>());
/// ```
pub struct RegistrationBuilder<'a, T: ?Sized> {
    store: &'a mut RegistrationStore,
    identity: TypeIdentity,
    scope: ScopeKind,
    home_domain: Option<Domain>,
    dependencies: Vec<TypeIdentity>,
    fallback: Option<Arc<SyncFactoryFn>>,
    _value: PhantomData<fn() -> Arc<T>>,
}

impl<'a, T: ?Sized + Send + Sync + 'static> RegistrationBuilder<'a, T> {
    fn new(store: &'a mut RegistrationStore, identity: TypeIdentity) -> Self {
        Self {
            store,
            identity,
            scope: ScopeKind::default(),
            home_domain: None,
            dependencies: Vec::new(),
            fallback: None,
            _value: PhantomData,
        }
    }

    pub fn scope(mut self, scope: ScopeKind) -> Self {
        self.scope = scope;
        self
    }

    /// Construct in `domain`; async resolutions from elsewhere hop into it.
    pub fn on_domain(mut self, domain: Domain) -> Self {
        self.home_domain = Some(domain);
        self
    }

    pub fn depends_on<U: ?Sized + 'static>(mut self) -> Self {
        self.dependencies.push(TypeIdentity::of::<U>());
        self
    }

    pub fn depends_on_identity(mut self, identity: TypeIdentity) -> Self {
        self.dependencies.push(identity);
        self
    }

    /// Used when there is no primary factory.
    pub fn fallback<F>(mut self, fallback: F) -> Self
    where
        F: Fn(&Resolver) -> anyhow::Result<Arc<T>> + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(move |resolver: &Resolver| {
            fallback(resolver).map(erase)
        }));
        self
    }

    /// Factory producing a shared `Arc<T>`; the only way to register `dyn Trait`.
    pub fn to_shared<F>(self, factory: F) -> Arc<Registration>
    where
        F: Fn(&Resolver) -> anyhow::Result<Arc<T>> + Send + Sync + 'static,
    {
        let factory: Arc<SyncFactoryFn> =
            Arc::new(move |resolver: &Resolver| factory(resolver).map(erase));
        self.finish(Some(Factory::Sync(factory)))
    }

    pub fn to_async_shared<F, Fut>(self, factory: F) -> Arc<Registration>
    where
        F: Fn(Resolver) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Arc<T>>> + Send + 'static,
    {
        let factory: Arc<AsyncFactoryFn> = Arc::new(move |resolver: Resolver| {
            let construction = factory(resolver);
            Box::pin(async move { construction.await.map(erase) })
                as BoxFuture<'static, anyhow::Result<Instance>>
        });
        self.finish(Some(Factory::Async(factory)))
    }

    /// Registration served only by its fallback.
    pub fn fallback_only(self) -> Arc<Registration> {
        self.finish(None)
    }

    fn finish(self, factory: Option<Factory>) -> Arc<Registration> {
        let registration = Registration {
            identity: self.identity,
            serial: 0,
            scope: self.scope,
            factory,
            fallback: self.fallback,
            home_domain: self.home_domain,
            dependencies: self.dependencies,
            registered_at: Instant::now(),
        };
        self.store.insert(registration)
    }
}

impl<'a, T: Send + Sync + 'static> RegistrationBuilder<'a, T> {
    pub fn to_factory<F>(self, factory: F) -> Arc<Registration>
    where
        F: Fn(&Resolver) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.to_shared(move |resolver| factory(resolver).map(Arc::new))
    }

    pub fn to_async<F, Fut>(self, factory: F) -> Arc<Registration>
    where
        F: Fn(Resolver) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.to_async_shared(move |resolver| {
            let construction = factory(resolver);
            async move { construction.await.map(Arc::new) }
        })
    }

    /// Pre-built value, handed out as a singleton.
    pub fn to_instance(self, value: T) -> Arc<Registration> {
        let value = Arc::new(value);
        self.scope(ScopeKind::Singleton)
            .to_shared(move |_| Ok(Arc::clone(&value)))
    }
}

/// Result of checking declared dependencies.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreValidation {
    pub cycles: Vec<CircularDependencyRecord>,
    /// (dependent, missing dependency)
    pub missing: Vec<(TypeIdentity, TypeIdentity)>,
}

impl StoreValidation {
    pub fn is_clean(&self) -> bool {
        self.cycles.is_empty() && self.missing.is_empty()
    }
}

#[derive(Clone, Default)]
pub struct RegistrationStore {
    registrations: HashMap<TypeIdentity, Arc<Registration>>,
}

impl RegistrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind<T: ?Sized + Send + Sync + 'static>(&mut self) -> RegistrationBuilder<'_, T> {
        RegistrationBuilder::new(self, TypeIdentity::of::<T>())
    }

    /// Builder keyed by the tag `K` instead of the value type.
    pub fn bind_key<K: InjectionKey>(&mut self) -> RegistrationBuilder<'_, K::Value> {
        RegistrationBuilder::new(self, TypeIdentity::of_key::<K>())
    }

    /// Singleton registration.
    pub fn register<T, F>(&mut self, factory: F) -> Arc<Registration>
    where
        T: Send + Sync + 'static,
        F: Fn(&Resolver) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.bind::<T>().to_factory(factory)
    }

    pub fn register_scoped<T, F>(&mut self, scope: ScopeKind, factory: F) -> Arc<Registration>
    where
        T: Send + Sync + 'static,
        F: Fn(&Resolver) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.bind::<T>().scope(scope).to_factory(factory)
    }

    pub fn register_shared<T, F>(&mut self, scope: ScopeKind, factory: F) -> Arc<Registration>
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&Resolver) -> anyhow::Result<Arc<T>> + Send + Sync + 'static,
    {
        self.bind::<T>().scope(scope).to_shared(factory)
    }

    pub fn register_async<T, F, Fut>(&mut self, scope: ScopeKind, factory: F) -> Arc<Registration>
    where
        T: Send + Sync + 'static,
        F: Fn(Resolver) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.bind::<T>().scope(scope).to_async(factory)
    }

    pub fn register_instance<T: Send + Sync + 'static>(&mut self, value: T) -> Arc<Registration> {
        self.bind::<T>().to_instance(value)
    }

    pub fn register_key<K, F>(&mut self, scope: ScopeKind, factory: F) -> Arc<Registration>
    where
        K: InjectionKey,
        F: Fn(&Resolver) -> anyhow::Result<Arc<K::Value>> + Send + Sync + 'static,
    {
        self.bind_key::<K>().scope(scope).to_shared(factory)
    }

    /// Attach a fallback to `T`, creating a fallback-only registration when
    /// `T` has no primary factory yet.
    pub fn register_fallback<T, F>(&mut self, fallback: F) -> Arc<Registration>
    where
        T: Send + Sync + 'static,
        F: Fn(&Resolver) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let identity = TypeIdentity::of::<T>();
        let fallback: Arc<SyncFactoryFn> =
            Arc::new(move |resolver: &Resolver| fallback(resolver).map(|v| erase(Arc::new(v))));

        let registration = match self.registrations.get(&identity) {
            Some(existing) => Registration {
                fallback: Some(fallback),
                ..Registration::clone(existing)
            },
            None => Registration {
                identity,
                serial: 0,
                scope: ScopeKind::Transient,
                factory: None,
                fallback: Some(fallback),
                home_domain: None,
                dependencies: Vec::new(),
                registered_at: Instant::now(),
            },
        };
        self.insert(registration)
    }

    /// Insert or overwrite (last write wins). A fallback declared earlier
    /// survives an overwrite that does not bring its own.
    pub fn insert(&mut self, mut registration: Registration) -> Arc<Registration> {
        registration.serial = NEXT_SERIAL.fetch_add(1, Ordering::Relaxed);
        if registration.fallback.is_none() {
            if let Some(previous) = self.registrations.get(&registration.identity) {
                registration.fallback = previous.fallback.clone();
            }
        }
        let registration = Arc::new(registration);
        self.registrations
            .insert(registration.identity, Arc::clone(&registration));
        registration
    }

    pub fn get(&self, identity: TypeIdentity) -> Option<&Arc<Registration>> {
        self.registrations.get(&identity)
    }

    /// Whether `identity` has a primary factory.
    pub fn contains(&self, identity: TypeIdentity) -> bool {
        self.registrations
            .get(&identity)
            .map(|registration| registration.has_factory())
            .unwrap_or(false)
    }

    pub fn is_registered<T: ?Sized + 'static>(&self) -> bool {
        self.contains(TypeIdentity::of::<T>())
    }

    pub fn has_fallback(&self, identity: TypeIdentity) -> bool {
        self.registrations
            .get(&identity)
            .map(|registration| registration.fallback.is_some())
            .unwrap_or(false)
    }

    pub fn unregister(&mut self, identity: TypeIdentity) -> Option<Arc<Registration>> {
        self.registrations.remove(&identity)
    }

    pub fn unregister_all(&mut self) {
        self.registrations.clear();
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Registered identities in stable order.
    pub fn identities(&self) -> Vec<TypeIdentity> {
        let mut identities: Vec<_> = self.registrations.keys().copied().collect();
        identities.sort();
        identities
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Registration>> {
        self.registrations.values()
    }

    /// Check declared dependencies for unregistered targets and cycles.
    pub fn validate(&self, max_cycles: usize) -> StoreValidation {
        let mut graph = DependencyGraph::new();
        let mut missing = Vec::new();
        let declared_at = std::time::SystemTime::now();

        for registration in self.registrations.values() {
            for dependency in &registration.dependencies {
                graph.add_edge(registration.identity, *dependency, declared_at);
                if !self.registrations.contains_key(dependency) {
                    missing.push((registration.identity, *dependency));
                }
            }
        }
        missing.sort();

        StoreValidation {
            cycles: graph.detect_cycles(max_cycles),
            missing,
        }
    }
}

impl fmt::Debug for RegistrationStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrationStore")
            .field("registrations", &self.identities())
            .finish()
    }
}
