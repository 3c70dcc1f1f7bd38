//! Type-safe dependency resolution with scoped lifetimes, a live dependency
//! graph and domain-aware resolution.
//!
//! ```
//! use injector::{Container, ScopeKind};
//! use std::sync::Arc;
//!
//! trait Greeter: Send + Sync {
//!     fn greet(&self) -> String;
//! }
//!
//! struct English;
//! impl Greeter for English {
//!     fn greet(&self) -> String {
//!         "hello".to_string()
//!     }
//! }
//!
//! let container = Container::new();
//! container.register_shared::<dyn Greeter, _>(ScopeKind::Singleton, |_| {
//!     Ok(Arc::new(English) as Arc<dyn Greeter>)
//! });
//!
//! let greeter = container.resolve::<dyn Greeter>().unwrap();
//! assert_eq!(greeter.greet(), "hello");
//! assert!(container.resolve_optional::<English>().is_none());
//! ```

pub mod cache;
pub mod config;
pub mod container;
pub mod domain;
pub mod errors;
pub mod events;
pub mod graph;
pub mod hot_path;
pub mod identity;
pub mod lazy;
pub mod logging;
pub mod metrics;
pub mod registration;
pub mod resolver;
pub mod scope;

pub use cache::{CacheEntrySnapshot, CacheKey, CacheOutcome, ScopeCache};
pub use config::{
    ConfigurationLoader, ContainerConfiguration, DiagnosticsConfig, HotPathConfig, OptimizerConfig,
};
pub use container::{Container, ContainerBuilder, ContainerStats, ScopeGuard};
pub use domain::{
    Domain, DomainExecutor, DomainHopOptimizer, DomainUsageReport, OptimizationSuggestion,
    SuggestionKind, TypeProfile,
};
pub use errors::{DiError, FactoryCause};
pub use events::{ResolutionEvent, ResolutionOutcome};
pub use graph::{
    CircularDependencyRecord, DependencyGraph, DependencyGraphSnapshot, DependencyGraphStats,
    GraphEdge, UsageStats,
};
pub use hot_path::FastPathCache;
pub use identity::{InjectionKey, TypeIdentity};
pub use lazy::Lazy;
pub use logging::{init_logging, LogVerbosity, LoggingConfig};
pub use metrics::{LatencyPercentiles, MetricsSnapshot};
pub use registration::{
    Factory, Registration, RegistrationBuilder, RegistrationStore, StoreValidation,
};
pub use resolver::Resolver;
pub use scope::{EffectiveScope, ScopeContext, ScopeId, ScopeKind};

pub type Result<T, E = DiError> = std::result::Result<T, E>;
