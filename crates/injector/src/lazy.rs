//! Deferred dependency accessor.

use once_cell::sync::OnceCell;
use std::{fmt, sync::Arc};

use crate::{errors::DiError, identity::TypeIdentity, resolver::Resolver};

/// Resolves `T` on first access and keeps the result.
///
/// Failures are not cached: a later access tries again.
///
/// ```
/// use injector::Container;
///
/// struct Metrics;
/// struct Handler {
///     metrics: injector::Lazy<Metrics>,
/// }
///
/// let container = Container::new();
/// let handler = Handler { metrics: container.lazy() };
/// assert!(handler.metrics.get().is_err());
///
/// container.register(|_| Ok(Metrics));
/// assert!(handler.metrics.get().is_ok());
/// assert!(handler.metrics.is_resolved());
/// ```
pub struct Lazy<T: ?Sized> {
    resolver: Resolver,
    cell: OnceCell<Arc<T>>,
}

impl<T: ?Sized + Send + Sync + 'static> Lazy<T> {
    pub(crate) fn new(resolver: Resolver) -> Self {
        Self {
            resolver,
            cell: OnceCell::new(),
        }
    }

    pub fn get(&self) -> Result<Arc<T>, DiError> {
        self.cell
            .get_or_try_init(|| self.resolver.resolve::<T>())
            .map(Arc::clone)
    }

    pub fn get_optional(&self) -> Option<Arc<T>> {
        self.get().ok()
    }

    /// Like [`Resolver::resolve_required`].
    #[track_caller]
    pub fn required(&self) -> Arc<T> {
        match self.get() {
            Ok(instance) => instance,
            Err(err) => panic!(
                "required dependency {} could not be resolved: {err}",
                TypeIdentity::of::<T>()
            ),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.cell.get().is_some()
    }
}

impl<T: ?Sized> fmt::Debug for Lazy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lazy")
            .field("resolved", &self.cell.get().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{container::Container, scope::ScopeKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Clock;

    #[test]
    fn resolves_once_on_first_access() {
        let container = Container::new();
        let constructions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&constructions);
        container.register_scoped(ScopeKind::Transient, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Clock)
        });

        let lazy = container.lazy::<Clock>();
        assert!(!lazy.is_resolved());
        assert_eq!(constructions.load(Ordering::SeqCst), 0);

        let first = lazy.get().unwrap();
        let second = lazy.get().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(constructions.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "required dependency Clock")]
    fn required_panics_when_missing() {
        let container = Container::new();
        let lazy = container.lazy::<Clock>();
        lazy.required();
    }
}
