//! Lifecycle scopes and the "current scope instance" context.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, sync::Arc};

use crate::errors::DiError;

/// Lifetime and caching boundary of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ScopeKind {
    /// One instance for the lifetime of the container.
    Singleton,
    /// One instance per session id.
    Session,
    /// One instance per screen id.
    Screen,
    /// One instance per request id.
    Request,
    /// A new instance on every resolution.
    Transient,
}

impl ScopeKind {
    pub const ALL: [ScopeKind; 5] = [
        ScopeKind::Singleton,
        ScopeKind::Session,
        ScopeKind::Screen,
        ScopeKind::Request,
        ScopeKind::Transient,
    ];

    /// Whether instances of this kind are stored in the scope cache.
    pub fn is_cached(self) -> bool {
        !matches!(self, ScopeKind::Transient)
    }

    /// Whether the caller has to supply a scope instance id.
    pub fn requires_instance_id(self) -> bool {
        matches!(self, ScopeKind::Session | ScopeKind::Screen | ScopeKind::Request)
    }
}

impl Default for ScopeKind {
    fn default() -> Self {
        ScopeKind::Singleton
    }
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScopeKind::Singleton => "singleton",
            ScopeKind::Session => "session",
            ScopeKind::Screen => "screen",
            ScopeKind::Request => "request",
            ScopeKind::Transient => "transient",
        };
        f.write_str(name)
    }
}

/// Caller supplied identifier of a live scope instance ("screen A", a session token).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(Arc<str>);

impl ScopeId {
    const SINGLETON: &'static str = "$singleton";

    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// The implicit id shared by every singleton registration.
    pub fn singleton() -> Self {
        Self::new(Self::SINGLETON)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ScopeId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ScopeId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where an instance of a given kind is cached, after applying the context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectiveScope {
    Cached { kind: ScopeKind, id: ScopeId },
    /// No cache: either a transient registration or a scoped one without a current id.
    Uncached { degraded_from: Option<ScopeKind> },
}

/// Currently active scope instance per kind.
///
/// At most one current id per kind. Callers pair every `set_current` with a
/// `clear`; nothing expires automatically.
#[derive(Debug, Default)]
pub struct ScopeContext {
    current: RwLock<HashMap<ScopeKind, ScopeId>>,
}

impl ScopeContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `id` the current instance of `kind`, returning the previous one.
    pub fn set_current(&self, kind: ScopeKind, id: ScopeId) -> Result<Option<ScopeId>, DiError> {
        if !kind.requires_instance_id() {
            return Err(DiError::InvalidScope {
                kind,
                reason: "only session, screen and request scopes take an instance id".to_string(),
            });
        }
        Ok(self.current.write().insert(kind, id))
    }

    pub fn current(&self, kind: ScopeKind) -> Option<ScopeId> {
        self.current.read().get(&kind).cloned()
    }

    /// Drop the current instance of `kind`.
    pub fn clear(&self, kind: ScopeKind) -> Option<ScopeId> {
        self.current.write().remove(&kind)
    }

    /// Drop the current instance of `kind` only if it is `id`.
    pub fn clear_if_current(&self, kind: ScopeKind, id: &ScopeId) -> bool {
        let mut current = self.current.write();
        if current.get(&kind) == Some(id) {
            current.remove(&kind);
            true
        } else {
            false
        }
    }

    pub fn clear_all(&self) {
        self.current.write().clear();
    }

    pub fn snapshot(&self) -> HashMap<ScopeKind, ScopeId> {
        self.current.read().clone()
    }

    /// Resolve the cache location for a registration declared with `kind`.
    pub fn effective(&self, kind: ScopeKind) -> EffectiveScope {
        match kind {
            ScopeKind::Singleton => EffectiveScope::Cached {
                kind,
                id: ScopeId::singleton(),
            },
            ScopeKind::Transient => EffectiveScope::Uncached {
                degraded_from: None,
            },
            scoped => match self.current(scoped) {
                Some(id) => EffectiveScope::Cached { kind: scoped, id },
                None => EffectiveScope::Uncached {
                    degraded_from: Some(scoped),
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn singleton_and_transient_ignore_context() {
        let ctx = ScopeContext::new();
        assert_eq!(
            ctx.effective(ScopeKind::Singleton),
            EffectiveScope::Cached {
                kind: ScopeKind::Singleton,
                id: ScopeId::singleton()
            }
        );
        assert_eq!(
            ctx.effective(ScopeKind::Transient),
            EffectiveScope::Uncached { degraded_from: None }
        );
    }

    #[test]
    fn scoped_kind_without_current_id_degrades() {
        let ctx = ScopeContext::new();
        assert_eq!(
            ctx.effective(ScopeKind::Screen),
            EffectiveScope::Uncached {
                degraded_from: Some(ScopeKind::Screen)
            }
        );

        ctx.set_current(ScopeKind::Screen, "A".into()).unwrap();
        assert_eq!(
            ctx.effective(ScopeKind::Screen),
            EffectiveScope::Cached {
                kind: ScopeKind::Screen,
                id: "A".into()
            }
        );
    }

    #[test]
    fn set_current_replaces_and_reports_previous() {
        let ctx = ScopeContext::new();
        assert_eq!(ctx.set_current(ScopeKind::Session, "s1".into()).unwrap(), None);
        assert_eq!(
            ctx.set_current(ScopeKind::Session, "s2".into()).unwrap(),
            Some(ScopeId::from("s1"))
        );
        assert_eq!(ctx.current(ScopeKind::Session), Some(ScopeId::from("s2")));
    }

    #[test]
    fn clear_if_current_leaves_other_ids_alone() {
        let ctx = ScopeContext::new();
        ctx.set_current(ScopeKind::Request, "r1".into()).unwrap();
        assert!(!ctx.clear_if_current(ScopeKind::Request, &"r2".into()));
        assert!(ctx.clear_if_current(ScopeKind::Request, &"r1".into()));
        assert_eq!(ctx.current(ScopeKind::Request), None);
    }

    #[test]
    fn singleton_cannot_take_an_instance_id() {
        let ctx = ScopeContext::new();
        let err = ctx
            .set_current(ScopeKind::Singleton, "x".into())
            .unwrap_err();
        assert!(matches!(err, DiError::InvalidScope { .. }));
    }
}
