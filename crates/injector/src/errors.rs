//! Error taxonomy of the resolution engine.
//!
//! Severity is decided by the call site: the same `NotRegistered` becomes
//! `None`, a default value, an `Err` or a panic depending on the strategy.

use std::{fmt, sync::Arc, time::Duration};
use thiserror::Error;

use crate::{domain::Domain, identity::TypeIdentity, scope::ScopeKind};

/// Factory error kept intact so callers can downcast it.
#[derive(Clone)]
pub struct FactoryCause(Arc<anyhow::Error>);

impl FactoryCause {
    pub fn new(error: anyhow::Error) -> Self {
        Self(Arc::new(error))
    }

    pub fn error(&self) -> &anyhow::Error {
        &self.0
    }
}

impl fmt::Debug for FactoryCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for FactoryCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

#[derive(Debug, Error, Clone)]
pub enum DiError {
    /// No registration and no fallback for the identity.
    #[error("no registration for {identity}")]
    NotRegistered { identity: TypeIdentity },

    /// The fallback factory itself failed.
    #[error("fallback factory for {identity} failed: {cause}")]
    FallbackInvocationFailed {
        identity: TypeIdentity,
        cause: FactoryCause,
    },

    /// The primary factory failed; the original error is kept in `cause`.
    #[error("failed to construct {identity}: {cause}")]
    ConstructionFailed {
        identity: TypeIdentity,
        cause: FactoryCause,
    },

    #[error("circular dependency: {}", format_chain(chain))]
    CircularDependency { chain: Vec<TypeIdentity> },

    /// Another caller was constructing the same scoped key for too long.
    #[error("timed out after {waited:?} waiting for {identity} to be constructed")]
    ConstructionTimeout {
        identity: TypeIdentity,
        waited: Duration,
    },

    #[error("{identity} has an async factory and must be resolved with an async resolver")]
    AsyncFactoryInSyncContext { identity: TypeIdentity },

    #[error("instance registered for {identity} is not a {expected}")]
    TypeMismatch {
        identity: TypeIdentity,
        expected: &'static str,
    },

    #[error("invalid {kind} scope operation: {reason}")]
    InvalidScope { kind: ScopeKind, reason: String },

    /// Construction was handed to a domain executor that dropped the task.
    #[error("domain {domain} did not complete the construction")]
    DomainUnavailable { domain: Domain },

    #[error("configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },
}

impl DiError {
    pub(crate) fn construction(identity: TypeIdentity, error: anyhow::Error) -> Self {
        DiError::ConstructionFailed {
            identity,
            cause: FactoryCause::new(error),
        }
    }

    pub(crate) fn fallback(identity: TypeIdentity, error: anyhow::Error) -> Self {
        DiError::FallbackInvocationFailed {
            identity,
            cause: FactoryCause::new(error),
        }
    }

    pub(crate) fn configuration(message: impl Into<String>, field: impl Into<String>) -> Self {
        DiError::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Identity the error is about, when it concerns a single type.
    pub fn identity(&self) -> Option<TypeIdentity> {
        match self {
            DiError::NotRegistered { identity }
            | DiError::FallbackInvocationFailed { identity, .. }
            | DiError::ConstructionFailed { identity, .. }
            | DiError::ConstructionTimeout { identity, .. }
            | DiError::AsyncFactoryInSyncContext { identity }
            | DiError::TypeMismatch { identity, .. } => Some(*identity),
            DiError::CircularDependency { chain } => chain.last().copied(),
            _ => None,
        }
    }

    /// Error raised by a factory, if this error wraps one.
    pub fn cause(&self) -> Option<&anyhow::Error> {
        match self {
            DiError::ConstructionFailed { cause, .. }
            | DiError::FallbackInvocationFailed { cause, .. } => Some(cause.error()),
            _ => None,
        }
    }

    pub fn is_not_registered(&self) -> bool {
        matches!(self, DiError::NotRegistered { .. })
    }
}

fn format_chain(chain: &[TypeIdentity]) -> String {
    chain
        .iter()
        .map(|identity| identity.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Database;
    struct Repository;

    #[derive(Debug, thiserror::Error)]
    #[error("connection refused")]
    struct ConnectionRefused;

    #[test]
    fn construction_error_keeps_original_cause() {
        let err = DiError::construction(
            TypeIdentity::of::<Database>(),
            anyhow::Error::new(ConnectionRefused),
        );

        assert_eq!(err.identity(), Some(TypeIdentity::of::<Database>()));
        let cause = err.cause().expect("cause");
        assert!(cause.downcast_ref::<ConnectionRefused>().is_some());
        assert_eq!(
            err.to_string(),
            "failed to construct Database: connection refused"
        );
    }

    #[test]
    fn circular_dependency_renders_chain() {
        let err = DiError::CircularDependency {
            chain: vec![
                TypeIdentity::of::<Database>(),
                TypeIdentity::of::<Repository>(),
                TypeIdentity::of::<Database>(),
            ],
        };
        assert_eq!(
            err.to_string(),
            "circular dependency: Database -> Repository -> Database"
        );
    }
}
