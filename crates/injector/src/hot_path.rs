//! Per-domain fast path for hot singletons.
//!
//! Opt-in per identity: nothing is cached here until [`FastPathCache::enable`]
//! is called for the domain the type is mostly resolved from. A hit skips
//! the registration lookup and the scope cache entirely.

use dashmap::DashMap;
use std::time::Instant;
use tracing::debug;

use crate::{config::HotPathConfig, domain::Domain, identity::TypeIdentity, registration::Instance};

struct FastPathEntry {
    instance: Instance,
    /// Serial of the registration whose factory built `instance`.
    serial: u64,
    inserted_at: Instant,
}

pub struct FastPathCache {
    entries: DashMap<(Domain, TypeIdentity), FastPathEntry>,
    enabled: DashMap<TypeIdentity, Domain>,
    config: HotPathConfig,
}

impl FastPathCache {
    pub fn new(config: HotPathConfig) -> Self {
        Self {
            entries: DashMap::new(),
            enabled: DashMap::new(),
            config,
        }
    }

    pub fn enable(&self, identity: TypeIdentity, domain: Domain) {
        if let Some(previous) = self.enabled.insert(identity, domain) {
            if previous != domain {
                self.entries.remove(&(previous, identity));
            }
        }
        debug!(identity = %identity, domain = %domain, "fast path enabled");
    }

    pub fn disable(&self, identity: TypeIdentity) {
        if let Some((_, domain)) = self.enabled.remove(&identity) {
            self.entries.remove(&(domain, identity));
        }
    }

    pub fn enabled_in(&self, identity: TypeIdentity) -> Option<Domain> {
        self.enabled.get(&identity).map(|domain| *domain)
    }

    /// Served only while `serial` still names the registration the entry was
    /// built from.
    pub fn get(&self, domain: Domain, identity: TypeIdentity, serial: u64) -> Option<Instance> {
        if self.enabled_in(identity) != Some(domain) {
            return None;
        }

        let key = (domain, identity);
        let ttl = self.config.ttl();
        {
            let entry = self.entries.get(&key)?;
            if entry.serial == serial && entry.inserted_at.elapsed() <= ttl {
                return Some(entry.instance.clone());
            }
        }
        // replaced registration or expired
        self.entries.remove(&key);
        None
    }

    pub fn insert(&self, domain: Domain, identity: TypeIdentity, serial: u64, instance: Instance) {
        if self.enabled_in(identity) != Some(domain) || self.config.max_entries == 0 {
            return;
        }

        let key = (domain, identity);
        if !self.entries.contains_key(&key) && self.entries.len() >= self.config.max_entries {
            self.evict_oldest();
        }
        self.entries.insert(
            key,
            FastPathEntry {
                instance,
                serial,
                inserted_at: Instant::now(),
            },
        );
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().inserted_at)
            .map(|entry| *entry.key());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }

    pub fn invalidate(&self, identity: TypeIdentity) {
        self.entries.retain(|(_, cached), _| *cached != identity);
    }

    /// Drop cached instances, keep the enabled set.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Drop cached instances and the enabled set.
    pub fn reset(&self) {
        self.entries.clear();
        self.enabled.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
