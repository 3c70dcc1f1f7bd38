//! Scope cache: constructed instances per (scope kind, scope id, identity).
//!
//! Every key owns a [`Slot`]. The first caller to find a slot empty marks it
//! `Constructing` and runs the factory outside the slot lock; everybody else
//! waits on the slot (condvar for sync callers, `Notify` for async ones).
//! A construction that fails, panics or is cancelled puts the slot back to
//! `Empty` and wakes the waiters, one of which takes over.

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::sync::Notify;
use tracing::debug;

use crate::{
    errors::DiError,
    identity::TypeIdentity,
    registration::Instance,
    scope::{ScopeId, ScopeKind},
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Store generation the instance was built against.
    pub generation: u64,
    /// [`Registration::serial`](crate::registration::Registration::serial)
    /// of the factory that builds the instance.
    pub registration: u64,
    pub kind: ScopeKind,
    pub scope_id: ScopeId,
    pub identity: TypeIdentity,
}

impl CacheKey {
    fn in_scope(&self, kind: ScopeKind, scope_id: &ScopeId) -> bool {
        self.kind == kind && &self.scope_id == scope_id
    }
}

/// A constructed instance and its bookkeeping.
pub struct CacheEntry {
    instance: Instance,
    identity: TypeIdentity,
    kind: ScopeKind,
    scope_id: ScopeId,
    created_at: Instant,
    access_count: AtomicU64,
    last_access: Mutex<Instant>,
}

impl CacheEntry {
    fn new(key: &CacheKey, instance: Instance) -> Self {
        let now = Instant::now();
        Self {
            instance,
            identity: key.identity,
            kind: key.kind,
            scope_id: key.scope_id.clone(),
            created_at: now,
            access_count: AtomicU64::new(1),
            last_access: Mutex::new(now),
        }
    }

    pub(crate) fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn identity(&self) -> TypeIdentity {
        self.identity
    }

    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    pub fn scope_id(&self) -> &ScopeId {
        &self.scope_id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    pub fn last_access(&self) -> Instant {
        *self.last_access.lock()
    }

    fn accessed(&self) {
        self.access_count.fetch_add(1, Ordering::Relaxed);
        *self.last_access.lock() = Instant::now();
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("identity", &self.identity)
            .field("kind", &self.kind)
            .field("scope_id", &self.scope_id)
            .field("access_count", &self.access_count())
            .finish()
    }
}

/// Read-only view of a cached entry for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntrySnapshot {
    pub identity: TypeIdentity,
    pub kind: ScopeKind,
    pub scope_id: ScopeId,
    pub generation: u64,
    pub age: Duration,
    pub idle: Duration,
    pub access_count: u64,
}

/// How [`ScopeCache::get_or_create`] produced its entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    Constructed,
}

enum SlotState {
    Empty,
    Constructing,
    Ready(Arc<CacheEntry>),
}

struct Slot {
    state: Mutex<SlotState>,
    ready: Condvar,
    notify: Notify,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Empty),
            ready: Condvar::new(),
            notify: Notify::new(),
        }
    }

    fn wake_all(&self) {
        self.ready.notify_all();
        self.notify.notify_waiters();
    }

    fn entry(&self) -> Option<Arc<CacheEntry>> {
        match &*self.state.lock() {
            SlotState::Ready(entry) => Some(Arc::clone(entry)),
            _ => None,
        }
    }
}

/// Owned by whoever is constructing; resets the slot unless completed.
struct ConstructionGuard {
    slot: Arc<Slot>,
    completed: bool,
}

impl ConstructionGuard {
    fn new(slot: Arc<Slot>) -> Self {
        Self {
            slot,
            completed: false,
        }
    }

    fn complete(mut self, entry: Arc<CacheEntry>) {
        *self.slot.state.lock() = SlotState::Ready(entry);
        self.completed = true;
        self.slot.wake_all();
    }
}

impl Drop for ConstructionGuard {
    fn drop(&mut self) {
        if !self.completed {
            *self.slot.state.lock() = SlotState::Empty;
            self.slot.wake_all();
        }
    }
}

enum Claim {
    Hit(Arc<CacheEntry>),
    Construct,
}

#[derive(Default)]
pub struct ScopeCache {
    slots: DashMap<CacheKey, Arc<Slot>>,
}

impl ScopeCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &CacheKey) -> Arc<Slot> {
        if let Some(slot) = self.slots.get(key) {
            return Arc::clone(&slot);
        }
        Arc::clone(
            &self
                .slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Slot::new())),
        )
    }

    /// Cached entry for `key`, constructing it at most once across callers.
    pub fn get_or_create<F>(
        &self,
        key: &CacheKey,
        timeout: Duration,
        construct: F,
    ) -> Result<(Arc<CacheEntry>, CacheOutcome), DiError>
    where
        F: FnOnce() -> Result<Instance, DiError>,
    {
        let slot = self.slot(key);
        let deadline = Instant::now() + timeout;

        match Self::claim_blocking(&slot, key, timeout, deadline)? {
            Claim::Hit(entry) => Ok((entry, CacheOutcome::Hit)),
            Claim::Construct => {
                let guard = ConstructionGuard::new(slot);
                let instance = construct()?;
                let entry = Arc::new(CacheEntry::new(key, instance));
                guard.complete(Arc::clone(&entry));
                debug!(identity = %key.identity, scope = %key.kind, id = %key.scope_id, "cached new instance");
                Ok((entry, CacheOutcome::Constructed))
            }
        }
    }

    fn claim_blocking(
        slot: &Slot,
        key: &CacheKey,
        timeout: Duration,
        deadline: Instant,
    ) -> Result<Claim, DiError> {
        let mut state = slot.state.lock();
        loop {
            match &*state {
                SlotState::Ready(entry) => {
                    entry.accessed();
                    return Ok(Claim::Hit(Arc::clone(entry)));
                }
                SlotState::Empty => {
                    *state = SlotState::Constructing;
                    return Ok(Claim::Construct);
                }
                SlotState::Constructing => {
                    let timed_out = slot.ready.wait_until(&mut state, deadline).timed_out();
                    if timed_out && matches!(*state, SlotState::Constructing) {
                        return Err(DiError::ConstructionTimeout {
                            identity: key.identity,
                            waited: timeout,
                        });
                    }
                }
            }
        }
    }

    /// Async counterpart of [`get_or_create`](Self::get_or_create).
    ///
    /// Dropping the returned future while it constructs releases the slot.
    pub async fn get_or_create_async<F, Fut>(
        &self,
        key: &CacheKey,
        timeout: Duration,
        construct: F,
    ) -> Result<(Arc<CacheEntry>, CacheOutcome), DiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Instance, DiError>>,
    {
        let slot = self.slot(key);
        let deadline = Instant::now() + timeout;

        loop {
            let notified = {
                let mut state = slot.state.lock();
                match &*state {
                    SlotState::Ready(entry) => {
                        entry.accessed();
                        return Ok((Arc::clone(entry), CacheOutcome::Hit));
                    }
                    SlotState::Empty => {
                        *state = SlotState::Constructing;
                        None
                    }
                    // Registered before the lock is released, so a wake-up
                    // between here and the await below is not lost.
                    SlotState::Constructing => Some(slot.notify.notified()),
                }
            };

            let Some(notified) = notified else {
                break;
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, notified).await.is_err()
                && matches!(*slot.state.lock(), SlotState::Constructing)
            {
                return Err(DiError::ConstructionTimeout {
                    identity: key.identity,
                    waited: timeout,
                });
            }
        }

        let guard = ConstructionGuard::new(Arc::clone(&slot));
        let instance = construct().await?;
        let entry = Arc::new(CacheEntry::new(key, instance));
        guard.complete(Arc::clone(&entry));
        debug!(identity = %key.identity, scope = %key.kind, id = %key.scope_id, "cached new instance");
        Ok((entry, CacheOutcome::Constructed))
    }

    /// Entry for `key` if it is already constructed.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let slot = self.slots.get(key).map(|slot| Arc::clone(&slot))?;
        let entry = slot.entry()?;
        entry.accessed();
        Some(entry)
    }

    /// Drop every entry of one scope instance. Returns how many were removed.
    pub fn evict(&self, kind: ScopeKind, scope_id: &ScopeId) -> usize {
        self.remove_where(|key| key.in_scope(kind, scope_id))
    }

    /// Drop a single entry of one scope instance.
    pub fn evict_entry(&self, kind: ScopeKind, scope_id: &ScopeId, identity: TypeIdentity) -> bool {
        self.remove_where(|key| key.in_scope(kind, scope_id) && key.identity == identity) > 0
    }

    /// Drop every entry of `identity`, in all scopes.
    pub fn evict_identity(&self, identity: TypeIdentity) -> usize {
        self.remove_where(|key| key.identity == identity)
    }

    /// Drop every entry of `kind`, in all scope instances.
    pub fn evict_kind(&self, kind: ScopeKind) -> usize {
        self.remove_where(|key| key.kind == kind)
    }

    /// Drop entries built against older store generations.
    pub fn purge_generations_before(&self, generation: u64) -> usize {
        self.remove_where(|key| key.generation < generation)
    }

    pub fn clear(&self) {
        self.slots.clear();
    }

    fn remove_where<P>(&self, predicate: P) -> usize
    where
        P: Fn(&CacheKey) -> bool,
    {
        // Only constructed entries count as removed.
        let mut removed = 0;
        self.slots.retain(|key, slot| {
            if !predicate(key) {
                return true;
            }
            if slot.entry().is_some() {
                removed += 1;
            }
            false
        });
        removed
    }

    /// Number of constructed entries.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.value().entry().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<CacheEntrySnapshot> {
        let mut entries: Vec<_> = self
            .slots
            .iter()
            .filter_map(|slot| {
                let entry = slot.value().entry()?;
                Some(CacheEntrySnapshot {
                    identity: entry.identity,
                    kind: entry.kind,
                    scope_id: entry.scope_id.clone(),
                    generation: slot.key().generation,
                    age: entry.created_at.elapsed(),
                    idle: entry.last_access().elapsed(),
                    access_count: entry.access_count(),
                })
            })
            .collect();
        entries.sort_by(|a, b| {
            (a.kind, &a.scope_id, a.identity).cmp(&(b.kind, &b.scope_id, b.identity))
        });
        entries
    }
}
