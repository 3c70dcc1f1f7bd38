//! Resolution events: the only link between the resolution path and analysis.
//!
//! Resolvers `try_send` into a bounded channel and never wait. A full
//! buffer is flushed into analysis by whichever resolver finds the analysis
//! lock free; otherwise the oldest pending event is evicted and counted, so
//! the newest events always survive. Analysis also drains the channel
//! whenever diagnostics are requested.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, SystemTime},
};
use tracing::trace;

use crate::{domain::Domain, identity::TypeIdentity};

/// How a successful resolution was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionOutcome {
    Constructed,
    CacheHit,
    FastPathHit,
    Fallback,
}

#[derive(Debug, Clone)]
pub enum ResolutionEvent {
    /// `from` asked for `to` while being constructed.
    Edge {
        from: TypeIdentity,
        to: TypeIdentity,
        at: SystemTime,
    },
    Resolved {
        identity: TypeIdentity,
        domain: Domain,
        outcome: ResolutionOutcome,
        elapsed: Duration,
        /// Hand-off cost when construction ran in another domain.
        hop: Option<Duration>,
        at: SystemTime,
    },
    Failed {
        identity: TypeIdentity,
        domain: Domain,
        at: SystemTime,
    },
}

const EVICTION_ATTEMPTS: usize = 8;

pub struct EventSink {
    sender: Sender<ResolutionEvent>,
    receiver: Receiver<ResolutionEvent>,
    dropped: AtomicU64,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity.max(1));
        Self {
            sender,
            receiver,
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue `event`, handing it back when the buffer is full.
    pub fn offer(&self, event: ResolutionEvent) -> Option<ResolutionEvent> {
        match self.sender.try_send(event) {
            Ok(()) => None,
            Err(TrySendError::Full(event)) => Some(event),
            // the sink owns its receiver
            Err(TrySendError::Disconnected(_)) => None,
        }
    }

    /// Queue `event`, evicting the oldest pending events to make room.
    pub fn record(&self, event: ResolutionEvent) {
        let mut event = event;
        for _ in 0..EVICTION_ATTEMPTS {
            event = match self.offer(event) {
                None => return,
                Some(event) => event,
            };
            if self.receiver.try_recv().is_ok() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        // lost every race against other writers
        trace!("event buffer contended, dropping newest event");
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Pending events, oldest first.
    pub fn drain(&self) -> Vec<ResolutionEvent> {
        self.receiver.try_iter().collect()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.receiver.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Cache;
    struct Store;

    fn resolved(millis: u64) -> ResolutionEvent {
        ResolutionEvent::Resolved {
            identity: TypeIdentity::of::<Cache>(),
            domain: Domain::Main,
            outcome: ResolutionOutcome::Constructed,
            elapsed: Duration::from_millis(millis),
            hop: None,
            at: SystemTime::now(),
        }
    }

    fn elapsed(event: &ResolutionEvent) -> Option<Duration> {
        match event {
            ResolutionEvent::Resolved { elapsed, .. } => Some(*elapsed),
            _ => None,
        }
    }

    #[test]
    fn full_buffer_evicts_oldest_instead_of_blocking() {
        let sink = EventSink::new(2);
        for millis in 0..5 {
            sink.record(resolved(millis));
        }

        assert_eq!(sink.pending(), 2);
        assert_eq!(sink.dropped(), 3);
        let kept: Vec<_> = sink.drain().iter().filter_map(elapsed).collect();
        assert_eq!(kept, vec![Duration::from_millis(3), Duration::from_millis(4)]);
        assert_eq!(sink.pending(), 0);
    }

    #[test]
    fn offer_hands_back_when_full() {
        let sink = EventSink::new(1);
        assert!(sink.offer(resolved(1)).is_none());
        let returned = sink.offer(resolved(2)).expect("buffer is full");
        assert_eq!(elapsed(&returned), Some(Duration::from_millis(2)));
        assert_eq!(sink.dropped(), 0);

        sink.record(ResolutionEvent::Edge {
            from: TypeIdentity::of::<Cache>(),
            to: TypeIdentity::of::<Store>(),
            at: SystemTime::now(),
        });
        assert!(matches!(sink.drain().as_slice(), [ResolutionEvent::Edge { .. }]));
    }
}
