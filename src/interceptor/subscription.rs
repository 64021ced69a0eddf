//! Inbound unit subscriptions.
//!
//! A subscription is a `(start, stop, callback)` triple bound to one
//! transport source. Every inbound unit passing `start` reaches `callback`;
//! the first unit passing `stop` deregisters the subscription.

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::identifiers::{HandleId, SubscriptionId};

// ============================================================================
// Types
// ============================================================================

/// Predicate over an inbound unit.
pub type UnitFilter = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Receiver of matching inbound units.
pub type UnitCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Where an inbound unit came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum UnitSource {
    /// A specific captured duplex socket.
    Duplex(HandleId),
    /// Any completed polling exchange.
    Poll,
}

/// Registered subscription state.
pub(crate) struct SubscriptionEntry {
    source: UnitSource,
    start: UnitFilter,
    stop: UnitFilter,
    callback: UnitCallback,
    active: AtomicBool,
    /// Serialises dispatch against deregistration.
    dispatch: Mutex<()>,
}

// ============================================================================
// SubscriptionRegistry
// ============================================================================

/// Live subscriptions keyed by id.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    entries: Mutex<FxHashMap<SubscriptionId, Arc<SubscriptionEntry>>>,
}

impl SubscriptionRegistry {
    /// Registers a subscription on `source`.
    pub(crate) fn register(
        self: &Arc<Self>,
        source: UnitSource,
        start: UnitFilter,
        stop: UnitFilter,
        callback: UnitCallback,
    ) -> Subscription {
        let id = SubscriptionId::next();
        let entry = Arc::new(SubscriptionEntry {
            source,
            start,
            stop,
            callback,
            active: AtomicBool::new(true),
            dispatch: Mutex::new(()),
        });

        self.entries.lock().insert(id, Arc::clone(&entry));
        debug!(subscription = %id, ?source, "Subscription registered");

        Subscription {
            id,
            entry,
            registry: Arc::downgrade(self),
        }
    }

    /// Offers one inbound unit to every subscription on `source`.
    pub(crate) fn dispatch(&self, source: UnitSource, unit: &str) {
        let matching: Vec<(SubscriptionId, Arc<SubscriptionEntry>)> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.source == source)
            .map(|(id, entry)| (*id, Arc::clone(entry)))
            .collect();

        for (id, entry) in matching {
            let _guard = entry.dispatch.lock();
            if !entry.active.load(Ordering::Acquire) {
                continue;
            }

            if (entry.start)(unit) {
                (entry.callback)(unit);
            }

            if (entry.stop)(unit) {
                entry.active.store(false, Ordering::Release);
                self.entries.lock().remove(&id);
                trace!(subscription = %id, "Stop condition met");
            }
        }
    }

    /// Drops every subscription.
    pub(crate) fn clear(&self) {
        let drained: Vec<Arc<SubscriptionEntry>> =
            self.entries.lock().drain().map(|(_, entry)| entry).collect();
        for entry in drained {
            entry.active.store(false, Ordering::Release);
        }
    }

    /// Number of live subscriptions.
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn remove(&self, id: SubscriptionId) {
        self.entries.lock().remove(&id);
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// Handle to a registered subscription.
///
/// Dropping the handle does not cancel the subscription; call
/// [`cancel`](Self::cancel).
pub struct Subscription {
    id: SubscriptionId,
    entry: Arc<SubscriptionEntry>,
    registry: Weak<SubscriptionRegistry>,
}

impl Subscription {
    /// Returns the subscription id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Returns `true` until cancelled or stopped.
    #[inline]
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.entry.active.load(Ordering::Acquire)
    }

    /// Stops delivery. Safe to call repeatedly or after the stop condition
    /// already fired.
    pub fn cancel(&self) {
        if self.entry.active.swap(false, Ordering::AcqRel) {
            debug!(subscription = %self.id, "Subscription cancelled");
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
