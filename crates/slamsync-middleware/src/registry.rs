//! Synchronous, typed multicast.
//!
//! An [`ObserverRegistry<T>`] hands every published `&T` to each currently
//! subscribed [`Observer<T>`], in subscription order, on the caller's
//! execution context.
//!
//! * The subscriber list is snapshotted under the lock and the lock is
//!   released before any observer runs, so observers may subscribe,
//!   unsubscribe or publish re-entrantly.
//! * A failing (or panicking) observer is isolated: the failure is recorded
//!   in the returned [`DeliveryReport`] and delivery continues with the next
//!   observer.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use slamsync_types::SyncError;
use tracing::{debug, warn};

// ────────────────────────────────────────────────────────────────────────────
// Observer capability
// ────────────────────────────────────────────────────────────────────────────

/// The single "receives `T`" capability every consumer implements.
pub trait Observer<T>: Send + Sync {
    /// Name used in failure reports and logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn observe(&self, value: &T) -> Result<(), SyncError>;
}

/// Adapter turning a closure into an [`Observer`].
pub struct FnObserver<F> {
    name: String,
    f: F,
}

impl<T, F> Observer<T> for FnObserver<F>
where
    F: Fn(&T) -> Result<(), SyncError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn observe(&self, value: &T) -> Result<(), SyncError> {
        (self.f)(value)
    }
}

/// Wrap `f` as a shareable observer.
pub fn observer_fn<T, F>(name: impl Into<String>, f: F) -> Arc<dyn Observer<T>>
where
    T: 'static,
    F: Fn(&T) -> Result<(), SyncError> + Send + Sync + 'static,
{
    Arc::new(FnObserver {
        name: name.into(),
        f,
    })
}

// ────────────────────────────────────────────────────────────────────────────
// Subscription handles and reports
// ────────────────────────────────────────────────────────────────────────────

/// Handle returned by [`ObserverRegistry::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// One isolated observer failure.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryFailure {
    pub id: SubscriptionId,
    /// Always [`SyncError::ObserverDeliveryFailure`].
    pub error: SyncError,
}

/// Outcome of one [`ObserverRegistry::publish`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryReport {
    /// Observers that accepted the value.
    pub delivered: usize,
    pub failures: Vec<DeliveryFailure>,
}

impl DeliveryReport {
    pub fn attempted(&self) -> usize {
        self.delivered + self.failures.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ObserverRegistry
// ────────────────────────────────────────────────────────────────────────────

struct RegistryState<T> {
    next_id: u64,
    observers: Vec<(SubscriptionId, Arc<dyn Observer<T>>)>,
    closed: bool,
}

/// Subscribe/unsubscribe multicast primitive.
pub struct ObserverRegistry<T> {
    name: String,
    state: Mutex<RegistryState<T>>,
    failures: AtomicU64,
}

impl<T> ObserverRegistry<T> {
    /// `name` labels log lines and failure reports (e.g. the topic name).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(RegistryState {
                next_id: 0,
                observers: Vec::new(),
                closed: false,
            }),
            failures: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append `observer` to the delivery list.
    ///
    /// On a closed registry the observer is discarded; the returned id is
    /// still unique.
    pub fn subscribe(&self, observer: Arc<dyn Observer<T>>) -> SubscriptionId {
        let mut state = self.state();
        let id = SubscriptionId(state.next_id);
        state.next_id += 1;
        if state.closed {
            debug!(registry = %self.name, observer = observer.name(), "subscribe on closed registry ignored");
        } else {
            state.observers.push((id, observer));
        }
        id
    }

    /// Remove a subscription.  Returns `false` if `id` was not subscribed.
    ///
    /// A `publish` already in flight may still deliver to the removed
    /// observer; later calls will not.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.state();
        let before = state.observers.len();
        state.observers.retain(|(sid, _)| *sid != id);
        state.observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.state().observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every subscriber and refuse new ones.
    pub fn close(&self) {
        let mut state = self.state();
        state.closed = true;
        state.observers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Total observer failures isolated since creation.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Deliver `value` to every observer subscribed when the call began.
    pub fn publish(&self, value: &T) -> DeliveryReport {
        let snapshot: Vec<(SubscriptionId, Arc<dyn Observer<T>>)> = {
            let state = self.state();
            if state.closed {
                return DeliveryReport::default();
            }
            state.observers.clone()
        };

        let mut report = DeliveryReport::default();
        for (id, observer) in snapshot {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| observer.observe(value)));
            let details = match outcome {
                Ok(Ok(())) => {
                    report.delivered += 1;
                    continue;
                }
                Ok(Err(err)) => err.to_string(),
                Err(payload) => format!("observer panicked: {}", panic_message(payload.as_ref())),
            };

            self.failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                registry = %self.name,
                observer = observer.name(),
                subscription = %id,
                error = %details,
                "observer delivery failed"
            );
            report.failures.push(DeliveryFailure {
                id,
                error: SyncError::ObserverDeliveryFailure {
                    observer: observer.name().to_string(),
                    details,
                },
            });
        }
        report
    }

    fn state(&self) -> MutexGuard<'_, RegistryState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> fmt::Debug for ObserverRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("ObserverRegistry")
            .field("name", &self.name)
            .field("observers", &state.observers.len())
            .field("closed", &state.closed)
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}
