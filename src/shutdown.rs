//! The process-wide single-shot shutdown signal.
//!
//! The signal is a latched boolean: it transitions from unset to set exactly
//! once and never reverts. Interested parties can block on the transition
//! ([`ShutdownSignal::wait`], [`ShutdownSignal::wait_for`]) or register a
//! one-shot callback ([`ShutdownSignal::subscribe`]). A callback registered
//! after the latch has already flipped is invoked synchronously before
//! `subscribe` returns, so no subscriber can be installed "too late" to
//! observe shutdown.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

type Callback = Box<dyn FnOnce() + Send>;

/// A registered callback. The boxed closure is taken out of the slot exactly
/// once, whichever of the latch transition, the late-subscribe path, or a
/// racing detach gets there first.
struct Subscriber {
    callback: Mutex<Option<Callback>>,
}

impl Subscriber {
    fn fire(&self) {
        let callback = self.callback.lock().take();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn disarm(&self) {
        drop(self.callback.lock().take());
    }
}

struct SignalState {
    /// Fast-path accessor mirroring the latch.
    latched: AtomicBool,
    /// Latch paired with `cond` for the blocking waits.
    state: Mutex<bool>,
    cond: Condvar,
    next_token: AtomicU64,
    subscribers: Mutex<BTreeMap<u64, Arc<Subscriber>>>,
}

/// Single-shot broadcast flag with subscription and wait primitives.
///
/// Cloning is cheap and every clone observes the same latch.
#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Arc<SignalState>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    /// Create a new, unset signal.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalState {
                latched: AtomicBool::new(false),
                state: Mutex::new(false),
                cond: Condvar::new(),
                next_token: AtomicU64::new(0),
                subscribers: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// O(1) check of the latch.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.inner.latched.load(Ordering::Acquire)
    }

    /// Latch the signal. Idempotent; returns the previous value so the first
    /// caller can take the initiator path.
    ///
    /// On the first transition every registered callback is fired, each at
    /// most once. Callbacks are copied out of the subscriber list before
    /// invocation so user code never runs under the list's lock.
    pub fn set(&self) -> bool {
        let previous = {
            let mut latched = self.inner.state.lock();
            let previous = *latched;
            *latched = true;
            self.inner.latched.store(true, Ordering::Release);
            self.inner.cond.notify_all();
            previous
        };

        if !previous {
            debug!("shutdown signal latched");
            let pending: Vec<Arc<Subscriber>> =
                self.inner.subscribers.lock().values().cloned().collect();
            for subscriber in pending {
                subscriber.fire();
            }
        }
        previous
    }

    /// Block the caller until the signal is latched.
    pub fn wait(&self) {
        let mut latched = self.inner.state.lock();
        while !*latched {
            self.inner.cond.wait(&mut latched);
        }
    }

    /// Block up to `timeout`; returns whether the signal was observed.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut latched = self.inner.state.lock();
        while !*latched {
            if self
                .inner
                .cond
                .wait_until(&mut latched, deadline)
                .timed_out()
            {
                return *latched;
            }
        }
        true
    }

    /// Register `callback` to fire exactly once when the signal latches. If
    /// the signal is already set, `callback` is invoked synchronously before
    /// this call returns.
    ///
    /// The returned subscription detaches the callback when dropped; after
    /// the drop completes the callback can no longer fire.
    #[must_use = "dropping the subscription immediately detaches the callback"]
    pub fn subscribe<F>(&self, callback: F) -> ShutdownSubscription
    where
        F: FnOnce() + Send + 'static,
    {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let subscriber = Arc::new(Subscriber {
            callback: Mutex::new(Some(Box::new(callback))),
        });
        self.inner
            .subscribers
            .lock()
            .insert(token, Arc::clone(&subscriber));

        // The latch may have flipped while we were inserting; the take-once
        // slot keeps this path and the broadcast path from both firing.
        if self.is_set() {
            subscriber.fire();
        }

        ShutdownSubscription {
            inner: Arc::clone(&self.inner),
            token,
        }
    }
}

/// Scoped acquisition of a shutdown subscription; detaches on drop.
pub struct ShutdownSubscription {
    inner: Arc<SignalState>,
    token: u64,
}

impl Drop for ShutdownSubscription {
    fn drop(&mut self) {
        let subscriber = self.inner.subscribers.lock().remove(&self.token);
        if let Some(subscriber) = subscriber {
            subscriber.disarm();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn set_reports_previous_value() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_set());
        assert!(!signal.set());
        assert!(signal.set());
        assert!(signal.is_set());
    }

    #[test]
    fn callback_fires_exactly_once_on_latch() {
        let signal = ShutdownSignal::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&fired);
        let _subscription = signal.subscribe(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        signal.set();
        signal.set();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_subscriber_fires_synchronously() {
        let signal = ShutdownSignal::new();
        signal.set();

        let fired = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&fired);
        let _subscription = signal.subscribe(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_subscription_does_not_fire() {
        let signal = ShutdownSignal::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&fired);
        let subscription = signal.subscribe(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });
        drop(subscription);

        signal.set();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn wait_for_times_out_while_unset() {
        let signal = ShutdownSignal::new();
        assert!(!signal.wait_for(Duration::from_millis(20)));
    }

    #[test]
    fn wait_observes_latch_from_another_thread() {
        let signal = ShutdownSignal::new();
        let remote = signal.clone();
        let setter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.set();
        });

        assert!(signal.wait_for(Duration::from_secs(5)));
        signal.wait();
        setter.join().expect("setter thread");
    }

    #[test]
    fn many_subscribers_all_fire() {
        let signal = ShutdownSignal::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let subscriptions: Vec<_> = (0..8)
            .map(|_| {
                let observed = Arc::clone(&fired);
                signal.subscribe(move || {
                    observed.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        signal.set();
        assert_eq!(fired.load(Ordering::SeqCst), 8);
        drop(subscriptions);
    }
}
