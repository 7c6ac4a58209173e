//! The process-wide lifetime manager.
//!
//! The manager owns the shutdown signal, the tracked-entity registry, the
//! replaceable logger sink, and the list of owned worker threads it will join
//! on the way out. It must be activated exactly once before any registration
//! or query; activation hands back a [`LifetimeGuard`] whose drop runs the
//! same termination protocol when `main` falls off the end without an
//! explicit [`LifetimeManager::exit`] (the "organic" exit path).
//!
//! The termination protocol has two grace windows: one waiting for the
//! tracked registry to drain, and a second one waiting for the owned threads
//! to be joined. A worker that outlives its window is named in the journal
//! and the process aborts; no attempt is made to force-kill threads.

use std::panic::Location;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::registry::{TrackedEntity, TrackedId, TrackedRegistry};
use crate::shutdown::{ShutdownSignal, ShutdownSubscription};

/// Replaceable sink for the termination journal. All journal lines serialize
/// through the manager's mutex before reaching the sink.
pub type LoggerSink = Box<dyn Fn(&str) + Send>;

struct ManagerState {
    activated: AtomicBool,
    config: Mutex<Arc<Config>>,
    logger: Mutex<Option<LoggerSink>>,
    signal: ShutdownSignal,
    registry: TrackedRegistry,
    owned_threads: Mutex<Vec<JoinHandle<()>>>,
}

static GLOBAL: LazyLock<LifetimeManager> = LazyLock::new(LifetimeManager::new);

/// Coordinates registration, shutdown, and final exit for the whole process.
///
/// Cloning is cheap; every clone refers to the same process-wide state.
#[derive(Clone)]
pub struct LifetimeManager {
    inner: Arc<ManagerState>,
}

impl LifetimeManager {
    /// The process-wide manager instance.
    #[must_use]
    pub fn global() -> &'static Self {
        &GLOBAL
    }

    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(ManagerState {
                activated: AtomicBool::new(false),
                config: Mutex::new(Arc::new(Config::default())),
                logger: Mutex::new(None),
                signal: ShutdownSignal::new(),
                registry: TrackedRegistry::new(),
                owned_threads: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn activate_impl(&self, config: Config, logger: Option<LoggerSink>) {
        let handle_os_signals = config.handle_os_signals;
        let grace = config.grace();

        let was_activated = self.inner.activated.swap(true, Ordering::SeqCst);
        *self.inner.logger.lock() = logger;
        *self.inner.config.lock() = Arc::new(config);

        if was_activated {
            self.log("activate() called twice, aborting.");
            std::process::abort();
        }
        debug!("lifetime manager activated");

        if handle_os_signals {
            crate::os_signals::install(self.clone(), grace);
        }
    }

    fn abort_if_not_activated(&self) {
        if !self.inner.activated.load(Ordering::SeqCst) {
            self.log("used before activate(), aborting.");
            std::process::abort();
        }
    }

    fn config(&self) -> Arc<Config> {
        Arc::clone(&self.inner.config.lock())
    }

    /// Write one line to the termination journal: the user sink if one was
    /// installed at activation, otherwise stderr with the configured tag.
    pub fn log(&self, message: &str) {
        let sink = self.inner.logger.lock();
        if let Some(sink) = sink.as_ref() {
            sink(message);
        } else {
            let tag = self.config().logger_tag.clone();
            eprintln!("{tag}: {message}");
        }
    }

    /// O(1) check whether shutdown has latched.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.inner.signal.is_set()
    }

    /// Block the calling thread until shutdown latches.
    pub fn wait_until_shutdown(&self) {
        self.abort_if_not_activated();
        self.inner.signal.wait();
    }

    /// Sleep up to `duration` or until shutdown latches, whichever comes
    /// first. Returns `true` iff shutdown has not latched, so worker loops
    /// read as `while manager.sleep_for(tick) { .. }`.
    pub fn sleep_for(&self, duration: Duration) -> bool {
        self.abort_if_not_activated();
        !self.inner.signal.wait_for(duration)
    }

    /// Register `callback` to fire exactly once when shutdown latches; fires
    /// synchronously if it already has. The subscription detaches on drop.
    #[must_use = "dropping the subscription immediately detaches the callback"]
    pub fn subscribe_shutdown<F>(&self, callback: F) -> ShutdownSubscription
    where
        F: FnOnce() + Send + 'static,
    {
        self.abort_if_not_activated();
        self.inner.signal.subscribe(callback)
    }

    pub(crate) fn register(
        &self,
        description: String,
        file: &'static str,
        line: u32,
    ) -> TrackedId {
        self.abort_if_not_activated();
        self.inner.registry.add(description, file, line)
    }

    pub(crate) fn deregister(&self, id: TrackedId) {
        self.inner.registry.remove(id);
    }

    /// Visit every live tracked entity, most recent first.
    pub fn dump_active<F: FnMut(&TrackedEntity)>(&self, visitor: F) {
        self.abort_if_not_activated();
        self.inner.registry.dump(visitor);
    }

    /// Write every live tracked entity to the journal, most recent first.
    pub fn log_active(&self) {
        self.dump_active(|entity| self.log(&entity.short_display()));
    }

    /// Render the live registry as status-report lines, most recent first.
    #[must_use]
    pub fn status_report(&self) -> String {
        let mut report = String::new();
        self.dump_active(|entity| {
            report.push_str(&entity.status_line());
            report.push('\n');
        });
        report
    }

    /// Start a thread whose handle the manager will join on exit. Returns
    /// `false` without starting anything if shutdown has already latched.
    /// Owned handles are never detached.
    pub(crate) fn spawn_owned<F>(&self, body: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.abort_if_not_activated();
        if self.inner.signal.is_set() {
            debug!("already shutting down; thread not started");
            return false;
        }
        let handle = thread::spawn(body);
        self.inner.owned_threads.lock().push(handle);
        true
    }

    /// Spawn a tracked worker thread. The call does not return until the
    /// worker has registered itself, so shutdown can never race past a
    /// thread that has not yet announced itself. The worker deregisters on
    /// every exit path, including panics.
    ///
    /// Returns `false` without starting anything if shutdown has already
    /// latched.
    #[track_caller]
    pub fn spawn_thread<F>(&self, description: impl Into<String>, body: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let location = Location::caller();
        let description = description.into();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<()>(1);

        let manager = self.clone();
        let started = self.spawn_owned(move || {
            let id = manager.register(description, location.file(), location.line());
            let _deregister = DeregisterGuard::new(manager, id);
            let _ = ready_tx.send(());
            body();
        });

        if started {
            let _ = ready_rx.recv();
        }
        started
    }

    /// Construct a long-lived instance on a dedicated owner thread and hand
    /// back a shared reference to it.
    ///
    /// The owner thread builds the value, registers it, publishes it to the
    /// caller, then parks until shutdown. Each instance owns its thread, so
    /// a slow destructor only delays its own deregistration. The destructor
    /// runs on the owner thread provided callers have released their clones
    /// by then.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShuttingDown`] if shutdown has already latched, or
    /// [`Error::InstanceUnavailable`] if the constructor panicked.
    #[track_caller]
    pub fn tracked_instance<T, F>(&self, description: impl Into<String>, init: F) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let location = Location::caller();
        let description = description.into();
        let owner_description = description.clone();
        let (publish_tx, publish_rx) = crossbeam_channel::bounded::<Arc<T>>(1);

        let manager = self.clone();
        let started = self.spawn_owned(move || {
            let instance = Arc::new(init());
            let id = manager.register(owner_description, location.file(), location.line());
            let _deregister = DeregisterGuard::new(manager.clone(), id);
            let _ = publish_tx.send(Arc::clone(&instance));
            manager.inner.signal.wait();
            // Destruct before the guard deregisters.
            drop(instance);
        });

        if !started {
            return Err(Error::ShuttingDown);
        }
        publish_rx
            .recv()
            .map_err(|_| Error::instance_unavailable(description))
    }

    /// Latch the shutdown signal and run the termination protocol: wait up
    /// to `grace` for the registry to drain, then up to `grace` again for
    /// the owned threads to join, then terminate the process with
    /// `exit_code`. Aborts instead if either window expires.
    ///
    /// Returns (without terminating anything) only when a previous call
    /// already latched the signal.
    pub fn exit(&self, exit_code: i32, grace: Duration) {
        if self.inner.signal.set() {
            self.log("Ignoring a repeated shutdown request.");
            return;
        }
        self.log("Shutdown requested, beginning the termination sequence.");
        self.run_termination_protocol(exit_code, grace);
    }

    fn run_termination_protocol(&self, exit_code: i32, grace: Duration) -> ! {
        let t0 = Instant::now();

        let drained = self.inner.registry.await_drained(grace, |entity| {
            self.log(&format!(
                "Gone after {:.3}s: {}",
                t0.elapsed().as_secs_f64(),
                entity.short_display()
            ));
        });

        if drained {
            self.log("Termination sequence successful, joining the worker threads.");
            let handles = {
                let mut owned = self.inner.owned_threads.lock();
                std::mem::take(&mut *owned)
            };

            let joined = ShutdownSignal::new();
            let joined_flag = joined.clone();
            let journal = self.clone();
            let joiner = thread::spawn(move || {
                for handle in handles {
                    if handle.join().is_err() {
                        journal.log("A worker thread panicked on the way out.");
                    }
                }
                joined_flag.set();
            });

            if joined.wait_for(grace) {
                let _ = joiner.join();
                self.log("All worker threads joined, all done.");
                std::process::exit(exit_code);
            }
            self.log("Uncooperative threads remain, aborting.");
            std::process::abort();
        }

        self.log("Termination sequence unsuccessful, offenders remain.");
        self.inner.registry.dump(|entity| {
            self.log(&format!("Offender: {}", entity.short_display()));
        });
        self.log("Aborting.");
        std::process::abort();
    }
}

/// Deregisters a tracked entity when dropped, on every exit path.
pub(crate) struct DeregisterGuard {
    manager: LifetimeManager,
    id: TrackedId,
}

impl DeregisterGuard {
    pub(crate) fn new(manager: LifetimeManager, id: TrackedId) -> Self {
        Self { manager, id }
    }
}

impl Drop for DeregisterGuard {
    fn drop(&mut self) {
        self.manager.deregister(self.id);
    }
}

/// Builder for activating the lifetime manager.
///
/// Activation is mandatory before any registration or query, and fatal if
/// performed twice.
#[derive(Default)]
pub struct Activation {
    config: Option<Config>,
    logger: Option<LoggerSink>,
}

impl Activation {
    /// Start building an activation with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `config` instead of the compiled-in defaults.
    #[must_use]
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Install `sink` as the termination-journal sink.
    #[must_use]
    pub fn with_logger<F>(mut self, sink: F) -> Self
    where
        F: Fn(&str) + Send + 'static,
    {
        self.logger = Some(Box::new(sink));
        self
    }

    /// Activate the process-wide manager. Fatal if called twice.
    #[must_use = "dropping the guard immediately would begin organic termination"]
    pub fn activate(self) -> LifetimeGuard {
        let config = self.config.unwrap_or_default();
        let manager = LifetimeManager::global().clone();
        manager.activate_impl(config, self.logger);
        LifetimeGuard { manager }
    }
}

/// Guard returned by activation. If the process reaches the end of `main`
/// without an explicit exit, dropping the guard observes the never-latched
/// signal and runs the termination protocol with the configured defaults, so
/// teardown is graceful even on a natural return.
pub struct LifetimeGuard {
    manager: LifetimeManager,
}

impl LifetimeGuard {
    /// The manager this guard activates.
    #[must_use]
    pub fn manager(&self) -> &LifetimeManager {
        &self.manager
    }
}

impl Drop for LifetimeGuard {
    fn drop(&mut self) {
        if self.manager.inner.signal.set() {
            return;
        }
        self.manager.log("The process is terminating organically.");
        let grace = self.manager.config().grace();
        self.manager.run_termination_protocol(0, grace);
    }
}

/// Activate the process-wide lifetime manager with defaults.
#[must_use = "dropping the guard immediately would begin organic termination"]
pub fn activate() -> LifetimeGuard {
    Activation::new().activate()
}

/// Latch the shutdown signal and run the termination protocol. See
/// [`LifetimeManager::exit`].
pub fn exit(exit_code: i32, grace: Duration) {
    LifetimeManager::global().exit(exit_code, grace);
}

/// O(1) check whether shutdown has latched.
#[must_use]
pub fn shutting_down() -> bool {
    LifetimeManager::global().is_shutting_down()
}

/// Block the calling thread until shutdown latches.
pub fn wait_until_shutdown() {
    LifetimeManager::global().wait_until_shutdown();
}

/// Sleep up to `duration` or until shutdown latches. Returns `true` iff
/// shutdown has not latched. See [`LifetimeManager::sleep_for`].
pub fn sleep_for(duration: Duration) -> bool {
    LifetimeManager::global().sleep_for(duration)
}

/// Register a one-shot shutdown callback. See
/// [`LifetimeManager::subscribe_shutdown`].
#[must_use = "dropping the subscription immediately detaches the callback"]
pub fn notify_on_shutdown<F>(callback: F) -> ShutdownSubscription
where
    F: FnOnce() + Send + 'static,
{
    LifetimeManager::global().subscribe_shutdown(callback)
}

/// Spawn a tracked worker thread. See [`LifetimeManager::spawn_thread`].
#[track_caller]
pub fn spawn_thread<F>(description: impl Into<String>, body: F) -> bool
where
    F: FnOnce() + Send + 'static,
{
    LifetimeManager::global().spawn_thread(description, body)
}

/// Construct a long-lived instance on a dedicated owner thread. See
/// [`LifetimeManager::tracked_instance`].
///
/// # Errors
///
/// Returns [`Error::ShuttingDown`] if shutdown has already latched, or
/// [`Error::InstanceUnavailable`] if the constructor panicked.
#[track_caller]
pub fn tracked_instance<T, F>(description: impl Into<String>, init: F) -> Result<Arc<T>>
where
    T: Send + Sync + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    LifetimeManager::global().tracked_instance(description, init)
}

/// Visit every live tracked entity, most recent first.
pub fn dump_active<F: FnMut(&TrackedEntity)>(visitor: F) {
    LifetimeManager::global().dump_active(visitor);
}

/// Write every live tracked entity to the journal, most recent first. See
/// [`LifetimeManager::log_active`].
pub fn log_active() {
    LifetimeManager::global().log_active();
}

/// Render the live registry as status-report lines, most recent first.
#[must_use]
pub fn status_report() -> String {
    LifetimeManager::global().status_report()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    // Private instances, never the process-wide one: the terminal protocol
    // paths (exit, abort) are exercised by the child-process tests in
    // tests/lifecycle.rs instead.
    fn activated() -> LifetimeManager {
        let manager = LifetimeManager::new();
        manager.activate_impl(Config::default(), Some(Box::new(|_| {})));
        manager
    }

    #[test]
    fn spawn_is_refused_after_latch() {
        let manager = activated();
        manager.inner.signal.set();
        let started = manager.spawn_thread("late worker", || {});
        assert!(!started);
        assert!(manager.inner.owned_threads.lock().is_empty());
        assert!(manager.inner.registry.is_empty());
    }

    #[test]
    fn worker_is_registered_before_spawn_returns() {
        let manager = activated();
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);

        let started = manager.spawn_thread("handshake worker", move || {
            let _ = release_rx.recv();
        });
        assert!(started);
        assert_eq!(manager.inner.registry.len(), 1);

        release_tx.send(()).expect("release worker");
        assert!(manager
            .inner
            .registry
            .await_drained(Duration::from_secs(5), |_| {}));
    }

    #[test]
    fn worker_deregisters_even_on_panic() {
        let manager = activated();
        let started = manager.spawn_thread("doomed worker", || {
            panic!("worker body failed");
        });
        assert!(started);
        assert!(manager
            .inner
            .registry
            .await_drained(Duration::from_secs(5), |_| {}));
    }

    #[test]
    fn sleep_for_reports_the_latch() {
        let manager = activated();
        assert!(manager.sleep_for(Duration::from_millis(5)));
        manager.inner.signal.set();
        assert!(!manager.sleep_for(Duration::from_millis(5)));
    }

    #[test]
    fn tracked_instance_lives_until_latch() {
        struct Probe {
            dropped: Arc<AtomicBool>,
        }
        impl Drop for Probe {
            fn drop(&mut self) {
                self.dropped.store(true, Ordering::SeqCst);
            }
        }

        let manager = activated();
        let dropped = Arc::new(AtomicBool::new(false));
        let observed = Arc::clone(&dropped);
        let probe = manager
            .tracked_instance("probe instance", move || Probe { dropped: observed })
            .expect("instance");
        assert_eq!(manager.inner.registry.len(), 1);

        // The caller releasing its clone must not destruct the instance.
        drop(probe);
        assert!(!dropped.load(Ordering::SeqCst));

        manager.inner.signal.set();
        assert!(manager
            .inner
            .registry
            .await_drained(Duration::from_secs(5), |_| {}));
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn tracked_instance_is_refused_after_latch() {
        let manager = activated();
        manager.inner.signal.set();
        let result = manager.tracked_instance("late instance", || 42_u32);
        assert!(matches!(result, Err(Error::ShuttingDown)));
    }

    #[test]
    fn status_report_lists_recent_first() {
        let manager = activated();
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(2);
        let hold_first = release_rx.clone();
        assert!(manager.spawn_thread("first worker", move || {
            let _ = hold_first.recv();
        }));
        let hold_second = release_rx;
        assert!(manager.spawn_thread("second worker", move || {
            let _ = hold_second.recv();
        }));

        let report = manager.status_report();
        let first_at = report.find("first worker").expect("first listed");
        let second_at = report.find("second worker").expect("second listed");
        assert!(second_at < first_at);
        assert!(report.contains(", up "));

        release_tx.send(()).expect("release");
        release_tx.send(()).expect("release");
        assert!(manager
            .inner
            .registry
            .await_drained(Duration::from_secs(5), |_| {}));
    }

    #[test]
    fn log_active_journals_the_short_forms() {
        let journal = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&journal);
        let manager = LifetimeManager::new();
        manager.activate_impl(
            Config::default(),
            Some(Box::new(move |message| sink.lock().push(message.to_string()))),
        );

        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        assert!(manager.spawn_thread("journaled worker", move || {
            let _ = release_rx.recv();
        }));

        manager.log_active();
        {
            let lines = journal.lock();
            assert_eq!(lines.len(), 1);
            assert!(
                lines[0].starts_with("journaled worker @ manager.rs:"),
                "journal line: {}",
                lines[0]
            );
        }

        release_tx.send(()).expect("release");
        assert!(manager
            .inner
            .registry
            .await_drained(Duration::from_secs(5), |_| {}));
    }

    #[test]
    fn shutdown_subscription_fires_once_through_the_manager() {
        let manager = activated();
        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let observed = Arc::clone(&fired);
        let _subscription = manager.subscribe_shutdown(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });

        manager.inner.signal.set();
        manager.inner.signal.set();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
