//! # vigil: process lifetime & graceful-shutdown coordination
//!
//! A coordinator for long-running multi-threaded programs that also spawn
//! child processes and broadcast events through in-process topics. Three
//! tightly coupled problems, one crate:
//!
//! - **Tracked liveness**: every long-running unit of work — a worker
//!   thread, a managed singleton instance, a spawned child process — is
//!   registered centrally with its description, source location, and start
//!   timestamp, and can be enumerated at any time.
//! - **Cooperative shutdown**: a process-wide shutdown signal can be raised
//!   exactly once; every registered worker gets a bounded grace period to
//!   observe it, finish, and deregister. Workers that cooperate let the
//!   process exit cleanly; workers that do not are named in the journal
//!   before the process aborts.
//! - **Actor-style pub/sub**: typed topics route shared event payloads to
//!   subscriber actors, each with a dedicated serial consumer thread and a
//!   FIFO queue, torn down in lockstep with the shutdown protocol.
//!
//! | Area | Description | Key items |
//! |------|-------------|-----------|
//! | **Activation** | One-time setup, organic exit on drop | [`activate`], [`Activation`], [`LifetimeGuard`] |
//! | **Workers** | Tracked threads and owned instances | [`spawn_thread`], [`tracked_instance`] |
//! | **Shutdown** | Latch, waits, one-shot callbacks | [`exit`], [`sleep_for`], [`notify_on_shutdown`] |
//! | **Subprocesses** | Line-streamed children, SIGTERM on shutdown | [`subprocess::run`], [`subprocess::run_tracked`] |
//! | **Events** | Typed topics, actor subscribers | [`Topic`], [`subscribe`], [`emit`] |
//! | **Introspection** | Live-registry enumeration | [`dump_active`], [`status_report`] |
//!
//! ## Quick start
//!
//! ```no_run
//! use std::time::Duration;
//!
//! fn main() {
//!     let _lifetime = vigil::activate();
//!
//!     vigil::spawn_thread("heartbeat", || {
//!         while vigil::sleep_for(Duration::from_secs(1)) {
//!             tracing::info!("still here");
//!         }
//!     });
//!
//!     vigil::exit(0, vigil::DEFAULT_GRACE);
//! }
//! ```
//!
//! ## Shutdown protocol
//!
//! [`exit`] latches the signal, fires every shutdown callback exactly once,
//! then waits up to the grace period for the tracked registry to drain,
//! journaling each departure. If the registry drains, the owned worker
//! threads are joined under a second grace window and the process exits
//! with the requested code; otherwise each survivor is journaled as an
//! offender and the process aborts. Reaching the end of `main` without
//! calling [`exit`] runs the same protocol from the [`LifetimeGuard`] drop.

#![deny(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod actor;
mod config;
mod error;
mod manager;
mod registry;
mod shutdown;
mod topic;

pub mod os_signals;
pub mod subprocess;

pub use actor::{subscribe, Actor, Handler, SubscriberHandle, SubscriberScope};
pub use config::Config;
pub use error::{Error, Result};
pub use manager::{
    activate, dump_active, exit, log_active, notify_on_shutdown, shutting_down, sleep_for,
    spawn_thread, status_report, tracked_instance, wait_until_shutdown, Activation, LifetimeGuard,
    LifetimeManager, LoggerSink,
};
pub use registry::{TrackedEntity, TrackedId};
pub use shutdown::{ShutdownSignal, ShutdownSubscription};
pub use subprocess::SubprocessRuntime;
pub use topic::{emit, emit_shared, SubscriberId, Topic, TopicId};

/// Version of the vigil library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default grace period in milliseconds, applied to both termination
/// windows.
pub const DEFAULT_GRACE_MS: u64 = 2_000;

/// Default grace period as a [`std::time::Duration`].
pub const DEFAULT_GRACE: std::time::Duration = std::time::Duration::from_millis(DEFAULT_GRACE_MS);

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "vigil.toml";
