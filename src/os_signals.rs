//! Bridges Unix termination signals into the shutdown protocol.
//!
//! A dedicated watcher thread iterates over SIGINT/SIGTERM and initiates a
//! graceful exit on the first one observed. The thread is deliberately
//! untracked and detached: it is the thread that calls `exit()`, so
//! registering it would stall the registry drain, and `process::exit` reaps
//! it along with everything else.

use std::thread;
use std::time::Duration;

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{debug, warn};

use crate::manager::LifetimeManager;

pub(crate) fn install(manager: LifetimeManager, grace: Duration) {
    match Signals::new([SIGINT, SIGTERM]) {
        Ok(mut signals) => {
            thread::spawn(move || {
                for signal in signals.forever() {
                    debug!(signal, "received termination signal");
                    manager.exit(0, grace);
                }
            });
        }
        Err(err) => warn!(error = %err, "failed to install signal handlers"),
    }
}

/// Install SIGINT/SIGTERM handlers that initiate shutdown with exit code 0
/// and the given grace period. Activation does this automatically when
/// [`Config::handle_os_signals`](crate::Config::handle_os_signals) is set.
pub fn install_signal_handlers(grace: Duration) {
    install(LifetimeManager::global().clone(), grace);
}
