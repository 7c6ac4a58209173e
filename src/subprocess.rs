//! Child-process execution with line streaming and lifetime integration.
//!
//! [`run`] is the primitive layer: it spawns an argv with piped stdio, reads
//! the child's stdout line-by-line on a reader thread, hands a
//! [`SubprocessRuntime`] to a driver callback on a second thread, and
//! returns the child's exit status once both have closed. [`run_tracked`]
//! layers lifetime management on top: the child is registered as a tracked
//! entity and receives a single SIGTERM once shutdown latches, so a blocked
//! child can never hold the process hostage past the grace period.

use std::io::{BufRead, BufReader, Write};
use std::panic::Location;
use std::process::{ChildStdin, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::manager::{DeregisterGuard, LifetimeManager};

/// Tracing target for subprocess operations.
const SUBPROCESS_TARGET: &str = "vigil::subprocess";

/// Handle to a running child process, passed to the driver callback.
pub struct SubprocessRuntime {
    pid: u32,
    stdin: Mutex<Option<ChildStdin>>,
    killed: AtomicBool,
}

impl SubprocessRuntime {
    /// OS process id of the child.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Write `data` to the child's stdin and flush it.
    ///
    /// # Errors
    ///
    /// Returns an error if the child's stdin has been closed or the write
    /// fails.
    pub fn write(&self, data: &str) -> std::io::Result<()> {
        let mut slot = self.stdin.lock();
        match slot.as_mut() {
            Some(stdin) => {
                stdin.write_all(data.as_bytes())?;
                stdin.flush()
            }
            None => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "child stdin is closed",
            )),
        }
    }

    /// Send the child a single SIGTERM. Idempotent: repeated calls, from any
    /// thread, deliver the signal at most once.
    pub fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(target: SUBPROCESS_TARGET, pid = self.pid, "sending SIGTERM to child");
        let rc = unsafe { libc::kill(self.pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            warn!(
                target: SUBPROCESS_TARGET,
                pid = self.pid,
                error = %std::io::Error::last_os_error(),
                "failed to signal child"
            );
        }
    }
}

fn apply_env(command: &mut Command, env: &[String]) {
    for pair in env {
        match pair.split_once('=') {
            Some((key, value)) => {
                command.env(key, value);
            }
            None => {
                warn!(
                    target: SUBPROCESS_TARGET,
                    entry = %pair,
                    "ignoring environment override without '='"
                );
            }
        }
    }
}

/// Spawn `argv` and run it to completion.
///
/// The child's stdout is read line-by-line on a reader thread; each line is
/// passed to `on_line` with the trailing newline stripped. `driver` runs on
/// its own thread and receives the [`SubprocessRuntime`], through which it
/// can write to the child's stdin and deliver an idempotent SIGTERM. The
/// call returns the child's exit status after the reader has hit EOF and the
/// driver has returned; the status is handed back uninterpreted.
///
/// `env` entries are `KEY=VALUE` overrides applied on top of the inherited
/// environment.
///
/// # Errors
///
/// Returns an error if `argv` is empty, the child cannot be spawned, or
/// waiting on it fails.
pub fn run<L, D>(argv: &[String], env: &[String], on_line: L, driver: D) -> Result<ExitStatus>
where
    L: FnMut(&str) + Send,
    D: FnOnce(Arc<SubprocessRuntime>) + Send,
{
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| Error::invalid_command("empty argv"))?;

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped());
    apply_env(&mut command, env);

    debug!(target: SUBPROCESS_TARGET, command = %argv.join(" "), "spawning child");
    let mut child = command.spawn().map_err(|e| Error::spawn(program.clone(), e))?;
    let pid = child.id();

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::invalid_command("failed to capture child stdout"))?;
    let stdin = child.stdin.take();

    let runtime = Arc::new(SubprocessRuntime {
        pid,
        stdin: Mutex::new(stdin),
        killed: AtomicBool::new(false),
    });

    let mut on_line = on_line;
    thread::scope(|scope| {
        scope.spawn(|| {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                match line {
                    Ok(text) => on_line(&text),
                    Err(err) => {
                        debug!(target: SUBPROCESS_TARGET, pid, error = %err, "child stdout closed");
                        break;
                    }
                }
            }
        });
        scope.spawn(|| driver(Arc::clone(&runtime)));
    });

    let status = child.wait().map_err(Error::subprocess_io)?;
    debug!(target: SUBPROCESS_TARGET, pid, %status, "child exited");
    Ok(status)
}

/// Run a child process under lifetime management.
///
/// On top of [`run`], the child is registered as a tracked entity under
/// `description` with the caller's source location, and a shutdown
/// subscription is held for the duration of `driver`: if shutdown latches
/// while the child is still running, it receives a single SIGTERM. The
/// common terminal driver body is simply
/// [`wait_until_shutdown`](crate::wait_until_shutdown) — the idiom for
/// "run the child until we are told to stop".
///
/// Requires the lifetime manager to be activated.
///
/// # Errors
///
/// Same as [`run`].
#[track_caller]
pub fn run_tracked<L, D>(
    description: impl Into<String>,
    argv: &[String],
    env: &[String],
    on_line: L,
    driver: D,
) -> Result<ExitStatus>
where
    L: FnMut(&str) + Send,
    D: FnOnce(Arc<SubprocessRuntime>) + Send,
{
    let location = Location::caller();
    let manager = LifetimeManager::global().clone();
    let id = manager.register(description.into(), location.file(), location.line());
    let _deregister = DeregisterGuard::new(manager.clone(), id);

    let done = Arc::new(AtomicBool::new(false));
    let done_in_driver = Arc::clone(&done);

    let result = run(argv, env, on_line, move |runtime| {
        let kill_target = Arc::clone(&runtime);
        let done_flag = Arc::clone(&done_in_driver);
        let _subscription = manager.subscribe_shutdown(move || {
            // kill() is idempotent at the runtime layer, so racing with a
            // user-initiated kill is harmless.
            if !done_flag.load(Ordering::SeqCst) {
                kill_target.kill();
            }
        });
        driver(runtime);
    });

    done.store(true, Ordering::SeqCst);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn empty_argv_is_rejected() {
        let result = run(&[], &[], |_| {}, |_| {});
        assert!(matches!(result, Err(Error::InvalidCommand { .. })));
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let result = run(
            &argv(&["/definitely/not/a/real/binary"]),
            &[],
            |_| {},
            |_| {},
        );
        assert!(matches!(result, Err(Error::Spawn { .. })));
    }

    #[test]
    fn stdout_lines_are_streamed_in_order() {
        let mut lines = Vec::new();
        let status = run(
            &argv(&["/bin/sh", "-c", "printf 'one\\ntwo\\nthree\\n'"]),
            &[],
            |line| lines.push(line.to_string()),
            |_| {},
        )
        .expect("run sh");
        assert!(status.success());
        assert_eq!(lines, ["one", "two", "three"]);
    }

    #[test]
    fn environment_overrides_reach_the_child() {
        let mut lines = Vec::new();
        let status = run(
            &argv(&["/bin/sh", "-c", "echo \"$VIGIL_TEST_VALUE\""]),
            &[String::from("VIGIL_TEST_VALUE=injected")],
            |line| lines.push(line.to_string()),
            |_| {},
        )
        .expect("run sh");
        assert!(status.success());
        assert_eq!(lines, ["injected"]);
    }

    #[test]
    fn kill_terminates_a_blocked_child() {
        let t0 = Instant::now();
        let status = run(
            &argv(&["/bin/sleep", "30"]),
            &[],
            |_| {},
            |runtime| {
                runtime.kill();
                runtime.kill();
            },
        )
        .expect("run sleep");
        assert!(!status.success());
        assert!(t0.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn driver_can_write_to_the_child() {
        let (line_tx, line_rx) = crossbeam_channel::bounded::<String>(1);
        let status = run(
            &argv(&["/bin/cat"]),
            &[],
            move |line| {
                let _ = line_tx.send(line.to_string());
            },
            move |runtime| {
                runtime.write("ping\n").expect("write to cat");
                let echoed = line_rx
                    .recv_timeout(Duration::from_secs(5))
                    .expect("cat echoes the line");
                assert_eq!(echoed, "ping");
                runtime.kill();
            },
        )
        .expect("run cat");
        assert!(!status.success());
    }
}
