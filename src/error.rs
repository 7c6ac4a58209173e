//! Error handling for the lifetime coordinator.
//!
//! Registration and deregistration are infallible by design: the registry can
//! always accept another entry and the 64-bit id space does not run out. The
//! fallible surfaces are configuration loading, subprocess spawning and I/O,
//! and tracked-instance creation once shutdown has already latched.
//!
//! Programmer errors (double activation, use before activation) are not
//! represented here at all: they are logged and the process aborts.

/// Result type alias for vigil operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for all fallible coordinator operations.
#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message
        message: String,
        /// Optional source error for better context
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },

    /// The command line handed to the subprocess layer was unusable.
    #[error("invalid command line: {message}")]
    InvalidCommand {
        /// Human-readable error message
        message: String,
    },

    /// A child process could not be spawned.
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        /// The program that failed to start
        command: String,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// I/O on a running child process failed.
    #[error("subprocess I/O error: {source}")]
    SubprocessIo {
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// Shutdown has already latched, so no new work may be started.
    #[error("shutdown already initiated")]
    ShuttingDown,

    /// The owner thread of a tracked instance terminated before publishing it,
    /// typically because the constructor panicked.
    #[error("tracked instance '{description}' was never published by its owner thread")]
    InstanceUnavailable {
        /// Description the instance was registered under
        description: String,
    },
}

impl Error {
    /// Create a configuration error from a message.
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error capturing the underlying cause.
    pub fn config_with_source<S, E>(message: S, source: E) -> Self
    where
        S: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an invalid-command error from a message.
    pub fn invalid_command<S: Into<String>>(message: S) -> Self {
        Self::InvalidCommand {
            message: message.into(),
        }
    }

    /// Create a spawn error for the given program.
    pub fn spawn<S: Into<String>>(command: S, source: std::io::Error) -> Self {
        Self::Spawn {
            command: command.into(),
            source,
        }
    }

    /// Create a subprocess I/O error.
    pub fn subprocess_io(source: std::io::Error) -> Self {
        Self::SubprocessIo { source }
    }

    /// Create an instance-unavailable error for the given description.
    pub fn instance_unavailable<S: Into<String>>(description: S) -> Self {
        Self::InstanceUnavailable {
            description: description.into(),
        }
    }

    /// Returns a short stable label (snake_case) for use in logs and metrics.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::InvalidCommand { .. } => "invalid_command",
            Self::Spawn { .. } => "spawn",
            Self::SubprocessIo { .. } => "subprocess_io",
            Self::ShuttingDown => "shutting_down",
            Self::InstanceUnavailable { .. } => "instance_unavailable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = Error::spawn(
            "nonexistent-binary",
            std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        );
        let rendered = err.to_string();
        assert!(rendered.contains("nonexistent-binary"));
        assert!(rendered.contains("no such file"));
    }

    #[test]
    fn labels_are_stable() {
        assert_eq!(Error::ShuttingDown.as_label(), "shutting_down");
        assert_eq!(Error::config("bad").as_label(), "config");
        assert_eq!(
            Error::instance_unavailable("cache").as_label(),
            "instance_unavailable"
        );
    }

    #[test]
    fn source_is_preserved() {
        let err = Error::config_with_source(
            "failed to load configuration",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(std::error::Error::source(&err).is_some());
    }
}
