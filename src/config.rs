//! Configuration for the lifetime coordinator.
//!
//! Settings are loaded from multiple sources with clear precedence rules,
//! built on top of figment: compiled-in defaults, then an optional TOML file,
//! then `VIGIL_`-prefixed environment variables.

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Coordinator configuration, fixed at activation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Grace period in milliseconds, applied twice during termination: once
    /// waiting for the tracked registry to drain, and once waiting for the
    /// owner threads to be joined.
    pub grace_ms: u64,
    /// Install SIGINT/SIGTERM handlers that initiate shutdown with exit
    /// code 0.
    pub handle_os_signals: bool,
    /// Tag prefixing termination-journal lines written to stderr when no
    /// logger sink has been installed.
    pub logger_tag: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            grace_ms: crate::DEFAULT_GRACE_MS,
            handle_os_signals: false,
            logger_tag: String::from("lifetime"),
        }
    }
}

impl Config {
    /// Create a new config with defaults.
    ///
    /// # Errors
    ///
    /// Will return an error if the default configuration fails validation.
    pub fn new() -> Result<Self> {
        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default file location plus environment.
    ///
    /// # Errors
    ///
    /// Will return an error if a source cannot be read or the merged
    /// configuration fails validation.
    pub fn load() -> Result<Self> {
        Self::load_from_file(crate::DEFAULT_CONFIG_FILE)
    }

    /// Load configuration with precedence: defaults, then `path` (if it
    /// exists), then `VIGIL_*` environment variables.
    ///
    /// # Errors
    ///
    /// Will return an error if a source cannot be read or the merged
    /// configuration fails validation.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if path.exists() {
            figment = figment.merge(Toml::file(path));
        }

        let config: Self = figment
            .merge(Env::prefixed("VIGIL_"))
            .extract()
            .map_err(|e| Error::config_with_source("failed to load configuration", e))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration values.
    ///
    /// # Errors
    ///
    /// Will return an error if any value is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.grace_ms == 0 {
            return Err(Error::config("grace_ms must be greater than zero"));
        }
        if self.logger_tag.is_empty() {
            return Err(Error::config("logger_tag must not be empty"));
        }
        Ok(())
    }

    /// The grace period as a [`Duration`].
    #[must_use]
    pub const fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}
