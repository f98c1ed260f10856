//! Runtime configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::application::Runtime;
use crate::error::Result;

/// Configuration for a [`Runtime`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Name used in diagnostics.
    pub application_name: String,
    /// Whether releasing the last quit lock may end the main loop.
    pub quit_lock_enabled: bool,
    /// Drop a timer event when one with the same timer id is already queued
    /// for the receiver.
    pub coalesce_timers: bool,
    /// Upper bound for a single idle wait. `None` waits until woken.
    pub idle_timeout: Option<Duration>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            application_name: "horizon-app".to_string(),
            quit_lock_enabled: true,
            coalesce_timers: cfg!(windows),
            idle_timeout: None,
        }
    }
}

impl RuntimeConfig {
    /// Create a new configuration with the given application name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            application_name: name.into(),
            ..Default::default()
        }
    }
}

/// Builder for creating a [`Runtime`] with custom configuration.
#[derive(Debug, Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
}

impl RuntimeBuilder {
    /// Create a new RuntimeBuilder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.config.application_name = name.into();
        self
    }

    /// Whether releasing the last quit lock may end the main loop.
    pub fn quit_lock_enabled(mut self, enabled: bool) -> Self {
        self.config.quit_lock_enabled = enabled;
        self
    }

    /// Enable or disable timer coalescing in the default compression policy.
    pub fn coalesce_timers(mut self, enabled: bool) -> Self {
        self.config.coalesce_timers = enabled;
        self
    }

    /// Bound each idle wait, so loops wake up periodically even without
    /// posted events.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = Some(timeout);
        self
    }

    /// The configuration built so far.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Build the runtime on the calling thread.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ApplicationAlreadyInitialized`](crate::RuntimeError::ApplicationAlreadyInitialized)
    /// if another runtime is alive.
    pub fn build(self) -> Result<Arc<Runtime>> {
        Runtime::with_config(self.config)
    }
}
