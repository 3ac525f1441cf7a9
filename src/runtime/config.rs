//! Runtime configuration.

use std::time::Duration;

/// Default native stack cap for the engine.
pub const DEFAULT_MAX_STACK_SIZE: usize = 512 * 1024;

/// Configuration for a single runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Maximum engine heap size in bytes (None = unlimited). Can also be
    /// changed later through the handle.
    pub memory_limit: Option<usize>,

    /// Native stack cap in bytes.
    pub max_stack_size: usize,

    /// Allocation threshold that triggers an automatic GC pass (None =
    /// engine default).
    pub gc_threshold: Option<usize>,

    /// Upper bound on each evaluation's drain; expiry cancels that
    /// evaluation's outstanding jobs.
    pub execution_timeout: Option<Duration>,

    /// Script evaluated once at engine startup.
    pub bootstrap_script: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            memory_limit: None,
            max_stack_size: DEFAULT_MAX_STACK_SIZE,
            gc_threshold: None,
            execution_timeout: None,
            bootstrap_script: None,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn with_max_stack_size(mut self, bytes: usize) -> Self {
        self.max_stack_size = bytes;
        self
    }

    pub fn with_gc_threshold(mut self, bytes: usize) -> Self {
        self.gc_threshold = Some(bytes);
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }

    pub fn with_bootstrap(mut self, script: impl Into<String>) -> Self {
        self.bootstrap_script = Some(script.into());
        self
    }
}
