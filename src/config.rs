//! Session configuration.
//!
//! Defaults work out of the box:
//!
//! ```no_run
//! use omnibus::{Session, SessionConfig};
//!
//! # async fn example() -> omnibus::Result<()> {
//! let session: Session = Session::new(SessionConfig::default())?;
//! # Ok(())
//! # }
//! ```
//!
//! For custom setups use the builder:
//!
//! ```
//! use omnibus::SessionConfig;
//!
//! let config = SessionConfig::builder()
//!     .worker_threads(8)
//!     .machine_id("test-machine-a")
//!     .capability("RemoteCancelableCalls", false)
//!     .build();
//! ```
//!
//! | Option | Default | Description |
//! |--------|---------|-------------|
//! | `worker_threads` | 4 | size of the session's executor pool |
//! | `machine_id` | auto | stable host identifier (override for tests) |
//! | `capabilities` | both on | capability map advertised to peers |

use std::collections::HashMap;

use crate::bound_object::{CAP_MESSAGE_FLAGS, CAP_REMOTE_CANCELABLE_CALLS};

/// Tunables for a [`Session`](crate::Session).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Worker threads of the session executor.
    pub worker_threads: usize,
    /// Machine identifier override; `None` uses the process-wide id.
    pub machine_id: Option<String>,
    /// Capabilities advertised on every socket.
    pub capabilities: HashMap<String, bool>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let mut capabilities = HashMap::new();
        capabilities.insert(CAP_MESSAGE_FLAGS.to_string(), true);
        capabilities.insert(CAP_REMOTE_CANCELABLE_CALLS.to_string(), true);
        Self {
            worker_threads: 4,
            machine_id: None,
            capabilities,
        }
    }
}

impl SessionConfig {
    /// Create a new builder.
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }
}

/// Builder for [`SessionConfig`].
#[derive(Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// Set the executor pool size.
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.config.worker_threads = threads;
        self
    }

    /// Pin the machine id (tests simulate distinct hosts this way).
    pub fn machine_id(mut self, id: impl Into<String>) -> Self {
        self.config.machine_id = Some(id.into());
        self
    }

    /// Set one advertised capability.
    pub fn capability(mut self, name: impl Into<String>, value: bool) -> Self {
        self.config.capabilities.insert(name.into(), value);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> SessionConfig {
        self.config
    }
}
