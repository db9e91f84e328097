//! # Service Lifecycle
//!
//! Startup, the listen/reconnect loop, and shutdown of a plugin worker.
//!
//! ```text
//! STARTING ──ok──▶ LISTENING ──signal──▶ DRAINING ──▶ SHUTDOWN
//!                    ▲    │
//!                    │  health failure
//!                    │    ▼
//!                  RECONNECTING (cool-down, then capped backoff, forever)
//! ```

pub mod connector;
pub mod service;

use std::fmt;

use tokio::signal;
use tracing::{error, info};

pub use connector::{Connector, InMemoryConnector};
pub use service::{LifecycleConfig, ServiceLifecycle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Starting,
    Listening,
    Draining,
    Reconnecting,
    Shutdown,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Starting => "starting",
            LifecycleState::Listening => "listening",
            LifecycleState::Draining => "draining",
            LifecycleState::Reconnecting => "reconnecting",
            LifecycleState::Shutdown => "shutdown",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Shutdown)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wait for Ctrl+C or SIGTERM
///
/// A handler that cannot be installed is logged and never fires.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}
