//! Tunnel error types

use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while provisioning a tunnel.
///
/// Teardown never errors; `close()` is best-effort by contract.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// The forwarding binary could not be launched at all
    #[error("Failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    /// The forwarding process exited before the local socket appeared
    #[error("Forwarding process exited ({status}) before becoming ready: {}", .argv.join(" "))]
    ProcessExited {
        status: ExitStatus,
        argv: Vec<String>,
    },

    /// The local socket never appeared within the boot deadline
    #[error("Local socket did not appear within {elapsed:?}: {}", .argv.join(" "))]
    BootTimeout {
        elapsed: Duration,
        argv: Vec<String>,
    },
}
