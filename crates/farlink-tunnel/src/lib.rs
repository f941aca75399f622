//! farlink-tunnel: TTL-cached supervised SSH forwarding tunnels
//!
//! A [`Tunnel`] supervises one external `ssh` process forwarding a local
//! Unix socket to a remote one; a [`Portal`] caches ready tunnels by
//! connection-target key, refreshing their TTL on every hit and reaping
//! expired ones from a background task. Callers connect their
//! application-level client to [`Tunnel::local_socket`] once a tunnel is
//! ready; the protocol spoken over it is not this crate's concern.

// Forwarding targets Unix domain sockets - not available on Windows
#![cfg(unix)]

pub mod error;
pub mod portal;
mod reaper;
pub mod tunnel;

pub use error::TunnelError;
pub use portal::Portal;
pub use tunnel::Tunnel;

pub use farlink_core::{Context, HostVerification, PortalConfig, TunnelConfig};
