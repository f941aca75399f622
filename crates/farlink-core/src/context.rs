//! Connection target description
//!
//! A [`Context`] is the immutable record of one forwarding target: where
//! the local socket lives, where the remote socket lives, and how the SSH
//! transport authenticates and verifies the remote host. It is created
//! once by the caller and handed to the tunnel layer by value.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use url::Url;

use crate::error::ContextError;

/// How the SSH transport verifies the remote host key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostVerification {
    /// Trust the remote unconditionally (no strict host key checking)
    Insecure,
    /// Verify against the given known-hosts file
    KnownHosts(PathBuf),
}

/// Immutable description of one connection target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    /// Interface/protocol name, passed through to the application layer
    pub interface: String,
    /// Local Unix socket the tunnel exposes
    pub local_socket: PathBuf,
    /// Remote Unix socket the service listens on
    pub remote_socket: PathBuf,
    /// Remote username
    pub username: String,
    /// Remote hostname
    pub hostname: String,
    /// Remote SSH port, if not the default
    pub port: Option<u16>,
    /// SSH identity file, if key-based authentication is wanted
    pub identity_file: Option<PathBuf>,
    /// Host key verification mode
    pub host_verification: HostVerification,
}

impl Context {
    /// Parse a connection target from an `ssh://` URI.
    ///
    /// The URI carries the remote side (`ssh://user@host:port/run/io.sock`);
    /// the username falls back to the current user and a unique local
    /// socket path is generated under the system temp directory. The
    /// identity file and verification mode keep their defaults (`None`,
    /// [`HostVerification::Insecure`]) and can be overridden on the
    /// returned value before first use.
    pub fn from_uri(uri: &str) -> Result<Self, ContextError> {
        let parsed = Url::parse(uri)?;

        if parsed.scheme() != "ssh" {
            return Err(ContextError::UnsupportedScheme(
                parsed.scheme().to_string(),
            ));
        }

        let hostname = parsed
            .host_str()
            .ok_or(ContextError::MissingField("a hostname"))?
            .to_string();

        let remote_path = parsed.path();
        if remote_path.is_empty() || remote_path == "/" {
            return Err(ContextError::MissingField("a remote socket path"));
        }
        let remote_socket = PathBuf::from(remote_path);

        let interface = remote_socket
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or(ContextError::MissingField("a remote socket name"))?;

        let username = if parsed.username().is_empty() {
            whoami::username()
        } else {
            parsed.username().to_string()
        };

        Ok(Self {
            interface,
            local_socket: generated_local_socket(),
            remote_socket,
            username,
            hostname,
            port: parsed.port(),
            identity_file: None,
            host_verification: HostVerification::Insecure,
        })
    }

    /// Canonical cache key for this target.
    ///
    /// Two contexts that forward to the same remote socket as the same
    /// user produce the same key, regardless of which local socket path
    /// each happens to use.
    pub fn target_key(&self) -> String {
        match self.port {
            Some(port) => format!(
                "ssh://{}@{}:{}{}",
                self.username,
                self.hostname,
                port,
                self.remote_socket.display()
            ),
            None => format!(
                "ssh://{}@{}{}",
                self.username,
                self.hostname,
                self.remote_socket.display()
            ),
        }
    }

    /// The `user@host` destination argument for the ssh command line
    pub fn ssh_destination(&self) -> String {
        format!("{}@{}", self.username, self.hostname)
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.target_key())
    }
}

/// Generate a unique local socket path under the system temp directory
fn generated_local_socket() -> PathBuf {
    std::env::temp_dir().join(format!("farlink-{}.sock", uuid::Uuid::new_v4()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> Context {
        Context {
            interface: "io.podman".to_string(),
            local_socket: PathBuf::from("/tmp/farlink-test.sock"),
            remote_socket: PathBuf::from("/run/podman/io.podman"),
            username: "core".to_string(),
            hostname: "vm.example.net".to_string(),
            port: None,
            identity_file: None,
            host_verification: HostVerification::Insecure,
        }
    }

    #[test]
    fn test_from_uri_full() {
        let ctx = Context::from_uri("ssh://core@vm.example.net:2222/run/podman/io.podman")
            .expect("uri should parse");
        assert_eq!(ctx.username, "core");
        assert_eq!(ctx.hostname, "vm.example.net");
        assert_eq!(ctx.port, Some(2222));
        assert_eq!(ctx.remote_socket, PathBuf::from("/run/podman/io.podman"));
        assert_eq!(ctx.interface, "io.podman");
        assert!(ctx.local_socket.starts_with(std::env::temp_dir()));
    }

    #[test]
    fn test_from_uri_defaults_username() {
        let ctx = Context::from_uri("ssh://vm.example.net/run/podman/io.podman")
            .expect("uri should parse");
        assert_eq!(ctx.username, whoami::username());
        assert_eq!(ctx.port, None);
    }

    #[test]
    fn test_from_uri_rejects_other_schemes() {
        let err = Context::from_uri("tcp://vm.example.net:8080/run/io.sock").unwrap_err();
        assert!(matches!(err, ContextError::UnsupportedScheme(_)));
    }

    #[test]
    fn test_from_uri_requires_remote_socket() {
        let err = Context::from_uri("ssh://vm.example.net").unwrap_err();
        assert!(matches!(err, ContextError::MissingField(_)));
    }

    #[test]
    fn test_local_sockets_are_unique() {
        let a = Context::from_uri("ssh://vm/run/io.sock").unwrap();
        let b = Context::from_uri("ssh://vm/run/io.sock").unwrap();
        assert_ne!(a.local_socket, b.local_socket);
    }

    #[test]
    fn test_target_key_ignores_local_socket() {
        let mut a = context();
        let mut b = context();
        a.local_socket = PathBuf::from("/tmp/one.sock");
        b.local_socket = PathBuf::from("/tmp/two.sock");
        assert_eq!(a.target_key(), b.target_key());
    }

    #[test]
    fn test_target_key_includes_port() {
        let mut ctx = context();
        assert_eq!(
            ctx.target_key(),
            "ssh://core@vm.example.net/run/podman/io.podman"
        );
        ctx.port = Some(2222);
        assert_eq!(
            ctx.target_key(),
            "ssh://core@vm.example.net:2222/run/podman/io.podman"
        );
    }
}
