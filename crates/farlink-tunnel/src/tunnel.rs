//! Supervised SSH forwarding process
//!
//! A [`Tunnel`] owns exactly one external `ssh` process that forwards a
//! local Unix socket to a remote one, plus the on-disk artifacts that
//! belong to it (the socket file and a pidfile). Booting polls until the
//! local socket appears; closing escalates from SIGTERM to SIGKILL under
//! bounded grace periods and never raises.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use farlink_core::{pidfile, Context, HostVerification, TunnelConfig};

use crate::error::TunnelError;

/// A supervised forwarding process and its local socket artifact.
///
/// Shared as `Arc<Tunnel>` between the portal and callers; `close()` is
/// idempotent and raced closers are resolved by a compare-and-swap so
/// only one teardown path runs.
#[derive(Debug)]
pub struct Tunnel {
    context: Context,
    config: TunnelConfig,
    /// Pid observed at spawn time; survives the child handle being consumed
    pid: Option<u32>,
    child: Mutex<Option<Child>>,
    closed: AtomicBool,
}

impl Tunnel {
    /// Spawn the forwarding process and wait for the local socket.
    ///
    /// Polls in short bounded sleeps until the socket exists (Ready), the
    /// process exits early ([`TunnelError::ProcessExited`]), or the boot
    /// deadline elapses ([`TunnelError::BootTimeout`]). On timeout the
    /// spawned process is terminated before the error returns, so a
    /// failed boot never leaks a forwarder.
    pub async fn boot(context: Context, config: TunnelConfig) -> Result<Self, TunnelError> {
        let args = forward_args(&context);
        let argv = full_argv(&config, &args);

        let mut child = Command::new(&config.ssh_binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| TunnelError::Spawn {
                binary: config.ssh_binary.display().to_string(),
                source,
            })?;

        let pid = child.id();
        if let Some(pid) = pid {
            if let Err(e) = pidfile::write_pid(&context.local_socket, pid) {
                tracing::warn!(
                    "Failed to record pid for {}: {}",
                    context.local_socket.display(),
                    e
                );
            }
        }
        tracing::debug!("Spawned forwarding process {:?}: {}", pid, argv.join(" "));

        let started = Instant::now();
        for _ in 0..config.max_polls() {
            if tokio::fs::try_exists(&context.local_socket)
                .await
                .unwrap_or(false)
            {
                tracing::info!(
                    "Tunnel ready: {} -> {}",
                    context.local_socket.display(),
                    context.target_key()
                );
                return Ok(Self {
                    context,
                    config,
                    pid,
                    child: Mutex::new(Some(child)),
                    closed: AtomicBool::new(false),
                });
            }

            match child.try_wait() {
                Ok(Some(status)) => {
                    let _ = pidfile::remove_pid(&context.local_socket);
                    return Err(TunnelError::ProcessExited { status, argv });
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Failed to poll forwarding process {:?}: {}", pid, e);
                }
            }

            tokio::time::sleep(config.poll_interval).await;
        }

        // Deadline elapsed without readiness; reap the forwarder before
        // reporting so the caller is not left with an orphan.
        let _ = child.start_kill();
        let _ = child.wait().await;
        let _ = pidfile::remove_pid(&context.local_socket);
        Err(TunnelError::BootTimeout {
            elapsed: started.elapsed(),
            argv,
        })
    }

    /// The connection target this tunnel forwards for
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Local socket path callers connect their client to
    pub fn local_socket(&self) -> &Path {
        &self.context.local_socket
    }

    /// Pid of the forwarding process, if it was observable at spawn
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether close() has already run (or is running)
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Tear down the forwarding process and remove the socket artifacts.
    ///
    /// Idempotent: the first caller wins the closed flag and performs the
    /// teardown; every later call is a no-op. Failures are logged, never
    /// returned, so this stays safe to call from any teardown path.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let child = self.child.lock().await.take();
        match child {
            Some(child) => self.terminate_child(child).await,
            // Recovery paths can leave us without a live handle; fall
            // back to the pid recorded at spawn time.
            None => self.terminate_recovered().await,
        }

        self.remove_artifacts();
        tracing::debug!("Tunnel closed: {}", self.context.target_key());
    }

    /// Graceful-then-forceful termination of the owned child handle
    async fn terminate_child(&self, mut child: Child) {
        let pid = child.id().or(self.pid);
        if let Some(pid) = pid {
            signal(pid, libc::SIGTERM);
        }

        match tokio::time::timeout(self.config.term_grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!("Forwarding process {:?} exited: {}", pid, status);
                return;
            }
            Ok(Err(e)) => {
                tracing::warn!("Failed waiting for forwarding process {:?}: {}", pid, e);
                return;
            }
            Err(_) => {
                tracing::debug!(
                    "Forwarding process {:?} ignored SIGTERM for {:?}, escalating",
                    pid,
                    self.config.term_grace
                );
            }
        }

        if let Err(e) = child.start_kill() {
            tracing::warn!("Failed to kill forwarding process {:?}: {}", pid, e);
        }
        match tokio::time::timeout(self.config.kill_grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!("Forwarding process {:?} killed: {}", pid, status)
            }
            Ok(Err(e)) => {
                tracing::warn!("Failed waiting for killed process {:?}: {}", pid, e)
            }
            // Straggler: recorded, never raised.
            Err(_) => tracing::warn!(
                "Forwarding process {:?} for {} survived SIGKILL",
                pid,
                self.context.target_key()
            ),
        }
    }

    /// Termination via the pidfile when the in-memory handle is stale
    async fn terminate_recovered(&self) {
        let socket = &self.context.local_socket;
        let pid = match pidfile::read_pid(socket) {
            Ok(Some(pid)) => pid,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("Unreadable pidfile for {}: {}", socket.display(), e);
                return;
            }
        };

        if !pidfile::process_alive(pid) {
            return;
        }
        // The pid may have been recycled since it was recorded; only
        // signal it if its command line still references our socket.
        if !commands_this_socket(pid, socket) {
            tracing::warn!(
                "Pid {} from pidfile no longer matches tunnel for {}, leaving it alone",
                pid,
                socket.display()
            );
            return;
        }

        signal(pid, libc::SIGTERM);
        if wait_for_exit(pid, self.config.term_grace, self.config.poll_interval).await {
            tracing::debug!("Recovered forwarding process {} exited", pid);
            return;
        }

        signal(pid, libc::SIGKILL);
        if !wait_for_exit(pid, self.config.kill_grace, self.config.poll_interval).await {
            tracing::warn!(
                "Forwarding process {} for {} survived SIGKILL",
                pid,
                self.context.target_key()
            );
        }
    }

    /// Remove the local socket file and pidfile, tolerating absence
    fn remove_artifacts(&self) {
        let socket = &self.context.local_socket;
        if let Err(e) = std::fs::remove_file(socket) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove local socket {}: {}", socket.display(), e);
            }
        }
        if let Err(e) = pidfile::remove_pid(socket) {
            tracing::warn!("Failed to remove pidfile for {}: {}", socket.display(), e);
        }
    }
}

impl Drop for Tunnel {
    /// Last-resort teardown for tunnels dropped without close().
    ///
    /// Drop cannot await the graceful escalation, so this goes straight
    /// to SIGKILL and artifact removal.
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::warn!(
            "Tunnel for {} dropped without close(), killing forwarding process",
            self.context.target_key()
        );
        if let Some(pid) = self.pid {
            if pidfile::process_alive(pid) {
                signal(pid, libc::SIGKILL);
            }
        }
        self.remove_artifacts();
    }
}

/// Build the ssh argument vector for a context.
///
/// Shape: `<verbosity> [-p <port>] -L <local>:<remote> <host-key opts>
/// [-i <identity>] <user>@<host>`.
fn forward_args(context: &Context) -> Vec<String> {
    let mut args = Vec::new();

    args.push(verbosity_flag().to_string());

    if let Some(port) = context.port {
        args.push("-p".to_string());
        args.push(port.to_string());
    }

    args.push("-L".to_string());
    args.push(format!(
        "{}:{}",
        context.local_socket.display(),
        context.remote_socket.display()
    ));

    match &context.host_verification {
        HostVerification::Insecure => {
            args.push("-o".to_string());
            args.push("StrictHostKeyChecking=no".to_string());
            args.push("-o".to_string());
            args.push("UserKnownHostsFile=/dev/null".to_string());
        }
        HostVerification::KnownHosts(path) => {
            args.push("-o".to_string());
            args.push(format!("UserKnownHostsFile={}", path.display()));
        }
    }

    if let Some(identity) = &context.identity_file {
        args.push("-i".to_string());
        args.push(identity.display().to_string());
    }

    args.push(context.ssh_destination());
    args
}

/// ssh verbosity mirroring the active log level
fn verbosity_flag() -> &'static str {
    if tracing::enabled!(tracing::Level::DEBUG) {
        "-v"
    } else {
        "-q"
    }
}

/// Full command line (binary + args) for error payloads
fn full_argv(config: &TunnelConfig, args: &[String]) -> Vec<String> {
    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push(config.ssh_binary.display().to_string());
    argv.extend(args.iter().cloned());
    argv
}

/// Send a signal to a pid, ignoring delivery failure (already-dead pids)
fn signal(pid: u32, sig: libc::c_int) {
    unsafe {
        libc::kill(pid as libc::pid_t, sig);
    }
}

/// Poll until the pid exits or the deadline elapses; true if it exited
async fn wait_for_exit(pid: u32, deadline: Duration, poll: Duration) -> bool {
    let started = Instant::now();
    while started.elapsed() < deadline {
        if !pidfile::process_alive(pid) {
            return true;
        }
        tokio::time::sleep(poll).await;
    }
    !pidfile::process_alive(pid)
}

/// Whether the process table entry for `pid` references `socket` on its
/// command line
fn commands_this_socket(pid: u32, socket: &Path) -> bool {
    use sysinfo::{Pid, ProcessesToUpdate, System};

    let target = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);

    let Some(process) = system.process(target) else {
        return false;
    };
    let needle = socket.to_string_lossy();
    process
        .cmd()
        .iter()
        .any(|arg| arg.to_string_lossy().contains(needle.as_ref()))
}

#[cfg(test)]
impl Tunnel {
    /// A ready tunnel with no process behind it, for portal tests
    pub(crate) fn stub(context: Context) -> Self {
        Self {
            context,
            config: TunnelConfig::default(),
            pid: None,
            child: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// A tunnel whose child handle has been lost, for recovery tests
    pub(crate) fn stale(context: Context, config: TunnelConfig, pid: Option<u32>) -> Self {
        Self {
            context,
            config,
            pid,
            child: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }
}
