//! Per-tunnel pidfile helpers
//!
//! Every tunnel records its forwarding process pid in a pidfile next to
//! its local socket. Teardown paths that have lost the in-memory child
//! handle recover the pid from here instead of pattern-matching process
//! command lines.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Pidfile path for a tunnel's local socket (`<socket>.pid`)
pub fn pid_path(local_socket: &Path) -> PathBuf {
    let mut name = local_socket.as_os_str().to_os_string();
    name.push(".pid");
    PathBuf::from(name)
}

/// Record the forwarding process pid for a local socket.
///
/// Creates parent directories if they don't exist.
pub fn write_pid(local_socket: &Path, pid: u32) -> io::Result<()> {
    let path = pid_path(local_socket);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = fs::File::create(&path)?;
    writeln!(file, "{}", pid)?;
    Ok(())
}

/// Read the recorded pid for a local socket.
///
/// Returns `Ok(Some(pid))` if the pidfile exists and holds a valid pid,
/// `Ok(None)` if there is no pidfile, or an error if it is malformed.
pub fn read_pid(local_socket: &Path) -> io::Result<Option<u32>> {
    match fs::File::open(pid_path(local_socket)) {
        Ok(mut file) => {
            let mut contents = String::new();
            file.read_to_string(&mut contents)?;
            let pid = contents
                .trim()
                .parse::<u32>()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            Ok(Some(pid))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Remove the pidfile for a local socket.
///
/// Returns `Ok(())` even if the file doesn't exist.
pub fn remove_pid(local_socket: &Path) -> io::Result<()> {
    match fs::remove_file(pid_path(local_socket)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Check whether a process with the given pid is still alive.
///
/// Uses kill(pid, 0): success or EPERM means the process exists.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    unsafe {
        if libc::kill(pid as libc::pid_t, 0) == 0 {
            return true;
        }
        let err = std::io::Error::last_os_error();
        err.raw_os_error() == Some(libc::EPERM)
    }
}
