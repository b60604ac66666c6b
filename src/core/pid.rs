//! PID file management and daemon liveness probing.
//!
//! Liveness uses signal 0; a PID file naming a dead process is reported as
//! stale so the CLI can clean it up.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

pub const DEFAULT_PID_FILE: &str = "/var/run/nam.pid";

/// Observed daemon state derived from a PID file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    Running { pid: i32 },
    /// PID file exists but names a dead process.
    Stale { pid: i32 },
    NoPidFile,
}

/// Write the current process id, newline terminated, mode 0644.
pub fn write_pid_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    let content = format!("{}\n", std::process::id());

    fs::write(path, content)
        .with_context(|| format!("failed to write PID file {}", path.display()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o644))
        .with_context(|| format!("failed to chmod PID file {}", path.display()))?;

    Ok(())
}

pub fn read_pid_file<P: AsRef<Path>>(path: P) -> Result<i32> {
    let path = path.as_ref();

    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read PID file {}", path.display()))?;

    content
        .trim()
        .parse()
        .with_context(|| format!("PID file {} holds no valid PID", path.display()))
}

/// Remove the PID file. A missing file is not an error.
pub fn remove_pid_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => {
            Err(err).with_context(|| format!("failed to remove PID file {}", path.display()))
        }
    }
}

/// Probe a process with signal 0.
pub fn is_process_running(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Inspect the PID file and probe the process it names.
pub fn check_daemon<P: AsRef<Path>>(path: P) -> DaemonStatus {
    let Ok(pid) = read_pid_file(path) else {
        return DaemonStatus::NoPidFile;
    };

    if is_process_running(pid) {
        DaemonStatus::Running { pid }
    } else {
        DaemonStatus::Stale { pid }
    }
}

fn send_signal(pid: i32, signal: libc::c_int) -> Result<()> {
    if unsafe { libc::kill(pid, signal) } != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("failed to signal process {pid}"));
    }
    Ok(())
}

/// SIGTERM the daemon named by the PID file. Cleans up a stale file.
pub fn stop_daemon<P: AsRef<Path>>(path: P) -> Result<i32> {
    let path = path.as_ref();
    let pid = read_pid_file(path)?;

    if !is_process_running(pid) {
        remove_pid_file(path)?;
        anyhow::bail!("process {pid} is not running (stale PID file removed)");
    }

    send_signal(pid, libc::SIGTERM)?;
    Ok(pid)
}

/// SIGHUP the daemon named by the PID file.
pub fn reload_daemon<P: AsRef<Path>>(path: P) -> Result<i32> {
    let pid = read_pid_file(path)?;

    if !is_process_running(pid) {
        anyhow::bail!("process {pid} is not running");
    }

    send_signal(pid, libc::SIGHUP)?;
    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_pid_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("nam_test_{}_{}.pid", name, std::process::id()))
    }

    // High enough that no real process uses it.
    const DEAD_PID: i32 = 0x3FFF_FFFE;

    #[test]
    fn write_read_remove_round_trip() {
        let path = temp_pid_path("roundtrip");

        write_pid_file(&path).unwrap();
        let pid = read_pid_file(&path).unwrap();
        assert_eq!(pid, std::process::id() as i32);

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.ends_with('\n'));

        remove_pid_file(&path).unwrap();
        assert!(read_pid_file(&path).is_err());
        // Removing again is fine.
        remove_pid_file(&path).unwrap();
    }

    #[test]
    fn garbage_pid_file_is_rejected() {
        let path = temp_pid_path("garbage");
        std::fs::write(&path, "not-a-pid\n").unwrap();

        assert!(read_pid_file(&path).is_err());
        assert_eq!(check_daemon(&path), DaemonStatus::NoPidFile);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn own_process_is_running() {
        assert!(is_process_running(std::process::id() as i32));
        assert!(!is_process_running(DEAD_PID));
    }

    #[test]
    fn check_daemon_reports_states() {
        let path = temp_pid_path("status");

        assert_eq!(check_daemon(&path), DaemonStatus::NoPidFile);

        write_pid_file(&path).unwrap();
        assert_eq!(
            check_daemon(&path),
            DaemonStatus::Running { pid: std::process::id() as i32 }
        );

        std::fs::write(&path, format!("{DEAD_PID}\n")).unwrap();
        assert_eq!(check_daemon(&path), DaemonStatus::Stale { pid: DEAD_PID });

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn stop_cleans_up_stale_pid_file() {
        let path = temp_pid_path("stale_stop");
        std::fs::write(&path, format!("{DEAD_PID}\n")).unwrap();

        let err = stop_daemon(&path).unwrap_err();
        assert!(format!("{err}").contains("not running"));
        assert!(!path.exists());
    }

    #[test]
    fn reload_requires_a_live_process() {
        let path = temp_pid_path("stale_reload");
        std::fs::write(&path, format!("{DEAD_PID}\n")).unwrap();

        assert!(reload_daemon(&path).is_err());

        std::fs::remove_file(&path).ok();
    }
}
