//! PID-file daemon lifecycle helpers.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

/// True when a process with `pid` exists. Signal 0 probes without
/// delivering; EPERM still means the process is there.
pub fn is_process_alive(pid: i32) -> bool {
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// PID recorded in the file, or `None` when the file is absent.
pub fn read_pid(path: &Path) -> Result<Option<i32>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(error) => {
            return Err(error)
                .with_context(|| format!("failed to read pid file {}", path.display()));
        }
    };
    let pid = raw
        .trim()
        .parse::<i32>()
        .with_context(|| format!("pid file {} is not a pid", path.display()))?;
    Ok(Some(pid))
}

/// Records the current process in the pid file. Refuses when another live
/// instance already owns it; a stale file from a dead process is replaced.
pub fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(existing) = read_pid(path)? {
        if is_process_alive(existing) {
            bail!(
                "another instance is already running with pid {existing} (pid file {})",
                path.display()
            );
        }
        tracing::warn!(pid = existing, "removing stale pid file");
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, format!("{}\n", std::process::id()))
        .with_context(|| format!("failed to write pid file {}", path.display()))?;
    Ok(())
}

pub fn remove_pid_file(path: &Path) {
    if let Err(error) = std::fs::remove_file(path) {
        if error.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %error, "failed to remove pid file");
        }
    }
}

/// Stops the daemon named by the pid file: SIGTERM, up to `grace` of
/// 500ms polls, then SIGKILL. Returns false when nothing was running.
pub fn stop_process(path: &Path, grace: Duration) -> Result<bool> {
    let Some(pid) = read_pid(path)? else {
        return Ok(false);
    };
    if !is_process_alive(pid) {
        tracing::warn!(pid, "pid file was stale");
        remove_pid_file(path);
        return Ok(false);
    }

    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !is_process_alive(pid) {
            remove_pid_file(path);
            return Ok(true);
        }
        std::thread::sleep(Duration::from_millis(500));
    }

    tracing::warn!(pid, "process ignored SIGTERM, sending SIGKILL");
    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }
    remove_pid_file(path);
    Ok(true)
}
