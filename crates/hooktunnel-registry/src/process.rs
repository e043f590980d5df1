//! Liveness, termination and usage sampling of detached helper processes
//!
//! Proxies and exposure helpers lead their own process group, so signals
//! are sent to the whole group to take down any grandchildren too.

use crate::record::ProcessInfo;
use std::io;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Grace period between SIGTERM and SIGKILL
pub const STOP_TIMEOUT: Duration = Duration::from_secs(3);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub use hooktunnel_runtime::detach;

/// Whether `pid` refers to a running process we could signal.
///
/// Helpers always run as the current user, so a pid owned by someone else
/// was reused after the helper died and counts as stale.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    let Ok(target) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if target <= 0 {
        return false;
    }

    unsafe {
        // Reap it first if it is an exited child of ours, otherwise the
        // zombie would still answer signal 0
        let mut status = 0;
        if libc::waitpid(target, &mut status, libc::WNOHANG) == target {
            return false;
        }

        if libc::kill(target, 0) == 0 {
            return true;
        }
    }
    if io::Error::last_os_error().raw_os_error() == Some(libc::EPERM) {
        debug!("Process {} belongs to another user, treating it as stale", pid);
    }
    false
}

#[cfg(windows)]
pub fn is_alive(pid: u32) -> bool {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
    };
    const STILL_ACTIVE: u32 = 259;

    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle.is_null() {
            return false;
        }
        let mut code = 0u32;
        let ok = GetExitCodeProcess(handle, &mut code) != 0;
        CloseHandle(handle);
        ok && code == STILL_ACTIVE
    }
}

/// Stop `pid` (and its process group), escalating to a hard kill after
/// `timeout`. A process that is already gone counts as stopped.
#[cfg(unix)]
pub async fn terminate(pid: u32, timeout: Duration) -> io::Result<()> {
    let Ok(target) = libc::pid_t::try_from(pid) else {
        return Ok(());
    };
    if target <= 0 || !is_alive(pid) {
        return Ok(());
    }

    let signal_target = unsafe {
        if libc::getpgid(target) == target {
            -target
        } else {
            target
        }
    };

    if !send_signal(signal_target, libc::SIGTERM)? {
        return Ok(());
    }
    debug!("Sent SIGTERM to {}", pid);

    if wait_for_exit(pid, timeout).await {
        return Ok(());
    }

    warn!("Process {} ignored SIGTERM, killing", pid);
    send_signal(signal_target, libc::SIGKILL)?;
    if !wait_for_exit(pid, Duration::from_secs(1)).await {
        warn!("Process {} still present after SIGKILL", pid);
    }
    Ok(())
}

/// Returns false when the target no longer exists
#[cfg(unix)]
fn send_signal(target: libc::pid_t, signal: libc::c_int) -> io::Result<bool> {
    if unsafe { libc::kill(target, signal) } == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(windows)]
pub async fn terminate(pid: u32, _timeout: Duration) -> io::Result<()> {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{OpenProcess, TerminateProcess, PROCESS_TERMINATE};

    if !is_alive(pid) {
        return Ok(());
    }
    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if handle.is_null() {
            return Ok(());
        }
        let ok = TerminateProcess(handle, 1) != 0;
        CloseHandle(handle);
        if !ok {
            return Err(io::Error::last_os_error());
        }
    }
    wait_for_exit(pid, Duration::from_secs(1)).await;
    Ok(())
}

async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// CPU and memory usage of a live process, if the platform can tell
#[cfg(unix)]
pub fn process_info(pid: u32) -> Option<ProcessInfo> {
    let output = std::process::Command::new("ps")
        .args(["-o", "%cpu=", "-o", "rss=", "-o", "lstart=", "-p", &pid.to_string()])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_ps_line(pid, &String::from_utf8_lossy(&output.stdout))
}

#[cfg(windows)]
pub fn process_info(_pid: u32) -> Option<ProcessInfo> {
    None
}

/// Parse `<%cpu> <rss KiB> <start time...>` as printed by ps
fn parse_ps_line(pid: u32, line: &str) -> Option<ProcessInfo> {
    let mut fields = line.split_whitespace();
    let cpu_percent: f64 = fields.next()?.replace(',', ".").parse().ok()?;
    let rss_kib: f64 = fields.next()?.parse().ok()?;
    let started = fields.collect::<Vec<_>>().join(" ");
    Some(ProcessInfo {
        pid,
        cpu_percent,
        memory_mb: rss_kib / 1024.0,
        started_at: (!started.is_empty()).then_some(started),
    })
}
