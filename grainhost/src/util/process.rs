//! Process signalling helpers for grain processes.

/// Kill a process with SIGKILL.
///
/// # Returns
/// * `true` - Process was killed or doesn't exist
/// * `false` - Failed to kill (permission denied)
pub fn kill_process(pid: u32) -> bool {
    signal(pid, libc::SIGKILL) || !is_process_alive(pid)
}

/// Ask a process to exit with SIGTERM.
///
/// Returns `true` if the signal was delivered.
pub fn terminate_process(pid: u32) -> bool {
    signal(pid, libc::SIGTERM)
}

/// Check if a process with the given PID exists.
///
/// Uses `libc::kill(pid, 0)` which sends a null signal to check existence.
/// A zombie that has not been reaped yet still counts as alive.
pub fn is_process_alive(pid: u32) -> bool {
    signal(pid, 0)
}

fn signal(pid: u32, sig: libc::c_int) -> bool {
    // pid 0 and values above i32::MAX address process groups, never a single grain.
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid == 0 {
        return false;
    }
    unsafe { libc::kill(pid, sig) == 0 }
}
