// Ties a worker's lifetime to the supervisor's on platforms that support it.
// On Linux the worker gets SIGTERM when the supervisor dies, and terminates
// itself right away if the supervisor died between fork and exec.

/// Runs in the forked child before exec.
///
/// # Arguments
///
/// * `parent_pid` - PID of the supervisor captured before fork.
#[cfg(target_os = "linux")]
pub(crate) fn set_parent_death(parent_pid: libc::pid_t) {
    unsafe {
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
        if libc::getppid() != parent_pid {
            libc::kill(libc::getpid(), libc::SIGTERM);
        }
    }
}

/// On non-Linux platforms, setting a parent-death signal is a no-op.
#[cfg(not(target_os = "linux"))]
pub(crate) fn set_parent_death(_parent_pid: libc::pid_t) {}
