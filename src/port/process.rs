/// Whether a process with `pid` currently exists.
///
/// Signal 0 probes existence without delivering anything. `EPERM` means the
/// process exists but belongs to someone else, which still counts as alive.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;

    let Some(nix_pid) = crate::error::validate_pid_for_check(pid) else {
        return false;
    };

    match kill(nix_pid, None) {
        Ok(_) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Without a portable existence check, assume the owner is alive so that the
/// reaper falls back to the port binding check.
#[cfg(not(unix))]
pub fn is_process_alive(pid: u32) -> bool {
    pid != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn pid_zero_is_not_alive() {
        assert!(!is_process_alive(0));
    }

    #[cfg(unix)]
    #[test]
    fn exited_child_is_not_alive() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        assert!(!is_process_alive(pid));
    }
}
