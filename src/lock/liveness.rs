//! Holder liveness
//!
//! A token is only reclaimable when it is old AND its holder process cannot
//! be confirmed alive. Where liveness cannot be determined the holder is
//! treated as alive, so nothing is reclaimed by guesswork.

use std::fmt::Debug;

/// Answers whether the process that last confirmed a hold is still running.
pub trait HolderLiveness: Send + Sync + Debug {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Liveness backed by the operating system process table.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLiveness;

impl HolderLiveness for ProcessLiveness {
    #[cfg(target_os = "linux")]
    fn is_alive(&self, pid: u32) -> bool {
        if pid == std::process::id() {
            return true;
        }
        std::path::Path::new("/proc").join(pid.to_string()).exists()
    }

    #[cfg(not(target_os = "linux"))]
    fn is_alive(&self, _pid: u32) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_is_alive() {
        assert!(ProcessLiveness.is_alive(std::process::id()));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_absent_pid_is_dead() {
        // pid_max on Linux is at most 2^22
        assert!(!ProcessLiveness.is_alive(u32::MAX - 1));
    }
}
