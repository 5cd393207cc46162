// Allow unused_assignments at module level because thiserror's generated code
// for struct variants triggers false positive warnings - the fields ARE used
// in the Display impl but rustc's lint pass doesn't see this.
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    #[diagnostic(
        code(portlease::config::validation),
        help("Check the 'ranges' and 'services' sections of your portlease.yaml")
    )]
    Validation(String),

    #[error("Filesystem error: {0}")]
    #[diagnostic(code(portlease::filesystem::error))]
    Filesystem(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Timed out after {timeout:?} waiting for allocation lock '{}'", .path.display())]
    #[diagnostic(
        code(portlease::lock::timeout),
        help("Another process is holding the allocation lock. Retry shortly.")
    )]
    LockTimeout { path: PathBuf, timeout: Duration },

    #[error("No free port for service '{service}' in range {range}")]
    #[diagnostic(
        code(portlease::port::range_exhausted),
        help("Release unused leases or run `portlease cleanup`, then retry")
    )]
    RangeExhausted { service: String, range: String },

    #[error("Invalid port range {start}-{end}: {reason}")]
    #[diagnostic(code(portlease::range::invalid))]
    InvalidRange { start: u16, end: u16, reason: String },

    #[error("Unknown range tier '{0}'")]
    #[diagnostic(
        code(portlease::range::unknown_tier),
        help("Known tiers: development, shared-test, dedicated-test, ci, staging")
    )]
    UnknownTier(String),

    #[error("No allocation for service '{service}' in environment '{environment_id}'")]
    #[diagnostic(code(portlease::allocation::not_found))]
    AllocationNotFound {
        environment_id: String,
        service: String,
    },

    #[error("Invalid PID {pid}: {reason}")]
    InvalidPid { pid: u32, reason: String },

    #[error("Background task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the caller may reasonably retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::LockTimeout { .. } | Error::RangeExhausted { .. })
    }

    /// Returns a helpful suggestion for resolving this error, if available.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Error::LockTimeout { path, .. } => Some(format!(
                "Another portlease process is holding '{}'. If no such process exists, the lock is released automatically when its holder exits; retry the command.",
                path.display()
            )),
            Error::RangeExhausted { range, .. } => Some(format!(
                "All ports in {} are leased or bound. Run `portlease cleanup` to reclaim expired leases, or `portlease release` in environments you no longer need.",
                range
            )),
            Error::UnknownTier(_) => Some(
                "Use one of: development, shared-test, dedicated-test, ci, staging".to_string(),
            ),
            Error::InvalidRange { .. } | Error::Validation(_) => {
                Some("Check the 'ranges' section of portlease.yaml".to_string())
            }
            Error::AllocationNotFound { service, .. } => Some(format!(
                "Allocate the port first with: portlease allocate {}",
                service
            )),
            Error::Config(msg) if msg.contains("Could not find") => None,
            Error::Config(_) | Error::Parse(_) | Error::Yaml(_) => {
                Some("Verify the syntax of portlease.yaml".to_string())
            }
            _ => None,
        }
    }

    /// Formats the error with its suggestion (if any) for user-friendly display.
    pub fn with_suggestion(&self) -> String {
        match self.suggestion() {
            Some(suggestion) => format!("{}\n\nHint: {}", self, suggestion),
            None => self.to_string(),
        }
    }
}

/// Converts a recorded PID into a `nix` PID suitable for an existence check.
/// Returns `None` for PID 0 (process group) and values > i32::MAX.
#[cfg(unix)]
pub fn validate_pid_for_check(pid: u32) -> Option<nix::unistd::Pid> {
    if pid == 0 || pid > i32::MAX as u32 {
        return None;
    }
    Some(nix::unistd::Pid::from_raw(pid as i32))
}

/// Rejects PIDs that can never name a single owning process.
pub fn validate_owner_pid(pid: u32) -> Result<u32> {
    if pid == 0 {
        return Err(Error::InvalidPid {
            pid,
            reason: "PID 0 refers to a process group, not a process".to_string(),
        });
    }
    if pid > i32::MAX as u32 {
        return Err(Error::InvalidPid {
            pid,
            reason: format!("PID {} exceeds i32::MAX", pid),
        });
    }
    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_timeout_is_retryable() {
        let err = Error::LockTimeout {
            path: PathBuf::from("/tmp/portlease/allocations.lock"),
            timeout: Duration::from_secs(30),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("allocations.lock"));
        assert!(err.suggestion().is_some());
    }

    #[test]
    fn range_exhausted_is_retryable() {
        let err = Error::RangeExhausted {
            service: "backend".to_string(),
            range: "shared-test 30000-30999".to_string(),
        };
        assert!(err.is_retryable());
        assert!(err.with_suggestion().contains("Hint:"));
    }

    #[test]
    fn invalid_range_is_not_retryable() {
        let err = Error::InvalidRange {
            start: 10,
            end: 5,
            reason: "start is greater than end".to_string(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn owner_pid_validation() {
        assert!(validate_owner_pid(0).is_err());
        assert!(validate_owner_pid(u32::MAX).is_err());
        assert_eq!(validate_owner_pid(4242).unwrap(), 4242);
    }

    #[cfg(unix)]
    #[test]
    fn pid_for_check_rejects_out_of_range() {
        assert!(validate_pid_for_check(0).is_none());
        assert!(validate_pid_for_check(i32::MAX as u32 + 1).is_none());
        assert!(validate_pid_for_check(1).is_some());
    }
}
