//! Ownership of live runs across processes.
//!
//! Every admitted run records the [`RunOwner`] of the process supervising
//! it. On start-up a `running` record is only treated as interrupted when
//! that owner is gone.

use std::sync::OnceLock;

use crate::model::{Run, RunOwner};

static INSTANCE: OnceLock<String> = OnceLock::new();

fn instance() -> &'static str {
    INSTANCE.get_or_init(|| uuid::Uuid::new_v4().to_string())
}

/// Owner tag for runs admitted by this process.
pub fn current_owner() -> RunOwner {
    RunOwner {
        pid: std::process::id(),
        instance: instance().to_string(),
    }
}

/// Whether a `running` record has lost the process that supervised it.
///
/// Records without an owner are orphaned. A record owned by this process
/// lifetime never is. A matching pid with a different instance means the
/// pid was reused after a restart.
pub fn is_orphaned(run: &Run) -> bool {
    match &run.owner {
        None => true,
        Some(owner) if owner.instance == instance() => false,
        Some(owner) if owner.pid == std::process::id() => true,
        Some(owner) => !pid_alive(owner.pid),
    }
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // Signal 0 only checks that the process exists.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

// Without a cheap liveness check, foreign owners are assumed gone.
#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn owned_by(owner: Option<RunOwner>) -> Run {
        let mut run = Run::start(Some("job-1"), None, Utc::now());
        run.owner = owner;
        run
    }

    #[test]
    fn test_current_owner_is_stable() {
        assert_eq!(current_owner(), current_owner());
        assert_eq!(current_owner().pid, std::process::id());
    }

    #[test]
    fn test_unowned_run_is_orphaned() {
        assert!(is_orphaned(&owned_by(None)));
    }

    #[test]
    fn test_own_run_is_not_orphaned() {
        assert!(!is_orphaned(&owned_by(Some(current_owner()))));
    }

    #[test]
    fn test_reused_pid_is_orphaned() {
        let owner = RunOwner {
            pid: std::process::id(),
            instance: "previous-lifetime".to_string(),
        };
        assert!(is_orphaned(&owned_by(Some(owner))));
    }

    #[cfg(unix)]
    #[test]
    fn test_foreign_owner_liveness() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let owner = RunOwner {
            pid: child.id(),
            instance: "other-process".to_string(),
        };
        assert!(!is_orphaned(&owned_by(Some(owner.clone()))));

        child.kill().unwrap();
        child.wait().unwrap();
        assert!(is_orphaned(&owned_by(Some(owner))));
    }

    #[cfg(unix)]
    #[test]
    fn test_invalid_pid_is_orphaned() {
        let owner = RunOwner {
            pid: u32::MAX,
            instance: "other-process".to_string(),
        };
        assert!(is_orphaned(&owned_by(Some(owner))));
    }
}
