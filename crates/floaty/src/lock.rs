//! File-based mutual exclusion per VRRP instance.
//!
//! The lock file contains the owner's PID. Acquisition preempts a previous
//! owner by sending it SIGTERM once, then keeps retrying until the owner has
//! released (or vanished) or the lock timeout expires. A predecessor that is
//! still refreshing addresses after its own state change must be stopped
//! before the new owner starts.

use crate::backoff::{retry, ExponentialBackOff, RetryError};
use common::{Error, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Holds an acquired lock; releasing deletes the lock file.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    released: bool,
}

impl LockGuard {
    /// Release the lock by removing the lock file.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        fs::remove_file(&self.path)?;
        debug!(path = %self.path.display(), "Lock released");
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(err) = fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %err, "Removing lock file failed");
            }
        }
    }
}

/// Acquire the lock at `path`, preempting a previous owner.
///
/// Retries with a 10 ms → 100 ms back-off until `timeout` has elapsed. A
/// busy lock triggers a single best-effort SIGTERM to the recorded owner per
/// acquisition attempt; stale state (unparsable PID, dead owner, vanished
/// file) is cleaned up and retried. After a successful claim the recorded
/// PID is verified to be ours; losing that race is an error.
pub async fn acquire_lock(
    scope: &CancellationToken,
    path: impl AsRef<Path>,
    timeout: Duration,
) -> Result<LockGuard> {
    let path = path.as_ref().to_path_buf();

    let mut backoff = ExponentialBackOff::new(Duration::from_millis(10));
    backoff.max_interval = Duration::from_millis(100);
    backoff.max_elapsed_time = timeout;

    let mut sent_sigterm = false;

    let claim = {
        let path = path.clone();
        retry(backoff, move || {
            let result = try_claim(&path, &mut sent_sigterm);
            async move { result }
        })
    };

    tokio::select! {
        result = claim => result?,
        _ = scope.cancelled() => {
            return Err(Error::lock("Acquisition cancelled"));
        }
    }

    // Verify we won; a concurrent claimant may have raced us.
    let owner = read_owner(&path)?;
    let own_pid = std::process::id() as i32;
    if owner != own_pid {
        return Err(Error::lock(format!("Lock owned by PID {owner}")));
    }

    debug!(path = %path.display(), "Lock acquired");

    Ok(LockGuard {
        path,
        released: false,
    })
}

fn try_claim(path: &Path, sent_sigterm: &mut bool) -> std::result::Result<(), RetryError> {
    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(mut file) => {
            let pid = std::process::id().to_string();
            file.write_all(pid.as_bytes()).map_err(|err| {
                // Claimed but unusable; do not leave an empty file behind.
                let _ = fs::remove_file(path);
                RetryError::permanent(Error::from(err))
            })?;
            file.sync_all()
                .map_err(|err| RetryError::transient(Error::from(err)))?;
            Ok(())
        }

        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            handle_busy(path, sent_sigterm)
        }

        Err(err) => Err(RetryError::permanent(Error::from(err))),
    }
}

fn handle_busy(path: &Path, sent_sigterm: &mut bool) -> std::result::Result<(), RetryError> {
    let owner = match read_owner(path) {
        Ok(pid) => pid,
        Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            // Owner released between our attempts
            return Err(RetryError::transient(Error::lock("Lock file vanished")));
        }
        Err(Error::Lock(_)) => {
            // Unparsable content cannot belong to a live owner
            let _ = fs::remove_file(path);
            return Err(RetryError::transient(Error::lock(
                "Removed lock file with invalid PID",
            )));
        }
        Err(err) => return Err(RetryError::transient(err)),
    };

    match kill(Pid::from_raw(owner), None) {
        Err(nix::errno::Errno::ESRCH) => {
            // Dead owner
            let _ = fs::remove_file(path);
            Err(RetryError::transient(Error::lock(format!(
                "Removed lock file of dead PID {owner}"
            ))))
        }
        _ => {
            if !*sent_sigterm {
                match kill(Pid::from_raw(owner), Signal::SIGTERM) {
                    Ok(()) => {
                        debug!(pid = owner, "Sent SIGTERM to lock owner");
                        *sent_sigterm = true;
                    }
                    Err(err) => {
                        warn!(pid = owner, error = %err, "Sending SIGTERM to lock owner failed");
                    }
                }
            }

            Err(RetryError::transient(Error::lock(format!(
                "Lock busy, owned by PID {owner}"
            ))))
        }
    }
}

fn read_owner(path: &Path) -> Result<i32> {
    let content = fs::read_to_string(path)?;
    content
        .trim()
        .parse::<i32>()
        .ok()
        .filter(|pid| *pid > 0)
        .ok_or_else(|| Error::lock(format!("Invalid PID in lock file {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn scope() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn acquire_writes_own_pid_and_release_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");

        let guard = acquire_lock(&scope(), &path, Duration::from_secs(1))
            .await
            .unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());

        guard.release().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn dropping_guard_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");

        let guard = acquire_lock(&scope(), &path, Duration::from_secs(1))
            .await
            .unwrap();
        drop(guard);

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn dead_owner_is_preempted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");

        // A process that has already exited
        let mut child = Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();

        fs::write(&path, dead_pid.to_string()).unwrap();

        let guard = acquire_lock(&scope(), &path, Duration::from_secs(2))
            .await
            .unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());

        guard.release().unwrap();
    }

    #[tokio::test]
    async fn invalid_pid_is_preempted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");
        fs::write(&path, "not a pid").unwrap();

        let guard = acquire_lock(&scope(), &path, Duration::from_secs(2))
            .await
            .unwrap();
        guard.release().unwrap();
    }

    #[tokio::test]
    async fn live_owner_receives_sigterm() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");

        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        fs::write(&path, child.id().to_string()).unwrap();

        // Reap the child as soon as the SIGTERM lands; a zombie would still
        // count as a live lock owner.
        let reaper = std::thread::spawn(move || child.wait().unwrap());

        let guard = acquire_lock(&scope(), &path, Duration::from_secs(5))
            .await
            .unwrap();

        // The sleeping owner must have been terminated for us to get here.
        let status = reaper.join().unwrap();
        assert!(!status.success());

        guard.release().unwrap();
    }

    #[tokio::test]
    async fn cancelled_scope_aborts_acquisition() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dir.lock");
        fs::create_dir(&path).unwrap();

        let scope = CancellationToken::new();
        scope.cancel();

        let result = acquire_lock(&scope, &path, Duration::from_secs(30)).await;
        assert!(result.is_err());
    }
}
