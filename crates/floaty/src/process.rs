//! Parent-process discovery and liveness polling via `/proc`.
//!
//! Keepalived does not terminate long-running notification programs when it
//! exits, and it may itself die from SIGKILL. Address refreshing must stop
//! as soon as the daemon (and with it the failover decision) is gone, so the
//! daemon's PID is located among our ancestors and polled for validity at a
//! regular interval.

use crate::backoff::{retry, ExponentialBackOff, RetryError};
use common::{Error, Result};
use std::io;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Executable base name of the VRRP daemon.
pub const KEEPALIVED_PROCESS_NAME: &str = "keepalived";

const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// A snapshot of one process-table entry.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pid: i32,
    ppid: i32,
    comm: String,
}

impl ProcessInfo {
    /// Read the entry for `pid` from `/proc/<pid>/stat`.
    pub fn read(pid: i32) -> io::Result<Self> {
        let content = std::fs::read_to_string(format!("/proc/{pid}/stat"))?;
        parse_stat(&content).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Malformed stat entry for PID {pid}"),
            )
        })
    }

    /// Re-read this entry from the process table.
    pub fn refresh(&mut self) -> io::Result<()> {
        *self = Self::read(self.pid)?;
        Ok(())
    }

    /// Whether the executable base name matches `exe`.
    ///
    /// The comm field is truncated to 15 bytes by the kernel; `exe` is
    /// truncated the same way before comparing.
    pub fn matches(&self, exe: &str) -> bool {
        let truncated = &exe[..exe.len().min(15)];
        self.comm == truncated
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn ppid(&self) -> i32 {
        self.ppid
    }
}

/// Parse a `/proc/<pid>/stat` line: `<pid> (<comm>) <state> <ppid> ...`.
///
/// The comm field may contain spaces and parentheses, hence the search for
/// the outermost closing parenthesis.
fn parse_stat(content: &str) -> Option<ProcessInfo> {
    let open = content.find('(')?;
    let close = content.rfind(')')?;

    let pid: i32 = content[..open].trim().parse().ok()?;
    let comm = content[open + 1..close].to_string();

    let mut rest = content[close + 1..].split_ascii_whitespace();
    let _state = rest.next()?;
    let ppid: i32 = rest.next()?.parse().ok()?;

    Some(ProcessInfo { pid, ppid, comm })
}

/// Walk the chain of parent processes and return the topmost entry whose
/// executable base name matches `exe`.
pub fn find_ancestor(exe: &str) -> Result<ProcessInfo> {
    let mut candidate: Option<ProcessInfo> = None;
    let mut pid = std::process::id() as i32;

    while pid > 0 {
        let proc = match ProcessInfo::read(pid) {
            Ok(proc) => proc,
            Err(err) if err.kind() == io::ErrorKind::NotFound => break,
            Err(err) => return Err(err.into()),
        };

        debug!(pid = proc.pid, ppid = proc.ppid, comm = %proc.comm, "Walking process ancestry");

        let ppid = proc.ppid;
        if proc.matches(exe) {
            candidate = Some(proc);
        }

        pid = ppid;
    }

    candidate.ok_or_else(|| {
        Error::process(format!(
            "Process with executable name {exe:?} not found among parents"
        ))
    })
}

/// Wait until either the scope is cancelled or `proc` has terminated.
///
/// Returns true when termination was confirmed, false on cancellation. The
/// entry is refreshed every five seconds; transient read errors are retried
/// briefly before being treated as confirmation of exit. A comm mismatch
/// means the PID was reused by another program and likewise counts as
/// termination.
pub async fn wait_for_termination(
    scope: &CancellationToken,
    proc: ProcessInfo,
    exe: &str,
) -> bool {
    wait_for_termination_every(scope, proc, exe, POLL_INTERVAL).await
}

async fn wait_for_termination_every(
    scope: &CancellationToken,
    mut proc: ProcessInfo,
    exe: &str,
    interval: Duration,
) -> bool {
    loop {
        tokio::select! {
            _ = scope.cancelled() => return false,
            _ = sleep(interval) => {}
        }

        let mut backoff = ExponentialBackOff::new(Duration::from_millis(100));
        backoff.max_interval = Duration::from_secs(1);
        backoff.max_elapsed_time = Duration::from_secs(5);

        let check = retry(backoff, || {
            let result = check_alive(&mut proc, exe);
            async move { result }
        })
        .await;

        if let Err(err) = check {
            warn!(error = %err, "Process termination detected");
            return true;
        }
    }
}

fn check_alive(proc: &mut ProcessInfo, exe: &str) -> std::result::Result<(), RetryError> {
    match proc.refresh() {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Err(RetryError::permanent(
            Error::process(format!("Process with ID {} no longer exists", proc.pid())),
        )),
        Err(err) => Err(RetryError::transient(Error::process(format!(
            "Refreshing data on process with ID {} failed: {}",
            proc.pid(),
            err
        )))),
        Ok(()) => {
            if proc.matches(exe) {
                Ok(())
            } else {
                Err(RetryError::permanent(Error::process(format!(
                    "Process with ID {} is not expected program {:?}",
                    proc.pid(),
                    exe
                ))))
            }
        }
    }
}

/// Locate the keepalived ancestor and cancel `root` once it terminates.
///
/// A missing keepalived parent is only a warning; floaty may be invoked
/// manually or from tests.
pub fn spawn_keepalived_watcher(root: &CancellationToken) {
    let proc = match find_ancestor(KEEPALIVED_PROCESS_NAME) {
        Ok(proc) => {
            debug!(pid = proc.pid(), "Keepalived process found");
            proc
        }
        Err(err) => {
            warn!("Keepalived not found: {err}");
            return;
        }
    };

    let scope = root.clone();
    tokio::spawn(async move {
        if wait_for_termination(&scope, proc, KEEPALIVED_PROCESS_NAME).await {
            info!("Keepalived terminated, shutting down");
            scope.cancel();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn parse_stat_plain() {
        let info = parse_stat("1234 (keepalived) S 1 1234 1234 0 -1 4194560 100 0 0 0").unwrap();
        assert_eq!(info.pid, 1234);
        assert_eq!(info.ppid, 1);
        assert_eq!(info.comm, "keepalived");
        assert!(info.matches("keepalived"));
    }

    #[test]
    fn parse_stat_comm_with_spaces_and_parens() {
        let info = parse_stat("42 (tmux: server (1)) S 7 42 42 0 -1 0 0 0").unwrap();
        assert_eq!(info.pid, 42);
        assert_eq!(info.ppid, 7);
        assert_eq!(info.comm, "tmux: server (1)");
    }

    #[test]
    fn matches_truncates_long_names() {
        let info = parse_stat("1 (averylongprogra) S 0 1 1 0 -1 0 0 0").unwrap();
        assert!(info.matches("averylongprogramname"));
        assert!(!info.matches("otherprogram"));
    }

    #[test]
    fn read_own_process() {
        let info = ProcessInfo::read(std::process::id() as i32).unwrap();
        assert_eq!(info.pid(), std::process::id() as i32);
        assert!(info.ppid() > 0);
    }

    #[test]
    fn find_ancestor_finds_own_comm() {
        let own = ProcessInfo::read(std::process::id() as i32).unwrap();
        let found = find_ancestor(&own.comm).unwrap();
        // No ancestor shares the test binary's name, so the topmost match is
        // the process itself.
        assert_eq!(found.pid(), own.pid());
    }

    #[test]
    fn find_ancestor_missing() {
        let err = find_ancestor("no-such-program").unwrap_err();
        assert!(err.to_string().contains("not found among parents"));
    }

    #[tokio::test]
    async fn detects_terminated_child() {
        let mut child = Command::new("sleep").arg("0.5").spawn().unwrap();
        let info = ProcessInfo::read(child.id() as i32).unwrap();

        // Reap the child so its /proc entry disappears
        let reaper = std::thread::spawn(move || {
            child.wait().unwrap();
        });

        let scope = CancellationToken::new();
        let terminated =
            wait_for_termination_every(&scope, info, "sleep", Duration::from_millis(100)).await;
        assert!(terminated);

        reaper.join().unwrap();
    }

    #[tokio::test]
    async fn comm_mismatch_counts_as_termination() {
        let info = ProcessInfo::read(std::process::id() as i32).unwrap();

        let scope = CancellationToken::new();
        let terminated =
            wait_for_termination_every(&scope, info, "imposter", Duration::from_millis(10)).await;
        assert!(terminated);
    }

    #[tokio::test]
    async fn cancellation_stops_waiting() {
        let info = ProcessInfo::read(std::process::id() as i32).unwrap();
        let own_comm = info.comm.clone();

        let scope = CancellationToken::new();
        scope.cancel();

        let terminated = wait_for_termination_every(
            &scope,
            info,
            &own_comm,
            Duration::from_secs(3600),
        )
        .await;
        assert!(!terminated);
    }
}
