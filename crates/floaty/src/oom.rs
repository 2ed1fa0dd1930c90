//! Best-effort protection from the kernel out-of-memory killer.

use crate::backoff::{retry, ExponentialBackOff, RetryError};
use common::{Error, Result};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

const OOM_SCORE_ADJ_PATH: &str = "/proc/self/oom_score_adj";

// Magic "don't kill me" value as documented in
// <https://www.kernel.org/doc/Documentation/filesystems/proc.txt>
const OOM_SCORE_ADJ: &str = "-1000";

/// Lower this process's OOM score as far as possible.
///
/// Floaty must outlive memory pressure long enough to stop refreshing when
/// it loses MASTER. Missing permission is tolerated with a warning.
pub async fn adjust_oom_score() -> Result<()> {
    adjust_oom_score_at(Path::new(OOM_SCORE_ADJ_PATH)).await
}

async fn adjust_oom_score_at(path: &Path) -> Result<()> {
    let mut backoff = ExponentialBackOff::new(Duration::from_millis(10));
    backoff.max_interval = Duration::from_millis(100);
    backoff.max_elapsed_time = Duration::from_secs(1);

    let result = retry(backoff, || {
        let attempt = write_score(path);
        async move { attempt }
    })
    .await;

    match result {
        Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            warn!(path = %path.display(), error = %err, "Setting OOM adjust score failed");
            Ok(())
        }
        other => other,
    }
}

fn write_score(path: &Path) -> std::result::Result<(), RetryError> {
    match std::fs::write(path, OOM_SCORE_ADJ) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            Err(RetryError::permanent(Error::from(err)))
        }
        Err(err) => Err(RetryError::transient(Error::from(err))),
    }
}
