// Watching a download directory written by another process
use crate::error::{StoreError, StoreResult};
use crate::storage::files;
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// How a wait on a sibling's download ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// The download directory went away: the sibling finished or gave up.
    Completed,
    /// Nothing changed for the whole stall timeout.
    Stalled,
}

/// Polls a download directory until it disappears or stops changing.
#[derive(Debug, Clone, Copy)]
pub struct DownloadWatch {
    stall_timeout: Duration,
    poll_interval: Duration,
}

impl DownloadWatch {
    pub fn new(stall_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            stall_timeout,
            poll_interval,
        }
    }

    pub fn stall_timeout(&self) -> Duration {
        self.stall_timeout
    }

    pub async fn wait(&self, dir: &Path) -> StoreResult<WatchOutcome> {
        let Some(mut last) = snapshot(dir).await? else {
            return Ok(WatchOutcome::Completed);
        };
        let mut last_change = Instant::now();

        loop {
            tokio::time::sleep(self.poll_interval).await;
            let Some(current) = snapshot(dir).await? else {
                debug!("Download {} finished elsewhere", dir.display());
                return Ok(WatchOutcome::Completed);
            };
            if current != last {
                last = current;
                last_change = Instant::now();
            } else if last_change.elapsed() >= self.stall_timeout {
                return Ok(WatchOutcome::Stalled);
            }
        }
    }
}

/// File count and total size beneath `dir`, or `None` once it is gone.
async fn snapshot(dir: &Path) -> StoreResult<Option<(usize, u64)>> {
    let listing = match files::walk_files(dir).await {
        Ok(listing) => listing,
        // Removed (or swapped into the cache) while walking
        Err(StoreError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    let mut bytes = 0;
    for rel in &listing {
        match tokio::fs::metadata(dir.join(rel)).await {
            Ok(meta) => bytes += meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(dir.join(rel), e)),
        }
    }
    Ok(Some((listing.len(), bytes)))
}
