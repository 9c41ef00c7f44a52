//! Completion detection over the shared events directory.
//!
//! Clients coordinate through flat marker files: the harness drops
//! `start_sending` to release the senders, each receiver drops a file
//! prefixed `done_receiving` when it has everything, and `dump_data`
//! tells clients to flush their results before halt. The watcher polls
//! the done count and decides between full completion and a stall.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Marker released by the harness when all clients are up.
pub const START_SENDING: &str = "start_sending";
/// Marker asking clients to flush accumulated results to disk.
pub const DUMP_DATA: &str = "dump_data";
/// Prefix of the per-receiver completion markers.
pub const DONE_PREFIX: &str = "done_receiving";

/// Default time between completion polls.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Consecutive unchanged nonzero polls before a partial count is
/// declared a stall.
pub const STALL_THRESHOLD: u32 = 3;

/// How a watched run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Every expected receiver reported done.
    AllDone,
    /// Progress stopped with some receivers still outstanding.
    Stalled,
}

/// Source of the done count. The production source reads marker files;
/// tests substitute scripted counts.
pub trait CompletionSource: Send + 'static {
    fn count_done(&self) -> io::Result<usize>;
}

/// Counts `done_receiving*` files in the events directory.
pub struct DoneFileSource {
    dir: PathBuf,
}

impl DoneFileSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl CompletionSource for DoneFileSource {
    fn count_done(&self) -> io::Result<usize> {
        let mut count = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry
                .file_name()
                .to_string_lossy()
                .starts_with(DONE_PREFIX)
            {
                count += 1;
            }
        }
        Ok(count)
    }
}

/// Drop a marker file into `dir`. The file's existence is the signal,
/// its content is unused.
pub fn release_marker(dir: &Path, name: &str) -> io::Result<()> {
    crate::paths::write_marker(dir, name)
}

pub struct EventWatcher;

impl EventWatcher {
    /// Watch for run completion in a background task.
    ///
    /// Polls `source` every `poll_interval` and sends exactly one
    /// [`Completion`] on the returned channel. A count that holds steady
    /// at a nonzero value short of `expected` for [`STALL_THRESHOLD`]
    /// consecutive polls is a stall; zero done files never stalls, since
    /// slow-starting receivers look identical to dead ones.
    pub fn spawn(
        source: impl CompletionSource,
        expected: usize,
        poll_interval: Duration,
    ) -> mpsc::Receiver<Completion> {
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let mut previous = 0usize;
            let mut stable_polls = 0u32;
            loop {
                sleep(poll_interval).await;
                let count = match source.count_done() {
                    Ok(count) => count,
                    Err(e) => {
                        warn!(error = %e, "could not read events directory");
                        continue;
                    }
                };
                debug!(done = count, expected, "completion poll");

                if count >= expected {
                    info!(done = count, "all receivers finished");
                    let _ = tx.send(Completion::AllDone).await;
                    return;
                }
                if count > 0 {
                    if count == previous {
                        stable_polls += 1;
                        if stable_polls >= STALL_THRESHOLD {
                            warn!(done = count, expected, "receiver progress stalled");
                            let _ = tx.send(Completion::Stalled).await;
                            return;
                        }
                    } else {
                        previous = count;
                        stable_polls = 0;
                    }
                }
            }
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Yields one scripted count per poll, repeating the last forever.
    struct Script {
        counts: Vec<usize>,
        cursor: Arc<AtomicUsize>,
    }

    impl Script {
        fn new(counts: &[usize]) -> Self {
            Self {
                counts: counts.to_vec(),
                cursor: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl CompletionSource for Script {
        fn count_done(&self) -> io::Result<usize> {
            let i = self.cursor.fetch_add(1, Ordering::SeqCst);
            Ok(*self.counts.get(i).or(self.counts.last()).unwrap())
        }
    }

    const FAST: Duration = Duration::from_millis(5);

    #[tokio::test]
    async fn reports_all_done_when_expected_count_reached() {
        let mut rx = EventWatcher::spawn(Script::new(&[0, 1, 3]), 3, FAST);
        assert_eq!(rx.recv().await, Some(Completion::AllDone));
    }

    #[tokio::test]
    async fn reports_stall_after_three_unchanged_polls() {
        let mut rx = EventWatcher::spawn(Script::new(&[2]), 5, FAST);
        assert_eq!(rx.recv().await, Some(Completion::Stalled));
    }

    #[tokio::test]
    async fn zero_count_never_stalls() {
        let mut rx = EventWatcher::spawn(Script::new(&[0, 0, 0, 0, 0, 0, 2, 2, 3]), 3, FAST);
        assert_eq!(rx.recv().await, Some(Completion::AllDone));
    }

    #[tokio::test]
    async fn progress_resets_the_stall_counter() {
        // Count advances every other poll, never sitting still three
        // times, then completes.
        let mut rx = EventWatcher::spawn(Script::new(&[1, 1, 2, 2, 3, 3, 4]), 4, FAST);
        assert_eq!(rx.recv().await, Some(Completion::AllDone));
    }

    #[tokio::test]
    async fn done_file_source_counts_only_prefixed_files() {
        let dir = std::env::temp_dir().join(format!(
            "skein_events_{}_{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        release_marker(&dir, START_SENDING).unwrap();
        release_marker(&dir, "done_receiving_receiver_0001").unwrap();
        release_marker(&dir, "done_receiving_receiver_0002").unwrap();

        let source = DoneFileSource::new(&dir);
        assert_eq!(source.count_done().unwrap(), 2);
    }
}
