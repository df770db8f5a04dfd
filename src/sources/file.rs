//! A single-file tailer.
//!
//! Reads complete newline-terminated lines from a growing file and ships
//! them as [`Line`] values. The file is polled rather than watched: each
//! pass drains to end-of-file, then sleeps for the poll interval and checks
//! whether the file was truncated, removed, or replaced.

use std::io::SeekFrom;
use std::mem;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use snafu::{ResultExt, Snafu};
use tokio::fs::File;
use tokio::io::{self, AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::event::{Line, DEFAULT_LINE_LEVEL};

#[derive(Debug, Snafu)]
pub enum TailError {
    #[snafu(display("failed to open {}: {}", path.display(), source))]
    Open { path: PathBuf, source: io::Error },
    #[snafu(display("failed to read {}: {}", path.display(), source))]
    Read { path: PathBuf, source: io::Error },
    #[snafu(display("failed to stat {}: {}", path.display(), source))]
    Metadata { path: PathBuf, source: io::Error },
}

#[derive(Clone, Debug)]
pub struct FileTailerConfig {
    pub path: PathBuf,
    /// Whether to read from the beginning instead of seeking to the end.
    pub read_from_start: bool,
    /// The delay between end-of-file checks.
    pub poll_interval: Duration,
    /// The maximum size of a line before it is discarded. Protects against
    /// malformed lines or tailing incorrect files.
    pub max_line_bytes: usize,
}

impl FileTailerConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            read_from_start: false,
            poll_interval: Duration::from_millis(250),
            max_line_bytes: 102_400,
        }
    }
}

/// What a poll pass learned about the tailed path.
enum FileStatus {
    Unchanged,
    /// The file shrank below the read position; start over from the top.
    Truncated,
    /// The path is gone or now names a different file.
    Gone,
}

pub struct FileTailer {
    config: FileTailerConfig,
    reader: BufReader<File>,
    position: u64,
    fingerprint: Option<u64>,
}

impl FileTailer {
    /// Opens the file and positions the read cursor.
    pub async fn open(config: FileTailerConfig) -> Result<Self, TailError> {
        let file = File::open(&config.path).await.context(OpenSnafu {
            path: config.path.clone(),
        })?;
        let metadata = file.metadata().await.context(MetadataSnafu {
            path: config.path.clone(),
        })?;
        let fingerprint = fingerprint(&metadata);
        let mut reader = BufReader::new(file);
        let position = if config.read_from_start {
            0
        } else {
            reader.seek(SeekFrom::End(0)).await.context(ReadSnafu {
                path: config.path.clone(),
            })?
        };
        Ok(Self {
            config,
            reader,
            position,
            fingerprint,
        })
    }

    /// Tails the file until it is removed or replaced, or until `cancel`
    /// fires. Lines go out through `sender`; the channel closes with the
    /// tailer, which is how downstream learns this source is done.
    pub async fn run(
        mut self,
        sender: mpsc::Sender<Line>,
        cancel: CancellationToken,
    ) -> Result<(), TailError> {
        let path = self.config.path.display().to_string();
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Partial line carried across poll passes, plus whether we are
        // throwing bytes away until the next newline.
        let mut partial: Vec<u8> = Vec::new();
        let mut discarding = false;

        loop {
            loop {
                let read = self
                    .reader
                    .read_until(b'\n', &mut partial)
                    .await
                    .context(ReadSnafu {
                        path: self.config.path.clone(),
                    })?;
                if read == 0 {
                    break;
                }
                self.position += read as u64;

                if partial.last() != Some(&b'\n') {
                    // Sheared write; hold the bytes until the newline lands.
                    // An over-long partial is dropped as it streams in so the
                    // buffer stays bounded.
                    if partial.len() > self.config.max_line_bytes {
                        if !discarding {
                            warn!(
                                message = "Discarding long line.",
                                path = %path,
                                max_line_bytes = self.config.max_line_bytes,
                            );
                            discarding = true;
                        }
                        partial.clear();
                    }
                    break;
                }

                partial.pop();
                if partial.last() == Some(&b'\r') {
                    partial.pop();
                }

                if discarding {
                    // The newline terminating an already-discarded line.
                    partial.clear();
                    discarding = false;
                    continue;
                }
                if partial.len() > self.config.max_line_bytes {
                    warn!(
                        message = "Discarding long line.",
                        path = %path,
                        length = partial.len(),
                        max_line_bytes = self.config.max_line_bytes,
                    );
                    partial.clear();
                    continue;
                }

                let line = Line::new(Bytes::from(mem::take(&mut partial)), DEFAULT_LINE_LEVEL)
                    .with_file(path.clone());
                if sender.send(line).await.is_err() {
                    debug!(message = "Receiver dropped; stopping tail.", path = %path);
                    return Ok(());
                }
            }

            match self.check_file().await? {
                FileStatus::Unchanged => {}
                FileStatus::Truncated => {
                    debug!(message = "File truncated; reading from the start.", path = %path);
                    self.position =
                        self.reader
                            .seek(SeekFrom::Start(0))
                            .await
                            .context(ReadSnafu {
                                path: self.config.path.clone(),
                            })?;
                    partial.clear();
                    discarding = false;
                }
                FileStatus::Gone => {
                    // The trailing partial will never get its newline.
                    if !partial.is_empty() && !discarding {
                        let line = Line::new(Bytes::from(partial), DEFAULT_LINE_LEVEL)
                            .with_file(path.clone());
                        let _ = sender.send(line).await;
                    }
                    debug!(message = "File removed or replaced; stopping tail.", path = %path);
                    return Ok(());
                }
            }

            tokio::select! {
                _ = poll.tick() => {}
                () = cancel.cancelled() => {
                    debug!(message = "Shutdown requested; stopping tail.", path = %path);
                    return Ok(());
                }
            }
        }
    }

    async fn check_file(&self) -> Result<FileStatus, TailError> {
        let metadata = match tokio::fs::metadata(&self.config.path).await {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return Ok(FileStatus::Gone);
            }
            Err(source) => {
                return Err(source).context(MetadataSnafu {
                    path: self.config.path.clone(),
                });
            }
        };
        if fingerprint(&metadata) != self.fingerprint {
            return Ok(FileStatus::Gone);
        }
        if metadata.len() < self.position {
            return Ok(FileStatus::Truncated);
        }
        Ok(FileStatus::Unchanged)
    }
}

#[cfg(unix)]
fn fingerprint(metadata: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(metadata.ino())
}

#[cfg(not(unix))]
fn fingerprint(_metadata: &std::fs::Metadata) -> Option<u64> {
    None
}
