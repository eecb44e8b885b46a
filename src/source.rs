//! Raw detection sources.
//!
//! Keyboard-wedge barcode scanners type each code followed by Enter, so the
//! sources here turn lines of text into [`RawDetection`]s stamped with the time
//! the line was read.

use crate::detection::RawDetection;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Channel buffer size for raw detections.
pub const DETECTION_CHANNEL_BUFFER_SIZE: usize = 100;

/// Errors starting a detection source.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Cannot open input {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Spawn a task that forwards each non-blank line of `reader` as a detection.
///
/// The channel closes at end of input or on the first read error.
pub fn spawn_line_reader<R>(reader: R) -> mpsc::Receiver<RawDetection>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(DETECTION_CHANNEL_BUFFER_SIZE);

    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let payload = line.trim();
                    if payload.is_empty() {
                        continue;
                    }
                    let detection = RawDetection::new(payload, Instant::now());
                    if tx.send(detection).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("end of scanner input");
                    break;
                }
                Err(error) => {
                    warn!(%error, "reading scanner input failed");
                    break;
                }
            }
        }
    });

    rx
}

/// Read detections from standard input.
pub fn start_stdin() -> mpsc::Receiver<RawDetection> {
    spawn_line_reader(tokio::io::stdin())
}

/// Read detections from a file or named pipe.
pub async fn start_file(path: &Path) -> Result<mpsc::Receiver<RawDetection>, SourceError> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|source| SourceError::Open {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(spawn_line_reader(file))
}
