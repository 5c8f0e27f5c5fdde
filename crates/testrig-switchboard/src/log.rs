/*!
 * Durable per-device log.
 *
 * Every line is timestamped and flushed before the reader moves on, so the file
 * is a faithful record even if the process dies mid-session. Rotation never
 * deletes: `start_new_log` and size-based rotation both open a new file and
 * leave the previous one in place.
 */
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info};

use crate::error::{Result, SwitchboardError};

/// Timestamp format used at the start of each log line
pub const LOG_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Append-only device log file
#[derive(Debug)]
pub struct DeviceLog {
    path: PathBuf,
    writer: BufWriter<File>,
    bytes_written: u64,
    max_size: u64,
    rotations: u32,
}

impl DeviceLog {
    /// Open (or create) the log at `path`. A `max_size` of 0 disables rotation.
    pub async fn open<P: AsRef<Path>>(path: P, max_size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (writer, bytes_written) = open_append(&path).await?;
        debug!("Opened device log {}", path.display());
        Ok(Self {
            path,
            writer,
            bytes_written,
            max_size,
            rotations: 0,
        })
    }

    /// The file currently being written
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line
    pub async fn write_line(&mut self, timestamp: DateTime<Utc>, line: &str) -> Result<()> {
        if self.max_size > 0 && self.bytes_written >= self.max_size {
            self.rotations += 1;
            let next = rotated_path(&self.path, self.rotations);
            self.switch_to(next).await?;
        }

        let entry = format!("<{}> {}\n", timestamp.format(LOG_TIMESTAMP_FORMAT), line);
        self.writer.write_all(entry.as_bytes()).await?;
        self.writer.flush().await?;
        self.bytes_written += entry.len() as u64;
        Ok(())
    }

    /// Continue logging into a new file, keeping the previous one
    pub async fn start_new_log<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.rotations = 0;
        self.switch_to(path.as_ref().to_path_buf()).await
    }

    /// Flush buffered bytes to disk
    pub async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await?;
        Ok(())
    }

    async fn switch_to(&mut self, path: PathBuf) -> Result<()> {
        self.writer.flush().await?;
        let (writer, bytes_written) = open_append(&path).await?;
        info!("Device log rotated from {} to {}", self.path.display(), path.display());
        self.writer = writer;
        self.bytes_written = bytes_written;
        self.path = path;
        Ok(())
    }
}

async fn open_append(path: &Path) -> Result<(BufWriter<File>, u64)> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| SwitchboardError::log(format!("cannot open {}: {}", path.display(), e)))?;
    let len = file.metadata().await?.len();
    Ok((BufWriter::new(file), len))
}

/// `logs/board.txt` rotates to `logs/board.00001.txt`, `logs/board.00002.txt`, ...
pub fn rotated_path(base: &Path, index: u32) -> PathBuf {
    let stem = base.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    // Strip an earlier rotation suffix so indices do not stack up
    let stem = match stem.rsplit_once('.') {
        Some((head, tail)) if tail.len() == 5 && tail.chars().all(|c| c.is_ascii_digit()) => head.to_string(),
        _ => stem,
    };
    let file_name = match base.extension() {
        Some(ext) => format!("{}.{:05}.{}", stem, index, ext.to_string_lossy()),
        None => format!("{}.{:05}", stem, index),
    };
    base.with_file_name(file_name)
}

/// `logs/board.txt` keeps its parsed events in `logs/board-events.txt`
pub fn events_path_for(log_path: &Path) -> PathBuf {
    let stem = log_path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let file_name = match log_path.extension() {
        Some(ext) => format!("{}-events.{}", stem, ext.to_string_lossy()),
        None => format!("{}-events", stem),
    };
    log_path.with_file_name(file_name)
}
