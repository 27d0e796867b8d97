//! Audit trail of recognition attempts.
//!
//! Every inbound recognition image is written to the log directory before any
//! processing, named `<prefix>_<YYYYmmdd_HHMMSS>.jpg`. The timestamp has
//! one-second granularity: two attempts with the same prefix in the same
//! second share a file name and the later one overwrites the earlier.
//!
//! The prefix is a short `[A-Za-z0-9_-]` word. Caller-supplied action tags
//! that do not fit fall back to [`DEFAULT_PREFIX`].

use chrono::{DateTime, Local, TimeZone};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const DEFAULT_PREFIX: &str = "recv";

const MAX_PREFIX_LEN: usize = 32;

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// File-name prefix for an attempt tagged with `action`.
pub fn attempt_prefix(action: Option<&str>) -> &str {
    match action {
        Some(tag) if is_valid_prefix(tag) => tag,
        _ => DEFAULT_PREFIX,
    }
}

fn is_valid_prefix(prefix: &str) -> bool {
    !prefix.is_empty()
        && prefix.len() <= MAX_PREFIX_LEN
        && prefix
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

pub struct AttemptLog {
    dir: PathBuf,
}

impl AttemptLog {
    /// Create the log directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist `bytes` stamped with the current local time.
    pub fn persist(&self, bytes: &[u8], prefix: &str) -> io::Result<PathBuf> {
        self.persist_at(bytes, prefix, Local::now())
    }

    pub fn persist_at<Tz: TimeZone>(
        &self,
        bytes: &[u8],
        prefix: &str,
        timestamp: DateTime<Tz>,
    ) -> io::Result<PathBuf>
    where
        Tz::Offset: std::fmt::Display,
    {
        if !is_valid_prefix(prefix) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid attempt prefix {prefix:?}"),
            ));
        }

        let path = self
            .dir
            .join(format!("{prefix}_{}.jpg", timestamp.format(TIMESTAMP_FORMAT)));
        fs::write(&path, bytes)?;
        tracing::debug!(path = %path.display(), bytes = bytes.len(), "attempt persisted");
        Ok(path)
    }
}
