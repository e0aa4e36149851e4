//! Tracked-file records
//!
//! A [`FileRecord`] describes one protected file: its identity (path
//! relative to the drive root), placement in the parity address space, and
//! integrity metadata (length, timestamps, attributes, content hash).

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

use crate::block::BLOCK_SIZE;
use crate::types::FileHash;

/// Metadata entry describing one tracked file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileRecord {
    /// Path relative to the drive root
    pub name: PathBuf,

    /// File length in bytes
    pub length: u64,

    /// First parity block of the file's contiguous run
    ///
    /// Meaningful only once the file has been added to parity.
    pub start_block: u32,

    /// MD5 content hash, written when the file's bytes enter parity
    pub hash: FileHash,

    /// Platform attribute bits (Unix permission mode on Unix, 0 elsewhere)
    pub attributes: u32,

    /// Creation timestamp
    pub created: DateTime<Utc>,

    /// Last-write timestamp
    pub modified_at: DateTime<Utc>,

    /// Set when the on-disk length or mtime no longer match this record
    ///
    /// Runtime state, never persisted: every scan re-derives it. A modified
    /// file disables the fast-remove path and downgrades Verify repairs to
    /// reports.
    pub modified: bool,
}

/// Truncate to millisecond precision, matching the persisted resolution
fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

impl FileRecord {
    /// Build a record from a file currently on disk
    ///
    /// The hash is zeroed and the start block unset; both are filled in when
    /// the file's bytes are first XORed into parity.
    pub fn from_disk(root: &Path, name: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(root.join(name))?;

        let modified_at: DateTime<Utc> = meta.modified()?.into();
        // Creation time is unavailable on some filesystems; fall back to mtime.
        let created: DateTime<Utc> = meta.created().map(Into::into).unwrap_or(modified_at);

        #[cfg(unix)]
        let attributes = {
            use std::os::unix::fs::MetadataExt;
            meta.mode()
        };
        #[cfg(not(unix))]
        let attributes = 0u32;

        Ok(Self {
            name: name.to_path_buf(),
            length: meta.len(),
            start_block: 0,
            hash: FileHash::default(),
            attributes,
            created,
            modified_at,
            modified: false,
        })
    }

    /// Number of parity blocks the file occupies: `ceil(length / BLOCK_SIZE)`
    #[must_use]
    pub fn length_in_blocks(&self) -> u32 {
        (self.length.div_ceil(BLOCK_SIZE as u64)) as u32
    }

    /// One past the last block of the file's run
    #[must_use]
    pub fn end_block(&self) -> u32 {
        self.start_block + self.length_in_blocks()
    }

    /// Whether `block` falls inside the file's run
    #[must_use]
    pub fn contains_block(&self, block: u32) -> bool {
        self.length > 0 && block >= self.start_block && block < self.end_block()
    }

    /// Full on-disk path under the given drive root
    #[must_use]
    pub fn full_path(&self, root: &Path) -> PathBuf {
        root.join(&self.name)
    }

    /// Whether this record and a freshly-statted state describe the same
    /// file content (length and mtime at millisecond precision)
    #[must_use]
    pub fn matches(&self, other: &FileRecord) -> bool {
        self.length == other.length && millis(self.modified_at) == millis(other.modified_at)
    }

    /// Re-stat the file and refresh length/timestamps/attributes
    ///
    /// Returns `false` when the file no longer exists. Divergence from the
    /// previous state sets the `modified` flag.
    pub fn refresh_attributes(&mut self, root: &Path) -> bool {
        let Ok(fresh) = FileRecord::from_disk(root, &self.name) else {
            return false;
        };
        if !self.matches(&fresh) {
            self.modified = true;
        }
        self.length = fresh.length;
        self.modified_at = fresh.modified_at;
        self.created = fresh.created;
        self.attributes = fresh.attributes;
        true
    }
}
