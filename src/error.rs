//! Error types for parity-snap
//!
//! This module provides the error taxonomy for the engine:
//! - Per-file recoverable conditions (missing/modified files, insufficient
//!   space for a single file) are NOT errors — they are reported through the
//!   event channel and the operation continues with the next file.
//! - The variants here cover conditions that abort an operation or that the
//!   caller must act on (corrupt metadata, a failed initial build, temp
//!   parity staging failure, etc).

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for parity-snap operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for parity-snap
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "parity_dir")
        key: Option<String>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Drive metadata file error (corrupt, truncated, or wrong version)
    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    /// Block index outside the current parity extent
    ///
    /// Reads and writes past the extent fail rather than implicitly
    /// zero-filling, so allocation bugs surface at the point of the mistake.
    #[error("block {block} is outside the parity extent (max block {max_block})")]
    BlockOutOfRange {
        /// The out-of-range block index
        block: u32,
        /// The current extent watermark (exclusive)
        max_block: u32,
    },

    /// Insufficient disk space
    #[error("insufficient disk space: need {required} bytes, have {available} bytes")]
    InsufficientSpace {
        /// Number of bytes required for the operation
        required: u64,
        /// Number of bytes currently available on disk
        available: u64,
    },

    /// Failed to check disk space
    #[error("failed to check disk space: {0}")]
    DiskSpaceCheckFailed(String),

    /// Temp parity staging failure (distinct from ordinary I/O errors)
    ///
    /// Usually means the temp directory ran out of space. It should have at
    /// least as much free space as the largest file under protection.
    #[error("temp parity failure: {0} (check free space at the temp parity location)")]
    TempParity(String),

    /// The initial full build failed and the partial parity set was erased
    #[error("initial parity build failed: {0}")]
    CreateFailed(String),

    /// A drive index or handle that does not belong to this parity set
    #[error("invalid drive: {0}")]
    InvalidDrive(String),

    /// Attempt to remove a drive that still tracks files
    #[error("drive {path} still tracks {files} file(s) and cannot be removed")]
    DriveNotEmpty {
        /// Root path of the drive
        path: PathBuf,
        /// Number of files still tracked
        files: usize,
    },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Drive metadata file errors
#[derive(Debug, Error)]
pub enum MetadataError {
    /// The file does not start with the expected magic bytes
    #[error("{path} is not a drive metadata file (bad magic)")]
    BadMagic {
        /// Path of the offending file
        path: PathBuf,
    },

    /// The format version is newer than this build understands
    #[error("{path} has unsupported metadata format version {version}")]
    UnsupportedVersion {
        /// Path of the offending file
        path: PathBuf,
        /// Version found in the header
        version: u32,
    },

    /// The file ended in the middle of a record
    #[error("{path} is truncated (record {record} of {total})")]
    Truncated {
        /// Path of the offending file
        path: PathBuf,
        /// Zero-based index of the record being read when data ran out
        record: u32,
        /// Record count claimed by the header
        total: u32,
    },

    /// A record contains an invalid field (e.g. non-UTF-8 path bytes)
    #[error("{path} contains an invalid record: {reason}")]
    InvalidRecord {
        /// Path of the offending file
        path: PathBuf,
        /// What was wrong with the record
        reason: String,
    },
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_out_of_range_mentions_both_indices() {
        let err = Error::BlockOutOfRange {
            block: 120,
            max_block: 100,
        };
        let msg = err.to_string();
        assert!(msg.contains("120"), "message should name the bad block: {msg}");
        assert!(msg.contains("100"), "message should name the extent: {msg}");
    }

    #[test]
    fn temp_parity_error_points_at_temp_location() {
        let err = Error::TempParity("write failed".into());
        assert!(
            err.to_string().contains("temp parity location"),
            "temp parity errors must steer the user toward the temp dir"
        );
    }

    #[test]
    fn insufficient_space_includes_byte_counts() {
        let err = Error::InsufficientSpace {
            required: 1_048_576,
            available: 512,
        };
        let msg = err.to_string();
        assert!(msg.contains("1048576"));
        assert!(msg.contains("512"));
    }

    #[test]
    fn metadata_errors_convert_into_error() {
        let err: Error = MetadataError::BadMagic {
            path: PathBuf::from("/parity/files1.dat"),
        }
        .into();
        assert!(matches!(err, Error::Metadata(MetadataError::BadMagic { .. })));
    }
}
