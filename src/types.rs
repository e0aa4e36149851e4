//! Core types and events for parity-snap

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 128-bit MD5 content hash of a tracked file
pub type FileHash = [u8; 16];

/// Long-running engine operations, named for progress reporting
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Initial full parity build
    Create,
    /// Incremental update (deletes then adds)
    Update,
    /// Parity verification and self-heal
    Verify,
    /// Whole-drive reconstruction
    Recover,
    /// Reconstruction of deleted files back onto their drive
    Undelete,
    /// Per-drive content hash verification
    Hashcheck,
    /// Removal of every tracked file on one drive from parity
    RemoveAll,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Verify => "verify",
            Operation::Recover => "recover",
            Operation::Undelete => "undelete",
            Operation::Hashcheck => "hashcheck",
            Operation::RemoveAll => "remove_all",
        };
        write!(f, "{name}")
    }
}

/// Per-drive state machine, driven only by Scan and post-update bookkeeping
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DriveStatus {
    /// No scan has run yet; the inventory may not reflect the disk
    #[default]
    ScanRequired,
    /// A scan is in progress
    Scanning,
    /// Scan found pending work
    UpdateRequired {
        /// Files present on disk but not yet in parity
        adds: usize,
        /// Files in parity but gone (or changed) on disk
        deletes: usize,
        /// Delete/add pairs that look like the same file at a new path
        moves: usize,
    },
    /// The inventory matches the disk
    UpToDate,
    /// The drive root could not be read
    AccessError,
}

/// Event emitted during engine operations
///
/// Consumers subscribe via [`crate::ParitySet::subscribe`]. Progress events
/// carry the operation name, a fraction in `0..=1` and a human status line;
/// error events carry a display-ready message for conditions that did not
/// abort the operation (missing files, per-file hash mismatches, ...).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Periodic progress for a long-running operation
    Progress {
        /// Which operation is reporting
        operation: Operation,
        /// Completed fraction, 0.0 to 1.0
        fraction: f64,
        /// Human-readable status line
        status: String,
    },

    /// A reportable, non-fatal problem encountered mid-operation
    Error {
        /// Display-ready error message
        message: String,
    },

    /// A drive scan started
    ScanStarted {
        /// Root path of the drive being scanned
        drive: PathBuf,
    },

    /// A drive scan finished
    ScanComplete {
        /// Root path of the scanned drive
        drive: PathBuf,
        /// Files found on disk but not in the inventory
        adds: usize,
        /// Inventory entries no longer matching the disk
        deletes: usize,
        /// Delete/add pairs that look like moves
        moves: usize,
    },

    /// A file's contribution was committed to parity
    FileAdded {
        /// Full path of the file
        path: PathBuf,
        /// Number of parity blocks the file occupies
        blocks: u32,
    },

    /// A file's contribution was removed from parity
    FileRemoved {
        /// Full path of the file
        path: PathBuf,
    },

    /// Unused tail blocks were reclaimed from the parity volume
    ParityTrimmed {
        /// Number of blocks released
        blocks: u32,
    },

    /// Verify repaired a mismatched parity block in place
    BlockRepaired {
        /// Index of the repaired block
        block: u32,
    },

    /// Verify found a mismatch it could not safely repair
    BlockUnrepairable {
        /// Index of the mismatched block
        block: u32,
    },

    /// A file was reconstructed from parity
    FileRecovered {
        /// Destination path of the reconstructed file
        path: PathBuf,
    },

    /// Update (or Create) finished
    UpdateComplete {
        /// Counters for the pass
        summary: UpdateSummary,
    },

    /// Verify finished
    VerifyComplete {
        /// Counters for the pass
        summary: VerifySummary,
    },

    /// Recover or Undelete finished
    RecoverComplete {
        /// Counters for the pass
        summary: RecoverSummary,
    },

    /// A file failed its content hash check
    HashcheckMismatch {
        /// Full path of the mismatching file
        path: PathBuf,
    },

    /// Hashcheck finished
    HashcheckComplete {
        /// Counters for the pass
        summary: HashcheckSummary,
    },
}

/// Counters reported by Update and Create
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSummary {
    /// Files whose contribution was added to parity
    pub files_added: u32,
    /// Files whose contribution was removed from parity
    pub files_removed: u32,
    /// Total bytes across added files
    pub bytes_added: u64,
    /// Total bytes across removed files
    pub bytes_removed: u64,
    /// Tail blocks reclaimed by the post-update trim
    pub blocks_reclaimed: u32,
}

/// Counters reported by Verify
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifySummary {
    /// Parity blocks compared against recomputed values
    pub blocks_checked: u32,
    /// Blocks whose stored parity did not match
    pub mismatches: u32,
    /// Mismatched blocks repaired in place
    pub repaired: u32,
}

/// Counters reported by Recover and Undelete
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverSummary {
    /// Files reconstructed with a matching content hash
    pub restored: u32,
    /// Files that failed reconstruction or failed the hash check
    pub failures: u32,
}

/// Counters reported by Hashcheck
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashcheckSummary {
    /// Files whose hash was checked (or skipped with a report)
    pub files_checked: u32,
    /// Files whose content hash did not match the record
    pub failures: u32,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_display_is_snake_case() {
        assert_eq!(Operation::Create.to_string(), "create");
        assert_eq!(Operation::RemoveAll.to_string(), "remove_all");
        assert_eq!(Operation::Hashcheck.to_string(), "hashcheck");
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = Event::Progress {
            operation: Operation::Verify,
            fraction: 0.25,
            status: "checking block 4 of 16".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["operation"], "verify");
        assert_eq!(json["fraction"], 0.25);
    }

    #[test]
    fn drive_status_update_required_carries_counts() {
        let status = DriveStatus::UpdateRequired {
            adds: 3,
            deletes: 1,
            moves: 1,
        };
        let json = serde_json::to_value(status).unwrap();
        assert_eq!(json["state"], "update_required");
        assert_eq!(json["adds"], 3);

        let back: DriveStatus = serde_json::from_value(json).unwrap();
        assert_eq!(back, status);
    }

    #[test]
    fn summaries_default_to_zero() {
        let summary = UpdateSummary::default();
        assert_eq!(summary.files_added, 0);
        assert_eq!(summary.blocks_reclaimed, 0);
    }
}
