//! # parity-snap
//!
//! Snapshot parity protection engine for independent data drives.
//!
//! A parity set protects any number of independently-sized volumes with a
//! single dedicated parity volume holding the running XOR of same-indexed
//! fixed-size blocks from every drive. Losing any one drive's data for a
//! block is recoverable: the missing bytes are the XOR of the stored parity
//! with the remaining drives.
//!
//! ## Design Philosophy
//!
//! parity-snap is designed to be:
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - Consumers subscribe to progress and error events,
//!   no polling required
//! - **Failure-tolerant** - Per-file problems are reported and skipped;
//!   an interrupted update resumes where it left off on the next pass
//! - **Cancellable** - Every operation takes a cancellation token checked
//!   at block granularity
//!
//! ## Quick Start
//!
//! ```no_run
//! use parity_snap::{Config, DriveConfig, ParitySet};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config {
//!         drives: vec![
//!             DriveConfig::new("/mnt/photos", "files1.dat"),
//!             DriveConfig::new("/mnt/music", "files2.dat"),
//!         ],
//!         parity_dir: "/mnt/parity".into(),
//!         temp_dir: "/tmp/parity-snap".into(),
//!         ..Default::default()
//!     };
//!
//!     let set = ParitySet::new(config).await?;
//!
//!     // Subscribe to events
//!     let mut events = set.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     // Scan the drives and bring parity up to date
//!     let cancel = CancellationToken::new();
//!     let summary = set.update(true, &cancel).await?;
//!     println!("added {} file(s)", summary.files_added);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Parity block constants and the XOR accumulator
pub mod block;
/// Change transactions with background flush
pub mod change;
/// Configuration types
pub mod config;
/// Data drives: inventories, scanning and block reads
pub mod drive;
/// Error types
pub mod error;
/// Free-range tracking and best-fit allocation
pub mod freespace;
/// Drive metadata file codec
pub mod metadata;
/// Tracked-file records
pub mod record;
/// Parity set orchestration
pub mod set;
/// Parity block store
pub mod store;
/// Core types and events
pub mod types;
/// Disk space and size formatting utilities
pub mod utils;

// Re-export commonly used types
pub use block::{BLOCK_SIZE, ParityBlock};
pub use change::ParityChange;
pub use config::{Config, DriveConfig};
pub use drive::{BlockData, DataDrive, ScanSummary};
pub use error::{Error, MetadataError, Result};
pub use freespace::FreeRange;
pub use record::FileRecord;
pub use set::{DriveInfo, ParitySet};
pub use store::ParityStore;
pub use types::{
    DriveStatus, Event, FileHash, HashcheckSummary, Operation, RecoverSummary, UpdateSummary,
    VerifySummary,
};
