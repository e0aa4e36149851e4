//! Concurrent per-drive content hash verification
//!
//! Drives hold disjoint file sets and a hash check never touches the block
//! store, so every selected drive runs as its own blocking task. Shared
//! progress lives in atomic counters that the coordinating loop polls (not
//! pushes) while it waits for the tasks to finish.
//!
//! Per-file problems (missing file, read error, hash mismatch) are reported
//! and skipped. An unexpected per-drive failure — the drive root itself
//! unreadable — is fatal: it cancels the in-flight sibling checks and is
//! surfaced to the caller once every task has unwound.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::block::BLOCK_SIZE;
use crate::error::{Error, Result};
use crate::record::FileRecord;
use crate::types::{Event, HashcheckSummary, Operation};

use super::ParitySet;

/// Read-only snapshot of one drive's inventory
struct DriveSnapshot {
    root: PathBuf,
    files: Vec<FileRecord>,
}

/// Progress counters shared across the per-drive tasks
#[derive(Default)]
struct Counters {
    files: AtomicU32,
    failures: AtomicU32,
    blocks: AtomicU64,
}

impl ParitySet {
    pub(super) async fn hashcheck_impl(
        &self,
        drive: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<HashcheckSummary> {
        // Snapshot under the lock; the check itself runs lock-free because
        // it only reads drive files, never the store or the inventories.
        let snapshots: Vec<DriveSnapshot> = self
            .with_engine(move |engine| {
                let selected: Vec<usize> = match drive {
                    Some(index) => {
                        if index >= engine.drives.len() {
                            return Err(Error::InvalidDrive(format!("no drive at index {index}")));
                        }
                        vec![index]
                    }
                    None => (0..engine.drives.len()).collect(),
                };
                Ok(selected
                    .into_iter()
                    .map(|i| DriveSnapshot {
                        root: engine.drives[i].root().to_path_buf(),
                        files: engine.drives[i].files().to_vec(),
                    })
                    .collect())
            })
            .await?;

        let total_blocks: u64 = snapshots
            .iter()
            .flat_map(|s| s.files.iter())
            .map(|r| u64::from(r.length_in_blocks()))
            .sum::<u64>()
            .max(1);

        let counters = Arc::new(Counters::default());
        let child = cancel.child_token();
        let event_tx = self.event_tx.clone();

        let mut handles = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
            let counters = Arc::clone(&counters);
            let token = child.clone();
            let event_tx = event_tx.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                hashcheck_drive(&snapshot, &counters, &event_tx, &token)
            }));
        }

        let mut join_all = std::pin::pin!(futures::future::join_all(handles));
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(100));
        let results = loop {
            tokio::select! {
                results = &mut join_all => break results,
                _ = ticker.tick() => {
                    let files = counters.files.load(Ordering::Relaxed);
                    let failures = counters.failures.load(Ordering::Relaxed);
                    let blocks = counters.blocks.load(Ordering::Relaxed);
                    event_tx
                        .send(Event::Progress {
                            operation: Operation::Hashcheck,
                            fraction: (blocks as f64 / total_blocks as f64).clamp(0.0, 1.0),
                            status: format!(
                                "Hash check in progress. Files checked: {files} Failures: {failures}"
                            ),
                        })
                        .ok();
                }
            }
        };

        // the first fatal error surfaces only after every unit unwinds
        let mut fatal: Option<Error> = None;
        for result in results {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => fatal = fatal.or(Some(e)),
                Err(e) => {
                    fatal = fatal.or(Some(Error::Other(format!("hash check task failed: {e}"))));
                }
            }
        }
        if let Some(e) = fatal {
            return Err(e);
        }

        let summary = HashcheckSummary {
            files_checked: counters.files.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
        };
        event_tx.send(Event::HashcheckComplete { summary }).ok();
        Ok(summary)
    }
}

/// Check every file on one drive against its recorded hash
fn hashcheck_drive(
    snapshot: &DriveSnapshot,
    counters: &Counters,
    event_tx: &tokio::sync::broadcast::Sender<Event>,
    cancel: &CancellationToken,
) -> Result<()> {
    let report = |message: String| {
        error!("{message}");
        event_tx.send(Event::Error { message }).ok();
    };

    // an unreadable root is not a per-file problem: stop the siblings and
    // surface it
    if let Err(e) = std::fs::read_dir(&snapshot.root) {
        cancel.cancel();
        return Err(Error::Io(std::io::Error::new(
            e.kind(),
            format!("hash check of {} failed: {e}", snapshot.root.display()),
        )));
    }

    info!("starting hash check for {}", snapshot.root.display());
    let mut buf = vec![0u8; BLOCK_SIZE];
    let mut drive_failures = 0u32;

    for record in &snapshot.files {
        counters.files.fetch_add(1, Ordering::Relaxed);
        if record.length == 0 {
            continue;
        }

        let full_path = record.full_path(&snapshot.root);
        if !full_path.exists() {
            report(format!(
                "{} not found. Skipping hash check for this file.",
                full_path.display()
            ));
            counters
                .blocks
                .fetch_add(u64::from(record.length_in_blocks()), Ordering::Relaxed);
            continue;
        }
        if record.modified {
            report(format!(
                "Warning: {} has been modified. Hash check will probably fail.",
                full_path.display()
            ));
        }

        let mut file = match File::open(&full_path) {
            Ok(file) => file,
            Err(e) => {
                report(format!("Error reading {}: {e}", full_path.display()));
                counters
                    .blocks
                    .fetch_add(u64::from(record.length_in_blocks()), Ordering::Relaxed);
                continue;
            }
        };

        let mut hasher = md5::Context::new();
        let mut read_failed = false;
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let mut filled = 0usize;
            while filled < BLOCK_SIZE {
                match file.read(&mut buf[filled..]) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) => {
                        report(format!("Error reading {}: {e}", full_path.display()));
                        read_failed = true;
                        break;
                    }
                }
            }
            if read_failed || filled == 0 {
                break;
            }
            hasher.consume(&buf[..filled]);
            counters.blocks.fetch_add(1, Ordering::Relaxed);
            if filled < BLOCK_SIZE {
                break;
            }
        }
        if read_failed {
            // progress will be a little off from here on; a mid-file read
            // error is rare enough to let it be
            continue;
        }

        if hasher.compute().0 != record.hash {
            report(format!("{} hash check failed", full_path.display()));
            event_tx
                .send(Event::HashcheckMismatch {
                    path: full_path.clone(),
                })
                .ok();
            counters.failures.fetch_add(1, Ordering::Relaxed);
            drive_failures += 1;
        }
    }

    if drive_failures == 0 {
        info!(
            "hash check of {} complete, no errors found",
            snapshot.root.display()
        );
    } else {
        error!(
            "hash check of {} complete, errors: {drive_failures}",
            snapshot.root.display()
        );
    }
    Ok(())
}
