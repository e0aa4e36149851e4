//! Parity set orchestration, split into focused submodules
//!
//! The [`ParitySet`] struct is the public surface; its operations are
//! organized by domain:
//! - [`update`] - Create and incremental update (deletes, adds, trim)
//! - [`verify`] - Parity verification and self-heal
//! - [`recover`] - Reconstruction (recover and undelete)
//! - [`hashcheck`] - Concurrent per-drive content hash verification
//!
//! Every mutating operation runs as one linear unit of work on a blocking
//! task, serialized by the engine mutex; Hashcheck fans out one task per
//! drive because those are provably independent (disjoint files, read-only).

mod hashcheck;
mod recover;
mod update;
mod verify;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{Config, DriveConfig};
use crate::drive::DataDrive;
use crate::error::{Error, Result};
use crate::store::ParityStore;
use crate::types::{DriveStatus, Event, HashcheckSummary, Operation, RecoverSummary, UpdateSummary, VerifySummary};
use crate::utils::smart_size;

/// Minimum interval between emitted progress events
const PROGRESS_MIN_DELTA: Duration = Duration::from_millis(100);

/// Snapshot of one drive's externally visible state
#[derive(Clone, Debug)]
pub struct DriveInfo {
    /// Root directory of the protected volume
    pub root: PathBuf,
    /// Metadata file name inside the parity directory
    pub metafile: String,
    /// Current status
    pub status: DriveStatus,
    /// Number of tracked files
    pub files: usize,
    /// Parity blocks occupied by tracked files
    pub blocks: u32,
    /// When the inventory last changed this session, if it did
    pub last_change: Option<DateTime<Utc>>,
}

/// The engine state: the block store plus every data drive
///
/// Owned behind a mutex held for the duration of each operation — that
/// mutex IS the serialization guarantee for mutating operations.
pub(crate) struct Engine {
    pub(crate) config: Arc<Config>,
    pub(crate) store: ParityStore,
    pub(crate) drives: Vec<DataDrive>,
    pub(crate) empty: bool,
    pub(crate) event_tx: tokio::sync::broadcast::Sender<Event>,
    /// Messages already reported this operation, to avoid repeating the
    /// same per-file complaint over and over
    pub(crate) reported: HashSet<String>,
    pub(crate) total_update_blocks: u64,
    pub(crate) current_update_blocks: u64,
    last_progress: Instant,
}

/// Orchestrator for one parity set (cloneable — state is Arc-wrapped)
#[derive(Clone)]
pub struct ParitySet {
    engine: Arc<Mutex<Engine>>,
    event_tx: tokio::sync::broadcast::Sender<Event>,
    config: Arc<Config>,
}

impl ParitySet {
    /// Open a parity set from its configuration
    ///
    /// Creates the parity and temp directories if needed, opens the block
    /// store, and loads each drive's inventory from its metadata file. A
    /// set with no metadata files on disk starts empty: the first update
    /// builds parity from scratch.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        tokio::fs::create_dir_all(&config.parity_dir).await.map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!(
                    "Failed to create parity directory '{}': {}",
                    config.parity_dir.display(),
                    e
                ),
            ))
        })?;
        tokio::fs::create_dir_all(&config.temp_dir).await.map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!(
                    "Failed to create temp directory '{}': {}",
                    config.temp_dir.display(),
                    e
                ),
            ))
        })?;

        let (event_tx, _rx) = tokio::sync::broadcast::channel(config.event_capacity.max(1));
        let config = Arc::new(config);

        let engine = {
            let config = Arc::clone(&config);
            let event_tx = event_tx.clone();
            tokio::task::spawn_blocking(move || -> Result<Engine> {
                let store = ParityStore::open(&config.parity_dir)?;
                let ignore = config.compiled_ignore();
                let mut drives = Vec::with_capacity(config.drives.len());
                let mut empty = true;
                for drive_config in &config.drives {
                    if config.parity_dir.join(&drive_config.metafile).exists() {
                        empty = false;
                    }
                    drives.push(DataDrive::new(
                        &drive_config.path,
                        &drive_config.metafile,
                        &config.parity_dir,
                        ignore.clone(),
                    )?);
                }
                info!(
                    drives = drives.len(),
                    empty,
                    parity_dir = %config.parity_dir.display(),
                    "parity set opened"
                );
                Ok(Engine {
                    config,
                    store,
                    drives,
                    empty,
                    event_tx,
                    reported: HashSet::new(),
                    total_update_blocks: 0,
                    current_update_blocks: 0,
                    last_progress: Instant::now()
                        .checked_sub(PROGRESS_MIN_DELTA)
                        .unwrap_or_else(Instant::now),
                })
            })
            .await
            .map_err(|e| Error::Other(format!("engine startup task failed: {e}")))??
        };

        Ok(Self {
            engine: Arc::new(Mutex::new(engine)),
            event_tx,
            config,
        })
    }

    /// Subscribe to engine events
    ///
    /// Multiple subscribers are supported; each receives all events
    /// independently. A subscriber lagging behind by more than the
    /// configured capacity starts receiving `RecvError::Lagged`.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// The configuration this set was opened with
    pub fn get_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// Run a closure against the locked engine on a blocking task
    async fn with_engine<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Engine) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        tokio::task::spawn_blocking(move || {
            let mut guard = engine
                .lock()
                .map_err(|_| Error::Other("engine lock poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| Error::Other(format!("engine task failed: {e}")))?
    }

    /// Whether no parity data has been generated yet for this set
    pub async fn is_empty(&self) -> Result<bool> {
        self.with_engine(|engine| Ok(engine.empty)).await
    }

    /// Snapshot every drive's externally visible state
    pub async fn drives(&self) -> Result<Vec<DriveInfo>> {
        self.with_engine(|engine| {
            Ok(engine
                .drives
                .iter()
                .map(|d| DriveInfo {
                    root: d.root().to_path_buf(),
                    metafile: d.metafile().to_string(),
                    status: d.status(),
                    files: d.file_count(),
                    blocks: d.total_file_blocks(),
                    last_change: d.last_change(),
                })
                .collect())
        })
        .await
    }

    /// Latest inventory change across all drives this session
    pub async fn last_change(&self) -> Result<Option<DateTime<Utc>>> {
        self.with_engine(|engine| {
            Ok(engine.drives.iter().filter_map(DataDrive::last_change).max())
        })
        .await
    }

    /// Scan every drive, diffing on-disk reality against the inventories
    ///
    /// Returns `false` when the pass was cancelled before every drive was
    /// scanned.
    pub async fn scan_all(&self, cancel: &CancellationToken) -> Result<bool> {
        let cancel = cancel.clone();
        self.with_engine(move |engine| Ok(engine.scan_all(&cancel))).await
    }

    /// Bring parity up to date with the drives
    ///
    /// Builds parity from scratch when the set is empty, otherwise applies
    /// pending deletes (first) and adds, then trims reclaimed tail blocks.
    /// With `scan_first`, every drive is rescanned before the pass.
    pub async fn update(&self, scan_first: bool, cancel: &CancellationToken) -> Result<UpdateSummary> {
        let cancel = cancel.clone();
        self.with_engine(move |engine| engine.update(scan_first, &cancel)).await
    }

    /// Verify every parity block against recomputed values, repairing
    /// mismatches whose contributing files are all unmodified
    pub async fn verify(&self, cancel: &CancellationToken) -> Result<VerifySummary> {
        let cancel = cancel.clone();
        self.with_engine(move |engine| engine.verify(&cancel)).await
    }

    /// Reconstruct every tracked file of one drive into `dest`
    ///
    /// The drive being recovered is never read; each block is rebuilt from
    /// stored parity and the other drives.
    pub async fn recover(
        &self,
        drive: usize,
        dest: impl Into<PathBuf>,
        cancel: &CancellationToken,
    ) -> Result<RecoverSummary> {
        let cancel = cancel.clone();
        let dest = dest.into();
        self.with_engine(move |engine| engine.recover(drive, &dest, &cancel)).await
    }

    /// Reconstruct selected pending-delete files back onto their drive
    ///
    /// `paths` may name files by full path or by path relative to the
    /// drive root. Successfully restored files leave the pending-Deletes
    /// set (and drop any matching pending Add).
    pub async fn undelete(
        &self,
        drive: usize,
        paths: Vec<PathBuf>,
        cancel: &CancellationToken,
    ) -> Result<RecoverSummary> {
        let cancel = cancel.clone();
        self.with_engine(move |engine| engine.undelete(drive, &paths, &cancel)).await
    }

    /// Remove every tracked file of one drive from parity
    /// (drive decommission path)
    pub async fn remove_all_files(
        &self,
        drive: usize,
        cancel: &CancellationToken,
    ) -> Result<UpdateSummary> {
        let cancel = cancel.clone();
        self.with_engine(move |engine| engine.remove_all_files(drive, &cancel)).await
    }

    /// Add a new drive to the parity set
    ///
    /// Picks the first unused `files{N}.dat` metadata name. The engine does
    /// not persist configuration; the returned [`DriveConfig`] is what the
    /// embedding application should add to its stored drive list.
    pub async fn add_drive(&self, path: impl Into<PathBuf>) -> Result<DriveConfig> {
        let path = path.into();
        self.with_engine(move |engine| engine.add_drive(&path)).await
    }

    /// Remove a drive that no longer tracks any files
    ///
    /// # Errors
    ///
    /// [`Error::DriveNotEmpty`] when files are still tracked — remove them
    /// first (see [`ParitySet::remove_all_files`]).
    pub async fn remove_empty_drive(&self, drive: usize) -> Result<()> {
        self.with_engine(move |engine| engine.remove_empty_drive(drive)).await
    }

    /// Pre-flight free-space check for an initial build
    ///
    /// Returns `false` when the parity volume clearly lacks room for the
    /// initial parity data plus the predicted metadata files.
    pub async fn check_available_space_for_update(&self) -> Result<bool> {
        self.with_engine(|engine| Ok(engine.check_available_space_for_update())).await
    }

    /// Erase the parity set: delete all parity data and drive inventories
    pub async fn erase(&self) -> Result<()> {
        self.with_engine(|engine| engine.erase()).await
    }

    /// Reload every drive's inventory from its metadata file, discarding
    /// in-memory scan state
    pub async fn reset(&self) -> Result<()> {
        self.with_engine(|engine| {
            for drive in &mut engine.drives {
                drive.reset()?;
            }
            Ok(())
        })
        .await
    }

    /// Close parity file handles (application shutdown path)
    pub async fn close(&self) {
        // shutdown best-effort; a poisoned lock just means nothing to close
        let _ = self.with_engine(|engine| {
            engine.store.close();
            Ok(())
        })
        .await;
    }

    /// Check every drive's file hashes concurrently
    ///
    /// See [`hashcheck`] for the fan-out details; with `drive` set only
    /// that drive is checked.
    pub async fn hashcheck(
        &self,
        drive: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<HashcheckSummary> {
        self.hashcheck_impl(drive, cancel).await
    }
}

impl Engine {
    /// Send an event to all subscribers (dropped silently with none)
    pub(crate) fn emit(&self, event: Event) {
        self.event_tx.send(event).ok();
    }

    /// Log and report a non-fatal, user-actionable problem
    pub(crate) fn report_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        error!("{message}");
        self.emit(Event::Error { message });
    }

    /// Report a problem at most once per operation
    pub(crate) fn report_error_once(&mut self, message: String) {
        if self.reported.insert(message.clone()) {
            self.report_error(message);
        }
    }

    /// Emit a throttled progress event
    pub(crate) fn progress(&mut self, operation: Operation, fraction: f64, status: impl Into<String>) {
        let now = Instant::now();
        if now.duration_since(self.last_progress) < PROGRESS_MIN_DELTA {
            return;
        }
        self.last_progress = now;
        self.emit(Event::Progress {
            operation,
            fraction: fraction.clamp(0.0, 1.0),
            status: status.into(),
        });
    }

    /// Highest used parity block across all drives (exclusive)
    pub(crate) fn max_parity_block(&self) -> u32 {
        self.drives.iter().map(DataDrive::max_block).max().unwrap_or(0)
    }

    /// Erase a previously created parity set
    pub(crate) fn erase(&mut self) -> Result<()> {
        self.store.close();
        self.store.delete_all()?;
        for drive in &mut self.drives {
            drive.clear()?;
        }
        self.empty = true;
        Ok(())
    }

    fn add_drive(&mut self, path: &Path) -> Result<DriveConfig> {
        if self.drives.iter().any(|d| d.root() == path) {
            return Err(Error::InvalidDrive(format!(
                "{} is already part of this parity set",
                path.display()
            )));
        }

        let metafile = self.find_available_metafile_name();

        // A stray file with this name belongs to no configured drive; keep
        // it out of the way rather than silently absorbing it.
        let full_path = self.config.parity_dir.join(&metafile);
        if full_path.exists() {
            std::fs::rename(&full_path, full_path.with_extension("old"))?;
        }

        let drive = DataDrive::new(
            path,
            &metafile,
            &self.config.parity_dir,
            self.config.compiled_ignore(),
        )?;
        self.drives.push(drive);
        info!(path = %path.display(), metafile, "drive added to parity set");

        Ok(DriveConfig::new(path, metafile))
    }

    fn find_available_metafile_name(&self) -> String {
        let mut file_no = 0u32;
        loop {
            file_no += 1;
            let name = format!("files{file_no}.dat");
            if !self.drives.iter().any(|d| d.metafile() == name) {
                return name;
            }
        }
    }

    fn remove_empty_drive(&mut self, index: usize) -> Result<()> {
        let drive = self.drives.get(index).ok_or_else(|| {
            Error::InvalidDrive(format!("no drive at index {index}"))
        })?;
        if drive.file_count() > 0 {
            return Err(Error::DriveNotEmpty {
                path: drive.root().to_path_buf(),
                files: drive.file_count(),
            });
        }
        drive.delete_metadata()?;
        let removed = self.drives.remove(index);
        info!(path = %removed.root().display(), "drive removed from parity set");
        Ok(())
    }

    fn check_available_space_for_update(&self) -> bool {
        let available = self.store.free_space();
        match available {
            Some(bytes) => {
                info!("free space on parity drive: {} ({bytes} bytes)", smart_size(bytes))
            }
            None => error!("could not determine free space available on parity drive"),
        }
        if !self.empty {
            return true;
        }

        let mut required_blocks: u64 = self
            .drives
            .iter()
            .map(|d| u64::from(d.total_scan_blocks()))
            .max()
            .unwrap_or(0);
        // include the metadata files, rounded up to whole blocks apiece for
        // a little wiggle room
        for drive in &self.drives {
            required_blocks += drive
                .predicted_meta_file_size()
                .div_ceil(crate::block::BLOCK_SIZE as u64);
        }
        let required = required_blocks * crate::block::BLOCK_SIZE as u64;
        info!(
            "space required for initial update: {} ({required} bytes)",
            smart_size(required)
        );
        match available {
            Some(bytes) => bytes >= required,
            None => true,
        }
    }
}
