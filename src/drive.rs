//! Data drives: ground truth about one protected volume
//!
//! A [`DataDrive`] owns the file inventory for one volume — the Current set
//! plus pending Adds and Deletes — along with the free-range list for its
//! reclaimed parity blocks. It mediates every block-level read its peers
//! need during cross-drive XOR recomputation, and persists its inventory to
//! a metadata file in the parity directory.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::block::BLOCK_SIZE;
use crate::error::Result;
use crate::freespace::{FreeRange, release};
use crate::metadata;
use crate::record::FileRecord;
use crate::types::DriveStatus;

/// Extra headroom required beyond the predicted metadata size before an add
/// is allowed to grow the metadata file
const META_GROWTH_SLACK: u64 = 64 * 1024;

/// Outcome of resolving a block against a drive's inventory
#[derive(Debug)]
pub enum BlockData {
    /// The owning file's bytes were copied into the buffer (tail
    /// zero-padded for a short final block)
    Read(FileRecord),
    /// A file owns this block but is absent on disk; the buffer is untouched
    ///
    /// An expected, reportable condition — callers get the record so they
    /// can say which file is missing.
    Missing(FileRecord),
    /// No tracked file covers this block
    Unassigned,
}

/// Result of a completed scan
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Files found on disk but not in the inventory
    pub adds: usize,
    /// Inventory entries missing from disk or superseded by a changed file
    pub deletes: usize,
    /// Delete/add pairs that look like the same file at a new path
    pub moves: usize,
}

/// Streaming enumeration state for the initial full build
struct FileEnum {
    pending: Vec<FileRecord>,
    index: usize,
    current: Option<OpenEnumFile>,
    next_block: u32,
}

struct OpenEnumFile {
    record: FileRecord,
    file: File,
    hasher: md5::Context,
    blocks_emitted: u32,
}

/// One protected volume and its tracked state
pub struct DataDrive {
    root: PathBuf,
    metafile: String,
    meta_path: PathBuf,
    files: Vec<FileRecord>,
    adds: Vec<FileRecord>,
    deletes: Vec<FileRecord>,
    free_list: Vec<FreeRange>,
    status: DriveStatus,
    last_change: Option<DateTime<Utc>>,
    ignore: Vec<Regex>,
    cached: Option<(PathBuf, File)>,
    enumerator: Option<FileEnum>,
}

impl DataDrive {
    /// Open a drive rooted at `root`, loading any existing inventory from
    /// its metadata file under `parity_dir`
    pub fn new(
        root: &Path,
        metafile: &str,
        parity_dir: &Path,
        ignore: Vec<Regex>,
    ) -> Result<Self> {
        let meta_path = parity_dir.join(metafile);
        let files = if meta_path.exists() {
            metadata::read_records(&meta_path)?
        } else {
            Vec::new()
        };

        let mut drive = Self {
            root: root.to_path_buf(),
            metafile: metafile.to_string(),
            meta_path,
            files,
            adds: Vec::new(),
            deletes: Vec::new(),
            free_list: Vec::new(),
            status: DriveStatus::ScanRequired,
            last_change: None,
            ignore,
            cached: None,
            enumerator: None,
        };
        drive.rebuild_free_list();
        debug!(
            root = %drive.root.display(),
            files = drive.files.len(),
            "data drive opened"
        );
        Ok(drive)
    }

    /// Root directory of the protected volume
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Metadata file name inside the parity directory
    #[must_use]
    pub fn metafile(&self) -> &str {
        &self.metafile
    }

    /// Current drive status
    #[must_use]
    pub fn status(&self) -> DriveStatus {
        self.status
    }

    /// Tracked files (the Current set)
    #[must_use]
    pub fn files(&self) -> &[FileRecord] {
        &self.files
    }

    /// Pending adds from the last scan
    #[must_use]
    pub fn adds(&self) -> &[FileRecord] {
        &self.adds
    }

    /// Pending deletes from the last scan
    #[must_use]
    pub fn deletes(&self) -> &[FileRecord] {
        &self.deletes
    }

    /// Number of tracked files
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// When the inventory last changed, if ever (this session)
    #[must_use]
    pub fn last_change(&self) -> Option<DateTime<Utc>> {
        self.last_change
    }

    /// The free-range list of reclaimed parity blocks
    #[must_use]
    pub fn free_list(&self) -> &[FreeRange] {
        &self.free_list
    }

    /// Mutable free-range access for the allocation pass
    pub(crate) fn free_list_mut(&mut self) -> &mut Vec<FreeRange> {
        &mut self.free_list
    }

    /// One past the highest parity block any tracked file occupies
    #[must_use]
    pub fn max_block(&self) -> u32 {
        self.files.iter().map(FileRecord::end_block).max().unwrap_or(0)
    }

    /// Total parity blocks occupied by tracked files
    #[must_use]
    pub fn total_file_blocks(&self) -> u32 {
        self.files.iter().map(FileRecord::length_in_blocks).sum()
    }

    /// Blocks the drive will occupy once pending work is applied
    #[must_use]
    pub fn total_scan_blocks(&self) -> u32 {
        let current: u32 = self.total_file_blocks();
        let pending_out: u32 = self.deletes.iter().map(FileRecord::length_in_blocks).sum();
        let pending_in: u32 = self.adds.iter().map(FileRecord::length_in_blocks).sum();
        current.saturating_sub(pending_out) + pending_in
    }

    /// Predicted metadata file size once pending adds are applied
    #[must_use]
    pub fn predicted_meta_file_size(&self) -> u64 {
        metadata::predicted_size(self.files.iter().chain(self.adds.iter()))
    }

    // -------------------------------------------------------------------
    // Scanning
    // -------------------------------------------------------------------

    /// Walk the live filesystem and diff it against the inventory
    ///
    /// Repopulates the pending Adds/Deletes sets from scratch. A file whose
    /// length or mtime changed becomes a Delete(old)/Add(new) pair, with the
    /// current record flagged `modified`. Returns `None` when cancelled.
    ///
    /// # Errors
    ///
    /// Fails (and transitions to [`DriveStatus::AccessError`]) when the
    /// drive root itself cannot be read; individual unreadable entries are
    /// logged and skipped.
    pub fn scan(&mut self, cancel: &CancellationToken) -> Result<Option<ScanSummary>> {
        self.status = DriveStatus::Scanning;
        self.cached = None;
        self.adds.clear();
        self.deletes.clear();

        if let Err(e) = std::fs::read_dir(&self.root) {
            self.status = DriveStatus::AccessError;
            return Err(e.into());
        }

        // Relative path -> fresh on-disk state
        let mut on_disk: BTreeMap<PathBuf, FileRecord> = BTreeMap::new();
        for entry in WalkDir::new(&self.root).follow_links(false) {
            if cancel.is_cancelled() {
                self.status = DriveStatus::ScanRequired;
                return Ok(None);
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(root = %self.root.display(), error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let Some(rel_str) = rel.to_str() else {
                warn!(path = %rel.display(), "skipping non-UTF-8 file name");
                continue;
            };
            if self.ignore.iter().any(|re| re.is_match(rel_str)) {
                continue;
            }
            match FileRecord::from_disk(&self.root, rel) {
                Ok(record) => {
                    on_disk.insert(rel.to_path_buf(), record);
                }
                Err(e) => {
                    warn!(path = %rel.display(), error = %e, "skipping unreadable file");
                }
            }
        }

        // Diff against the current inventory
        for record in &mut self.files {
            if cancel.is_cancelled() {
                self.status = DriveStatus::ScanRequired;
                return Ok(None);
            }
            match on_disk.remove(&record.name) {
                Some(fresh) => {
                    if !record.matches(&fresh) {
                        // Changed in place: remove the stale contribution,
                        // re-add the new content. The old record is flagged
                        // modified so removal takes the full-recompute path.
                        record.modified = true;
                        self.deletes.push(record.clone());
                        self.adds.push(fresh);
                    }
                }
                None => {
                    self.deletes.push(record.clone());
                }
            }
        }
        // Whatever is left on disk is new
        self.adds.extend(on_disk.into_values());

        let moves = self.count_moves();
        let summary = ScanSummary {
            adds: self.adds.len(),
            deletes: self.deletes.len(),
            moves,
        };
        self.update_status();
        debug!(
            root = %self.root.display(),
            adds = summary.adds,
            deletes = summary.deletes,
            moves = summary.moves,
            "scan complete"
        );
        Ok(Some(summary))
    }

    /// Delete/add pairs that share file name, length and mtime
    fn count_moves(&self) -> usize {
        self.deletes
            .iter()
            .filter(|d| {
                self.adds.iter().any(|a| {
                    a.name.file_name() == d.name.file_name() && a.matches(d)
                })
            })
            .count()
    }

    /// Recompute the status from the pending sets (post-update bookkeeping)
    pub fn update_status(&mut self) {
        self.status = if self.adds.is_empty() && self.deletes.is_empty() {
            DriveStatus::UpToDate
        } else {
            DriveStatus::UpdateRequired {
                adds: self.adds.len(),
                deletes: self.deletes.len(),
                moves: self.count_moves(),
            }
        };
    }

    // -------------------------------------------------------------------
    // Block access
    // -------------------------------------------------------------------

    /// Resolve `block` against the inventory and read the owning file's
    /// bytes into `buf`, zero-padding a short final block
    pub fn read_block(&mut self, block: u32, buf: &mut [u8]) -> Result<BlockData> {
        debug_assert_eq!(buf.len(), BLOCK_SIZE);
        let Some(record) = self.files.iter().find(|r| r.contains_block(block)).cloned() else {
            return Ok(BlockData::Unassigned);
        };

        let full_path = record.full_path(&self.root);
        if !full_path.exists() {
            return Ok(BlockData::Missing(record));
        }

        let file = self.open_cached(&full_path)?;
        let offset = u64::from(block - record.start_block) * BLOCK_SIZE as u64;
        file.seek(SeekFrom::Start(offset))?;

        let mut filled = 0;
        while filled < BLOCK_SIZE {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf[filled..].fill(0);
        Ok(BlockData::Read(record))
    }

    /// The tracked file covering `block`, if any (Verify ownership reports)
    #[must_use]
    pub fn file_from_block(&self, block: u32) -> Option<&FileRecord> {
        self.files.iter().find(|r| r.contains_block(block))
    }

    fn open_cached(&mut self, path: &Path) -> Result<&mut File> {
        let stale = match &self.cached {
            Some((cached_path, _)) => cached_path != path,
            None => true,
        };
        if stale {
            let file = File::open(path)?;
            self.cached = Some((path.to_path_buf(), file));
        }
        self.cached
            .as_mut()
            .map(|(_, file)| file)
            .ok_or_else(|| crate::error::Error::Other("drive file cache empty".into()))
    }

    // -------------------------------------------------------------------
    // Inventory mutation
    // -------------------------------------------------------------------

    /// Pre-flight check that the metadata file can grow for one more entry
    ///
    /// Returns `false` (a soft, skip-this-file condition) when the parity
    /// volume does not have room for the grown metadata file.
    #[must_use]
    pub fn prepare_to_add(&self, record: &FileRecord) -> bool {
        let predicted =
            metadata::predicted_size(self.files.iter().chain(std::iter::once(record)));
        let Some(parent) = self.meta_path.parent() else {
            return false;
        };
        match crate::utils::get_available_space(parent) {
            Ok(available) => available >= predicted + META_GROWTH_SLACK,
            // can't tell — let the add proceed and fail honestly later
            Err(_) => true,
        }
    }

    /// Commit a record into the Current set and persist the inventory
    ///
    /// Drops any pending Add with the same name. Call only after the file's
    /// bytes are fully in parity.
    pub fn add_file(&mut self, record: FileRecord) -> Result<()> {
        self.adds.retain(|r| r.name != record.name);
        self.files.push(record);
        self.last_change = Some(Utc::now());
        self.save_metadata()
    }

    /// Remove a record from the Current set, reclaim its block range and
    /// persist the inventory
    ///
    /// An interior range becomes a free-list entry for later best-fit
    /// reuse. Removing the tail file instead shrinks the drive's extent,
    /// and any free ranges now at or past the new extent are dropped with
    /// it — free ranges always sit strictly below [`DataDrive::max_block`],
    /// so appends can never collide with them.
    pub fn remove_file(&mut self, record: &FileRecord) -> Result<()> {
        let was_tail = record.length > 0 && record.end_block() == self.max_block();
        self.files.retain(|r| r.name != record.name);
        if record.length > 0 {
            if was_tail {
                let new_max = self.max_block();
                self.free_list.retain(|r| r.start < new_max);
            } else {
                release(&mut self.free_list, record.start_block, record.length_in_blocks());
            }
        }
        self.cached = None;
        self.last_change = Some(Utc::now());
        self.save_metadata()
    }

    /// Drop a pending Delete after its parity contribution was removed
    /// (or after the file was undeleted)
    pub fn remove_pending_delete(&mut self, name: &Path) {
        self.deletes.retain(|r| r.name != name);
    }

    /// Drop a pending Add matching `name`, if one exists (Undelete cleanup)
    pub fn maybe_remove_add_by_name(&mut self, name: &Path) {
        self.adds.retain(|r| r.name != name);
    }

    fn save_metadata(&self) -> Result<()> {
        metadata::write_records(&self.meta_path, &self.files)
    }

    /// Discard in-memory state and reload the inventory from disk
    pub fn reset(&mut self) -> Result<()> {
        self.files = if self.meta_path.exists() {
            metadata::read_records(&self.meta_path)?
        } else {
            Vec::new()
        };
        self.adds.clear();
        self.deletes.clear();
        self.cached = None;
        self.enumerator = None;
        self.status = DriveStatus::ScanRequired;
        self.rebuild_free_list();
        Ok(())
    }

    /// Wipe all tracked state and delete the metadata file (Create teardown)
    pub fn clear(&mut self) -> Result<()> {
        self.files.clear();
        self.adds.clear();
        self.deletes.clear();
        self.free_list.clear();
        self.cached = None;
        self.enumerator = None;
        self.status = DriveStatus::ScanRequired;
        if self.meta_path.exists() {
            std::fs::remove_file(&self.meta_path)?;
        }
        Ok(())
    }

    /// Delete the metadata file without touching in-memory state
    /// (drive removal path)
    pub fn delete_metadata(&self) -> Result<()> {
        if self.meta_path.exists() {
            std::fs::remove_file(&self.meta_path)?;
        }
        Ok(())
    }

    /// Derive the free-range list from the gaps between tracked files
    fn rebuild_free_list(&mut self) {
        self.free_list.clear();
        let mut runs: Vec<(u32, u32)> = self
            .files
            .iter()
            .filter(|r| r.length > 0)
            .map(|r| (r.start_block, r.end_block()))
            .collect();
        runs.sort_unstable();
        let mut cursor = 0u32;
        for (start, end) in runs {
            if start > cursor {
                release(&mut self.free_list, cursor, start - cursor);
            }
            cursor = cursor.max(end);
        }
    }

    // -------------------------------------------------------------------
    // File enumeration for the initial full build
    // -------------------------------------------------------------------

    /// Begin streaming every pending add, assigning sequential start blocks
    pub fn begin_file_enum(&mut self) {
        self.enumerator = Some(FileEnum {
            pending: self.adds.clone(),
            index: 0,
            current: None,
            next_block: 0,
        });
    }

    /// Produce the next data block of the enumeration into `buf`
    ///
    /// Returns `false` once the drive has no blocks left (it simply finished
    /// enumerating earlier than its peers — not an error). As each file's
    /// final block is produced, its record (hash and placement now known) is
    /// committed to the Current set.
    ///
    /// # Errors
    ///
    /// Any I/O failure here is fatal to the initial build; the caller
    /// erases the parity set.
    pub fn enum_next_block(&mut self, buf: &mut [u8]) -> Result<bool> {
        debug_assert_eq!(buf.len(), BLOCK_SIZE);
        let Some(mut state) = self.enumerator.take() else {
            return Ok(false);
        };

        let produced = loop {
            if state.current.is_none() {
                let Some(record) = state.pending.get(state.index).cloned() else {
                    break false;
                };
                state.index += 1;
                if record.length == 0 {
                    // zero-length files carry the hash of empty content and
                    // occupy no blocks
                    let mut committed = record;
                    committed.start_block = 0;
                    committed.hash = md5::compute(b"").0;
                    self.adds.retain(|r| r.name != committed.name);
                    self.files.push(committed);
                    continue;
                }
                let file = File::open(record.full_path(&self.root))?;
                let mut record = record;
                record.start_block = state.next_block;
                state.current = Some(OpenEnumFile {
                    record,
                    file,
                    hasher: md5::Context::new(),
                    blocks_emitted: 0,
                });
            }

            let Some(open) = state.current.as_mut() else {
                break false;
            };
            let mut filled = 0;
            while filled < BLOCK_SIZE {
                let n = open.file.read(&mut buf[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            open.hasher.consume(&buf[..filled]);
            buf[filled..].fill(0);
            open.blocks_emitted += 1;
            state.next_block += 1;

            if open.blocks_emitted >= open.record.length_in_blocks() {
                let Some(done) = state.current.take() else {
                    break false;
                };
                let mut committed = done.record;
                committed.hash = done.hasher.compute().0;
                self.adds.retain(|r| r.name != committed.name);
                self.files.push(committed);
            }
            break true;
        };

        self.enumerator = Some(state);
        Ok(produced)
    }

    /// Finish the enumeration and persist the inventory
    pub fn end_file_enum(&mut self) -> Result<()> {
        self.enumerator = None;
        self.update_status();
        self.save_metadata()
    }
}
