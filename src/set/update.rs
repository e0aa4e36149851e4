//! Create and incremental update passes
//!
//! The update entry point decides between the initial full build (no parity
//! data exists yet) and the incremental path: all pending deletes across
//! every drive, then all pending adds, then a trim of any reclaimed tail
//! blocks. Deletes run first on purpose — they maximize the free ranges
//! available to the best-fit allocation pass and keep peak space lower.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::block::{BLOCK_SIZE, ParityBlock};
use crate::change::ParityChange;
use crate::drive::BlockData;
use crate::error::{Error, Result};
use crate::freespace;
use crate::record::FileRecord;
use crate::types::{Event, Operation, UpdateSummary};
use crate::utils::smart_size;

use super::Engine;

/// Share of a file's progress attributed to the staging flush
pub(super) const TEMP_FLUSH_FRACTION: f64 = 0.2;

impl Engine {
    /// Bring parity up to date (Create when the set is still empty)
    pub(crate) fn update(
        &mut self,
        scan_first: bool,
        cancel: &CancellationToken,
    ) -> Result<UpdateSummary> {
        self.reported.clear();
        if self.empty {
            info!("no existing parity data found, creating new snapshot");
            if scan_first && !self.scan_all(cancel) {
                return Ok(UpdateSummary::default());
            }
            let result = self.create(cancel);
            self.store.close();
            return result;
        }

        let result = self.update_inner(scan_first, cancel);
        for drive in &mut self.drives {
            drive.update_status();
        }
        self.store.close();
        result
    }

    fn update_inner(&mut self, scan_first: bool, cancel: &CancellationToken) -> Result<UpdateSummary> {
        let mut summary = UpdateSummary::default();

        if scan_first && !self.scan_all(cancel) {
            return Ok(summary);
        }

        self.current_update_blocks = 0;
        self.total_update_blocks = self
            .drives
            .iter()
            .map(|d| {
                d.adds()
                    .iter()
                    .chain(d.deletes().iter())
                    .map(|r| u64::from(r.length_in_blocks()))
                    .sum::<u64>()
            })
            .sum();

        // deletes before adds
        let started = Instant::now();
        for di in 0..self.drives.len() {
            let delete_list = self.drives[di].deletes().to_vec();
            for record in delete_list {
                if self.remove_from_parity(di, &record, Operation::Update, cancel) {
                    summary.files_removed += 1;
                    summary.bytes_removed += record.length;
                    self.drives[di].remove_pending_delete(&record.name);
                }
                if cancel.is_cancelled() {
                    return Ok(summary);
                }
            }
            self.drives[di].update_status();
        }
        if summary.files_removed > 0 {
            info!(
                "{} file(s) ({}) removed in {:.2} sec",
                summary.files_removed,
                smart_size(summary.bytes_removed),
                started.elapsed().as_secs_f64()
            );
        }

        let started = Instant::now();
        for di in 0..self.drives.len() {
            let add_list = self.drives[di].adds().to_vec();
            for record in add_list {
                let length = record.length;
                if self.add_to_parity(di, record, cancel) {
                    summary.files_added += 1;
                    summary.bytes_added += length;
                }
                if cancel.is_cancelled() {
                    return Ok(summary);
                }
            }
            self.drives[di].update_status();
        }
        if summary.files_added > 0 {
            info!(
                "{} file(s) ({}) added in {:.2} sec",
                summary.files_added,
                smart_size(summary.bytes_added),
                started.elapsed().as_secs_f64()
            );
        }

        // reclaim unused parity space if files were deleted off the end
        let max_parity_block = self.max_parity_block();
        if max_parity_block < self.store.max_block() {
            let blocks = self.store.max_block() - max_parity_block;
            info!("reclaiming {blocks} blocks of unused parity space");
            self.store.trim(max_parity_block)?;
            info!(
                "{} freed on parity drive",
                smart_size(u64::from(blocks) * BLOCK_SIZE as u64)
            );
            summary.blocks_reclaimed = blocks;
            self.emit(Event::ParityTrimmed { blocks });
        }

        self.emit(Event::UpdateComplete { summary });
        Ok(summary)
    }

    /// Scan every drive, reporting per-drive results through the event
    /// channel; a drive whose root is unreadable is reported and skipped.
    /// Returns `false` when the pass was cancelled mid-scan.
    pub(crate) fn scan_all(&mut self, cancel: &CancellationToken) -> bool {
        for di in 0..self.drives.len() {
            let root = self.drives[di].root().to_path_buf();
            self.emit(Event::ScanStarted { drive: root.clone() });
            match self.drives[di].scan(cancel) {
                Ok(Some(summary)) => self.emit(Event::ScanComplete {
                    drive: root,
                    adds: summary.adds,
                    deletes: summary.deletes,
                    moves: summary.moves,
                }),
                Ok(None) => return false, // cancelled
                Err(e) => {
                    self.report_error(format!("Error scanning {}: {e}", root.display()));
                }
            }
        }
        true
    }

    // ---------------------------------------------------------------
    // Initial full build
    // ---------------------------------------------------------------

    /// Build parity from scratch, round-robin across all drives
    ///
    /// A partial initial build can never be trusted: cancellation or any
    /// unexpected I/O error erases the whole set.
    fn create(&mut self, cancel: &CancellationToken) -> Result<UpdateSummary> {
        let started = Instant::now();

        let mut total_blocks = 1u32; // no divide-by-zero on empty drives
        for drive in &mut self.drives {
            drive.begin_file_enum();
            total_blocks = total_blocks.max(drive.total_scan_blocks());
        }

        match self.create_blocks(total_blocks, cancel) {
            Err(e) => {
                error!("fatal error on initial update: {e}");
                if let Err(erase_err) = self.erase() {
                    error!("additionally failed to erase partial parity: {erase_err}");
                }
                Err(Error::CreateFailed(e.to_string()))
            }
            Ok(true) => {
                // cancelled: a half-built volume cannot be salvaged
                error!("initial update cancelled, resetting parity to empty");
                self.erase()?;
                Ok(UpdateSummary::default())
            }
            Ok(false) => {
                for drive in &mut self.drives {
                    drive.end_file_enum()?;
                }
                self.empty = false;
                let summary = UpdateSummary {
                    files_added: self.drives.iter().map(|d| d.file_count() as u32).sum(),
                    bytes_added: self
                        .drives
                        .iter()
                        .flat_map(|d| d.files().iter())
                        .map(|r| r.length)
                        .sum(),
                    ..Default::default()
                };
                info!(
                    "initial parity build complete: {} file(s), {} blocks, {:.2} sec",
                    summary.files_added,
                    self.store.max_block(),
                    started.elapsed().as_secs_f64()
                );
                self.emit(Event::UpdateComplete { summary });
                Ok(summary)
            }
        }
    }

    /// Round-robin block loop; returns `Ok(true)` when cancelled
    fn create_blocks(&mut self, total_blocks: u32, cancel: &CancellationToken) -> Result<bool> {
        let mut parity_block = ParityBlock::new();
        let mut data_buf = vec![0u8; BLOCK_SIZE];
        let mut block = 0u32;

        loop {
            let mut any = false;
            for di in 0..self.drives.len() {
                // the first drive with data seeds the block, the rest XOR in;
                // a drive that ran out of files simply contributes nothing
                if !any {
                    if self.drives[di].enum_next_block(parity_block.data_mut())? {
                        any = true;
                    }
                } else if self.drives[di].enum_next_block(&mut data_buf)? {
                    parity_block.add(&data_buf);
                }
            }
            if !any {
                return Ok(false);
            }
            parity_block.write(&mut self.store, block)?;
            self.progress(
                Operation::Create,
                f64::from(block) / f64::from(total_blocks),
                "Building parity snapshot",
            );
            block += 1;

            if cancel.is_cancelled() {
                return Ok(true);
            }
        }
    }

    // ---------------------------------------------------------------
    // Incremental add
    // ---------------------------------------------------------------

    fn add_to_parity(&mut self, di: usize, mut record: FileRecord, cancel: &CancellationToken) -> bool {
        let root = self.drives[di].root().to_path_buf();
        let full_path = record.full_path(&root);

        // time has passed since the scan; re-validate before committing anything
        if !record.refresh_attributes(&root) {
            error!("{} no longer exists", full_path.display());
            return false;
        }

        if !self.drives[di].prepare_to_add(&record) {
            let metafile = self.drives[di].metafile().to_string();
            self.report_error(format!(
                "Unable to expand {metafile} to add {}. File will be skipped this update.",
                full_path.display()
            ));
            return false;
        }

        if record.length > 0 {
            let blocks = record.length_in_blocks();
            let reused = freespace::allocate(self.drives[di].free_list_mut(), blocks);
            let start_block = reused.unwrap_or_else(|| self.drives[di].max_block());
            let end_block = start_block + blocks;

            // additional physical space only matters when the placement
            // grows the parity files
            let required = if end_block > self.store.max_block() {
                u64::from(end_block - self.store.max_block()) * BLOCK_SIZE as u64
            } else {
                0
            };
            if let Some(available) = self.store.free_space()
                && available < required
            {
                self.report_error(format!(
                    "Insufficient space available on {} to process {}. File will be \
                     skipped this update. (Required: {} Available: {})",
                    self.config.parity_dir.display(),
                    full_path.display(),
                    smart_size(required),
                    smart_size(available)
                ));
                self.rollback_allocation(di, reused, blocks);
                return false;
            }

            record.start_block = start_block;
            info!(
                "adding {} to blocks {}..{}",
                full_path.display(),
                start_block,
                end_block - 1
            );

            if end_block > self.store.max_block() {
                info!(
                    "extending parity by {} blocks for add",
                    end_block - self.store.max_block()
                );
                if !self.extend_parity(end_block, cancel) {
                    if !cancel.is_cancelled() {
                        self.report_error(format!(
                            "Unable to extend parity space for {}. File will be skipped this update.",
                            full_path.display()
                        ));
                    }
                    self.rollback_allocation(di, reused, blocks);
                    return false;
                }
            }

            if !self.xor_file_with_parity(di, &mut record, false, Operation::Update, cancel) {
                if !cancel.is_cancelled() {
                    error!(
                        "could not add {} to parity, file will be skipped",
                        full_path.display()
                    );
                }
                self.rollback_allocation(di, reused, blocks);
                return false;
            }
        } else {
            record.hash = md5::compute(b"").0;
        }

        let blocks = record.length_in_blocks();
        if let Err(e) = self.drives[di].add_file(record) {
            self.report_error(format!(
                "Error saving inventory for {}: {e}",
                root.display()
            ));
            return false;
        }
        self.emit(Event::FileAdded {
            path: full_path,
            blocks,
        });
        true
    }

    /// Put a consumed free range back after a failed add
    fn rollback_allocation(&mut self, di: usize, reused: Option<u32>, blocks: u32) {
        if let Some(start) = reused {
            freespace::release(self.drives[di].free_list_mut(), start, blocks);
        }
    }

    /// Zero-fill the store up to (but not including) `to_block`
    ///
    /// Returns `false` on failure — most likely out of disk space — or
    /// cancellation.
    fn extend_parity(&mut self, to_block: u32, cancel: &CancellationToken) -> bool {
        let zeros = vec![0u8; BLOCK_SIZE];
        while self.store.max_block() < to_block {
            let next = self.store.max_block();
            if let Err(e) = self.store.write_block(next, &zeros) {
                error!("failed to extend parity to block {to_block}: {e}");
                return false;
            }
            if cancel.is_cancelled() {
                return false;
            }
        }
        true
    }

    // ---------------------------------------------------------------
    // Incremental remove
    // ---------------------------------------------------------------

    /// Remove one file's contribution from parity
    ///
    /// The fast path re-XORs the file's own unmodified bytes (self-inverse,
    /// `file_blocks` reads); the fallback recomputes each block from every
    /// other drive (`drives x file_blocks` reads). The asymmetry is why the
    /// fast path is always attempted first.
    pub(super) fn remove_from_parity(
        &mut self,
        di: usize,
        record: &FileRecord,
        operation: Operation,
        cancel: &CancellationToken,
    ) -> bool {
        if record.length > 0 {
            let root = self.drives[di].root().to_path_buf();
            let full_path = record.full_path(&root);
            let start_block = record.start_block;
            let blocks = record.length_in_blocks();
            info!(
                "removing {} from blocks {}..{}",
                full_path.display(),
                start_block,
                start_block + blocks - 1
            );

            if !record.modified {
                let mut fast = record.clone();
                if self.xor_file_with_parity(di, &mut fast, true, operation, cancel) {
                    return self.commit_remove(di, record);
                }
                if cancel.is_cancelled() {
                    return false;
                }
                // fall through to the full recompute
            }

            let mut change = match ParityChange::new(&self.config.temp_dir, start_block, blocks) {
                Ok(change) => change,
                Err(e) => {
                    self.report_error(e.to_string());
                    return false;
                }
            };
            let mut buf = vec![0u8; BLOCK_SIZE];
            for block in start_block..start_block + blocks {
                if let Err(e) = change.reset(&mut self.store, false) {
                    self.report_error(e.to_string());
                    return false;
                }
                for dj in 0..self.drives.len() {
                    if dj == di {
                        continue;
                    }
                    // a sibling's file may itself be pending delete; a
                    // missing file just contributes nothing
                    match self.drives[dj].read_block(block, &mut buf) {
                        Ok(BlockData::Read(_)) => change.add(&buf),
                        Ok(_) => {}
                        Err(e) => {
                            self.report_error(e.to_string());
                            return false;
                        }
                    }
                }
                if let Err(e) = change.write() {
                    self.report_error(e.to_string());
                    return false;
                }
                self.current_update_blocks += 1;
                let overall = self.overall_update_fraction();
                let file_fraction =
                    (1.0 - TEMP_FLUSH_FRACTION) * f64::from(block - start_block + 1) / f64::from(blocks);
                self.progress(
                    operation,
                    overall,
                    format!("Removing {} ({:.0}%)", full_path.display(), file_fraction * 100.0),
                );
                if cancel.is_cancelled() {
                    return false;
                }
            }
            if let Err(e) = self.flush_change(change, operation, &full_path, "Removing") {
                self.report_error(e.to_string());
                return false;
            }
        }
        self.commit_remove(di, record)
    }

    fn commit_remove(&mut self, di: usize, record: &FileRecord) -> bool {
        let path = record.full_path(self.drives[di].root());
        match self.drives[di].remove_file(record) {
            Ok(()) => {
                self.emit(Event::FileRemoved { path });
                true
            }
            Err(e) => {
                self.report_error(format!(
                    "Error saving inventory after removing {}: {e}",
                    path.display()
                ));
                false
            }
        }
    }

    /// Remove every tracked file on one drive (decommission path)
    pub(crate) fn remove_all_files(
        &mut self,
        di: usize,
        cancel: &CancellationToken,
    ) -> Result<UpdateSummary> {
        if di >= self.drives.len() {
            return Err(Error::InvalidDrive(format!("no drive at index {di}")));
        }
        self.reported.clear();

        let files = self.drives[di].files().to_vec();
        self.total_update_blocks = files.iter().map(|r| u64::from(r.length_in_blocks())).sum();
        self.current_update_blocks = 0;

        let mut summary = UpdateSummary::default();
        for record in files {
            if self.remove_from_parity(di, &record, Operation::RemoveAll, cancel) {
                summary.files_removed += 1;
                summary.bytes_removed += record.length;
            }
            if cancel.is_cancelled() {
                break;
            }
        }
        self.drives[di].update_status();
        self.store.close();
        Ok(summary)
    }

    // ---------------------------------------------------------------
    // Shared XOR pass
    // ---------------------------------------------------------------

    /// XOR a file's bytes into its parity range
    ///
    /// Adds the file to parity, or — because XOR is self-inverse — removes
    /// an unmodified file that is already there. With `check_hash` the
    /// accumulated hash must match the record before the change is
    /// committed (remove); otherwise the record's hash is updated (add).
    pub(super) fn xor_file_with_parity(
        &mut self,
        di: usize,
        record: &mut FileRecord,
        check_hash: bool,
        operation: Operation,
        cancel: &CancellationToken,
    ) -> bool {
        let root = self.drives[di].root().to_path_buf();
        let full_path = record.full_path(&root);
        if !full_path.exists() {
            return false;
        }
        if record.length == 0 {
            return true;
        }

        let blocks = record.length_in_blocks();
        let mut change = match ParityChange::new(&self.config.temp_dir, record.start_block, blocks) {
            Ok(change) => change,
            Err(e) => {
                self.report_error(e.to_string());
                return false;
            }
        };

        let mut file = match File::open(&full_path) {
            Ok(file) => file,
            Err(e) => {
                self.report_error(format!("Error opening {}: {e}", full_path.display()));
                return false;
            }
        };

        let verb = if check_hash { "Removing" } else { "Adding" };
        let mut hasher = md5::Context::new();
        let mut buf = vec![0u8; BLOCK_SIZE];

        for b in 0..blocks {
            let mut filled = 0usize;
            while filled < BLOCK_SIZE {
                match file.read(&mut buf[filled..]) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) => {
                        self.report_error(format!("Error reading {}: {e}", full_path.display()));
                        return false;
                    }
                }
            }
            hasher.consume(&buf[..filled]);
            buf[filled..].fill(0);

            let staged = change.reset(&mut self.store, true).and_then(|()| {
                change.add(&buf);
                change.write()
            });
            if let Err(e) = staged {
                self.report_error(e.to_string());
                return false;
            }

            self.current_update_blocks += 1;
            let overall = self.overall_update_fraction();
            let file_fraction = (1.0 - TEMP_FLUSH_FRACTION) * f64::from(b + 1) / f64::from(blocks);
            self.progress(
                operation,
                overall,
                format!("{verb} {} ({:.0}%)", full_path.display(), file_fraction * 100.0),
            );
            if cancel.is_cancelled() {
                return false;
            }
        }

        let digest = hasher.compute().0;
        if check_hash {
            if digest != record.hash {
                self.report_error(format!(
                    "Tried to remove {} but its content no longer matches the recorded \
                     hash; falling back to a full parity recompute.",
                    full_path.display()
                ));
                return false;
            }
        } else {
            record.hash = digest;
        }

        if let Err(e) = self.flush_change(change, operation, &full_path, verb) {
            self.report_error(e.to_string());
            return false;
        }
        true
    }

    fn overall_update_fraction(&self) -> f64 {
        if self.total_update_blocks == 0 {
            return 1.0;
        }
        self.current_update_blocks as f64 / self.total_update_blocks as f64
    }

    /// Commit a change transaction, forwarding flush progress to subscribers
    fn flush_change(
        &mut self,
        change: ParityChange,
        operation: Operation,
        path: &Path,
        verb: &str,
    ) -> Result<()> {
        let event_tx = self.event_tx.clone();
        let overall = self.overall_update_fraction();
        let display = path.display().to_string();
        let verb = verb.to_string();
        change.commit(&mut self.store, move |frac| {
            let file_fraction = (1.0 - TEMP_FLUSH_FRACTION) + TEMP_FLUSH_FRACTION * frac;
            event_tx
                .send(Event::Progress {
                    operation,
                    fraction: overall.clamp(0.0, 1.0),
                    status: format!("{verb} {display} ({:.0}%)", file_fraction * 100.0),
                })
                .ok();
        })
    }
}
