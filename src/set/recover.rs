//! Reconstruction: recover and undelete
//!
//! A file is rebuilt block by block from the algebraic identity
//! `target = parity XOR (everything else)`: load the stored parity block,
//! then XOR in the same-indexed block from every drive except the one being
//! recovered. The recovered drive is never read. Contributing files that
//! are modified or missing make the result suspect — each is warned about
//! once per pass, but reconstruction proceeds (best effort), and a final
//! content-hash mismatch is reported without deleting the output.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::block::{BLOCK_SIZE, ParityBlock};
use crate::drive::BlockData;
use crate::error::{Error, Result};
use crate::record::FileRecord;
use crate::types::{Event, Operation, RecoverSummary};

use super::Engine;

impl Engine {
    /// Reconstruct every tracked file of drive `di` into `dest`
    pub(crate) fn recover(
        &mut self,
        di: usize,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<RecoverSummary> {
        let drive = self
            .drives
            .get(di)
            .ok_or_else(|| Error::InvalidDrive(format!("no drive at index {di}")))?;
        self.reported.clear();
        let files = drive.files().to_vec();
        self.recover_files(di, &files, dest, Operation::Recover, false, cancel)
    }

    /// Reconstruct selected pending-delete files back onto drive `di`
    pub(crate) fn undelete(
        &mut self,
        di: usize,
        paths: &[PathBuf],
        cancel: &CancellationToken,
    ) -> Result<RecoverSummary> {
        let drive = self
            .drives
            .get(di)
            .ok_or_else(|| Error::InvalidDrive(format!("no drive at index {di}")))?;
        self.reported.clear();

        let root = drive.root().to_path_buf();
        let files: Vec<FileRecord> = drive
            .deletes()
            .iter()
            .filter(|r| {
                paths
                    .iter()
                    .any(|p| *p == r.name || *p == r.full_path(&root))
            })
            .cloned()
            .collect();

        if files.is_empty() {
            info!("no files to undelete");
            return Ok(RecoverSummary::default());
        }
        info!("beginning undelete for {} file(s)", files.len());
        self.recover_files(di, &files, &root, Operation::Undelete, true, cancel)
    }

    fn recover_files(
        &mut self,
        di: usize,
        files: &[FileRecord],
        dest_root: &Path,
        operation: Operation,
        undelete: bool,
        cancel: &CancellationToken,
    ) -> Result<RecoverSummary> {
        let total_blocks: u64 = files
            .iter()
            .map(|r| u64::from(r.length_in_blocks()))
            .sum::<u64>()
            .max(1);
        let mut done_blocks: u64 = 0;
        let mut summary = RecoverSummary::default();

        for record in files {
            let outcome = self.recover_file(
                di,
                record,
                dest_root,
                operation,
                total_blocks,
                done_blocks,
                cancel,
            );
            // failed files still advance progress by their full block count
            done_blocks += u64::from(record.length_in_blocks());

            match outcome {
                Ok(true) => {
                    summary.restored += 1;
                    if undelete {
                        self.drives[di].remove_pending_delete(&record.name);
                        self.drives[di].maybe_remove_add_by_name(&record.name);
                        self.drives[di].update_status();
                    }
                }
                Ok(false) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    summary.failures += 1;
                }
                Err(e) => {
                    self.report_error(format!(
                        "Error recovering \"{}\": {e}",
                        dest_root.join(&record.name).display()
                    ));
                    summary.failures += 1;
                }
            }

            let mut status = format!("{} file(s) restored.", summary.restored);
            if summary.failures > 0 {
                status.push_str(&format!(" Errors: {}", summary.failures));
            }
            self.progress(operation, done_blocks as f64 / total_blocks as f64, status);
        }

        self.emit(Event::RecoverComplete { summary });
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    fn recover_file(
        &mut self,
        di: usize,
        record: &FileRecord,
        dest_root: &Path,
        operation: Operation,
        total_blocks: u64,
        done_blocks: u64,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let full_path = dest_root.join(&record.name);
        info!("recovering {}", full_path.display());

        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut out = File::create(&full_path)?;
        let mut hasher = md5::Context::new();
        let mut parity_buf = ParityBlock::new();
        let mut scratch = vec![0u8; BLOCK_SIZE];

        let blocks = record.length_in_blocks();
        let mut remaining = record.length;
        for i in 0..blocks {
            let block = record.start_block + i;
            self.recover_block(di, block, &mut parity_buf, &mut scratch);

            let take = remaining.min(BLOCK_SIZE as u64) as usize;
            out.write_all(&parity_buf.data()[..take])?;
            hasher.consume(&parity_buf.data()[..take]);
            remaining -= take as u64;

            self.progress(
                operation,
                (done_blocks + u64::from(i) + 1) as f64 / total_blocks as f64,
                format!("Recovering {}", record.name.display()),
            );
            if cancel.is_cancelled() {
                drop(out);
                let _ = std::fs::remove_file(&full_path);
                return Ok(false);
            }
        }

        out.set_modified(record.modified_at.into())?;
        drop(out);

        #[cfg(unix)]
        if record.attributes != 0 {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(
                &full_path,
                std::fs::Permissions::from_mode(record.attributes),
            );
        }

        if record.length > 0 && hasher.compute().0 != record.hash {
            // best effort: the file stays on disk, but the caller needs to
            // know it is suspect
            self.report_error(format!(
                "Hash verify failed for \"{}\". Recovered file is probably corrupt.",
                full_path.display()
            ));
            return Ok(false);
        }

        self.emit(Event::FileRecovered { path: full_path });
        Ok(true)
    }

    /// Rebuild one block: stored parity XOR every other drive's bytes
    fn recover_block(&mut self, skip: usize, block: u32, parity: &mut ParityBlock, buf: &mut [u8]) {
        if let Err(e) = parity.load(&mut self.store, block) {
            self.report_error_once(e.to_string());
            parity.clear();
        }
        for dj in 0..self.drives.len() {
            if dj == skip {
                continue;
            }
            match self.drives[dj].read_block(block, buf) {
                Ok(BlockData::Read(contributor)) => {
                    parity.add(buf);
                    if contributor.modified {
                        let path = contributor.full_path(self.drives[dj].root());
                        self.report_error_once(format!(
                            "Warning: {} has been modified. Some recovered files may be corrupt.",
                            path.display()
                        ));
                    }
                }
                Ok(BlockData::Missing(contributor)) => {
                    let path = contributor.full_path(self.drives[dj].root());
                    self.report_error_once(format!(
                        "Warning: {} could not be found. Some recovered files may be corrupt.",
                        path.display()
                    ));
                }
                Ok(BlockData::Unassigned) => {}
                Err(e) => self.report_error_once(e.to_string()),
            }
        }
    }
}
