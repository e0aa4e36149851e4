//! Parity verification and self-heal
//!
//! Every parity block is compared against the XOR of the same-indexed block
//! from every drive. A mismatch is repaired in place only when none of the
//! files covering that block are modified: an unmodified owner with
//! mismatched parity means the corruption is on the parity side, which is
//! exactly what recomputation can fix. A modified owner makes any repair
//! unsafe — recomputation would bake the drift in — so the mismatch is
//! reported and left alone.

use std::collections::HashSet;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use crate::block::ParityBlock;
use crate::drive::BlockData;
use crate::error::Result;
use crate::record::FileRecord;
use crate::types::{Event, Operation, VerifySummary};

use super::Engine;

impl Engine {
    /// Verify blocks `0..max_parity_block`, repairing where safe
    pub(crate) fn verify(&mut self, cancel: &CancellationToken) -> Result<VerifySummary> {
        self.reported.clear();
        let max_block = self.max_parity_block();
        let mut summary = VerifySummary::default();

        // each file is reported at most once per pass, however many of its
        // blocks mismatch
        let mut suspect_files: HashSet<(usize, PathBuf)> = HashSet::new();

        let mut stored = ParityBlock::new();
        let mut computed = ParityBlock::new();
        let mut buf = vec![0u8; crate::block::BLOCK_SIZE];

        for block in 0..max_block {
            stored.load(&mut self.store, block)?;

            // no drive contributing data means the expected value is all-zero
            computed.clear();
            for di in 0..self.drives.len() {
                match self.drives[di].read_block(block, &mut buf) {
                    Ok(BlockData::Read(_)) => computed.add(&buf),
                    Ok(_) => {}
                    Err(e) => self.report_error(e.to_string()),
                }
            }

            if computed != stored {
                summary.mismatches += 1;
                self.report_error(format!("Block {block} does not match"));

                let owners: Vec<(usize, FileRecord)> = self
                    .drives
                    .iter()
                    .enumerate()
                    .filter_map(|(di, d)| d.file_from_block(block).cloned().map(|f| (di, f)))
                    .collect();

                let can_repair = owners.iter().all(|(_, f)| !f.modified);

                let mut reported_header = false;
                for (di, file) in &owners {
                    if !suspect_files.insert((*di, file.name.clone())) {
                        continue;
                    }
                    if !reported_header {
                        self.report_error(format!(
                            "Block {block} contains data from the following file or files \
                             (each file will only be reported once per verify pass):"
                        ));
                        reported_header = true;
                    }
                    let full_path = file.full_path(self.drives[*di].root());
                    let mut line = full_path.display().to_string();
                    if !full_path.exists() {
                        line.push_str(" (MISSING)");
                    } else if file.modified {
                        line.push_str(" (MODIFIED)");
                    }
                    self.report_error(line);
                }

                if can_repair {
                    self.store.write_block(block, computed.data())?;
                    summary.repaired += 1;
                    self.report_error(format!("Block {block} repaired."));
                    self.emit(Event::BlockRepaired { block });
                } else {
                    self.report_error(format!(
                        "Cannot repair block {block} because one or more files are \
                         modified or missing."
                    ));
                    self.emit(Event::BlockUnrepairable { block });
                }
            }

            summary.blocks_checked += 1;
            self.progress(
                Operation::Verify,
                f64::from(block + 1) / f64::from(max_block),
                format!(
                    "{} of {max_block} parity blocks verified. Errors found: {} Errors fixed: {}",
                    block + 1,
                    summary.mismatches,
                    summary.repaired
                ),
            );
            if cancel.is_cancelled() {
                break;
            }
        }

        self.emit(Event::VerifyComplete { summary });
        Ok(summary)
    }
}
