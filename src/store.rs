//! Parity block store backed by one or more capped-size data files
//!
//! The store presents a flat, block-addressed array. Backing files are
//! capped at [`BLOCKS_PER_FILE`] blocks so a single filesystem's file-size
//! limits never bound the logical address space; a block index maps to
//! (file number, offset) by fixed division.
//!
//! The store never grows implicitly: writing at exactly the watermark
//! appends one block, anything past it is an error. Callers that need new
//! space must zero-extend first (see the orchestrator's extend pass).

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::block::BLOCK_SIZE;
use crate::error::{Error, Result};
use crate::utils::get_available_space;

/// Blocks per backing parity file (1 GiB of parity per file at 64 KiB blocks)
pub const BLOCKS_PER_FILE: u32 = 16 * 1024;

/// Block-addressed parity storage spread across `parity{N}.dat` files
pub struct ParityStore {
    dir: PathBuf,
    blocks_per_file: u32,
    max_block: u32,
    handles: HashMap<u32, File>,
}

impl ParityStore {
    /// Open (or initialize) the parity store in `dir`
    ///
    /// Existing `parity{N}.dat` files determine the current watermark; a
    /// directory with no parity files opens as an empty store.
    pub fn open(dir: &Path) -> Result<Self> {
        Self::open_with_layout(dir, BLOCKS_PER_FILE)
    }

    /// Open with an explicit per-file block cap (small caps in tests
    /// exercise the multi-file mapping without gigabytes of data)
    pub(crate) fn open_with_layout(dir: &Path, blocks_per_file: u32) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let mut store = Self {
            dir: dir.to_path_buf(),
            blocks_per_file,
            max_block: 0,
            handles: HashMap::new(),
        };

        // Backing files are contiguous from parity0.dat; the first gap ends
        // the extent.
        let mut file_no = 0u32;
        loop {
            let path = store.file_path(file_no);
            let Ok(meta) = std::fs::metadata(&path) else {
                break;
            };
            let blocks = (meta.len() / BLOCK_SIZE as u64) as u32;
            store.max_block = file_no * blocks_per_file + blocks;
            if blocks < blocks_per_file {
                break;
            }
            file_no += 1;
        }

        debug!(
            dir = %dir.display(),
            max_block = store.max_block,
            "parity store opened"
        );
        Ok(store)
    }

    /// Highest block index ever written (exclusive watermark)
    #[must_use]
    pub fn max_block(&self) -> u32 {
        self.max_block
    }

    /// Directory holding the backing files
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Available space on the parity volume, if it can be determined
    #[must_use]
    pub fn free_space(&self) -> Option<u64> {
        get_available_space(&self.dir).ok()
    }

    fn file_path(&self, file_no: u32) -> PathBuf {
        self.dir.join(format!("parity{file_no}.dat"))
    }

    fn locate(&self, block: u32) -> (u32, u64) {
        let file_no = block / self.blocks_per_file;
        let offset = u64::from(block % self.blocks_per_file) * BLOCK_SIZE as u64;
        (file_no, offset)
    }

    fn handle(&mut self, file_no: u32) -> Result<&mut File> {
        if !self.handles.contains_key(&file_no) {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(self.file_path(file_no))?;
            self.handles.insert(file_no, file);
        }
        // contains_key/insert above guarantees presence
        self.handles
            .get_mut(&file_no)
            .ok_or_else(|| Error::Other("parity file handle vanished".into()))
    }

    /// Read the block at `index` into `buf`
    ///
    /// # Errors
    ///
    /// [`Error::BlockOutOfRange`] when `index` is at or past the watermark.
    pub fn read_block(&mut self, index: u32, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), BLOCK_SIZE);
        if index >= self.max_block {
            return Err(Error::BlockOutOfRange {
                block: index,
                max_block: self.max_block,
            });
        }
        let (file_no, offset) = self.locate(index);
        let file = self.handle(file_no)?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    /// Write one block at `index`
    ///
    /// Writing at exactly the watermark appends and advances it by one;
    /// overwriting any earlier block is allowed.
    ///
    /// # Errors
    ///
    /// [`Error::BlockOutOfRange`] when `index` is past the watermark — the
    /// store does not auto-grow across gaps.
    pub fn write_block(&mut self, index: u32, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len(), BLOCK_SIZE);
        if index > self.max_block {
            return Err(Error::BlockOutOfRange {
                block: index,
                max_block: self.max_block,
            });
        }
        let (file_no, offset) = self.locate(index);
        let file = self.handle(file_no)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        if index == self.max_block {
            self.max_block += 1;
        }
        Ok(())
    }

    /// Physically shrink the store to `new_max` blocks
    ///
    /// Truncates the backing file containing the new boundary and deletes
    /// every wholly-vacated file past it, releasing the space for reclaimed
    /// tail blocks.
    pub fn trim(&mut self, new_max: u32) -> Result<()> {
        if new_max >= self.max_block {
            return Ok(());
        }

        let (boundary_file, _) = self.locate(new_max);
        let (last_file, _) = self.locate(self.max_block.saturating_sub(1));

        // Drop cached handles before touching files on disk.
        self.handles.retain(|&n, _| n < boundary_file);

        let keep_blocks = new_max - boundary_file * self.blocks_per_file;
        let boundary_path = self.file_path(boundary_file);
        if boundary_path.exists() {
            let file = OpenOptions::new().write(true).open(&boundary_path)?;
            file.set_len(u64::from(keep_blocks) * BLOCK_SIZE as u64)?;
        }

        for file_no in (boundary_file + 1)..=last_file {
            let path = self.file_path(file_no);
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }

        debug!(
            from = self.max_block,
            to = new_max,
            "parity store trimmed"
        );
        self.max_block = new_max;
        Ok(())
    }

    /// Delete every backing parity file (Create teardown)
    pub fn delete_all(&mut self) -> Result<()> {
        self.handles.clear();
        let last = if self.max_block == 0 {
            0
        } else {
            (self.max_block - 1) / self.blocks_per_file
        };
        for file_no in 0..=last {
            let path = self.file_path(file_no);
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        self.max_block = 0;
        Ok(())
    }

    /// Close any open backing file handles
    pub fn close(&mut self) {
        self.handles.clear();
    }
}
