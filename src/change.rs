//! Change transactions for contiguous parity recomputations
//!
//! A [`ParityChange`] buffers the recomputed blocks for one contiguous range
//! in a staging file under the configured temp directory, then commits them
//! to the permanent store in one pass. Staging keeps a half-finished
//! recomputation away from live parity: the store is only touched once the
//! whole range has been produced.
//!
//! The commit flush runs on its own thread while the issuing thread waits on
//! a completion channel, sampling an atomic blocks-flushed counter for
//! progress. Staging-file failures surface as [`Error::TempParity`] — a
//! distinct category, because they almost always mean the temp location ran
//! out of space.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc;
use std::time::Duration;
use tracing::debug;

use crate::block::{BLOCK_SIZE, ParityBlock};
use crate::error::{Error, Result};
use crate::store::ParityStore;

/// How often the committing thread samples flush progress
const FLUSH_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A buffered run of recomputed parity blocks awaiting commit
#[derive(Debug)]
pub struct ParityChange {
    start_block: u32,
    path: PathBuf,
    file: File,
    buffer: ParityBlock,
    blocks_staged: u32,
}

impl ParityChange {
    /// Open a staging file for a recomputation of `length` blocks starting
    /// at `start_block`
    ///
    /// # Errors
    ///
    /// [`Error::TempParity`] when the staging file cannot be created.
    pub fn new(temp_dir: &std::path::Path, start_block: u32, length: u32) -> Result<Self> {
        std::fs::create_dir_all(temp_dir)
            .map_err(|e| Error::TempParity(format!("cannot create temp dir: {e}")))?;
        let path = temp_dir.join(format!("parity-change-{start_block}.tmp"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::TempParity(format!("cannot create staging file: {e}")))?;

        debug!(start_block, length, staging = %path.display(), "parity change opened");
        Ok(Self {
            start_block,
            path,
            file,
            buffer: ParityBlock::new(),
            blocks_staged: 0,
        })
    }

    /// Number of blocks written to staging so far
    #[must_use]
    pub fn blocks_staged(&self) -> u32 {
        self.blocks_staged
    }

    /// Begin the next block of the range
    ///
    /// With `seed_from_parity` the buffer starts from the currently stored
    /// parity block (add and fast-remove XOR on top of it); otherwise the
    /// buffer starts zeroed (full recomputation).
    pub fn reset(&mut self, store: &mut ParityStore, seed_from_parity: bool) -> Result<()> {
        if seed_from_parity {
            self.buffer.load(store, self.start_block + self.blocks_staged)?;
        } else {
            self.buffer.clear();
        }
        Ok(())
    }

    /// XOR one block of data into the current buffer
    pub fn add(&mut self, data: &[u8]) {
        self.buffer.add(data);
    }

    /// Append the current buffer to the staging file
    ///
    /// # Errors
    ///
    /// [`Error::TempParity`] when the staging write fails.
    pub fn write(&mut self) -> Result<()> {
        self.file
            .write_all(self.buffer.data())
            .map_err(|e| Error::TempParity(format!("staging write failed: {e}")))?;
        self.blocks_staged += 1;
        Ok(())
    }

    /// Flush the staged blocks into the permanent store
    ///
    /// The flush runs on a dedicated thread; the calling thread receives
    /// progress callbacks (fraction of blocks flushed, `0..=1`) while it
    /// waits on the completion channel. Returns once every staged block has
    /// been written through, or with the flush error.
    pub fn commit(mut self, store: &mut ParityStore, mut on_progress: impl FnMut(f64)) -> Result<()> {
        let total = self.blocks_staged;
        if total == 0 {
            return Ok(());
        }
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|e| Error::TempParity(format!("staging rewind failed: {e}")))?;

        let start_block = self.start_block;
        let file = &mut self.file;
        let flushed = AtomicU32::new(0);
        let (done_tx, done_rx) = mpsc::channel::<()>();

        let result = std::thread::scope(|scope| {
            let flushed = &flushed;
            let handle = scope.spawn(move || {
                let result = flush_staged(file, store, start_block, total, flushed);
                done_tx.send(()).ok();
                result
            });

            loop {
                match done_rx.recv_timeout(FLUSH_POLL_INTERVAL) {
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        on_progress(f64::from(flushed.load(Ordering::Relaxed)) / f64::from(total));
                    }
                }
            }

            handle
                .join()
                .map_err(|_| Error::Other("parity flush thread panicked".into()))?
        });

        on_progress(1.0);
        debug!(start_block, blocks = total, "parity change committed");
        result
    }
}

impl Drop for ParityChange {
    fn drop(&mut self) {
        // best effort; a leftover staging file is harmless and overwritten
        // by the next change for the same range
        let _ = std::fs::remove_file(&self.path);
    }
}

fn flush_staged(
    staging: &mut File,
    store: &mut ParityStore,
    start_block: u32,
    total: u32,
    flushed: &AtomicU32,
) -> Result<()> {
    let mut buf = vec![0u8; BLOCK_SIZE];
    for i in 0..total {
        staging
            .read_exact(&mut buf)
            .map_err(|e| Error::TempParity(format!("staging read failed: {e}")))?;
        store.write_block(start_block + i, &buf)?;
        flushed.fetch_add(1, Ordering::Relaxed);
    }
    Ok(())
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn block_of(byte: u8) -> Vec<u8> {
        vec![byte; BLOCK_SIZE]
    }

    fn store_with_blocks(dir: &std::path::Path, blocks: &[u8]) -> ParityStore {
        let mut store = ParityStore::open(dir).unwrap();
        for &b in blocks {
            store.write_block(store.max_block(), &block_of(b)).unwrap();
        }
        store
    }

    #[test]
    fn staged_blocks_commit_into_the_store() {
        let parity_dir = TempDir::new().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let mut store = store_with_blocks(parity_dir.path(), &[0, 0, 0]);

        let mut change = ParityChange::new(temp_dir.path(), 1, 2).unwrap();
        for byte in [0x11, 0x22] {
            change.reset(&mut store, false).unwrap();
            change.add(&block_of(byte));
            change.write().unwrap();
        }

        let mut fractions = Vec::new();
        change.commit(&mut store, |f| fractions.push(f)).unwrap();

        let mut buf = block_of(0);
        store.read_block(1, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0x11));
        store.read_block(2, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0x22));

        assert_eq!(
            fractions.last().copied(),
            Some(1.0),
            "commit must report completion"
        );
    }

    #[test]
    fn seeded_reset_xors_on_top_of_stored_parity() {
        let parity_dir = TempDir::new().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let mut store = store_with_blocks(parity_dir.path(), &[0b1010_1010]);

        let mut change = ParityChange::new(temp_dir.path(), 0, 1).unwrap();
        change.reset(&mut store, true).unwrap();
        change.add(&block_of(0b0110_0110));
        change.write().unwrap();
        change.commit(&mut store, |_| {}).unwrap();

        let mut buf = block_of(0);
        store.read_block(0, &mut buf).unwrap();
        assert!(
            buf.iter().all(|&b| b == 0b1010_1010 ^ 0b0110_0110),
            "seeded commit must produce old_parity XOR data"
        );
    }

    #[test]
    fn empty_change_commits_without_touching_the_store() {
        let parity_dir = TempDir::new().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let mut store = store_with_blocks(parity_dir.path(), &[7]);

        let change = ParityChange::new(temp_dir.path(), 0, 0).unwrap();
        change.commit(&mut store, |_| {}).unwrap();

        let mut buf = block_of(0);
        store.read_block(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 7));
    }

    #[cfg(unix)]
    #[test]
    fn unwritable_temp_location_is_a_temp_parity_failure() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let locked = temp_dir.path().join("locked");
        std::fs::create_dir(&locked).unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o555)).unwrap();

        struct RestorePerms<'a>(&'a std::path::Path);
        impl Drop for RestorePerms<'_> {
            fn drop(&mut self) {
                let _ = std::fs::set_permissions(self.0, std::fs::Permissions::from_mode(0o755));
            }
        }
        let _guard = RestorePerms(&locked);

        let err = ParityChange::new(&locked, 0, 1).unwrap_err();
        assert!(
            matches!(err, Error::TempParity(_)),
            "staging failures must use the temp-parity category, got {err:?}"
        );
    }

    #[test]
    fn staging_file_is_removed_on_drop() {
        let temp_dir = TempDir::new().unwrap();
        let staging_path = temp_dir.path().join("parity-change-3.tmp");
        {
            let parity_dir = TempDir::new().unwrap();
            let mut store = store_with_blocks(parity_dir.path(), &[0, 0, 0, 0]);
            let mut change = ParityChange::new(temp_dir.path(), 3, 1).unwrap();
            change.reset(&mut store, false).unwrap();
            change.add(&block_of(1));
            change.write().unwrap();
            assert!(staging_path.exists());
        }
        assert!(!staging_path.exists(), "drop must clean up the staging file");
    }
}
