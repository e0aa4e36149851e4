//! End-to-end tests for the parity set orchestrator
//!
//! Each submodule exercises one operation family against real temp
//! directories: data drives, the parity directory and the temp staging
//! directory are all `tempfile` sandboxes.

mod update;
mod verify;

use rand::RngCore;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tempfile::TempDir;

use crate::config::{Config, DriveConfig};
use crate::set::ParitySet;
use crate::types::Event;

/// A parity set over `n` sandboxed data drives
pub(crate) struct TestSet {
    pub data: Vec<TempDir>,
    pub parity: TempDir,
    pub temp: TempDir,
    pub config: Config,
}

impl TestSet {
    pub fn new(drives: usize) -> Self {
        let data: Vec<TempDir> = (0..drives).map(|_| TempDir::new().unwrap()).collect();
        let parity = TempDir::new().unwrap();
        let temp = TempDir::new().unwrap();
        let config = Config {
            drives: data
                .iter()
                .enumerate()
                .map(|(i, dir)| DriveConfig::new(dir.path(), format!("files{}.dat", i + 1)))
                .collect(),
            parity_dir: parity.path().to_path_buf(),
            temp_dir: temp.path().to_path_buf(),
            ignore: Vec::new(),
            event_capacity: 1000,
        };
        Self {
            data,
            parity,
            temp,
            config,
        }
    }

    pub async fn open(&self) -> ParitySet {
        ParitySet::new(self.config.clone()).await.unwrap()
    }

    /// Write a file onto one of the data drives
    pub fn write(&self, drive: usize, name: &str, contents: &[u8]) {
        let path = self.data[drive].path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }

    pub fn delete(&self, drive: usize, name: &str) {
        std::fs::remove_file(self.data[drive].path().join(name)).unwrap();
    }

    /// All parity bytes, concatenated across the backing files in order
    pub fn parity_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut file_no = 0;
        loop {
            let path = self.parity.path().join(format!("parity{file_no}.dat"));
            let Ok(bytes) = std::fs::read(&path) else {
                break;
            };
            out.extend_from_slice(&bytes);
            file_no += 1;
        }
        out
    }
}

/// Deterministic pseudo-random content for test files
pub(crate) fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    data
}

/// Drain everything currently buffered on an event subscription
pub(crate) fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
