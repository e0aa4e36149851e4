//! Configuration types for parity-snap
//!
//! The engine consumes its configuration read-only; persistence belongs to
//! the embedding application. [`Config::load`] / [`Config::save`] are
//! JSON convenience helpers for embedders that do not keep their own format.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// One protected volume: where it lives and which metadata file tracks it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveConfig {
    /// Root directory of the protected volume
    pub path: PathBuf,

    /// Metadata file name inside the parity directory (e.g. "files1.dat")
    pub metafile: String,
}

impl DriveConfig {
    /// Create a new drive entry
    pub fn new(path: impl Into<PathBuf>, metafile: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            metafile: metafile.into(),
        }
    }
}

/// Main configuration for a parity set
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Protected volumes, in parity-set order
    #[serde(default)]
    pub drives: Vec<DriveConfig>,

    /// Directory holding the parity data files and drive metadata files
    pub parity_dir: PathBuf,

    /// Directory for temp parity staging files
    ///
    /// Should have at least as much free space as the largest protected
    /// file; a dedicated fast disk helps large updates.
    pub temp_dir: PathBuf,

    /// Regular expressions matching relative paths to exclude from scans
    #[serde(default)]
    pub ignore: Vec<String>,

    /// Event broadcast channel capacity (default: 1000)
    ///
    /// Subscribers lagging behind by more than this many events start
    /// receiving `RecvError::Lagged`.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_event_capacity() -> usize {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            drives: Vec::new(),
            parity_dir: PathBuf::new(),
            temp_dir: PathBuf::new(),
            ignore: Vec::new(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl Config {
    /// Load a configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Save this configuration to a JSON file
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Validate invariants that serde cannot express
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when a drive path is duplicated, a metafile
    /// name is reused, or an ignore pattern fails to compile.
    pub fn validate(&self) -> Result<()> {
        for (i, drive) in self.drives.iter().enumerate() {
            for other in &self.drives[i + 1..] {
                if other.path == drive.path {
                    return Err(Error::Config {
                        message: format!("drive path {} listed twice", drive.path.display()),
                        key: Some("drives".into()),
                    });
                }
                if other.metafile == drive.metafile {
                    return Err(Error::Config {
                        message: format!("metafile name {} reused", drive.metafile),
                        key: Some("drives".into()),
                    });
                }
            }
        }
        for pattern in &self.ignore {
            regex::Regex::new(pattern).map_err(|e| Error::Config {
                message: format!("invalid ignore pattern {pattern:?}: {e}"),
                key: Some("ignore".into()),
            })?;
        }
        Ok(())
    }

    /// Compile the ignore patterns
    ///
    /// Patterns that fail to compile were already rejected by
    /// [`Config::validate`]; this method silently skips any that slip
    /// through so a bad pattern can never take a scan down.
    #[must_use]
    pub(crate) fn compiled_ignore(&self) -> Vec<regex::Regex> {
        self.ignore
            .iter()
            .filter_map(|p| regex::Regex::new(p).ok())
            .collect()
    }
}
