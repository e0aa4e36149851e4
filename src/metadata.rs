//! Drive metadata file codec
//!
//! Each protected drive has one metadata file (`files{N}.dat`) in the parity
//! directory enumerating its [`FileRecord`]s. The layout is little-endian
//! and versioned:
//!
//! ```text
//! header:  magic "PSMF" | format version u32 | record count u32
//! record:  name length u16 | name UTF-8 bytes | length u64 |
//!          start block u32 | MD5 hash [16] | attributes u32 |
//!          created millis i64 | modified millis i64
//! ```
//!
//! Writes go through a temp file plus rename so a crash mid-save never
//! leaves a torn metadata file behind.

use chrono::DateTime;
use std::path::Path;

use crate::error::{MetadataError, Result};
use crate::record::FileRecord;
use crate::types::FileHash;

/// Magic bytes opening every drive metadata file
pub const MAGIC: &[u8; 4] = b"PSMF";

/// Current metadata format version
pub const FORMAT_VERSION: u32 = 1;

const HEADER_SIZE: usize = 4 + 4 + 4;
const RECORD_FIXED_SIZE: usize = 2 + 8 + 4 + 16 + 4 + 8 + 8;

/// Size in bytes one record occupies on disk
fn record_size(record: &FileRecord) -> usize {
    let name_len = record.name.to_str().map_or(0, str::len);
    RECORD_FIXED_SIZE + name_len
}

/// Predicted on-disk size for a set of records
///
/// Used for pre-flight space checks before growing a metadata file.
#[must_use]
pub fn predicted_size<'a>(records: impl IntoIterator<Item = &'a FileRecord>) -> u64 {
    let body: usize = records.into_iter().map(record_size).sum();
    (HEADER_SIZE + body) as u64
}

/// Write all records to `path`, atomically
pub fn write_records(path: &Path, records: &[FileRecord]) -> Result<()> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + records.iter().map(record_size).sum::<usize>());
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf.extend_from_slice(&(records.len() as u32).to_le_bytes());

    for record in records {
        let name = record.name.to_str().ok_or_else(|| MetadataError::InvalidRecord {
            path: path.to_path_buf(),
            reason: format!("non-UTF-8 file name {:?}", record.name),
        })?;
        buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(&record.length.to_le_bytes());
        buf.extend_from_slice(&record.start_block.to_le_bytes());
        buf.extend_from_slice(&record.hash);
        buf.extend_from_slice(&record.attributes.to_le_bytes());
        buf.extend_from_slice(&record.created.timestamp_millis().to_le_bytes());
        buf.extend_from_slice(&record.modified_at.timestamp_millis().to_le_bytes());
    }

    let tmp = path.with_extension("dat.tmp");
    std::fs::write(&tmp, &buf)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Parse cursor over the raw metadata bytes
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let slice = self.data.get(self.pos..self.pos + n)?;
        self.pos += n;
        Some(slice)
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4).and_then(|b| b.try_into().ok()).map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> Option<u64> {
        self.take(8).and_then(|b| b.try_into().ok()).map(u64::from_le_bytes)
    }

    fn i64(&mut self) -> Option<i64> {
        self.take(8).and_then(|b| b.try_into().ok()).map(i64::from_le_bytes)
    }
}

/// Read every record from the metadata file at `path`
pub fn read_records(path: &Path) -> Result<Vec<FileRecord>> {
    let data = std::fs::read(path)?;
    let mut reader = Reader { data: &data, pos: 0 };

    let truncated = |record, total| MetadataError::Truncated {
        path: path.to_path_buf(),
        record,
        total,
    };

    let magic = reader.take(4).ok_or(truncated(0, 0))?;
    if magic != MAGIC.as_slice() {
        return Err(MetadataError::BadMagic {
            path: path.to_path_buf(),
        }
        .into());
    }
    let version = reader.u32().ok_or(truncated(0, 0))?;
    if version != FORMAT_VERSION {
        return Err(MetadataError::UnsupportedVersion {
            path: path.to_path_buf(),
            version,
        }
        .into());
    }
    let count = reader.u32().ok_or(truncated(0, 0))?;

    let mut records = Vec::with_capacity(count as usize);
    for i in 0..count {
        let mut field = || -> Option<FileRecord> {
            let name_len = reader.u16()? as usize;
            let name_bytes = reader.take(name_len)?;
            let name = std::str::from_utf8(name_bytes).ok()?;
            let length = reader.u64()?;
            let start_block = reader.u32()?;
            let hash: FileHash = reader.take(16)?.try_into().ok()?;
            let attributes = reader.u32()?;
            let created = DateTime::from_timestamp_millis(reader.i64()?)?;
            let modified_at = DateTime::from_timestamp_millis(reader.i64()?)?;
            Some(FileRecord {
                name: name.into(),
                length,
                start_block,
                hash,
                attributes,
                created,
                modified_at,
                modified: false,
            })
        };
        let record = field().ok_or(truncated(i, count))?;
        records.push(record);
    }

    Ok(records)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use chrono::Utc;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn sample_records() -> Vec<FileRecord> {
        let now_ms = DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap();
        vec![
            FileRecord {
                name: PathBuf::from("photos/winter/img_001.jpg"),
                length: 123_456,
                start_block: 0,
                hash: [7u8; 16],
                attributes: 0o100644,
                created: now_ms,
                modified_at: now_ms,
                modified: false,
            },
            FileRecord {
                name: PathBuf::from("empty.txt"),
                length: 0,
                start_block: 0,
                hash: [0u8; 16],
                attributes: 0o100600,
                created: now_ms,
                modified_at: now_ms,
                modified: false,
            },
        ]
    }

    #[test]
    fn records_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("files1.dat");

        let records = sample_records();
        write_records(&path, &records).unwrap();
        let loaded = read_records(&path).unwrap();

        assert_eq!(loaded, records);
    }

    #[test]
    fn empty_record_list_round_trips() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("files1.dat");

        write_records(&path, &[]).unwrap();
        assert_eq!(read_records(&path).unwrap(), Vec::new());
    }

    #[test]
    fn modified_flag_is_not_persisted() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("files1.dat");

        let mut records = sample_records();
        records[0].modified = true;
        write_records(&path, &records).unwrap();

        let loaded = read_records(&path).unwrap();
        assert!(!loaded[0].modified, "modified is runtime state and must load as false");
    }

    #[test]
    fn bad_magic_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("files1.dat");
        std::fs::write(&path, b"NOPE\x01\x00\x00\x00\x00\x00\x00\x00").unwrap();

        let err = read_records(&path).unwrap_err();
        assert!(matches!(err, Error::Metadata(MetadataError::BadMagic { .. })));
    }

    #[test]
    fn future_version_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("files1.dat");
        let mut data = Vec::new();
        data.extend_from_slice(MAGIC);
        data.extend_from_slice(&99u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        std::fs::write(&path, &data).unwrap();

        let err = read_records(&path).unwrap_err();
        assert!(matches!(
            err,
            Error::Metadata(MetadataError::UnsupportedVersion { version: 99, .. })
        ));
    }

    #[test]
    fn truncated_file_names_the_partial_record() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("files1.dat");

        let records = sample_records();
        write_records(&path, &records).unwrap();

        // Chop the file mid-way through the second record
        let full = std::fs::read(&path).unwrap();
        std::fs::write(&path, &full[..full.len() - 10]).unwrap();

        let err = read_records(&path).unwrap_err();
        match err {
            Error::Metadata(MetadataError::Truncated { record, total, .. }) => {
                assert_eq!(record, 1);
                assert_eq!(total, 2);
            }
            other => panic!("expected Truncated, got {other:?}"),
        }
    }

    #[test]
    fn predicted_size_matches_actual_file_size() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("files1.dat");

        let records = sample_records();
        write_records(&path, &records).unwrap();

        let actual = std::fs::metadata(&path).unwrap().len();
        assert_eq!(predicted_size(records.iter()), actual);
    }

    #[test]
    fn save_replaces_rather_than_appends() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("files1.dat");

        write_records(&path, &sample_records()).unwrap();
        write_records(&path, &sample_records()[..1]).unwrap();

        assert_eq!(read_records(&path).unwrap().len(), 1);
    }
}
