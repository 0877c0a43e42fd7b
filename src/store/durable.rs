//! Durable single-value records
//!
//! A record is one JSON file holding a checksummed payload:
//!
//! ```text
//! { "checksum": <crc32 of payload>, "payload": { ... } }
//! ```
//!
//! Atomicity is achieved via:
//! 1. Write to temp file
//! 2. fsync temp file
//! 3. Rename temp to final (atomic on POSIX)
//! 4. fsync the directory so the rename itself is durable
//!
//! A crash at any point leaves either the old record or the new one, never
//! a partially written file under the final name.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::{StoreError, StoreResult};
use crate::crash_point::maybe_crash;

/// On-disk envelope
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    checksum: u32,
    payload: Value,
}

/// Computes a CRC32 checksum over the provided data.
pub fn compute_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// A durable, atomically replaced record of type `T`.
#[derive(Debug, Clone)]
pub struct DurableRecord<T> {
    path: PathBuf,
    temp_path: PathBuf,
    crash_before_rename: Option<&'static str>,
    crash_after_rename: Option<&'static str>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> DurableRecord<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Create a record stored at `dir/file_name`.
    pub fn new(dir: &Path, file_name: &str) -> Self {
        Self {
            path: dir.join(file_name),
            temp_path: dir.join(format!("{}.tmp", file_name)),
            crash_before_rename: None,
            crash_after_rename: None,
            _marker: PhantomData,
        }
    }

    /// Attach crash points fired around the commit rename.
    pub fn with_crash_points(mut self, before: &'static str, after: &'static str) -> Self {
        self.crash_before_rename = Some(before);
        self.crash_after_rename = Some(after);
        self
    }

    /// Write the record atomically.
    pub fn write_atomic(&self, value: &T) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io("create_dir", parent, e))?;
        }

        let payload = serde_json::to_value(value)?;
        let checksum = compute_checksum(&serde_json::to_vec(&payload)?);
        let content = serde_json::to_vec_pretty(&Envelope { checksum, payload })?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.temp_path)
            .map_err(|e| StoreError::io("open_temp", &self.temp_path, e))?;

        file.write_all(&content)
            .map_err(|e| StoreError::io("write_temp", &self.temp_path, e))?;

        file.sync_all()
            .map_err(|e| StoreError::io("fsync_temp", &self.temp_path, e))?;
        drop(file);

        if let Some(point) = self.crash_before_rename {
            maybe_crash(point);
        }

        fs::rename(&self.temp_path, &self.path)
            .map_err(|e| StoreError::io("rename", &self.path, e))?;

        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        if let Some(point) = self.crash_after_rename {
            maybe_crash(point);
        }

        Ok(())
    }

    /// Read the record if present.
    ///
    /// Returns:
    /// - `Ok(None)` if no record has been committed
    /// - `Err(StoreError::Corrupt)` if the file fails to parse or verify
    pub fn read(&self) -> StoreResult<Option<T>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io("read", &self.path, e)),
        };

        let envelope: Envelope = serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
            path: self.path.clone(),
            reason: format!("unparseable envelope: {}", e),
        })?;

        let actual = compute_checksum(&serde_json::to_vec(&envelope.payload)?);
        if actual != envelope.checksum {
            return Err(StoreError::Corrupt {
                path: self.path.clone(),
                reason: format!(
                    "checksum mismatch: stored {:08x}, computed {:08x}",
                    envelope.checksum, actual
                ),
            });
        }

        let value = serde_json::from_value(envelope.payload).map_err(|e| StoreError::Corrupt {
            path: self.path.clone(),
            reason: format!("payload does not match record type: {}", e),
        })?;

        Ok(Some(value))
    }

    /// Check if a committed record exists.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Remove the record and any leftover temp file.
    pub fn remove(&self) -> StoreResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io("remove", &self.path, e)),
        }

        if self.temp_path.exists() {
            let _ = fs::remove_file(&self.temp_path);
        }

        Ok(())
    }

    /// Record file path (for diagnostics).
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u64,
    }

    fn sample() -> Sample {
        Sample {
            name: "cam0".into(),
            count: 7,
        }
    }

    #[test]
    fn test_write_and_read() {
        let tmp = TempDir::new().unwrap();
        let record = DurableRecord::<Sample>::new(tmp.path(), "sample.json");

        record.write_atomic(&sample()).unwrap();
        assert_eq!(record.read().unwrap(), Some(sample()));
    }

    #[test]
    fn test_absent_returns_none() {
        let tmp = TempDir::new().unwrap();
        let record = DurableRecord::<Sample>::new(tmp.path(), "sample.json");
        assert!(record.read().unwrap().is_none());
        assert!(!record.exists());
    }

    #[test]
    fn test_overwrite_replaces_whole_record() {
        let tmp = TempDir::new().unwrap();
        let record = DurableRecord::<Sample>::new(tmp.path(), "sample.json");

        record.write_atomic(&sample()).unwrap();
        let updated = Sample {
            name: "cam1".into(),
            count: 8,
        };
        record.write_atomic(&updated).unwrap();

        assert_eq!(record.read().unwrap(), Some(updated));
        assert!(!tmp.path().join("sample.json.tmp").exists());
    }

    #[test]
    fn test_tampered_payload_detected() {
        let tmp = TempDir::new().unwrap();
        let record = DurableRecord::<Sample>::new(tmp.path(), "sample.json");
        record.write_atomic(&sample()).unwrap();

        let text = fs::read_to_string(record.path()).unwrap();
        fs::write(record.path(), text.replace("cam0", "cam9")).unwrap();

        let err = record.read().unwrap_err();
        assert!(err.is_corrupt());
    }

    #[test]
    fn test_truncated_file_detected() {
        let tmp = TempDir::new().unwrap();
        let record = DurableRecord::<Sample>::new(tmp.path(), "sample.json");
        record.write_atomic(&sample()).unwrap();

        let bytes = fs::read(record.path()).unwrap();
        fs::write(record.path(), &bytes[..bytes.len() / 2]).unwrap();

        assert!(record.read().unwrap_err().is_corrupt());
    }

    #[test]
    fn test_leftover_temp_file_ignored() {
        // Simulates a crash after the temp write but before rename
        let tmp = TempDir::new().unwrap();
        let record = DurableRecord::<Sample>::new(tmp.path(), "sample.json");
        record.write_atomic(&sample()).unwrap();

        fs::write(tmp.path().join("sample.json.tmp"), b"{ half written").unwrap();

        assert_eq!(record.read().unwrap(), Some(sample()));
    }

    #[test]
    fn test_remove() {
        let tmp = TempDir::new().unwrap();
        let record = DurableRecord::<Sample>::new(tmp.path(), "sample.json");
        record.write_atomic(&sample()).unwrap();

        record.remove().unwrap();
        assert!(!record.exists());
        // Removing twice is fine
        record.remove().unwrap();
    }

    #[test]
    fn test_creates_missing_directory() {
        let tmp = TempDir::new().unwrap();
        let nested = tmp.path().join("state").join("nested");
        let record = DurableRecord::<Sample>::new(&nested, "sample.json");

        record.write_atomic(&sample()).unwrap();
        assert!(nested.join("sample.json").exists());
    }
}
