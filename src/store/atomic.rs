//! Crash-safe record files.
//!
//! Every record is written to a hidden temp file in the target directory,
//! flushed, and renamed over the destination, so readers see either the old
//! record or the new one and never a torn write. Temp files start with `.`
//! and end in `.tmp`; directory scans skip them.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::IoConfig;
use crate::error::{MusterError, Result};

const TMP_SUFFIX: &str = ".tmp";

fn temp_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let token = uuid::Uuid::new_v4().simple().to_string();
    dest.with_file_name(format!(".{name}.{}{TMP_SUFFIX}", &token[..12]))
}

fn write_temp(dest: &Path, bytes: &[u8]) -> Result<PathBuf> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_path(dest);
    let mut file = File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(tmp)
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::PermissionDenied
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ResourceBusy
    )
}

/// Replace `dest` with `value` serialized as pretty JSON.
pub fn write_json<T: Serialize>(dest: &Path, value: &T, io: &IoConfig) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    write_bytes(dest, json.as_bytes(), io)
}

/// Replace `dest` with `bytes`, retrying transient rename failures.
pub fn write_bytes(dest: &Path, bytes: &[u8], io: &IoConfig) -> Result<()> {
    let tmp = write_temp(dest, bytes)?;
    let mut attempt = 0;
    loop {
        match fs::rename(&tmp, dest) {
            Ok(()) => return Ok(()),
            Err(e) if is_transient(&e) && attempt < io.retries => {
                std::thread::sleep(io.backoff(attempt));
                attempt += 1;
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                return Err(e.into());
            }
        }
    }
}

/// Create `dest` only if it does not already exist.
///
/// The record is fully written before it becomes visible: the temp file is
/// hard-linked into place, which fails atomically if `dest` exists. Returns
/// `false` when another writer got there first.
pub fn create_json<T: Serialize>(dest: &Path, value: &T) -> Result<bool> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = write_temp(dest, json.as_bytes())?;
    let linked = fs::hard_link(&tmp, dest);
    let _ = fs::remove_file(&tmp);
    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Read a JSON record, returning `None` if the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| MusterError::CorruptFile(path.display().to_string(), e.to_string()))
}

/// Remove a file, returning `false` if it was already gone.
pub fn remove(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

pub fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.') && n.ends_with(TMP_SUFFIX))
}

/// Paths of `*.json` records in `dir`, sorted by file name. Temp files are skipped.
pub fn list_records(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e.into()),
    };
    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if is_temp_file(&path) || path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        paths.push(path);
    }
    paths.sort();
    Ok(paths)
}

/// Delete temp files in `dir` older than `max_age`, left behind by writers
/// that crashed between write and rename. Returns the removed paths.
pub fn sweep_temp_files(dir: &Path, max_age: Duration) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e.into()),
    };
    let now = SystemTime::now();
    let mut removed = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !is_temp_file(&path) {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        let age = now.duration_since(modified).unwrap_or_default();
        if age >= max_age && remove(&path)? {
            removed.push(path);
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Rec {
        n: u32,
    }

    #[test]
    fn write_replaces_and_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rec.json");
        write_json(&path, &Rec { n: 1 }, &IoConfig::default()).unwrap();
        write_json(&path, &Rec { n: 2 }, &IoConfig::default()).unwrap();

        assert_eq!(read_json::<Rec>(&path).unwrap(), Some(Rec { n: 2 }));
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| is_temp_file(&e.path()))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn create_refuses_existing_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("claim.json");
        assert!(create_json(&path, &Rec { n: 1 }).unwrap());
        assert!(!create_json(&path, &Rec { n: 2 }).unwrap());
        assert_eq!(read_json::<Rec>(&path).unwrap(), Some(Rec { n: 1 }));
    }

    #[test]
    fn read_missing_is_none_and_corrupt_is_error() {
        let dir = tempdir().unwrap();
        assert_eq!(read_json::<Rec>(&dir.path().join("nope.json")).unwrap(), None);

        let bad = dir.path().join("bad.json");
        fs::write(&bad, "{not json").unwrap();
        assert!(matches!(
            read_json::<Rec>(&bad),
            Err(MusterError::CorruptFile(_, _))
        ));
    }

    #[test]
    fn list_records_skips_temp_and_foreign_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b.json"), "{}").unwrap();
        fs::write(dir.path().join("a.json"), "{}").unwrap();
        fs::write(dir.path().join(".a.json.abc.tmp"), "{").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();

        let names: Vec<String> = list_records(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.json", "b.json"]);
    }

    #[test]
    fn sweep_removes_only_stale_temp_files() {
        let dir = tempdir().unwrap();
        let tmp = dir.path().join(".x.json.0123.tmp");
        fs::write(&tmp, "partial").unwrap();
        fs::write(dir.path().join("x.json"), "{}").unwrap();

        assert!(sweep_temp_files(dir.path(), Duration::from_secs(3600))
            .unwrap()
            .is_empty());
        let removed = sweep_temp_files(dir.path(), Duration::ZERO).unwrap();
        assert_eq!(removed, vec![tmp]);
        assert!(dir.path().join("x.json").exists());
    }

    #[test]
    fn remove_reports_absence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gone.json");
        fs::write(&path, "{}").unwrap();
        assert!(remove(&path).unwrap());
        assert!(!remove(&path).unwrap());
    }
}
