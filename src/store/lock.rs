use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;

use crate::config::IoConfig;
use crate::error::{MusterError, Result};

/// Try once to take an exclusive lock on a file, returning the locked File handle.
/// The lock is released when the File is dropped.
pub fn try_acquire_lock(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    file.try_lock_exclusive()
        .map_err(|_| MusterError::Locked(path.display().to_string()))?;

    Ok(file)
}

/// Acquire an exclusive lock, retrying contention with bounded backoff.
///
/// Gives up with `Locked` once `io.retries` attempts are exhausted.
pub fn acquire_lock(path: &Path, io: &IoConfig) -> Result<File> {
    let mut attempt = 0;
    loop {
        match try_acquire_lock(path) {
            Ok(file) => return Ok(file),
            Err(MusterError::Locked(_)) if attempt < io.retries => {
                std::thread::sleep(io.backoff(attempt));
                attempt += 1;
            }
            Err(err) => {
                if matches!(err, MusterError::Locked(_)) {
                    tracing::warn!(path = %path.display(), attempts = attempt + 1, "lock contention exhausted retries");
                }
                return Err(err);
            }
        }
    }
}

/// Release lock explicitly (normally handled by Drop).
pub fn release_lock(file: File) -> Result<()> {
    file.unlock()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn quick() -> IoConfig {
        IoConfig {
            retries: 3,
            backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    #[test]
    fn acquire_and_release_lock() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("test.lock");

        let file = acquire_lock(&lock_path, &quick()).unwrap();
        // Lock is held; trying to acquire again should fail after retries
        assert!(matches!(
            acquire_lock(&lock_path, &quick()),
            Err(MusterError::Locked(_))
        ));
        release_lock(file).unwrap();
        let _file = acquire_lock(&lock_path, &quick()).unwrap();
    }

    #[test]
    fn creates_missing_lock_directory() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("locks").join("nested.lock");
        let _file = try_acquire_lock(&lock_path).unwrap();
        assert!(lock_path.exists());
    }

    #[test]
    fn waits_for_holder_to_release() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("wait.lock");
        let held = try_acquire_lock(&lock_path).unwrap();

        let path = lock_path.clone();
        let waiter = std::thread::spawn(move || {
            let io = IoConfig {
                retries: 200,
                backoff_ms: 5,
                max_backoff_ms: 10,
            };
            let start = Instant::now();
            let _file = acquire_lock(&path, &io).unwrap();
            start.elapsed()
        });

        std::thread::sleep(Duration::from_millis(50));
        drop(held);
        let waited = waiter.join().unwrap();
        assert!(waited >= Duration::from_millis(30));
    }
}
