use crate::CoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Exclusive advisory lock on a state directory, released on drop.
pub struct StoreLock {
    file: File,
    path: PathBuf,
}

fn open_lock_file(path: &Path) -> Result<File, CoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)?)
}

impl StoreLock {
    /// Block until the lock is ours.
    pub fn acquire(path: &Path) -> Result<Self, CoreError> {
        let file = open_lock_file(path)?;
        file.lock_exclusive()?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// `Ok(None)` if another process holds the lock.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, CoreError> {
        let file = open_lock_file(path)?;
        if file.try_lock_exclusive().is_err() {
            return Ok(None);
        }
        Ok(Some(Self {
            file,
            path: path.to_path_buf(),
        }))
    }

    /// Like [`try_acquire`](Self::try_acquire), but a held lock is an error.
    pub fn acquire_or_fail(path: &Path) -> Result<Self, CoreError> {
        Self::try_acquire(path)?.ok_or_else(|| CoreError::Locked(path.display().to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Route Ctrl-C to the shutdown flag. A second Ctrl-C exits immediately.
pub fn install_signal_handler() {
    let result = ctrlc::set_handler(|| {
        if SHUTDOWN_REQUESTED.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        eprintln!("\nstopping packages, press Ctrl-C again to exit now...");
    });
    if let Err(e) = result {
        tracing::debug!("signal handler not installed: {e}");
    }
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}
