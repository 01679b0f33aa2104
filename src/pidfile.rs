//! PID file handling.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

/// A written PID file, removed again on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    pid: u32,
}

impl PidFile {
    /// Write the current process id to `path`.
    pub fn create(path: &Path) -> io::Result<Self> {
        let pid = std::process::id();
        fs::write(path, format!("{pid}\n"))?;
        info!("PID file written to {:?}", path);
        Ok(Self {
            path: path.to_path_buf(),
            pid,
        })
    }

    /// Path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        // A forked worker must not remove the manager's file.
        if std::process::id() != self.pid {
            return;
        }
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to remove PID file {:?}: {}", self.path, e);
        }
    }
}
