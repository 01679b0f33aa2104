//! Shared secret used to authenticate control sessions.
//!
//! The secret either comes from an operator-supplied file (`-S`), read
//! verbatim, or is generated into the working directory at startup. A
//! generated file is removed again when the [`SecretStore`] is dropped, but
//! only by the process that created it: a restarted instance that inherits an
//! existing file must not pull it out from under a running peer.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::RngCore;
use rand::rngs::OsRng;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Name of the generated secret file inside the working directory.
pub const SECRET_FILE_NAME: &str = "_.secret";

/// Number of random bytes written to a generated secret.
pub const GENERATED_SECRET_LEN: usize = 256;

/// Errors from secret creation or loading. Always fatal at startup.
#[derive(Debug, Error)]
pub enum SecretError {
    /// The operator-supplied secret file could not be read.
    #[error("Cannot read secret file {path}: {source}")]
    Read {
        /// Path given with `-S`.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The generated secret file could not be written.
    #[error("Cannot create secret file {path}: {source}")]
    Create {
        /// Path inside the working directory.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

/// Secret key material. The bytes are never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(Vec<u8>);

impl Secret {
    /// Wrap raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// An empty secret, which disables authentication.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// True when authentication is disabled.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({} bytes)", self.0.len())
    }
}

/// Where the secret comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretSource {
    /// Generate a fresh secret in the working directory.
    Generate,
    /// Read an operator-supplied file.
    File(PathBuf),
    /// Explicitly disabled (`-S ''`).
    Disabled,
}

impl SecretSource {
    /// Interpret the `-S` argument.
    pub fn from_arg(arg: Option<&Path>) -> Self {
        match arg {
            None => SecretSource::Generate,
            Some(p) if p.as_os_str().is_empty() => SecretSource::Disabled,
            Some(p) => SecretSource::File(p.to_path_buf()),
        }
    }
}

/// Owns the secret for the process lifetime and cleans up a generated file.
#[derive(Debug)]
pub struct SecretStore {
    secret: Arc<Secret>,
    generated: Option<GeneratedFile>,
}

#[derive(Debug)]
struct GeneratedFile {
    path: PathBuf,
    creator_pid: u32,
}

impl SecretStore {
    /// Obtain the secret according to `source`.
    ///
    /// An empty secret is accepted, but logs a warning because it switches
    /// authentication off for every channel.
    pub fn derive(source: &SecretSource, workdir: &Path) -> Result<Self, SecretError> {
        let store = match source {
            SecretSource::Disabled => Self {
                secret: Arc::new(Secret::empty()),
                generated: None,
            },
            SecretSource::File(path) => {
                let bytes = fs::read(path).map_err(|source| SecretError::Read {
                    path: path.clone(),
                    source,
                })?;
                debug!("Loaded {} byte secret from {:?}", bytes.len(), path);
                Self {
                    secret: Arc::new(Secret::new(bytes)),
                    generated: None,
                }
            }
            SecretSource::Generate => {
                let path = workdir.join(SECRET_FILE_NAME);
                let secret = generate(&path)?;
                info!("Generated secret file {:?}", path);
                Self {
                    secret: Arc::new(secret),
                    generated: Some(GeneratedFile {
                        path,
                        creator_pid: std::process::id(),
                    }),
                }
            }
        };

        if store.secret.is_empty() {
            warn!("Empty secret, no CLI authentication.");
        }
        Ok(store)
    }

    /// Shared handle to the secret.
    pub fn secret(&self) -> Arc<Secret> {
        Arc::clone(&self.secret)
    }

    /// Take over cleanup of a generated file in the calling process.
    ///
    /// Called after daemonizing: the file was created by the parent, but the
    /// daemon is the process that must remove it at exit.
    pub fn adopt_pid(&mut self) {
        if let Some(ref mut generated) = self.generated {
            generated.creator_pid = std::process::id();
        }
    }

    /// Path of the generated file, if this store created one.
    pub fn generated_path(&self) -> Option<&Path> {
        self.generated.as_ref().map(|g| g.path.as_path())
    }
}

impl Drop for SecretStore {
    fn drop(&mut self) {
        let Some(ref generated) = self.generated else {
            return;
        };
        // A forked child shares this memory but not the ownership.
        if std::process::id() != generated.creator_pid {
            return;
        }
        if let Err(e) = fs::remove_file(&generated.path) {
            warn!("Failed to remove secret file {:?}: {}", generated.path, e);
        } else {
            debug!("Removed secret file {:?}", generated.path);
        }
    }
}

fn generate(path: &Path) -> Result<Secret, SecretError> {
    let create_err = |source| SecretError::Create {
        path: path.to_path_buf(),
        source,
    };

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(create_err)?;
    // mode() only applies when the file is new.
    file.set_permissions(fs::Permissions::from_mode(0o600))
        .map_err(create_err)?;

    let mut bytes = vec![0u8; GENERATED_SECRET_LEN];
    OsRng.fill_bytes(&mut bytes);
    file.write_all(&bytes).map_err(create_err)?;
    file.sync_all().map_err(create_err)?;

    Ok(Secret::new(bytes))
}
