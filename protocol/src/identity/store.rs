//! # Key Store
//!
//! Loads a node identity from disk, or creates and persists one on first
//! use. Identities are addressed by a key reference (`private_key.<port>`),
//! so restarting a node on the same port yields the same `PeerId`.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::identity::keys::{KeyError, NodeIdentity};

/// Directory-backed identity storage.
#[derive(Debug, Clone)]
pub struct KeyStore {
    root: PathBuf,
}

impl KeyStore {
    /// Opens a key store rooted at `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the key file for `key_ref`.
    pub fn path_for(&self, key_ref: &str) -> PathBuf {
        self.root.join(key_ref)
    }

    /// Returns the identity stored under `key_ref`, generating and persisting
    /// a new one if none exists yet.
    ///
    /// # Errors
    ///
    /// - [`KeyError::Corrupt`] if the file exists but does not hold a valid
    ///   RSA PKCS#8 key. We never overwrite it in that case: a corrupt key
    ///   file needs a human, not a silent identity change.
    /// - [`KeyError::Io`] if the file or directory cannot be read or written.
    pub fn load_or_create(&self, key_ref: &str) -> Result<NodeIdentity, KeyError> {
        let path = self.path_for(key_ref);

        match fs::read_to_string(&path) {
            Ok(pem) => {
                let identity = NodeIdentity::from_pkcs8_pem(&pem)?;
                debug!(path = %path.display(), peer_id = %identity.peer_id(), "loaded node key");
                Ok(identity)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let identity = NodeIdentity::generate()?;
                self.persist(&path, &identity)?;
                info!(path = %path.display(), peer_id = %identity.peer_id(), "generated node key");
                Ok(identity)
            }
            Err(e) => Err(io_error(&path, e)),
        }
    }

    fn persist(&self, path: &Path, identity: &NodeIdentity) -> Result<(), KeyError> {
        fs::create_dir_all(&self.root).map_err(|e| io_error(&self.root, e))?;

        let pem = identity.to_pkcs8_pem()?;
        let mut file = open_key_file(path).map_err(|e| io_error(path, e))?;
        file.write_all(pem.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|e| io_error(path, e))
    }
}

/// Creates the key file, failing if it already exists. On Unix the mode is
/// set at creation, so the key is never readable by anyone but the owner.
fn open_key_file(path: &Path) -> std::io::Result<fs::File> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

fn io_error(path: &Path, source: std::io::Error) -> KeyError {
    KeyError::Io {
        path: path.display().to_string(),
        source,
    }
}
