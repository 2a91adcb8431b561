use std::{
    io::{self, Write},
    path::Path,
};

use tracing::{debug, warn};

use crate::types::Credentials;

/// Durable home of the credential snapshot for one app registration.
pub trait CredentialStore: Send + Sync {
    /// Read the snapshot at `path`. Missing or unreadable files yield `None`.
    fn load(&self, path: &Path) -> Option<Credentials>;

    /// Replace the snapshot at `path`. Readers see either the old or the new
    /// file, never a partial one.
    fn save(&self, path: &Path, credentials: &Credentials) -> io::Result<()>;

    /// Remove the snapshot. A missing file is not an error.
    fn clear(&self, path: &Path) -> io::Result<()>;
}

/// JSON file store with write-to-temp-then-rename saves.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileCredentialStore;

impl FileCredentialStore {
    pub fn new() -> Self {
        Self
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self, path: &Path) -> Option<Credentials> {
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "credential cache unreadable, ignoring");
                return None;
            },
        };
        match serde_json::from_str::<Credentials>(&data) {
            Ok(credentials) => Some(credentials),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "credential cache corrupt, ignoring");
                None
            },
        }
    }

    fn save(&self, path: &Path, credentials: &Credentials) -> io::Result<()> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let data = serde_json::to_vec_pretty(credentials).map_err(io::Error::other)?;

        // Must share a filesystem with `path` for the rename to be atomic.
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;

        debug!(path = %path.display(), "saved credentials");
        Ok(())
    }

    fn clear(&self, path: &Path) -> io::Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
