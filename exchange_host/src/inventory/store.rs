use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

/// JSON snapshot persistence for one denomination map.
///
/// The on-disk shape is a flat object of stringified denominations to
/// integer counts. Writes go to a temporary sibling first and replace the
/// canonical file with a rename, so a crash mid-write never leaves a
/// truncated snapshot behind.
#[derive(Debug)]
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonStore { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the snapshot, or `None` when no file exists yet.
    pub fn load(&self) -> io::Result<Option<BTreeMap<u32, u32>>> {
        match fs::read(&self.path) {
            Ok(bytes) => {
                let counts: BTreeMap<u32, u32> = serde_json::from_slice(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                debug!(path = %self.path.display(), entries = counts.len(), "snapshot loaded");
                Ok(Some(counts))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Writes the snapshot atomically.
    pub fn persist(&self, counts: &BTreeMap<u32, u32>) -> io::Result<()> {
        let tmp = self.tmp_path();
        let bytes = serde_json::to_vec_pretty(counts)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "snapshot persisted");
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }
}
