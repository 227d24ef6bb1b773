use std::io;
use std::path::Path;
use std::path::PathBuf;

use uuid::Uuid;

/// Process-wide directory that holds every instance's control socket.
///
/// Created empty when the registry starts and removed when it stops. Must not
/// be shared with another supervisor on the same host.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        remove_dir_if_present(&path)?;
        std::fs::create_dir_all(&path)?;
        tracing::debug!(path = %path.display(), "created control socket directory");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns a fresh control address inside the directory. Addresses are
    /// never reused.
    pub fn allocate(&self) -> PathBuf {
        self.path.join(Uuid::new_v4().to_string())
    }

    pub fn remove(&self) {
        if let Err(err) = remove_dir_if_present(&self.path) {
            tracing::warn!(path = %self.path.display(), "failed to remove control socket directory: {err}");
        }
    }
}

fn remove_dir_if_present(path: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Removes a single control address, tolerating its absence.
pub(crate) fn remove_socket_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(path = %path.display(), "failed to remove control socket: {err}");
        }
    }
}
