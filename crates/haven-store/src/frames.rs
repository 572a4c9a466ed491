use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::instrument;

use crate::error::StoreError;

/// Content-addressed byte store for camera frames.
///
/// Frames are written under `<root>/frames/<aa>/<hash>.jpg` where `aa` is the
/// first hash byte; save returns the path relative to the root so log rows
/// stay valid if the root moves.
pub struct FrameStore {
    root: PathBuf,
}

impl FrameStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Hex digest of the frame bytes; also the MotionMemory sequence key.
    pub fn content_hash(bytes: &[u8]) -> String {
        let digest = Sha256::digest(bytes);
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn relative_path(hash: &str) -> String {
        format!("frames/{}/{}.jpg", &hash[..2], hash)
    }

    /// Persist frame bytes; returns the relative path. Idempotent for
    /// identical content.
    #[instrument(skip(self, bytes), fields(len = bytes.len()))]
    pub fn save(&self, bytes: &[u8]) -> Result<String, StoreError> {
        let hash = Self::content_hash(bytes);
        let rel = Self::relative_path(&hash);
        let full = self.root.join(&rel);

        if full.exists() {
            return Ok(rel);
        }
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Io(format!("create dir: {e}")))?;
        }
        std::fs::write(&full, bytes).map_err(|e| StoreError::Io(format!("write frame: {e}")))?;
        Ok(rel)
    }

    pub fn load(&self, relative: &str) -> Result<Vec<u8>, StoreError> {
        std::fs::read(self.root.join(relative))
            .map_err(|e| StoreError::Io(format!("read frame {relative}: {e}")))
    }

    /// Delete by relative path. Missing files are a no-op.
    #[instrument(skip(self))]
    pub fn delete(&self, relative: &str) -> Result<(), StoreError> {
        match std::fs::remove_file(self.root.join(relative)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(format!("delete frame {relative}: {e}"))),
        }
    }
}
