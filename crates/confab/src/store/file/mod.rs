//! File-based storage implementations.
//!
//! - Engine state blobs (conversation state, init caches) are raw binary files
//! - The assignment table is a single YAML document
//!
//! All writes use atomic operations (temp file + rename) to prevent corruption.

mod assignment;
mod init_cache;
mod session;

use std::path::Path;

use tokio::fs;

use super::error::{StorageError, StorageResult};

pub use assignment::FileAssignmentStore;
pub use init_cache::FileInitCacheStore;
pub use session::FileSessionStateStore;

/// Write `bytes` to `path` via a sibling temp file and rename.
async fn write_atomic(path: &Path, bytes: &[u8]) -> StorageResult<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .await
            .map_err(|e| StorageError::file_io(dir, e))?;
    }

    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = Path::new(&temp_name);

    fs::write(temp_path, bytes)
        .await
        .map_err(|e| StorageError::file_io(temp_path, e))?;

    fs::rename(temp_path, path)
        .await
        .map_err(|e| StorageError::file_io(path, e))
}

/// Read a file, mapping "not found" to `None`.
async fn read_optional(path: &Path) -> StorageResult<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::file_io(path, e)),
    }
}
