//! Storage abstractions.
//!
//! Traits describe what the core needs from persistent storage; `file` holds
//! the filesystem implementations used by the binary.

mod assignment;
mod error;
pub mod file;
mod init_cache;
mod session;

pub use assignment::{AssignmentStore, ChannelAssignment};
pub use error::{StorageError, StorageResult};
pub use init_cache::{InitCacheKey, InitCacheStore};
pub use session::SessionStateStore;

/// Whether `key` can be used as a single path component.
pub(crate) fn is_safe_key(key: &str) -> bool {
    !key.is_empty()
        && key != "."
        && key != ".."
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
