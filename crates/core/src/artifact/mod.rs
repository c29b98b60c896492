//! Artifact storage: the retained store for source videos and final outputs,
//! and job-scoped scratch space for intermediates.

mod checksum;
mod error;
mod fs_store;
mod scratch;
mod traits;

pub use checksum::sha256_file;
pub use error::StorageError;
pub use fs_store::FsArtifactStore;
pub use scratch::ScratchSpace;
pub use traits::{ArtifactStore, PutMode, StoredObject};
