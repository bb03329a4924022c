mod error;
mod hash;
mod traits;

pub mod filesystem;
#[cfg(feature = "object-storage")]
pub mod s3;

pub use error::StorageError;
pub use hash::{ContentHash, hash_file};
pub use traits::{BoxReader, CompletedPart, ObjectStore};

/// Build a fresh object key for an upload: a random UUID plus the original extension.
pub fn new_object_key(original_name: &str) -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4(),
        crate::ingest::extension_of(original_name)
    )
}
