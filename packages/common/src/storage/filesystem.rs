use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::error::StorageError;
use super::traits::{CompletedPart, ObjectStore};

/// Filesystem-backed object store for development and single-node deployments.
///
/// Objects live in a sharded layout: `{base_path}/{first 2 chars of key}/{key}`.
/// Multipart sessions are staged under `{base_path}/.uploads/{upload_id}/` and
/// concatenated on completion. Presigned URLs point at `public_base_url`, which
/// is expected to be served by something that checks the `expires` parameter.
pub struct FilesystemObjectStore {
    base_path: PathBuf,
    public_base_url: String,
}

impl FilesystemObjectStore {
    /// Create a new filesystem object store.
    pub async fn new(
        base_path: PathBuf,
        public_base_url: impl Into<String>,
    ) -> Result<Self, StorageError> {
        fs::create_dir_all(&base_path).await?;
        fs::create_dir_all(base_path.join(".tmp")).await?;
        fs::create_dir_all(base_path.join(".uploads")).await?;
        Ok(Self {
            base_path,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Compute the filesystem path for an object key.
    fn object_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        let shard: String = key.chars().take(2).collect();
        Ok(self.base_path.join(shard).join(key))
    }

    fn session_dir(&self, upload_id: &str) -> Result<PathBuf, StorageError> {
        validate_key(upload_id)?;
        Ok(self.base_path.join(".uploads").join(upload_id))
    }

    /// Path for a temporary file during writes.
    fn temp_path(&self) -> PathBuf {
        self.base_path
            .join(".tmp")
            .join(uuid::Uuid::new_v4().to_string())
    }

    /// Move a finished temp file into place.
    async fn commit_temp(&self, temp_path: PathBuf, key: &str) -> Result<(), StorageError> {
        let object_path = self.object_path(key)?;
        if let Some(parent) = object_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        if let Err(e) = fs::rename(&temp_path, &object_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }
}

fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() || key.starts_with('.') || key.contains(['/', '\\']) {
        return Err(StorageError::Backend(format!("invalid object key: {key:?}")));
    }
    Ok(())
}

fn part_file_name(part_number: u32) -> String {
    format!("{part_number:05}.part")
}

#[async_trait]
impl ObjectStore for FilesystemObjectStore {
    async fn put_object(
        &self,
        key: &str,
        data: Vec<u8>,
        _content_type: &str,
    ) -> Result<(), StorageError> {
        validate_key(key)?;
        let temp_path = self.temp_path();
        if let Err(e) = fs::write(&temp_path, &data).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        self.commit_temp(temp_path, key).await
    }

    async fn initiate_multipart(
        &self,
        key: &str,
        _content_type: &str,
    ) -> Result<String, StorageError> {
        validate_key(key)?;
        let upload_id = uuid::Uuid::new_v4().to_string();
        let dir = self.session_dir(&upload_id)?;
        fs::create_dir_all(&dir).await?;
        fs::write(dir.join("key"), key.as_bytes()).await?;
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _key: &str,
        upload_id: &str,
        part_number: u32,
        data: Vec<u8>,
    ) -> Result<CompletedPart, StorageError> {
        let dir = self.session_dir(upload_id)?;
        if !fs::try_exists(&dir).await? {
            return Err(StorageError::NotFound(format!("upload session {upload_id}")));
        }
        let etag = hex::encode(Sha256::digest(&data));
        fs::write(dir.join(part_file_name(part_number)), &data).await?;
        Ok(CompletedPart { part_number, etag })
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<(), StorageError> {
        let dir = self.session_dir(upload_id)?;
        if parts.is_empty() {
            return Err(StorageError::Backend("multipart completion needs at least one part".into()));
        }
        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(StorageError::Backend("parts must be in ascending order".into()));
        }

        let temp_path = self.temp_path();
        let mut out = fs::File::create(&temp_path).await?;
        for part in &parts {
            let data = match fs::read(dir.join(part_file_name(part.part_number))).await {
                Ok(data) => data,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    drop(out);
                    let _ = fs::remove_file(&temp_path).await;
                    return Err(StorageError::Backend(format!(
                        "part {} was never uploaded",
                        part.part_number
                    )));
                }
                Err(e) => return Err(e.into()),
            };
            if hex::encode(Sha256::digest(&data)) != part.etag {
                drop(out);
                let _ = fs::remove_file(&temp_path).await;
                return Err(StorageError::Backend(format!(
                    "etag mismatch for part {}",
                    part.part_number
                )));
            }
            out.write_all(&data).await?;
        }
        out.flush().await?;
        drop(out);

        self.commit_temp(temp_path, key).await?;
        let _ = fs::remove_dir_all(&dir).await;
        Ok(())
    }

    async fn abort_multipart(&self, _key: &str, upload_id: &str) -> Result<(), StorageError> {
        let dir = self.session_dir(upload_id)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        let object_path = self.object_path(key)?;
        match fs::remove_file(&object_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn presign_get(&self, key: &str, expires: Duration) -> Result<String, StorageError> {
        validate_key(key)?;
        let expires_at = chrono::Utc::now().timestamp() + expires.as_secs() as i64;
        Ok(format!(
            "{}/{}?expires={}",
            self.public_base_url, key, expires_at
        ))
    }
}
