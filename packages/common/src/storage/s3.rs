use std::time::Duration;

use async_trait::async_trait;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::serde_types::Part;
use s3::{Bucket, Region};

use super::error::StorageError;
use super::traits::{CompletedPart, ObjectStore};

/// Connection settings for an S3-compatible bucket.
#[derive(Debug, Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for MinIO/OSS/R2. Empty means AWS.
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub path_style: bool,
}

/// Object store backed by any S3-compatible service.
pub struct S3ObjectStore {
    bucket: Box<Bucket>,
}

impl S3ObjectStore {
    pub fn new(settings: &S3Settings) -> Result<Self, StorageError> {
        let region = if settings.endpoint.is_empty() {
            settings
                .region
                .parse::<Region>()
                .map_err(|e| StorageError::Config(format!("invalid region: {e}")))?
        } else {
            Region::Custom {
                region: settings.region.clone(),
                endpoint: settings.endpoint.clone(),
            }
        };

        let credentials = Credentials::new(
            Some(&settings.access_key),
            Some(&settings.secret_key),
            None,
            None,
            None,
        )
        .map_err(|e| StorageError::Config(format!("invalid credentials: {e}")))?;

        let mut bucket = Bucket::new(&settings.bucket, region, credentials).map_err(config_err)?;
        if settings.path_style {
            bucket = bucket.with_path_style();
        }

        Ok(Self { bucket })
    }
}

fn config_err(e: S3Error) -> StorageError {
    StorageError::Config(e.to_string())
}

fn backend_err(e: S3Error) -> StorageError {
    match e {
        S3Error::Io(io) => StorageError::Io(io),
        other => StorageError::Backend(other.to_string()),
    }
}

/// rust-s3 returns non-2xx responses as data unless `fail-on-err` is enabled.
fn check_status(op: &str, key: &str, status: u16) -> Result<(), StorageError> {
    match status {
        200..=299 => Ok(()),
        404 => Err(StorageError::NotFound(key.to_string())),
        code => Err(StorageError::Backend(format!("{op} {key} returned HTTP {code}"))),
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_object(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let response = self
            .bucket
            .put_object_with_content_type(key, &data, content_type)
            .await
            .map_err(backend_err)?;
        check_status("PUT", key, response.status_code())
    }

    async fn initiate_multipart(
        &self,
        key: &str,
        content_type: &str,
    ) -> Result<String, StorageError> {
        let response = self
            .bucket
            .initiate_multipart_upload(key, content_type)
            .await
            .map_err(backend_err)?;
        Ok(response.upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Vec<u8>,
    ) -> Result<CompletedPart, StorageError> {
        let part = self
            .bucket
            .put_multipart_chunk(data, key, part_number, upload_id, "application/octet-stream")
            .await
            .map_err(backend_err)?;
        Ok(CompletedPart {
            part_number: part.part_number,
            etag: part.etag,
        })
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<(), StorageError> {
        let parts = parts
            .into_iter()
            .map(|p| Part {
                part_number: p.part_number,
                etag: p.etag,
            })
            .collect();
        let response = self
            .bucket
            .complete_multipart_upload(key, upload_id, parts)
            .await
            .map_err(backend_err)?;
        check_status("CompleteMultipartUpload", key, response.status_code())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), StorageError> {
        self.bucket
            .abort_upload(key, upload_id)
            .await
            .map_err(backend_err)
    }

    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        let response = self.bucket.delete_object(key).await.map_err(backend_err)?;
        match check_status("DELETE", key, response.status_code()) {
            Err(StorageError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    async fn presign_get(&self, key: &str, expires: Duration) -> Result<String, StorageError> {
        let secs = u32::try_from(expires.as_secs())
            .map_err(|_| StorageError::Config("presign expiry too large".into()))?;
        self.bucket
            .presign_get(key, secs, None)
            .await
            .map_err(backend_err)
    }
}
