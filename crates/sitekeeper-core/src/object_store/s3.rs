//! S3-compatible [`ObjectStore`] backend, via `aws-sdk-s3`. Also serves
//! MinIO and other S3-compatible endpoints when constructed with a custom
//! endpoint URL.

use std::pin::Pin;

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::primitives::ByteStream;
use tokio::io::AsyncRead;

use super::{FileInfo, Metadata, ObjectStore, ObjectStream, reject_reserved_key};
use crate::error::ObjectStoreError;

fn backend_err(reason: impl std::fmt::Display) -> ObjectStoreError {
    ObjectStoreError::Backend {
        reason: reason.to_string(),
    }
}

/// Backs the object store with an S3 (or S3-compatible) bucket.
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    #[must_use]
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get(&self, name: &str) -> Result<Option<ObjectStream>, ObjectStoreError> {
        reject_reserved_key(name)?;
        match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(name)
            .send()
            .await
        {
            Ok(resp) => {
                let metadata = resp
                    .metadata()
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .collect::<Metadata>();
                let stream = resp.body.into_async_read();
                Ok(Some(ObjectStream {
                    reader: Box::pin(stream),
                    metadata,
                }))
            }
            Err(SdkError::ServiceError(e)) if matches!(e.err(), GetObjectError::NoSuchKey(_)) => {
                Ok(None)
            }
            Err(e) => Err(backend_err(e)),
        }
    }

    async fn list(&self) -> Result<Vec<FileInfo>, ObjectStoreError> {
        let resp = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(backend_err)?;
        Ok(resp
            .contents()
            .iter()
            .filter_map(|obj| {
                let name = obj.key()?.to_owned();
                if name.starts_with(super::METADATA_SIDECAR_PREFIX) {
                    return None;
                }
                Some(FileInfo {
                    name,
                    size: obj.size().unwrap_or(0).max(0) as u64,
                })
            })
            .collect())
    }

    async fn set(
        &self,
        name: &str,
        mut reader: Pin<Box<dyn AsyncRead + Send + '_>>,
        metadata: Metadata,
    ) -> Result<(), ObjectStoreError> {
        reject_reserved_key(name)?;
        if self.get_metadata(name).await?.is_some() {
            return Err(ObjectStoreError::FileExists {
                key: name.to_owned(),
            });
        }
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut buf)
            .await
            .map_err(|e| ObjectStoreError::Io {
                reason: e.to_string(),
            })?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(name)
            .body(ByteStream::from(buf))
            .set_metadata(Some(metadata.into_iter().collect()))
            .send()
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn get_metadata(&self, name: &str) -> Result<Option<Metadata>, ObjectStoreError> {
        reject_reserved_key(name)?;
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(name)
            .send()
            .await
        {
            Ok(resp) => Ok(Some(resp.metadata().cloned().unwrap_or_default())),
            Err(SdkError::ServiceError(e)) if matches!(e.err(), HeadObjectError::NotFound(_)) => {
                Ok(None)
            }
            Err(e) => Err(backend_err(e)),
        }
    }

    async fn set_metadata(&self, name: &str, metadata: Metadata) -> Result<(), ObjectStoreError> {
        reject_reserved_key(name)?;
        // S3 has no in-place metadata update; re-upload via copy-to-self
        // with REPLACE semantics.
        let source = format!("{}/{}", self.bucket, name);
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .key(name)
            .copy_source(source)
            .metadata_directive(aws_sdk_s3::types::MetadataDirective::Replace)
            .set_metadata(Some(metadata.into_iter().collect()))
            .send()
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), ObjectStoreError> {
        reject_reserved_key(name)?;
        if self.get_metadata(name).await?.is_none() {
            return Err(ObjectStoreError::NotExist {
                key: name.to_owned(),
            });
        }
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(name)
            .send()
            .await
            .map_err(backend_err)?;
        Ok(())
    }
}
