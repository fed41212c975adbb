//! Azure Blob Storage [`ObjectStore`] backend, via `azure_storage_blobs`.

use std::pin::Pin;

use async_trait::async_trait;
use azure_storage_blobs::prelude::ContainerClient;
use futures::StreamExt;
use tokio::io::AsyncRead;

use super::{FileInfo, Metadata, ObjectStore, ObjectStream, reject_reserved_key};
use crate::error::ObjectStoreError;

fn backend_err(reason: impl std::fmt::Display) -> ObjectStoreError {
    ObjectStoreError::Backend {
        reason: reason.to_string(),
    }
}

/// Backs the object store with an Azure Blob Storage container.
pub struct AzureBlobObjectStore {
    container: ContainerClient,
}

impl AzureBlobObjectStore {
    #[must_use]
    pub fn new(container: ContainerClient) -> Self {
        Self { container }
    }
}

#[async_trait]
impl ObjectStore for AzureBlobObjectStore {
    async fn get(&self, name: &str) -> Result<Option<ObjectStream>, ObjectStoreError> {
        reject_reserved_key(name)?;
        let blob = self.container.blob_client(name);
        if !blob.exists().await.map_err(backend_err)? {
            return Ok(None);
        }
        let properties = blob.get_properties().await.map_err(backend_err)?;
        let metadata: Metadata = properties
            .blob
            .metadata
            .map(|m| m.into_iter().collect())
            .unwrap_or_default();

        let body = blob.get_content().await.map_err(backend_err)?;
        let reader = std::io::Cursor::new(body);
        Ok(Some(ObjectStream {
            reader: Box::pin(reader),
            metadata,
        }))
    }

    async fn list(&self) -> Result<Vec<FileInfo>, ObjectStoreError> {
        let mut stream = self.container.list_blobs().into_stream();
        let mut out = Vec::new();
        while let Some(page) = stream.next().await {
            let page = page.map_err(backend_err)?;
            for blob in page.blobs.blobs() {
                if blob.name.starts_with(super::METADATA_SIDECAR_PREFIX) {
                    continue;
                }
                out.push(FileInfo {
                    name: blob.name.clone(),
                    size: blob.properties.content_length,
                });
            }
        }
        Ok(out)
    }

    async fn set(
        &self,
        name: &str,
        mut reader: Pin<Box<dyn AsyncRead + Send + '_>>,
        metadata: Metadata,
    ) -> Result<(), ObjectStoreError> {
        reject_reserved_key(name)?;
        let blob = self.container.blob_client(name);
        if blob.exists().await.map_err(backend_err)? {
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
        blob.put_block_blob(buf)
            .metadata(azure_storage_blobs::prelude::Metadata::from_iter(metadata))
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn get_metadata(&self, name: &str) -> Result<Option<Metadata>, ObjectStoreError> {
        reject_reserved_key(name)?;
        let blob = self.container.blob_client(name);
        if !blob.exists().await.map_err(backend_err)? {
            return Ok(None);
        }
        let properties = blob.get_properties().await.map_err(backend_err)?;
        Ok(Some(
            properties.blob.metadata.unwrap_or_default().into_iter().collect(),
        ))
    }

    async fn set_metadata(&self, name: &str, metadata: Metadata) -> Result<(), ObjectStoreError> {
        reject_reserved_key(name)?;
        let blob = self.container.blob_client(name);
        blob.set_metadata(azure_storage_blobs::prelude::Metadata::from_iter(metadata))
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), ObjectStoreError> {
        reject_reserved_key(name)?;
        let blob = self.container.blob_client(name);
        if !blob.exists().await.map_err(backend_err)? {
            return Err(ObjectStoreError::NotExist {
                key: name.to_owned(),
            });
        }
        blob.delete().await.map_err(backend_err)?;
        Ok(())
    }
}
