//! Local-directory [`ObjectStore`]: bundles live as plain files, metadata as
//! a sibling `.metadata.<name>` JSON file.

use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncRead;

use super::{FileInfo, Metadata, ObjectStore, ObjectStream, reject_reserved_key};
use crate::error::ObjectStoreError;

fn io_err(e: std::io::Error) -> ObjectStoreError {
    ObjectStoreError::Io {
        reason: e.to_string(),
    }
}

/// Backs the object store with a local directory on disk.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn metadata_path(&self, name: &str) -> PathBuf {
        self.root.join(format!(".metadata.{name}"))
    }

    async fn read_metadata(&self, name: &str) -> Result<Metadata, ObjectStoreError> {
        let path = self.metadata_path(name);
        match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| ObjectStoreError::Io {
                reason: format!("corrupt metadata sidecar for {name}: {e}"),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Metadata::new()),
            Err(e) => Err(io_err(e)),
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn get(&self, name: &str) -> Result<Option<ObjectStream>, ObjectStoreError> {
        reject_reserved_key(name)?;
        let path = self.object_path(name);
        match fs::File::open(&path).await {
            Ok(file) => {
                let metadata = self.read_metadata(name).await?;
                Ok(Some(ObjectStream {
                    reader: Box::pin(file),
                    metadata,
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(e)),
        }
    }

    async fn list(&self) -> Result<Vec<FileInfo>, ObjectStoreError> {
        let mut entries = fs::read_dir(&self.root).await.map_err(io_err)?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(super::METADATA_SIDECAR_PREFIX) {
                continue;
            }
            let meta = entry.metadata().await.map_err(io_err)?;
            if meta.is_file() {
                out.push(FileInfo {
                    name,
                    size: meta.len(),
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
        let path = self.object_path(name);
        if fs::metadata(&path).await.is_ok() {
            return Err(ObjectStoreError::FileExists {
                key: name.to_owned(),
            });
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let mut file = fs::File::create(&path).await.map_err(io_err)?;
        tokio::io::copy(&mut reader, &mut file).await.map_err(io_err)?;
        self.set_metadata(name, metadata).await?;
        Ok(())
    }

    async fn get_metadata(&self, name: &str) -> Result<Option<Metadata>, ObjectStoreError> {
        reject_reserved_key(name)?;
        if fs::metadata(self.object_path(name)).await.is_err() {
            return Ok(None);
        }
        Ok(Some(self.read_metadata(name).await?))
    }

    async fn set_metadata(&self, name: &str, metadata: Metadata) -> Result<(), ObjectStoreError> {
        reject_reserved_key(name)?;
        let json = serde_json::to_vec(&metadata).map_err(|e| ObjectStoreError::Io {
            reason: e.to_string(),
        })?;
        fs::write(self.metadata_path(name), json)
            .await
            .map_err(io_err)
    }

    async fn delete(&self, name: &str) -> Result<(), ObjectStoreError> {
        reject_reserved_key(name)?;
        let path = self.object_path(name);
        match fs::remove_file(&path).await {
            Ok(()) => {
                let _ = fs::remove_file(self.metadata_path(name)).await;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ObjectStoreError::NotExist {
                key: name.to_owned(),
            }),
            Err(e) => Err(io_err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn set_then_get_roundtrips_content_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let mut meta = HashMap::new();
        meta.insert("hash".to_owned(), "abc".to_owned());
        store
            .set("bundle.tar.gz", Box::pin(&b"bundle-bytes"[..]), meta.clone())
            .await
            .unwrap();

        let mut stream = store.get("bundle.tar.gz").await.unwrap().unwrap();
        let mut content = Vec::new();
        stream.reader.read_to_end(&mut content).await.unwrap();
        assert_eq!(content, b"bundle-bytes");
        assert_eq!(stream.metadata.get("hash"), Some(&"abc".to_owned()));
    }

    #[tokio::test]
    async fn set_rejects_existing_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        store
            .set("a", Box::pin(&b"1"[..]), HashMap::new())
            .await
            .unwrap();
        let err = store
            .set("a", Box::pin(&b"2"[..]), HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ObjectStoreError::FileExists { .. }));
    }

    #[tokio::test]
    async fn delete_missing_key_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        assert!(matches!(
            store.delete("missing").await,
            Err(ObjectStoreError::NotExist { .. })
        ));
    }

    #[tokio::test]
    async fn reserved_metadata_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        let err = store
            .set(".metadata.a", Box::pin(&b"x"[..]), HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ObjectStoreError::ReservedKey { .. }));
    }

    #[tokio::test]
    async fn list_excludes_metadata_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());
        store
            .set("bundle", Box::pin(&b"x"[..]), HashMap::new())
            .await
            .unwrap();
        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "bundle");
    }
}
