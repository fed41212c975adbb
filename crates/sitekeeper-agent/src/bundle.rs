//! Bundle fetch, verification, and extraction:
//! `workerStageApp -> StageApp -> FetchBundle` in one module. Streams from
//! the object store into `cache/<bundle>` via a tee reader that computes
//! SHA-256 in flight, checks the `hash`/`signature`/`type` metadata, then
//! extracts the archive into `apps/<bundle>`.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rsa::{BigUint, Pkcs1v15Sign, RsaPublicKey};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use sitekeeper_core::error::SyncError;
use sitekeeper_core::object_store::{Metadata, ObjectStore, META_HASH, META_SIGNATURE, META_TYPE};

use crate::state::AgentState;

/// Fetches `bundle` from the object store into `cache/<bundle>`, verifies
/// it, and extracts it into `apps/<bundle>`. On any verification failure
/// the cache file is removed and an error returned; the caller marks the
/// affected site unhealthy rather than aborting the whole sync.
pub async fn stage_app(state: &AgentState, bundle: &str) -> Result<(), SyncError> {
    let app_root = &state.config.core.app_root;
    let cache_path = PathBuf::from(app_root).join("cache").join(bundle);

    let Some(object) = state.object_store.get(bundle).await? else {
        return Err(SyncError::StageApp {
            bundle: bundle.to_owned(),
            reason: "bundle not found in object store".to_owned(),
        });
    };

    let computed_hash = stream_to_cache(object.reader, &cache_path).await?;

    if let Err(e) = verify_metadata(state, bundle, &object.metadata, &computed_hash).await {
        let _ = tokio::fs::remove_file(&cache_path).await;
        return Err(e);
    }

    let format = object.metadata.get(META_TYPE).cloned().unwrap_or_default();
    let type_marker = PathBuf::from(app_root).join("cache").join(format!(".type.{bundle}"));
    tokio::fs::write(&type_marker, &format)
        .await
        .map_err(|e| io_err(&type_marker, e))?;

    let dest = PathBuf::from(app_root).join("apps").join(bundle);
    extract_archive(&cache_path, &dest, &format).await?;

    Ok(())
}

async fn stream_to_cache(
    mut reader: std::pin::Pin<Box<dyn tokio::io::AsyncRead + Send>>,
    cache_path: &Path,
) -> Result<[u8; 32], SyncError> {
    if let Some(parent) = cache_path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| io_err(parent, e))?;
    }
    let mut file = tokio::fs::File::create(cache_path)
        .await
        .map_err(|e| io_err(cache_path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0_u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).await.map_err(|e| io_err(cache_path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n]).await.map_err(|e| io_err(cache_path, e))?;
    }
    file.flush().await.map_err(|e| io_err(cache_path, e))?;
    Ok(hasher.finalize().into())
}

async fn verify_metadata(
    state: &AgentState,
    bundle: &str,
    metadata: &Metadata,
    computed_hash: &[u8; 32],
) -> Result<(), SyncError> {
    if let Some(expected_b64) = metadata.get(META_HASH) {
        let expected = BASE64.decode(expected_b64).map_err(|_| SyncError::HashMismatch {
            bundle: bundle.to_owned(),
        })?;
        if expected != computed_hash.as_slice() {
            return Err(SyncError::HashMismatch {
                bundle: bundle.to_owned(),
            });
        }
    }

    let signature_b64 = metadata.get(META_SIGNATURE);
    let codesign_key = state.codesign_key.read().await.clone();

    match (signature_b64, &codesign_key) {
        (None, Some(_)) => {
            return Err(SyncError::MissingSignature {
                bundle: bundle.to_owned(),
            })
        }
        (Some(sig_b64), Some((n, e))) => {
            let signature = BASE64.decode(sig_b64).map_err(|_| SyncError::SignatureMismatch {
                bundle: bundle.to_owned(),
            })?;
            verify_signature(n, e, computed_hash, &signature).map_err(|()| {
                SyncError::SignatureMismatch {
                    bundle: bundle.to_owned(),
                }
            })?;
        }
        (None, None) | (Some(_), None) => {}
    }
    Ok(())
}

fn verify_signature(n: &[u8], e: &[u8], hashed: &[u8], signature: &[u8]) -> Result<(), ()> {
    let key = RsaPublicKey::new(BigUint::from_bytes_be(n), BigUint::from_bytes_be(e))
        .map_err(|_| ())?;
    key.verify(Pkcs1v15Sign::new::<Sha256>(), hashed, signature)
        .map_err(|_| ())?;
    Ok(())
}

fn io_err(path: &Path, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Extracts `archive_path` into `dest`, collapsing a single top-level
/// directory one level and rejecting entries that would escape `dest`.
async fn extract_archive(archive_path: &Path, dest: &Path, format: &str) -> Result<(), SyncError> {
    let archive_path = archive_path.to_owned();
    let dest = dest.to_owned();
    let format = format.to_owned();
    tokio::task::spawn_blocking(move || extract_archive_blocking(&archive_path, &dest, &format))
        .await
        .map_err(|e| SyncError::StageApp {
            bundle: dest_name(&dest),
            reason: e.to_string(),
        })?
}

fn dest_name(dest: &Path) -> String {
    dest.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
}

fn extract_archive_blocking(archive_path: &Path, dest: &Path, format: &str) -> Result<(), SyncError> {
    if dest.exists() {
        std::fs::remove_dir_all(dest).map_err(|e| io_err(dest, e))?;
    }
    std::fs::create_dir_all(dest).map_err(|e| io_err(dest, e))?;

    let staging = dest.with_extension("staging");
    if staging.exists() {
        std::fs::remove_dir_all(&staging).map_err(|e| io_err(&staging, e))?;
    }
    std::fs::create_dir_all(&staging).map_err(|e| io_err(&staging, e))?;

    match format {
        "tar.gz" | "tgz" => extract_tar(archive_path, &staging, |f| {
            Box::new(flate2::read::GzDecoder::new(f))
        })?,
        "tar.bz2" | "tbz2" => extract_tar(archive_path, &staging, |f| {
            Box::new(bzip2::read::BzDecoder::new(f))
        })?,
        "tar.xz" | "txz" => extract_tar(archive_path, &staging, |f| {
            Box::new(xz2::read::XzDecoder::new(f))
        })?,
        "tar.lz4" => extract_tar(archive_path, &staging, |f| {
            Box::new(lz4_flex::frame::FrameDecoder::new(f))
        })?,
        "tar.sz" => extract_tar(archive_path, &staging, |f| Box::new(snap::read::FrameDecoder::new(f)))?,
        "tar" => extract_tar(archive_path, &staging, |f| Box::new(f))?,
        "zip" => extract_zip(archive_path, &staging)?,
        "rar" => {
            return Err(SyncError::UnsupportedArchive {
                format: "rar".to_owned(),
            })
        }
        other => {
            return Err(SyncError::UnsupportedArchive {
                format: other.to_owned(),
            })
        }
    }

    collapse_single_top_level(&staging, dest)?;
    let _ = std::fs::remove_dir_all(&staging);
    Ok(())
}

fn extract_tar(
    archive_path: &Path,
    dest: &Path,
    decoder: impl FnOnce(std::fs::File) -> Box<dyn std::io::Read>,
) -> Result<(), SyncError> {
    let file = std::fs::File::open(archive_path).map_err(|e| io_err(archive_path, e))?;
    let reader = decoder(file);
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries().map_err(|e| io_err(archive_path, e))? {
        let mut entry = entry.map_err(|e| io_err(archive_path, e))?;
        let path = entry.path().map_err(|e| io_err(archive_path, e))?.into_owned();
        reject_escaping_entry(&path)?;
        entry.unpack_in(dest).map_err(|e| io_err(dest, e))?;
    }
    Ok(())
}

fn extract_zip(archive_path: &Path, dest: &Path) -> Result<(), SyncError> {
    let file = std::fs::File::open(archive_path).map_err(|e| io_err(archive_path, e))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| SyncError::StageApp {
        bundle: dest_name(dest),
        reason: e.to_string(),
    })?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| SyncError::StageApp {
            bundle: dest_name(dest),
            reason: e.to_string(),
        })?;
        let Some(entry_path) = entry.enclosed_name() else {
            return Err(SyncError::ZipSlip {
                entry: entry.name().to_owned(),
            });
        };
        reject_escaping_entry(&entry_path)?;
        let out_path = dest.join(&entry_path);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path).map_err(|e| io_err(&out_path, e))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        let mut out_file = std::fs::File::create(&out_path).map_err(|e| io_err(&out_path, e))?;
        std::io::copy(&mut entry, &mut out_file).map_err(|e| io_err(&out_path, e))?;
    }
    Ok(())
}

/// Rejects archive entries whose path contains a `..` component that would
/// let them resolve outside the extraction root (the zip-slip guard).
fn reject_escaping_entry(entry_path: &Path) -> Result<(), SyncError> {
    if entry_path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(SyncError::ZipSlip {
            entry: entry_path.display().to_string(),
        });
    }
    Ok(())
}

/// If the extracted tree has exactly one top-level entry and it is a
/// directory, moves its contents up one level.
fn collapse_single_top_level(staging: &Path, dest: &Path) -> Result<(), SyncError> {
    let mut entries: Vec<_> = std::fs::read_dir(staging)
        .map_err(|e| io_err(staging, e))?
        .filter_map(Result::ok)
        .collect();

    let source_root = if entries.len() == 1 && entries[0].path().is_dir() {
        entries.remove(0).path()
    } else {
        staging.to_owned()
    };

    for entry in std::fs::read_dir(&source_root).map_err(|e| io_err(&source_root, e))? {
        let entry = entry.map_err(|e| io_err(&source_root, e))?;
        let target = dest.join(entry.file_name());
        std::fs::rename(entry.path(), &target).map_err(|e| io_err(&target, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_parent_dir_traversal() {
        let err = reject_escaping_entry(Path::new("../../etc/passwd"));
        assert!(matches!(err, Err(SyncError::ZipSlip { .. })));
    }

    #[test]
    fn accepts_ordinary_relative_path() {
        assert!(reject_escaping_entry(Path::new("static/index.html")).is_ok());
    }
}
