use crate::error::{CommonError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

pub fn to_pretty_vec<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(value)?)
}

pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = tokio::fs::read(path).await.map_err(|source| CommonError::File {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_slice(&content)?)
}

/// Replaces `path` with `contents` through a sibling temp file and a rename,
/// so readers see either the old or the new file, never a partial one.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp_path = temp_path(path);
    let file_error = |source| CommonError::File {
        path: tmp_path.clone(),
        source,
    };

    let mut file = tokio::fs::File::create(&tmp_path).await.map_err(file_error)?;
    file.write_all(contents).await.map_err(file_error)?;
    file.sync_all().await.map_err(file_error)?;
    drop(file);

    if let Err(source) = tokio::fs::rename(&tmp_path, path).await {
        if let Err(e) = tokio::fs::remove_file(&tmp_path).await {
            debug!("Failed to remove {}: {}", tmp_path.display(), e);
        }
        return Err(CommonError::File {
            path: path.to_path_buf(),
            source,
        });
    }
    trace!("Wrote {} bytes to {}", contents.len(), path.display());
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("state"));
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        count: u64,
    }

    #[tokio::test]
    async fn write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.json");
        let sample = Sample {
            name: "relay".to_string(),
            count: 42,
        };

        write_atomic(&path, &to_pretty_vec(&sample).unwrap())
            .await
            .unwrap();
        let loaded: Sample = read_json(&path).await.unwrap();

        assert_eq!(loaded, sample);
        assert!(!dir.path().join("sample.json.tmp").exists());
    }

    #[tokio::test]
    async fn write_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.json");
        std::fs::write(&path, b"old contents that are longer than the new ones").unwrap();

        write_atomic(&path, b"{}").await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"{}");
    }

    #[tokio::test]
    async fn failed_rename_cleans_up_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taken");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("inner"), b"x").unwrap();

        let err = write_atomic(&path, b"{}").await.unwrap_err();
        assert!(matches!(err, CommonError::File { .. }));
        assert!(!dir.path().join("taken.tmp").exists());
    }

    #[tokio::test]
    async fn read_missing_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");

        let err = read_json::<Sample>(&path).await.unwrap_err();
        assert!(matches!(err, CommonError::File { .. }));
        assert!(err.to_string().contains("missing.json"));
    }

    #[tokio::test]
    async fn read_garbage_is_a_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.json");
        std::fs::write(&path, b"not json").unwrap();

        let err = read_json::<Sample>(&path).await.unwrap_err();
        assert!(matches!(err, CommonError::Serialization(_)));
    }
}
