//! MD5 verification of downloaded temps.
//!
//! Runs after the last write, off the transfer hot path. The remote
//! declares MD5 for regular files, so that is what gets computed here.

use std::path::Path;

use md5::{Digest, Md5};
use tokio::io::AsyncReadExt;

use crate::errors::SyncError;

const BUF_SIZE: usize = 64 * 1024;

/// Computes the MD5 of a file as lowercase hex.
/// Reads in chunks to keep memory use bounded; suitable for large files.
///
/// # Errors
///
/// Returns a storage-kind error if the file cannot be read.
pub async fn md5_path(path: &Path) -> Result<String, SyncError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| SyncError::storage(format!("open {}: {e}", path.display())))?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| SyncError::storage(format!("read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_md5_path_empty_file() {
        let f = tempfile::NamedTempFile::new().unwrap();
        let digest = md5_path(f.path()).await.unwrap();
        assert_eq!(digest, "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[tokio::test]
    async fn test_md5_path_known_content() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"hello\n").unwrap();
        f.flush().unwrap();
        let digest = md5_path(f.path()).await.unwrap();
        assert_eq!(digest, "b1946ac92492d2347c6235b4d2611184");
    }

    #[tokio::test]
    async fn test_md5_path_missing_file_is_storage_error() {
        let err = md5_path(Path::new("/nonexistent/nope")).await.unwrap_err();
        assert_eq!(err.kind, crate::errors::SyncErrorKind::Storage);
    }
}
