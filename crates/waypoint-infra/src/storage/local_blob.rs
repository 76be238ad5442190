//! Local filesystem blob store.
//!
//! Implements the `BlobStore` trait from `waypoint-core` with blobs stored
//! as plain files under a root directory. Blob paths are relative,
//! `/`-separated and may not escape the root.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use futures_util::StreamExt;
use tokio_util::io::ReaderStream;
use waypoint_core::storage::blob_store::{BlobStore, BlobWriter, ByteStream};
use waypoint_types::error::BlobError;

pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a blob path to a location under the root.
    ///
    /// Rejects empty, absolute and `..` paths.
    pub fn resolve(&self, blob_path: &str) -> Result<PathBuf, BlobError> {
        if blob_path.trim().is_empty() || blob_path.contains('\\') {
            return Err(BlobError::InvalidPath(blob_path.to_string()));
        }

        let relative = Path::new(blob_path);
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(BlobError::InvalidPath(blob_path.to_string()));
        }

        Ok(self.root.join(relative))
    }

    /// A missing root means the backing volume is not mounted.
    async fn ensure_root(&self) -> Result<(), BlobError> {
        match tokio::fs::try_exists(&self.root).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(BlobError::Unavailable(format!(
                "blob root {} does not exist",
                self.root.display()
            ))),
            Err(e) => Err(BlobError::Unavailable(e.to_string())),
        }
    }
}

fn io_error(blob_path: &str, err: std::io::Error) -> BlobError {
    match err.kind() {
        ErrorKind::NotFound => BlobError::NotFound(blob_path.to_string()),
        _ => BlobError::Io(format!("{blob_path}: {err}")),
    }
}

impl BlobStore for LocalBlobStore {
    async fn exists(&self, path: &str) -> Result<bool, BlobError> {
        let full = self.resolve(path)?;
        self.ensure_root().await?;
        match tokio::fs::metadata(&full).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(path, e)),
        }
    }

    async fn get_stream(&self, path: &str) -> Result<ByteStream, BlobError> {
        let full = self.resolve(path)?;
        self.ensure_root().await?;
        let file = tokio::fs::File::open(&full)
            .await
            .map_err(|e| io_error(path, e))?;

        let blob_path = path.to_string();
        let stream = ReaderStream::new(file)
            .map(move |chunk| chunk.map_err(|e| io_error(&blob_path, e)));
        Ok(Box::pin(stream))
    }

    async fn upload_stream(&self, path: &str) -> Result<BlobWriter, BlobError> {
        let full = self.resolve(path)?;
        self.ensure_root().await?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(path, e))?;
        }

        let file = tokio::fs::File::create(&full)
            .await
            .map_err(|e| io_error(path, e))?;
        Ok(Box::new(file.into_std().await))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn rejects_escaping_paths() {
        let store = LocalBlobStore::new("/data");
        assert!(store.resolve("a/b.txt").is_ok());
        for bad in ["", "../etc/passwd", "/abs", "a/../../b", "a\\b"] {
            assert!(
                matches!(store.resolve(bad), Err(BlobError::InvalidPath(_))),
                "{bad} accepted"
            );
        }
    }

    #[tokio::test]
    async fn write_then_stream_back() {
        let tmp = TempDir::new().unwrap();
        let store = LocalBlobStore::new(tmp.path());

        let mut writer = store.upload_stream("nested/dir/blob.bin").await.unwrap();
        writer.write_all(b"hello blob").unwrap();
        writer.flush().unwrap();
        drop(writer);

        assert!(store.exists("nested/dir/blob.bin").await.unwrap());
        assert!(!store.exists("nested/dir/other.bin").await.unwrap());

        let mut stream = store.get_stream("nested/dir/blob.bin").await.unwrap();
        let mut read = Vec::new();
        while let Some(chunk) = stream.next().await {
            read.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(read, b"hello blob");
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = LocalBlobStore::new(tmp.path());
        let err = store.get_stream("nope.txt").await.err().unwrap();
        assert!(matches!(err, BlobError::NotFound(_)));
    }

    #[tokio::test]
    async fn missing_root_is_unavailable() {
        let tmp = TempDir::new().unwrap();
        let store = LocalBlobStore::new(tmp.path().join("unmounted"));
        let err = store.upload_stream("out.zip").await.err().unwrap();
        assert!(err.is_unavailable());
    }
}
