//! Filesystem-backed object store for single-node deployments and tests.
//! Writes land in `<path>.part` and are renamed into place on commit, so a
//! present file is always a committed object. Presigning is unsupported.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use super::{ByteStream, ObjectMeta, ObjectStore, StoreError, StoreWriter};
use crate::constants::COPY_CHUNK_SIZE;

pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        if key.is_empty() || key.split('/').any(|s| s.is_empty() || s == "." || s == "..") {
            return Err(StoreError::Other(format!("invalid object key {key:?}")));
        }
        Ok(self.root.join(key))
    }
}

fn meta_from_fs(meta: &std::fs::Metadata) -> ObjectMeta {
    ObjectMeta {
        size: meta.len(),
        last_modified: meta.modified().ok(),
        etag: None,
    }
}

fn map_io(key: &str, err: io::Error) -> StoreError {
    if err.kind() == io::ErrorKind::NotFound {
        StoreError::NotFound(key.to_string())
    } else {
        StoreError::Io(err)
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn stat(&self, key: &str) -> Result<ObjectMeta, StoreError> {
        let path = self.object_path(key)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|err| map_io(key, err))?;
        if meta.is_dir() {
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(meta_from_fs(&meta))
    }

    async fn reader(&self, key: &str) -> Result<(ByteStream, ObjectMeta), StoreError> {
        let path = self.object_path(key)?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|err| map_io(key, err))?;
        let meta = file.metadata().await.map_err(|err| map_io(key, err))?;
        if meta.is_dir() {
            return Err(StoreError::NotFound(key.to_string()));
        }
        let stream = ReaderStream::with_capacity(file, COPY_CHUNK_SIZE).boxed();
        Ok((stream, meta_from_fs(&meta)))
    }

    async fn writer(&self, key: &str) -> Result<Box<dyn StoreWriter>, StoreError> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = part_path(&path);
        let file = tokio::fs::File::create(&tmp).await?;
        Ok(Box::new(LocalWriter {
            file: Some(file),
            tmp,
            dst: path,
            finished: false,
        }))
    }

    fn sign_get(&self, _key: &str, _expires: Duration) -> Result<String, StoreError> {
        Err(StoreError::SignUnsupported)
    }

    fn sign_head(&self, _key: &str, _expires: Duration) -> Result<String, StoreError> {
        Err(StoreError::SignUnsupported)
    }
}

fn part_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".part");
    PathBuf::from(os)
}

struct LocalWriter {
    file: Option<tokio::fs::File>,
    tmp: PathBuf,
    dst: PathBuf,
    finished: bool,
}

#[async_trait]
impl StoreWriter for LocalWriter {
    async fn write(&mut self, chunk: Bytes) -> Result<(), StoreError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StoreError::Other("write after commit or cancel".to_string()))?;
        file.write_all(&chunk).await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| StoreError::Other("commit after commit or cancel".to_string()))?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&self.tmp, &self.dst).await?;
        self.finished = true;
        Ok(())
    }

    async fn cancel(&mut self) -> Result<(), StoreError> {
        self.file.take();
        self.finished = true;
        match tokio::fs::remove_file(&self.tmp).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for LocalWriter {
    fn drop(&mut self) {
        if !self.finished {
            let _ = std::fs::remove_file(&self.tmp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    async fn collect(stream: ByteStream) -> Vec<u8> {
        stream
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
            .expect("collect stream")
    }

    #[tokio::test]
    async fn write_commit_read_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalStore::new(dir.path());

        assert!(matches!(
            store.stat("example.com/a.bin").await,
            Err(StoreError::NotFound(_))
        ));

        let mut writer = store.writer("example.com/a.bin").await.expect("writer");
        writer.write(Bytes::from_static(b"hello ")).await.expect("write");
        writer.write(Bytes::from_static(b"world")).await.expect("write");

        // Nothing visible before commit.
        assert!(store.stat("example.com/a.bin").await.is_err());

        writer.commit().await.expect("commit");
        let meta = store.stat("example.com/a.bin").await.expect("stat");
        assert_eq!(meta.size, 11);

        let (stream, meta) = store.reader("example.com/a.bin").await.expect("reader");
        assert_eq!(meta.size, 11);
        assert_eq!(collect(stream).await, b"hello world");
    }

    #[tokio::test]
    async fn cancel_leaves_no_object() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalStore::new(dir.path());

        let mut writer = store.writer("example.com/b.bin").await.expect("writer");
        writer.write(Bytes::from_static(b"partial")).await.expect("write");
        writer.cancel().await.expect("cancel");

        assert!(store.stat("example.com/b.bin").await.is_err());
        // The .part staging file must be gone as well.
        assert!(!dir.path().join("example.com/b.bin.part").exists());
    }

    #[tokio::test]
    async fn rejects_traversal_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalStore::new(dir.path());
        assert!(store.stat("../escape").await.is_err());
        assert!(store.writer("a//b").await.is_err());
    }
}
