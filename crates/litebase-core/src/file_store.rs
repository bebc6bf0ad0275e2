//! Shared file store abstraction.
//!
//! All coordination state (lease, nomination record, primary pointer,
//! presence markers, cluster config) lives in small files reached through
//! the [`FileSystem`] trait. The store only guarantees atomic single-file
//! writes, so callers read back anything they need to trust.
//!
//! [`LocalFileSystem`] backs the trait with a directory, which may itself be
//! a network mount shared by every node.

use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use litebase_proto::error::{LbError, LbResult};
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, error};

/// Metadata returned by [`FileSystem::stat`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub size: u64,
    pub is_dir: bool,
    /// Last modification time (unix ms), 0 if unavailable.
    pub modified_ms: u64,
}

/// Trait that all shared file store backends must implement.
///
/// Paths are relative to the store root and use `/` separators.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Return metadata, or `LbError::NotFound`.
    async fn stat(&self, path: &str) -> LbResult<FileInfo>;

    /// Read a whole file.
    async fn read_file(&self, path: &str) -> LbResult<Vec<u8>>;

    /// Atomically replace a file, creating parent directories as needed.
    async fn write_file(&self, path: &str, data: &[u8]) -> LbResult<()>;

    /// Open a file for appending (created if absent) and append `data`.
    async fn append_file(&self, path: &str, data: &[u8]) -> LbResult<()>;

    /// Write `data` at `offset`, creating the file if absent.
    async fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> LbResult<()>;

    /// Truncate (or extend with zeros) an existing file to `size` bytes.
    async fn truncate(&self, path: &str, size: u64) -> LbResult<()>;

    /// Remove a file, or `LbError::NotFound`.
    async fn remove(&self, path: &str) -> LbResult<()>;

    /// List the entry names of a directory.
    async fn read_dir(&self, path: &str) -> LbResult<Vec<String>>;

    /// Create a directory and all missing parents.
    async fn mkdir_all(&self, path: &str) -> LbResult<()>;
}

/// File store rooted at a local (or mounted) directory.
pub struct LocalFileSystem {
    root: PathBuf,
}

impl LocalFileSystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative store path, refusing anything that escapes the root.
    fn resolve(&self, path: &str) -> LbResult<PathBuf> {
        let rel = Path::new(path.trim_start_matches('/'));
        for component in rel.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => return Err(LbError::InvalidParms),
            }
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn stat(&self, path: &str) -> LbResult<FileInfo> {
        let full = self.resolve(path)?;
        let meta = fs::metadata(&full).await?;
        let modified_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Ok(FileInfo {
            size: meta.len(),
            is_dir: meta.is_dir(),
            modified_ms,
        })
    }

    async fn read_file(&self, path: &str) -> LbResult<Vec<u8>> {
        let full = self.resolve(path)?;
        Ok(fs::read(&full).await?)
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> LbResult<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write to a sibling temp file and rename over the target.
        let file_name = full
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or(LbError::InvalidParms)?;
        let tmp = full.with_file_name(format!(".{}.{:016x}.tmp", file_name, rand::random::<u64>()));

        let write = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            fs::rename(&tmp, &full).await?;
            Ok::<_, std::io::Error>(())
        }
        .await;

        if let Err(e) = write {
            error!("file store: failed to write {}: {}", full.display(), e);
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!("file store: wrote {} ({} bytes)", path, data.len());
        Ok(())
    }

    async fn append_file(&self, path: &str, data: &[u8]) -> LbResult<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&full)
            .await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> LbResult<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&full)
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn truncate(&self, path: &str, size: u64) -> LbResult<()> {
        let full = self.resolve(path)?;
        let file = fs::OpenOptions::new().write(true).open(&full).await?;
        file.set_len(size).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn remove(&self, path: &str) -> LbResult<()> {
        let full = self.resolve(path)?;
        fs::remove_file(&full).await?;
        debug!("file store: removed {}", path);
        Ok(())
    }

    async fn read_dir(&self, path: &str) -> LbResult<Vec<String>> {
        let full = self.resolve(path)?;
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&full).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                // Skip in-flight atomic writes.
                if name.starts_with('.') && name.ends_with(".tmp") {
                    continue;
                }
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn mkdir_all(&self, path: &str) -> LbResult<()> {
        let full = self.resolve(path)?;
        fs::create_dir_all(&full).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_read_remove() {
        let dir = TempDir::new().unwrap();
        let store = LocalFileSystem::new(dir.path());

        store.write_file("_cluster/query/LEASE", b"12345").await.unwrap();
        assert_eq!(store.read_file("_cluster/query/LEASE").await.unwrap(), b"12345");

        let info = store.stat("_cluster/query/LEASE").await.unwrap();
        assert_eq!(info.size, 5);
        assert!(!info.is_dir);

        store.remove("_cluster/query/LEASE").await.unwrap();
        assert_eq!(
            store.read_file("_cluster/query/LEASE").await,
            Err(LbError::NotFound)
        );
        assert_eq!(store.remove("_cluster/query/LEASE").await, Err(LbError::NotFound));
    }

    #[tokio::test]
    async fn test_write_replaces_content() {
        let dir = TempDir::new().unwrap();
        let store = LocalFileSystem::new(dir.path());

        store.write_file("PRIMARY", b"10.0.0.1:8080").await.unwrap();
        store.write_file("PRIMARY", b"10.0.0.2:8080").await.unwrap();
        assert_eq!(store.read_file("PRIMARY").await.unwrap(), b"10.0.0.2:8080");
        // No temp files left behind.
        assert_eq!(store.read_dir("").await.unwrap(), vec!["PRIMARY".to_string()]);
    }

    #[tokio::test]
    async fn test_append_creates_and_extends() {
        let dir = TempDir::new().unwrap();
        let store = LocalFileSystem::new(dir.path());

        store.append_file("a/NOMINATION", b"one\n").await.unwrap();
        store.append_file("a/NOMINATION", b"two\n").await.unwrap();
        assert_eq!(store.read_file("a/NOMINATION").await.unwrap(), b"one\ntwo\n");
    }

    #[tokio::test]
    async fn test_write_at_and_truncate() {
        let dir = TempDir::new().unwrap();
        let store = LocalFileSystem::new(dir.path());

        store.write_at("db/main/wal/100", 0, b"aaaa").await.unwrap();
        store.write_at("db/main/wal/100", 2, b"bbbb").await.unwrap();
        assert_eq!(store.read_file("db/main/wal/100").await.unwrap(), b"aabbbb");

        store.truncate("db/main/wal/100", 3).await.unwrap();
        assert_eq!(store.read_file("db/main/wal/100").await.unwrap(), b"aab");
        assert_eq!(store.truncate("db/main/wal/200", 0).await, Err(LbError::NotFound));
    }

    #[tokio::test]
    async fn test_read_dir_and_mkdir() {
        let dir = TempDir::new().unwrap();
        let store = LocalFileSystem::new(dir.path());

        store.mkdir_all("_nodes/storage").await.unwrap();
        assert!(store.read_dir("_nodes/storage").await.unwrap().is_empty());

        store.write_file("_nodes/storage/b_1", b"").await.unwrap();
        store.write_file("_nodes/storage/a_1", b"").await.unwrap();
        assert_eq!(
            store.read_dir("_nodes/storage").await.unwrap(),
            vec!["a_1".to_string(), "b_1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let dir = TempDir::new().unwrap();
        let store = LocalFileSystem::new(dir.path());
        assert_eq!(store.read_file("../etc/passwd").await, Err(LbError::InvalidParms));
    }
}
