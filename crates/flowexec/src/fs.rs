//! Repository and assoc stored under a local directory.
//!
//! Layout:
//!
//! ```text
//! <root>/objects/<hex digest>   object contents
//! <root>/assoc/<hex key>        hex digest of the value object
//! <root>/tmp/                   staging area for atomic writes
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use flowcore::{Assoc, Digest, FileRef, Repository, RepositoryError};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

fn prepare(root: &Path, dirs: &[&str]) -> Result<(), RepositoryError> {
    for dir in dirs {
        std::fs::create_dir_all(root.join(dir))?;
    }
    Ok(())
}

/// Write `data` to `dest` through a temporary file in `staging`, so readers
/// never observe a partial object.
async fn write_atomic(staging: PathBuf, dest: PathBuf, data: Bytes) -> Result<(), RepositoryError> {
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&staging)?;
        tmp.write_all(&data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&dest).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| RepositoryError::Io(e.to_string()))??;
    Ok(())
}

/// Content-addressed object store on the local filesystem.
#[derive(Debug, Clone)]
pub struct FileRepository {
    root: PathBuf,
}

impl FileRepository {
    /// Open (creating if needed) a repository rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, RepositoryError> {
        let root = root.into();
        prepare(&root, &["objects", "tmp"])?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, id: &Digest) -> PathBuf {
        self.root.join("objects").join(id.to_string())
    }
}

#[async_trait]
impl Repository for FileRepository {
    async fn get(&self, id: &Digest) -> Result<Bytes, RepositoryError> {
        let data = match tokio::fs::read(self.object_path(id)).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(RepositoryError::NotFound(*id)),
            Err(e) => return Err(e.into()),
        };
        let actual = Digest::of_bytes(&data);
        if actual != *id {
            tracing::error!("Object {} is corrupt (contents hash to {})", id.short(), actual.short());
            return Err(RepositoryError::Corrupt { expected: *id, actual });
        }
        Ok(Bytes::from(data))
    }

    async fn put(&self, data: Bytes) -> Result<Digest, RepositoryError> {
        let id = Digest::of_bytes(&data);
        let dest = self.object_path(&id);
        if tokio::fs::try_exists(&dest).await? {
            return Ok(id);
        }
        write_atomic(self.root.join("tmp"), dest, data).await?;
        tracing::trace!("Stored object {}", id.short());
        Ok(id)
    }

    async fn stat(&self, id: &Digest) -> Result<FileRef, RepositoryError> {
        match tokio::fs::metadata(self.object_path(id)).await {
            Ok(meta) => Ok(FileRef::new(*id, meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(RepositoryError::NotFound(*id)),
            Err(e) => Err(e.into()),
        }
    }
}

/// Key to value-digest mapping on the local filesystem.
#[derive(Debug, Clone)]
pub struct FileAssoc {
    root: PathBuf,
}

impl FileAssoc {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, RepositoryError> {
        let root = root.into();
        prepare(&root, &["assoc", "tmp"])?;
        Ok(Self { root })
    }

    fn entry_path(&self, key: &Digest) -> PathBuf {
        self.root.join("assoc").join(key.to_string())
    }
}

#[async_trait]
impl Assoc for FileAssoc {
    async fn get(&self, key: &Digest) -> Result<Option<Digest>, RepositoryError> {
        let text = match tokio::fs::read_to_string(self.entry_path(key)).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match text.trim().parse() {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                // Unreadable entries behave as misses; the next store overwrites them.
                tracing::warn!("Ignoring malformed assoc entry {}: {}", key.short(), e);
                Ok(None)
            }
        }
    }

    async fn put(&self, key: Digest, value: Digest) -> Result<(), RepositoryError> {
        write_atomic(
            self.root.join("tmp"),
            self.entry_path(&key),
            Bytes::from(value.to_string()),
        )
        .await
    }
}
