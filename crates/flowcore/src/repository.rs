use crate::{Digest, FileRef, RepositoryError};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Content-addressed store of immutable objects.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Fetch the object with the given digest.
    async fn get(&self, id: &Digest) -> Result<Bytes, RepositoryError>;

    /// Store an object, returning its digest. Storing existing content is a no-op.
    async fn put(&self, data: Bytes) -> Result<Digest, RepositoryError>;

    /// Size of a stored object; `NotFound` when absent.
    async fn stat(&self, id: &Digest) -> Result<FileRef, RepositoryError>;

    /// Whether the object exists.
    async fn contains(&self, id: &Digest) -> Result<bool, RepositoryError> {
        match self.stat(id).await {
            Ok(_) => Ok(true),
            Err(RepositoryError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Mapping from a key digest (a node's identity) to a value digest (the
/// repository object holding its serialized result).
#[async_trait]
pub trait Assoc: Send + Sync {
    async fn get(&self, key: &Digest) -> Result<Option<Digest>, RepositoryError>;

    async fn put(&self, key: Digest, value: Digest) -> Result<(), RepositoryError>;
}

/// Copy `files` from `src` into `dst`, skipping objects `dst` already has.
pub async fn transfer(
    files: &[FileRef],
    src: &Arc<dyn Repository>,
    dst: &Arc<dyn Repository>,
) -> Result<usize, RepositoryError> {
    if Arc::ptr_eq(src, dst) {
        return Ok(0);
    }
    let mut copied = 0;
    for file in files {
        if dst.contains(&file.id).await? {
            continue;
        }
        let data = src.get(&file.id).await?;
        let id = dst.put(data).await?;
        if id != file.id {
            return Err(RepositoryError::Corrupt {
                expected: file.id,
                actual: id,
            });
        }
        copied += 1;
    }
    if copied > 0 {
        tracing::debug!("transferred {} object(s) between repositories", copied);
    }
    Ok(copied)
}
