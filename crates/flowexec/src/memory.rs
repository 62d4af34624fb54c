use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use flowcore::{Assoc, Digest, FileRef, Repository, RepositoryError};

/// Repository held in process memory. Contents are lost on exit.
#[derive(Default)]
pub struct MemoryRepository {
    objects: DashMap<Digest, Bytes>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn get(&self, id: &Digest) -> Result<Bytes, RepositoryError> {
        self.objects
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or(RepositoryError::NotFound(*id))
    }

    async fn put(&self, data: Bytes) -> Result<Digest, RepositoryError> {
        let id = Digest::of_bytes(&data);
        self.objects.entry(id).or_insert(data);
        Ok(id)
    }

    async fn stat(&self, id: &Digest) -> Result<FileRef, RepositoryError> {
        self.objects
            .get(id)
            .map(|entry| FileRef::new(*id, entry.value().len() as u64))
            .ok_or(RepositoryError::NotFound(*id))
    }
}

#[derive(Default)]
pub struct MemoryAssoc {
    entries: DashMap<Digest, Digest>,
}

impl MemoryAssoc {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Assoc for MemoryAssoc {
    async fn get(&self, key: &Digest) -> Result<Option<Digest>, RepositoryError> {
        Ok(self.entries.get(key).map(|entry| *entry.value()))
    }

    async fn put(&self, key: Digest, value: Digest) -> Result<(), RepositoryError> {
        self.entries.insert(key, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_is_content_addressed() {
        let repo = MemoryRepository::new();
        let a = repo.put(Bytes::from_static(b"hello")).await.unwrap();
        let b = repo.put(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(repo.len(), 1);
        assert_eq!(repo.stat(&a).await.unwrap().size, 5);
        assert_eq!(repo.get(&a).await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_missing_object() {
        let repo = MemoryRepository::new();
        let id = Digest::of_bytes(b"absent");
        assert_eq!(repo.get(&id).await.unwrap_err(), RepositoryError::NotFound(id));
        assert!(!repo.contains(&id).await.unwrap());
    }
}
