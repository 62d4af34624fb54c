use bytes::Bytes;
use flowcore::{Assoc, Digest, Repository, RepositoryError};
use flowexec::{FileAssoc, FileRepository};

#[tokio::test]
async fn test_file_repository_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let repo = FileRepository::open(dir.path()).unwrap();

    let id = repo.put(Bytes::from_static(b"line one\nline two\n")).await.unwrap();
    assert_eq!(id, Digest::of_bytes(b"line one\nline two\n"));
    assert!(dir.path().join("objects").join(id.to_string()).is_file());
    assert_eq!(repo.stat(&id).await.unwrap().size, 18);
    assert_eq!(repo.get(&id).await.unwrap(), Bytes::from_static(b"line one\nline two\n"));

    // Reopening sees the same objects.
    let reopened = FileRepository::open(dir.path()).unwrap();
    assert!(reopened.contains(&id).await.unwrap());
}

#[tokio::test]
async fn test_file_repository_detects_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let repo = FileRepository::open(dir.path()).unwrap();
    let id = repo.put(Bytes::from_static(b"original")).await.unwrap();
    std::fs::write(dir.path().join("objects").join(id.to_string()), b"tampered").unwrap();

    match repo.get(&id).await {
        Err(RepositoryError::Corrupt { expected, actual }) => {
            assert_eq!(expected, id);
            assert_eq!(actual, Digest::of_bytes(b"tampered"));
        }
        other => panic!("expected corruption, got {:?}", other),
    }
}

#[tokio::test]
async fn test_file_repository_missing_object() {
    let dir = tempfile::tempdir().unwrap();
    let repo = FileRepository::open(dir.path()).unwrap();
    let id = Digest::of_bytes(b"never stored");
    assert_eq!(repo.get(&id).await.unwrap_err(), RepositoryError::NotFound(id));
    assert_eq!(repo.stat(&id).await.unwrap_err(), RepositoryError::NotFound(id));
}

#[tokio::test]
async fn test_file_assoc_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let assoc = FileAssoc::open(dir.path()).unwrap();
    let key = Digest::of_bytes(b"key");
    let value = Digest::of_bytes(b"value");

    assert_eq!(assoc.get(&key).await.unwrap(), None);
    assoc.put(key, value).await.unwrap();
    assert_eq!(assoc.get(&key).await.unwrap(), Some(value));

    // A garbled entry reads as a miss.
    std::fs::write(dir.path().join("assoc").join(key.to_string()), "garbage").unwrap();
    assert_eq!(assoc.get(&key).await.unwrap(), None);
}
