//! Moving repository objects to and from local paths.

use flowcore::{ExecutorError, FileRef, Repository, Value};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Resolve a dir entry name below `base`, refusing names that escape it.
pub(crate) fn entry_path(base: &Path, name: &str) -> Result<PathBuf, ExecutorError> {
    let relative = Path::new(name);
    let plain = !name.is_empty() && relative.components().all(|c| matches!(c, Component::Normal(_)));
    if !plain {
        return Err(ExecutorError::Invalid(format!("illegal dir entry name {:?}", name)));
    }
    Ok(base.join(relative))
}

pub(crate) async fn store_file(repository: &dyn Repository, path: &Path) -> Result<FileRef, ExecutorError> {
    let data = tokio::fs::read(path).await?;
    let size = data.len() as u64;
    let id = repository.put(data.into()).await?;
    Ok(FileRef::new(id, size))
}

/// Store every regular file below `dir`, keyed by its `/`-separated relative path.
pub(crate) async fn store_dir(
    repository: &dyn Repository,
    dir: &Path,
) -> Result<BTreeMap<String, FileRef>, ExecutorError> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| ExecutorError::Io(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| ExecutorError::Io(e.to_string()))?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        paths.push((name, entry.path().to_path_buf()));
    }
    let mut entries = BTreeMap::new();
    for (name, path) in paths {
        entries.insert(name, store_file(repository, &path).await?);
    }
    Ok(entries)
}

/// Store a file or directory found at `path`.
pub(crate) async fn store_path(repository: &dyn Repository, path: &Path) -> Result<Value, ExecutorError> {
    let meta = tokio::fs::metadata(path).await?;
    if meta.is_dir() {
        Ok(Value::Dir(store_dir(repository, path).await?))
    } else {
        Ok(Value::File(store_file(repository, path).await?))
    }
}

pub(crate) async fn write_file(repository: &dyn Repository, file: &FileRef, path: &Path) -> Result<(), ExecutorError> {
    let data = repository.get(&file.id).await?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, &data).await?;
    Ok(())
}

pub(crate) async fn write_dir(
    repository: &dyn Repository,
    entries: &BTreeMap<String, FileRef>,
    dir: &Path,
) -> Result<(), ExecutorError> {
    tokio::fs::create_dir_all(dir).await?;
    for (name, file) in entries {
        write_file(repository, file, &entry_path(dir, name)?).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_path_stays_inside_base() {
        let base = Path::new("/work");
        assert_eq!(entry_path(base, "a/b.txt").unwrap(), PathBuf::from("/work/a/b.txt"));
        assert!(entry_path(base, "../etc/passwd").is_err());
        assert!(entry_path(base, "/etc/passwd").is_err());
        assert!(entry_path(base, "").is_err());
    }
}
