//! Bringing outside data into a repository and writing results back out.

use crate::files;
use flowcore::{ExecutorError, Repository, Value};
use std::path::PathBuf;

#[derive(Debug, PartialEq)]
pub(crate) enum Location {
    Local(PathBuf),
    Http(String),
}

impl Location {
    /// `file://` urls and bare paths are local; `http(s)://` is fetched.
    pub fn parse(url: &str) -> Result<Self, ExecutorError> {
        if let Some(path) = url.strip_prefix("file://") {
            return Ok(Location::Local(PathBuf::from(path)));
        }
        if url.starts_with("http://") || url.starts_with("https://") {
            return Ok(Location::Http(url.to_string()));
        }
        match url.split_once("://") {
            Some((scheme, _)) => Err(ExecutorError::Unsupported(format!("{} urls", scheme))),
            None if url.is_empty() => Err(ExecutorError::Invalid("empty url".to_string())),
            None => Ok(Location::Local(PathBuf::from(url))),
        }
    }
}

/// Fetch `url` into `repository` as a file, or a dir for local directories.
pub(crate) async fn fetch(
    client: &reqwest::Client,
    repository: &dyn Repository,
    url: &str,
) -> Result<Value, ExecutorError> {
    match Location::parse(url)? {
        Location::Local(path) => {
            if !tokio::fs::try_exists(&path).await? {
                return Err(ExecutorError::Invalid(format!("{}: no such file or directory", url)));
            }
            files::store_path(repository, &path).await
        }
        Location::Http(url) => {
            let response = client
                .get(&url)
                .send()
                .await
                .map_err(|e| ExecutorError::Network(e.to_string()))?;
            let status = response.status();
            if status.is_server_error() {
                return Err(ExecutorError::Unavailable(format!("GET {} returned {}", url, status)));
            }
            if !status.is_success() {
                return Err(ExecutorError::Invalid(format!("GET {} returned {}", url, status)));
            }
            let body = response
                .bytes()
                .await
                .map_err(|e| ExecutorError::Network(e.to_string()))?;
            let size = body.len() as u64;
            let id = repository.put(body).await?;
            tracing::debug!("Fetched {} ({} bytes)", url, size);
            Ok(Value::File(flowcore::FileRef::new(id, size)))
        }
    }
}

/// Write a file or dir value to `url`.
pub(crate) async fn export(repository: &dyn Repository, url: &str, value: &Value) -> Result<(), ExecutorError> {
    let path = match Location::parse(url)? {
        Location::Local(path) => path,
        Location::Http(_) => return Err(ExecutorError::Unsupported("extern to http urls".to_string())),
    };
    match value {
        Value::File(file) => files::write_file(repository, file, &path).await,
        Value::Dir(entries) => files::write_dir(repository, entries, &path).await,
        other => Err(ExecutorError::Invalid(format!("cannot extern a {}", other.kind()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_locations() {
        assert_eq!(
            Location::parse("file:///data/in.txt").unwrap(),
            Location::Local(PathBuf::from("/data/in.txt"))
        );
        assert_eq!(
            Location::parse("relative/in.txt").unwrap(),
            Location::Local(PathBuf::from("relative/in.txt"))
        );
        assert_eq!(
            Location::parse("https://example.com/x").unwrap(),
            Location::Http("https://example.com/x".to_string())
        );
        assert!(matches!(
            Location::parse("s3://bucket/key"),
            Err(ExecutorError::Unsupported(_))
        ));
    }
}
