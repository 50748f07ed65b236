use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::{fs::File, io::AsyncReadExt};

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("failed to open key file {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read key file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Flat-file list of API keys, one per line.
///
/// Nothing is cached: every call to [`KeyStore::list_keys`] reads the file
/// again, so edits take effect on the next request.
#[derive(Clone, Debug)]
pub struct KeyStore {
    path: PathBuf,
}

impl KeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn list_keys(&self) -> Result<Vec<String>, KeyStoreError> {
        list_keys(&self.path).await
    }

    pub async fn contains(&self, key: &str) -> Result<bool, KeyStoreError> {
        Ok(self.list_keys().await?.iter().any(|k| k == key))
    }
}

pub async fn list_keys(path: &Path) -> Result<Vec<String>, KeyStoreError> {
    let mut file = File::open(path).await.map_err(|source| KeyStoreError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let mut raw = Vec::new();
    file.read_to_end(&mut raw)
        .await
        .map_err(|source| KeyStoreError::Read {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(parse_keys(&String::from_utf8_lossy(&raw)))
}

/// Keeps lines that are non-empty and free of whitespace, in file order.
#[must_use]
pub fn parse_keys(content: &str) -> Vec<String> {
    content
        .lines()
        .filter(|line| is_valid_key(line))
        .map(str::to_string)
        .collect()
}

fn is_valid_key(line: &str) -> bool {
    !line.is_empty() && !line.chars().any(char::is_whitespace)
}
