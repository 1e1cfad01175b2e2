use std::{
    io::ErrorKind,
    path::{Component, Path, PathBuf},
};

use async_trait::async_trait;
use backend::{BackendError, BackendResult, ObjectStorage};
use tokio::{fs, io::AsyncWriteExt};
use tracing::debug;

/// Buckets as directories under `root`; public URLs are `{public_base}/{bucket}/{key}`.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
    public_base: String,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>, public_base: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base: public_base.into().trim_end_matches('/').to_string(),
        }
    }

    /// Public URLs point straight at the files as `file://` URLs.
    pub fn file_urls(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let public_base = format!("file://{}", root.display());
        Self::new(root, public_base)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, bucket: &str, key: &str) -> BackendResult<PathBuf> {
        let relative = Path::new(bucket).join(key.trim_start_matches('/'));
        let escapes = relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)));
        if bucket.is_empty() || key.is_empty() || escapes {
            return Err(BackendError::InvalidQuery(format!(
                "invalid object path {bucket}/{key}"
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStore {
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        upsert: bool,
    ) -> BackendResult<()> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut options = fs::OpenOptions::new();
        options.write(true);
        if upsert {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }
        let mut file = match options.open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(BackendError::Conflict(format!(
                    "object {bucket}/{key} already exists"
                )))
            }
            Err(err) => return Err(err.into()),
        };
        file.write_all(&bytes).await?;
        file.flush().await?;
        debug!(%bucket, %key, %content_type, size = bytes.len(), "storage: object stored");
        Ok(())
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        format!(
            "{}/{bucket}/{}",
            self.public_base,
            key.trim_start_matches('/')
        )
    }

    async fn remove(&self, bucket: &str, keys: &[String]) -> BackendResult<()> {
        for key in keys {
            let path = self.object_path(bucket, key)?;
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/objects_tests.rs"]
mod tests;
