//! Image byte sources.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{ImageRef, SourceError};

/// Resolves an [`ImageRef`] to raw bytes. Any failure here is an input
/// error: the pipeline never starts.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn load(&self, image: &ImageRef) -> Result<Arc<[u8]>, SourceError>;
}

/// Reads `ImageRef::Location` as a filesystem path, optionally relative to a
/// root directory. Inline bytes pass through after the same size checks.
#[derive(Debug, Clone)]
pub struct FsImageSource {
    root: Option<PathBuf>,
    max_bytes: u64,
}

impl FsImageSource {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            root: None,
            max_bytes,
        }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    fn resolve(&self, location: &str) -> PathBuf {
        match &self.root {
            Some(root) => root.join(location),
            None => PathBuf::from(location),
        }
    }

    fn check_size(&self, what: &str, size: u64) -> Result<(), SourceError> {
        if size == 0 {
            return Err(SourceError::Empty(what.to_string()));
        }
        if size > self.max_bytes {
            return Err(SourceError::TooLarge {
                size,
                limit: self.max_bytes,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ImageSource for FsImageSource {
    async fn load(&self, image: &ImageRef) -> Result<Arc<[u8]>, SourceError> {
        match image {
            ImageRef::Inline(bytes) => {
                self.check_size("inline image", bytes.len() as u64)?;
                Ok(Arc::clone(bytes))
            }
            ImageRef::Location(location) => {
                let path = self.resolve(location);
                let meta = tokio::fs::metadata(&path).await.map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        SourceError::NotFound(path.display().to_string())
                    } else {
                        SourceError::Io(e)
                    }
                })?;
                if !meta.is_file() {
                    return Err(SourceError::Unsupported("non-file"));
                }
                let label = path.display().to_string();
                self.check_size(&label, meta.len())?;

                let bytes = tokio::fs::read(&path).await?;
                // The file may have changed between stat and read.
                self.check_size(&label, bytes.len() as u64)?;
                tracing::debug!(path = %path.display(), bytes = bytes.len(), "image loaded");
                Ok(Arc::from(bytes))
            }
        }
    }
}
