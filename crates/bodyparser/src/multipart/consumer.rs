//! Part consumers decide where the bytes of a file part go.
//!
//! A consumer receives a [`Part`] stream and returns a [`PartMeta`] describing
//! what it did with it. Closures can be turned into consumers with
//! [`consumer_fn`], and [`TmpFileConsumer`] writes parts to temp files.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::TmpFileName;
use crate::error::BodyParserError;
use crate::multipart::part::Part;

/// What a consumer did with a part, absorbed into the file record on success.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PartMeta {
    /// Where the part was written on local disk, required by `move_to`.
    pub tmp_path: Option<PathBuf>,
    pub meta: serde_json::Value,
}

impl PartMeta {
    pub fn from_tmp_path(tmp_path: PathBuf) -> Self {
        Self { tmp_path: Some(tmp_path), meta: serde_json::Value::Null }
    }

    #[must_use]
    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = meta;
        self
    }
}

#[async_trait]
pub trait PartConsumer: Send + Sync {
    async fn consume(&self, part: Part) -> Result<PartMeta, BodyParserError>;
}

#[async_trait]
impl<C: PartConsumer + ?Sized> PartConsumer for Arc<C> {
    async fn consume(&self, part: Part) -> Result<PartMeta, BodyParserError> {
        (**self).consume(part).await
    }
}

#[derive(Debug)]
pub struct ConsumerFn<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> PartConsumer for ConsumerFn<F>
where
    F: Fn(Part) -> Fut + Send + Sync,
    Fut: Future<Output = Result<PartMeta, BodyParserError>> + Send,
{
    async fn consume(&self, part: Part) -> Result<PartMeta, BodyParserError> {
        (self.f)(part).await
    }
}

pub fn consumer_fn<F, Fut>(f: F) -> ConsumerFn<F>
where
    F: Fn(Part) -> Fut + Send + Sync,
    Fut: Future<Output = Result<PartMeta, BodyParserError>> + Send,
{
    ConsumerFn { f }
}

/// Streams each part into its own file under a temp directory.
#[derive(Debug, Clone)]
pub struct TmpFileConsumer {
    dir: PathBuf,
    file_name: Option<TmpFileName>,
}

impl TmpFileConsumer {
    pub fn new(dir: Option<PathBuf>, file_name: Option<TmpFileName>) -> Self {
        Self { dir: dir.unwrap_or_else(std::env::temp_dir), file_name }
    }

    fn next_path(&self) -> PathBuf {
        let name = match &self.file_name {
            Some(file_name) => file_name.generate(),
            None => Uuid::new_v4().to_string(),
        };
        self.dir.join(name)
    }

    /// The file is only created once the first chunk, or the end of the part, has arrived.
    async fn write(path: &Path, mut part: Part) -> Result<(), BodyParserError> {
        let first = part.next().await.transpose()?;

        tokio::fs::create_dir_all(path.parent().unwrap_or(path)).await?;
        let mut file = File::create(path).await?;
        if let Some(chunk) = first {
            file.write_all(&chunk).await?;
        }
        while let Some(chunk) = part.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok(())
    }
}

impl Default for TmpFileConsumer {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[async_trait]
impl PartConsumer for TmpFileConsumer {
    async fn consume(&self, part: Part) -> Result<PartMeta, BodyParserError> {
        let path = self.next_path();
        debug!(field_name = part.name(), tmp_path = %path.display(), "writing part to temp file");

        // also covers the consumer being dropped when processing fails
        let mut partial = RemoveOnDrop { path: &path, armed: true };
        Self::write(&path, part).await?;
        partial.armed = false;

        Ok(PartMeta::from_tmp_path(path.clone()))
    }
}

/// Removes a partially written temp file unless disarmed.
struct RemoveOnDrop<'a> {
    path: &'a Path,
    armed: bool,
}

impl Drop for RemoveOnDrop<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = std::fs::remove_file(self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(tmp_path = %self.path.display(), "failed to remove partial temp file, {}", e);
        }
    }
}
