//! Finalized boundary artifacts and how each one reaches the output store.

use std::{fmt, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream};
use object_store::{ObjectStore, PutPayload, buffered::BufWriter, path::Path};
use tokio::io::{AsyncRead, AsyncWriteExt};

use crate::error::UploadError;

/// Rewrites a destination path right before the upload, see the date partitioned writer.
pub type PathMapper<'a> = dyn Fn(&Path) -> Path + Send + Sync + 'a;

/// Files from one table uploaded concurrently by an [`UploadSet`].
const UPLOAD_SET_CONCURRENCY: usize = 5;

/// The artifact produced by closing a boundary.
///
/// An upload may be retried after a failure, implementations keep their content until
/// [`Uploadable::cleanup`] is called.
#[async_trait]
pub trait Uploadable: Send + Sync + fmt::Debug {
    /// Destination paths relative to the output store.
    fn paths(&self) -> Vec<Path>;

    /// Uploads the artifact, every destination path rewritten by `map`.
    ///
    /// Returns the paths actually written.
    async fn upload_mapped(
        &self,
        store: &Arc<dyn ObjectStore>,
        map: &PathMapper<'_>,
    ) -> Result<Vec<Path>, UploadError>;

    async fn upload(&self, store: &Arc<dyn ObjectStore>) -> Result<Vec<Path>, UploadError> {
        self.upload_mapped(store, &|path: &Path| path.clone()).await
    }

    /// Releases local resources backing the artifact, called once after a successful upload.
    async fn cleanup(&self) -> Result<(), UploadError> {
        Ok(())
    }
}

/// A boundary held entirely in memory.
#[derive(Debug)]
pub struct MemoryUpload {
    path: Path,
    data: Bytes,
}

impl MemoryUpload {
    pub fn new(path: Path, data: Bytes) -> Self {
        Self { path, data }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

#[async_trait]
impl Uploadable for MemoryUpload {
    fn paths(&self) -> Vec<Path> {
        vec![self.path.clone()]
    }

    #[tracing::instrument(skip_all, fields(path = %self.path, size = self.data.len()), err)]
    async fn upload_mapped(
        &self,
        store: &Arc<dyn ObjectStore>,
        map: &PathMapper<'_>,
    ) -> Result<Vec<Path>, UploadError> {
        let path = map(&self.path);
        store
            .put(&path, PutPayload::from(self.data.clone()))
            .await
            .map_err(|source| UploadError::Put {
                path: path.clone(),
                source,
            })?;

        Ok(vec![path])
    }
}

/// A boundary spilled to a local working file.
#[derive(Debug)]
pub struct LocalFileUpload {
    path: Path,
    local: PathBuf,
}

impl LocalFileUpload {
    pub fn new(path: Path, local: PathBuf) -> Self {
        Self { path, local }
    }
}

#[async_trait]
impl Uploadable for LocalFileUpload {
    fn paths(&self) -> Vec<Path> {
        vec![self.path.clone()]
    }

    #[tracing::instrument(skip_all, fields(path = %self.path, local = %self.local.display()), err)]
    async fn upload_mapped(
        &self,
        store: &Arc<dyn ObjectStore>,
        map: &PathMapper<'_>,
    ) -> Result<Vec<Path>, UploadError> {
        let path = map(&self.path);
        let mut file = fs_err::tokio::File::open(&self.local)
            .await
            .map_err(|source| UploadError::ReadLocal {
                path: self.local.clone(),
                source,
            })?;

        stream_into(store, &path, &mut file).await?;

        Ok(vec![path])
    }

    async fn cleanup(&self) -> Result<(), UploadError> {
        fs_err::tokio::remove_file(&self.local)
            .await
            .map_err(|source| UploadError::CleanupLocal {
                path: self.local.clone(),
                source,
            })
    }
}

/// A boundary streamed into a working object store during accumulation.
///
/// Uploading copies the working object to its destination, the working object is deleted on
/// cleanup.
#[derive(Debug)]
pub struct WorkingObjectUpload {
    path: Path,
    working_store: Arc<dyn ObjectStore>,
    working: Path,
}

impl WorkingObjectUpload {
    pub fn new(path: Path, working_store: Arc<dyn ObjectStore>, working: Path) -> Self {
        Self {
            path,
            working_store,
            working,
        }
    }
}

#[async_trait]
impl Uploadable for WorkingObjectUpload {
    fn paths(&self) -> Vec<Path> {
        vec![self.path.clone()]
    }

    #[tracing::instrument(skip_all, fields(path = %self.path, working = %self.working), err)]
    async fn upload_mapped(
        &self,
        store: &Arc<dyn ObjectStore>,
        map: &PathMapper<'_>,
    ) -> Result<Vec<Path>, UploadError> {
        let path = map(&self.path);
        let working = self
            .working_store
            .get(&self.working)
            .await
            .map_err(|source| UploadError::ReadWorking {
                path: self.working.clone(),
                source,
            })?;

        let mut writer = BufWriter::new(Arc::clone(store), path.clone());
        let mut chunks = working.into_stream();
        while let Some(chunk) = chunks.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(source) => {
                    let _ = writer.abort().await;
                    return Err(UploadError::ReadWorking {
                        path: self.working.clone(),
                        source,
                    });
                }
            };
            if let Err(source) = writer.write_all(&chunk).await {
                let _ = writer.abort().await;
                return Err(UploadError::Stream { path, source });
            }
        }
        writer
            .shutdown()
            .await
            .map_err(|source| UploadError::Stream {
                path: path.clone(),
                source,
            })?;

        Ok(vec![path])
    }

    async fn cleanup(&self) -> Result<(), UploadError> {
        self.working_store
            .delete(&self.working)
            .await
            .map_err(|source| UploadError::CleanupWorking {
                path: self.working.clone(),
                source,
            })
    }
}

/// An artifact that writes nothing, produced by the noop writer.
#[derive(Debug)]
pub struct NoopUpload {
    path: Path,
}

impl NoopUpload {
    pub fn new(path: Path) -> Self {
        Self { path }
    }
}

#[async_trait]
impl Uploadable for NoopUpload {
    fn paths(&self) -> Vec<Path> {
        vec![self.path.clone()]
    }

    async fn upload_mapped(
        &self,
        _store: &Arc<dyn ObjectStore>,
        map: &PathMapper<'_>,
    ) -> Result<Vec<Path>, UploadError> {
        let path = map(&self.path);
        tracing::debug!(path = %path, "skipping upload");
        Ok(vec![path])
    }
}

/// Several artifacts of the same boundary, one per table, uploaded concurrently.
#[derive(Debug)]
pub struct UploadSet {
    parts: Vec<Box<dyn Uploadable>>,
}

impl UploadSet {
    pub fn new(parts: Vec<Box<dyn Uploadable>>) -> Self {
        Self { parts }
    }
}

#[async_trait]
impl Uploadable for UploadSet {
    fn paths(&self) -> Vec<Path> {
        self.parts.iter().flat_map(|part| part.paths()).collect()
    }

    async fn upload_mapped(
        &self,
        store: &Arc<dyn ObjectStore>,
        map: &PathMapper<'_>,
    ) -> Result<Vec<Path>, UploadError> {
        let uploads: Vec<_> = self
            .parts
            .iter()
            .map(|part| part.upload_mapped(store, map))
            .collect();
        let written: Vec<Vec<Path>> = stream::iter(uploads)
            .buffer_unordered(UPLOAD_SET_CONCURRENCY)
            .try_collect()
            .await?;

        let mut paths: Vec<Path> = written.into_iter().flatten().collect();
        paths.sort();
        Ok(paths)
    }

    async fn cleanup(&self) -> Result<(), UploadError> {
        for part in &self.parts {
            part.cleanup().await?;
        }
        Ok(())
    }
}

/// Streams `reader` into a new object at `path`, aborting the multipart upload on failure.
async fn stream_into<R>(
    store: &Arc<dyn ObjectStore>,
    path: &Path,
    reader: &mut R,
) -> Result<(), UploadError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut writer = BufWriter::new(Arc::clone(store), path.clone());
    if let Err(source) = tokio::io::copy(reader, &mut writer).await {
        let _ = writer.abort().await;
        return Err(UploadError::Stream {
            path: path.clone(),
            source,
        });
    }

    writer
        .shutdown()
        .await
        .map_err(|source| UploadError::Stream {
            path: path.clone(),
            source,
        })
}
