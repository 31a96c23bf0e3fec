use std::path::PathBuf;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use object_store::path::Path;
use tokio::io::AsyncWriteExt;

use super::{FileType, Writer, check_close};
use crate::{
    error::WriterError,
    range::BlockRange,
    uploadable::{LocalFileUpload, MemoryUpload, Uploadable},
};

/// Keeps the boundary in memory until it grows past `max_size`, then spills it to a local
/// working file.
pub struct BufferedWriter {
    file_type: FileType,
    working_dir: PathBuf,
    max_size: usize,
    active: Option<Boundary>,
}

struct Boundary {
    range: BlockRange,
    buffer: BytesMut,
    file: Option<(PathBuf, fs_err::tokio::File)>,
}

impl BufferedWriter {
    pub fn new(file_type: FileType, working_dir: impl Into<PathBuf>, max_size: usize) -> Self {
        Self {
            file_type,
            working_dir: working_dir.into(),
            max_size,
            active: None,
        }
    }

    async fn spill(
        working_dir: &std::path::Path,
        file_type: FileType,
        boundary: &mut Boundary,
    ) -> Result<(), WriterError> {
        let path = working_dir.join(boundary.range.working_file_name(file_type.extension()));
        fs_err::tokio::create_dir_all(working_dir)
            .await
            .map_err(|source| WriterError::CreateWorkingFile {
                path: path.clone(),
                source,
            })?;
        let mut file = fs_err::tokio::File::create(&path).await.map_err(|source| {
            WriterError::CreateWorkingFile {
                path: path.clone(),
                source,
            }
        })?;

        tracing::debug!(
            range = %boundary.range,
            path = %path.display(),
            buffered = boundary.buffer.len(),
            "spilling boundary to working file"
        );

        let buffered = boundary.buffer.split().freeze();
        file.write_all(&buffered)
            .await
            .map_err(|source| WriterError::LocalWrite {
                path: path.clone(),
                source,
            })?;
        boundary.file = Some((path, file));

        Ok(())
    }
}

#[async_trait]
impl Writer for BufferedWriter {
    fn file_type(&self) -> FileType {
        self.file_type
    }

    async fn start_boundary(&mut self, range: BlockRange) -> Result<(), WriterError> {
        if let Some(active) = &self.active {
            return Err(WriterError::AlreadyActive {
                active: active.range,
            });
        }
        self.active = Some(Boundary {
            range,
            buffer: BytesMut::new(),
            file: None,
        });
        Ok(())
    }

    async fn write(&mut self, data: Bytes) -> Result<(), WriterError> {
        let boundary = self.active.as_mut().ok_or(WriterError::NoActiveBoundary)?;

        if boundary.file.is_none() && boundary.buffer.len() + data.len() > self.max_size {
            Self::spill(&self.working_dir, self.file_type, boundary).await?;
        }

        match &mut boundary.file {
            Some((path, file)) => {
                file.write_all(&data)
                    .await
                    .map_err(|source| WriterError::LocalWrite {
                        path: path.clone(),
                        source,
                    })?;
            }
            None => boundary.buffer.extend_from_slice(&data),
        }

        Ok(())
    }

    async fn close_boundary(
        &mut self,
        range: BlockRange,
    ) -> Result<Box<dyn Uploadable>, WriterError> {
        let active = self.active.as_ref().ok_or(WriterError::NoActiveBoundary)?;
        check_close(active.range, range)?;
        let boundary = self.active.take().ok_or(WriterError::NoActiveBoundary)?;

        let path = Path::from(range.file_name(self.file_type.extension()));
        match boundary.file {
            Some((local, mut file)) => {
                file.flush()
                    .await
                    .map_err(|source| WriterError::LocalWrite {
                        path: local.clone(),
                        source,
                    })?;
                file.sync_all()
                    .await
                    .map_err(|source| WriterError::LocalWrite {
                        path: local.clone(),
                        source,
                    })?;
                Ok(Box::new(LocalFileUpload::new(path, local)))
            }
            None => Ok(Box::new(MemoryUpload::new(path, boundary.buffer.freeze()))),
        }
    }

    async fn discard_boundary(&mut self) -> Result<(), WriterError> {
        let boundary = self.active.take().ok_or(WriterError::NoActiveBoundary)?;
        if let Some((local, file)) = boundary.file {
            drop(file);
            fs_err::tokio::remove_file(&local)
                .await
                .map_err(|source| WriterError::RemoveWorkingFile {
                    path: local.clone(),
                    source,
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use object_store::{ObjectStore, memory::InMemory};

    use super::*;

    async fn uploaded(artifact: &dyn Uploadable) -> Bytes {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let paths = artifact.upload(&store).await.expect("upload");
        store
            .get(&paths[0])
            .await
            .expect("object")
            .bytes()
            .await
            .expect("bytes")
    }

    #[tokio::test]
    async fn small_boundary_stays_in_memory() {
        //* Given
        let dir = tempfile::tempdir().expect("tempdir");
        let mut writer = BufferedWriter::new(FileType::Jsonl, dir.path(), 1024);
        let range = BlockRange::new(0, 100);
        writer.start_boundary(range).await.expect("start");

        //* When
        writer.write(Bytes::from_static(b"a\n")).await.expect("write");
        let artifact = writer.close_boundary(range).await.expect("close");

        //* Then
        assert_eq!(uploaded(artifact.as_ref()).await, Bytes::from_static(b"a\n"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn large_boundary_spills_to_working_file() {
        //* Given
        let dir = tempfile::tempdir().expect("tempdir");
        let mut writer = BufferedWriter::new(FileType::Jsonl, dir.path(), 4);
        let range = BlockRange::new(0, 100);
        writer.start_boundary(range).await.expect("start");

        //* When
        writer.write(Bytes::from_static(b"ab\n")).await.expect("write");
        writer.write(Bytes::from_static(b"cd\n")).await.expect("write");
        let working = dir.path().join("0000000000-0000000100.tmp.jsonl");
        let spilled = working.exists();
        writer.write(Bytes::from_static(b"ef\n")).await.expect("write");
        let artifact = writer.close_boundary(range).await.expect("close");

        //* Then
        assert!(spilled, "working file is created once the buffer overflows");
        assert_eq!(
            uploaded(artifact.as_ref()).await,
            Bytes::from_static(b"ab\ncd\nef\n")
        );
        artifact.cleanup().await.expect("cleanup");
        assert!(!working.exists());
    }

    #[tokio::test]
    async fn discard_removes_working_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut writer = BufferedWriter::new(FileType::Jsonl, dir.path(), 0);
        writer
            .start_boundary(BlockRange::new(0, 100))
            .await
            .expect("start");
        writer.write(Bytes::from_static(b"x\n")).await.expect("write");

        writer.discard_boundary().await.expect("discard");

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
