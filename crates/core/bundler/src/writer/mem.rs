use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use object_store::path::Path;

use super::{FileType, Writer, check_close};
use crate::{
    error::WriterError,
    range::BlockRange,
    uploadable::{MemoryUpload, Uploadable},
};

/// Keeps the whole boundary in memory.
pub struct MemWriter {
    file_type: FileType,
    active: Option<(BlockRange, BytesMut)>,
}

impl MemWriter {
    pub fn new(file_type: FileType) -> Self {
        Self {
            file_type,
            active: None,
        }
    }
}

#[async_trait]
impl Writer for MemWriter {
    fn file_type(&self) -> FileType {
        self.file_type
    }

    async fn start_boundary(&mut self, range: BlockRange) -> Result<(), WriterError> {
        if let Some((active, _)) = &self.active {
            return Err(WriterError::AlreadyActive { active: *active });
        }
        self.active = Some((range, BytesMut::new()));
        Ok(())
    }

    async fn write(&mut self, data: Bytes) -> Result<(), WriterError> {
        let (_, buffer) = self.active.as_mut().ok_or(WriterError::NoActiveBoundary)?;
        buffer.extend_from_slice(&data);
        Ok(())
    }

    async fn close_boundary(
        &mut self,
        range: BlockRange,
    ) -> Result<Box<dyn Uploadable>, WriterError> {
        let (active, _) = self.active.as_ref().ok_or(WriterError::NoActiveBoundary)?;
        check_close(*active, range)?;

        let (_, buffer) = self.active.take().ok_or(WriterError::NoActiveBoundary)?;
        let path = Path::from(range.file_name(self.file_type.extension()));
        Ok(Box::new(MemoryUpload::new(path, buffer.freeze())))
    }

    async fn discard_boundary(&mut self) -> Result<(), WriterError> {
        self.active
            .take()
            .map(|_| ())
            .ok_or(WriterError::NoActiveBoundary)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use object_store::{ObjectStore, memory::InMemory};

    use super::*;

    #[tokio::test]
    async fn closes_into_named_artifact() {
        //* Given
        let mut writer = MemWriter::new(FileType::Jsonl);
        writer
            .start_boundary(BlockRange::new(4, 100))
            .await
            .expect("start");
        writer.write(Bytes::from_static(b"a\n")).await.expect("write");
        writer.write(Bytes::from_static(b"b\n")).await.expect("write");

        //* When
        let artifact = writer
            .close_boundary(BlockRange::new(4, 50))
            .await
            .expect("close");

        //* Then
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let paths = artifact.upload(&store).await.expect("upload");
        assert_eq!(paths, [Path::from("0000000004-0000000050.jsonl")]);
        let bytes = store.get(&paths[0]).await.unwrap().bytes().await.unwrap();
        assert_eq!(bytes, Bytes::from_static(b"a\nb\n"));
    }

    #[tokio::test]
    async fn lifecycle_errors() {
        let mut writer = MemWriter::new(FileType::Jsonl);

        assert!(matches!(
            writer.write(Bytes::new()).await,
            Err(WriterError::NoActiveBoundary)
        ));
        assert!(matches!(
            writer.close_boundary(BlockRange::new(0, 10)).await,
            Err(WriterError::NoActiveBoundary)
        ));

        writer
            .start_boundary(BlockRange::new(0, 10))
            .await
            .expect("start");
        assert!(matches!(
            writer.start_boundary(BlockRange::new(10, 20)).await,
            Err(WriterError::AlreadyActive { .. })
        ));
        assert!(matches!(
            writer.close_boundary(BlockRange::new(0, 11)).await,
            Err(WriterError::RangeMismatch { .. })
        ));
        assert!(matches!(
            writer.write_rows(Default::default()).await,
            Err(WriterError::UnsupportedInput { .. })
        ));
    }
}
