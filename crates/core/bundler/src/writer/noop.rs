use async_trait::async_trait;
use bytes::Bytes;
use object_store::path::Path;

use super::{FileType, Writer, check_close};
use crate::{
    error::WriterError,
    range::BlockRange,
    uploadable::{NoopUpload, Uploadable},
};

/// Accepts everything and keeps nothing, for dry runs.
pub struct NoopWriter {
    file_type: FileType,
    active: Option<BlockRange>,
}

impl NoopWriter {
    pub fn new(file_type: FileType) -> Self {
        Self {
            file_type,
            active: None,
        }
    }
}

#[async_trait]
impl Writer for NoopWriter {
    fn file_type(&self) -> FileType {
        self.file_type
    }

    async fn start_boundary(&mut self, range: BlockRange) -> Result<(), WriterError> {
        if let Some(active) = self.active {
            return Err(WriterError::AlreadyActive { active });
        }
        self.active = Some(range);
        Ok(())
    }

    async fn write(&mut self, _data: Bytes) -> Result<(), WriterError> {
        self.active.map(|_| ()).ok_or(WriterError::NoActiveBoundary)
    }

    async fn write_rows(&mut self, _rows: parquet_rows::RowsByTable) -> Result<(), WriterError> {
        self.active.map(|_| ()).ok_or(WriterError::NoActiveBoundary)
    }

    async fn close_boundary(
        &mut self,
        range: BlockRange,
    ) -> Result<Box<dyn Uploadable>, WriterError> {
        let active = self.active.ok_or(WriterError::NoActiveBoundary)?;
        check_close(active, range)?;
        self.active = None;

        let path = Path::from(range.file_name(self.file_type.extension()));
        Ok(Box::new(NoopUpload::new(path)))
    }

    async fn discard_boundary(&mut self) -> Result<(), WriterError> {
        self.active
            .take()
            .map(|_| ())
            .ok_or(WriterError::NoActiveBoundary)
    }
}
