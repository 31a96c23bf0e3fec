use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::{ObjectStore, buffered::BufWriter, path::Path};
use tokio::{io::AsyncWriteExt, sync::mpsc, task::JoinHandle};

use super::{FileType, Writer, check_close};
use crate::{
    error::WriterError,
    range::BlockRange,
    uploadable::{Uploadable, WorkingObjectUpload},
};

/// Streams the boundary straight into a working object store.
///
/// Writes go through a bounded channel to a drain task that owns the object writer. Closing
/// drops the sender, which ends the stream, and waits for the drain task to report how the
/// object was completed.
pub struct DirectWriter {
    file_type: FileType,
    working_store: Arc<dyn ObjectStore>,
    capacity: usize,
    active: Option<Boundary>,
}

struct Boundary {
    range: BlockRange,
    working: Path,
    sender: mpsc::Sender<Bytes>,
    drain: JoinHandle<Result<(), WriterError>>,
}

impl DirectWriter {
    pub fn new(file_type: FileType, working_store: Arc<dyn ObjectStore>, capacity: usize) -> Self {
        Self {
            file_type,
            working_store,
            capacity: capacity.max(1),
            active: None,
        }
    }

    /// Closes the channel and waits for the drain task outcome.
    async fn finish_drain(boundary: Boundary) -> Result<Path, WriterError> {
        let Boundary {
            working,
            sender,
            drain,
            ..
        } = boundary;
        drop(sender);

        match drain.await {
            Ok(result) => result.map(|()| working),
            Err(source) => Err(WriterError::DrainTask {
                path: working,
                source,
            }),
        }
    }
}

#[async_trait]
impl Writer for DirectWriter {
    fn file_type(&self) -> FileType {
        self.file_type
    }

    async fn start_boundary(&mut self, range: BlockRange) -> Result<(), WriterError> {
        if let Some(active) = &self.active {
            return Err(WriterError::AlreadyActive {
                active: active.range,
            });
        }

        let working = Path::from(range.working_file_name(self.file_type.extension()));
        let (sender, receiver) = mpsc::channel(self.capacity);
        let drain = tokio::spawn(drain(
            Arc::clone(&self.working_store),
            working.clone(),
            receiver,
        ));

        self.active = Some(Boundary {
            range,
            working,
            sender,
            drain,
        });
        Ok(())
    }

    async fn write(&mut self, data: Bytes) -> Result<(), WriterError> {
        let boundary = self.active.as_ref().ok_or(WriterError::NoActiveBoundary)?;
        if boundary.sender.send(data).await.is_err() {
            // The drain task is gone, its error surfaces on close
            return Err(WriterError::DrainStopped {
                path: boundary.working.clone(),
            });
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(range = %range), err)]
    async fn close_boundary(
        &mut self,
        range: BlockRange,
    ) -> Result<Box<dyn Uploadable>, WriterError> {
        let active = self.active.as_ref().ok_or(WriterError::NoActiveBoundary)?;
        check_close(active.range, range)?;
        let boundary = self.active.take().ok_or(WriterError::NoActiveBoundary)?;

        let working = Self::finish_drain(boundary).await?;
        let path = Path::from(range.file_name(self.file_type.extension()));

        Ok(Box::new(WorkingObjectUpload::new(
            path,
            Arc::clone(&self.working_store),
            working,
        )))
    }

    async fn discard_boundary(&mut self) -> Result<(), WriterError> {
        let boundary = self.active.take().ok_or(WriterError::NoActiveBoundary)?;
        let working = boundary.working.clone();
        if let Err(err) = Self::finish_drain(boundary).await {
            tracing::debug!(error = %err, "drain of discarded boundary failed");
        }

        match self.working_store.delete(&working).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(source) => Err(WriterError::DeleteWorkingObject {
                path: working,
                source,
            }),
        }
    }
}

/// Copies every received chunk into the working object until the channel closes.
async fn drain(
    store: Arc<dyn ObjectStore>,
    path: Path,
    mut receiver: mpsc::Receiver<Bytes>,
) -> Result<(), WriterError> {
    let mut writer = BufWriter::new(store, path.clone());

    while let Some(chunk) = receiver.recv().await {
        if let Err(source) = writer.write_all(&chunk).await {
            let _ = writer.abort().await;
            return Err(WriterError::DrainWrite { path, source });
        }
    }

    writer
        .shutdown()
        .await
        .map_err(|source| WriterError::DrainWrite { path, source })
}

#[cfg(test)]
mod test {
    use object_store::memory::InMemory;

    use super::*;

    #[tokio::test]
    async fn streams_into_working_object_then_uploads() {
        //* Given
        let working_store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let output: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let mut writer = DirectWriter::new(FileType::Jsonl, Arc::clone(&working_store), 2);
        let range = BlockRange::new(100, 200);
        writer.start_boundary(range).await.expect("start");

        //* When
        for line in ["a\n", "b\n", "c\n", "d\n"] {
            writer.write(Bytes::from(line)).await.expect("write");
        }
        let artifact = writer.close_boundary(range).await.expect("close");

        //* Then
        let working = Path::from("0000000100-0000000200.tmp.jsonl");
        assert!(working_store.head(&working).await.is_ok());

        let paths = artifact.upload(&output).await.expect("upload");
        artifact.cleanup().await.expect("cleanup");
        let bytes = output.get(&paths[0]).await.unwrap().bytes().await.unwrap();
        assert_eq!(bytes, Bytes::from_static(b"a\nb\nc\nd\n"));
        assert!(working_store.head(&working).await.is_err());
    }

    #[tokio::test]
    async fn discard_leaves_no_working_object() {
        let working_store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let mut writer = DirectWriter::new(FileType::Jsonl, Arc::clone(&working_store), 2);
        writer
            .start_boundary(BlockRange::new(0, 100))
            .await
            .expect("start");
        writer.write(Bytes::from_static(b"x\n")).await.expect("write");

        writer.discard_boundary().await.expect("discard");

        let working = Path::from("0000000000-0000000100.tmp.jsonl");
        assert!(working_store.head(&working).await.is_err());
        assert!(writer.start_boundary(BlockRange::new(0, 100)).await.is_ok());
    }
}
