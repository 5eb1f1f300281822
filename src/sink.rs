use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

use crate::config::OutputTarget;
use crate::models::TransferOutput;

/// Free space kept in reserve on top of what a write needs.
const SPACE_MARGIN: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("write at offset {got} but sink is at {expected}")]
    OutOfOrder { expected: u64, got: u64 },
    #[error("insufficient disk space: need {required} bytes, {available} available")]
    InsufficientSpace { required: u64, available: u64 },
    #[error("sink already finished")]
    Finished,
}

/// Destination for reassembled bytes. Writes always arrive in ascending offset order.
#[async_trait]
pub trait ChunkSink: Send {
    async fn write(&mut self, offset: u64, data: Bytes) -> Result<(), SinkError>;

    /// Drop everything written so far and continue from offset 0.
    async fn reset(&mut self) -> Result<(), SinkError>;

    /// Finalise and report where the output is.
    async fn finish(&mut self) -> Result<TransferOutput, SinkError>;

    /// Discard partial output. Best effort; never fails.
    async fn abort(&mut self);
}

#[async_trait]
impl<T: ChunkSink + ?Sized> ChunkSink for Box<T> {
    async fn write(&mut self, offset: u64, data: Bytes) -> Result<(), SinkError> {
        (**self).write(offset, data).await
    }

    async fn reset(&mut self) -> Result<(), SinkError> {
        (**self).reset().await
    }

    async fn finish(&mut self) -> Result<TransferOutput, SinkError> {
        (**self).finish().await
    }

    async fn abort(&mut self) {
        (**self).abort().await
    }
}

/// Open the sink described by a config. `expected_size` is checked against
/// free disk space for file targets.
pub async fn open(target: &OutputTarget, expected_size: Option<u64>) -> Result<Box<dyn ChunkSink>, SinkError> {
    Ok(match target {
        OutputTarget::Memory => Box::new(MemorySink::new()),
        OutputTarget::File(path) => Box::new(FileSink::create(path, expected_size).await?),
    })
}

/// Fail unless the filesystem holding `dir` has room for `needed` more bytes.
///
/// A filesystem that cannot report its free space is not treated as full.
pub async fn ensure_space(dir: &Path, needed: u64) -> Result<(), SinkError> {
    let target = dir.to_path_buf();
    let available = match tokio::task::spawn_blocking(move || fs2::available_space(&target)).await {
        Ok(Ok(available)) => available,
        Ok(Err(e)) => {
            warn!(path = %dir.display(), error = %e, "unable to check free disk space");
            return Ok(());
        }
        Err(e) => {
            warn!(path = %dir.display(), error = %e, "free space check did not run");
            return Ok(());
        }
    };
    let required = needed.saturating_add(SPACE_MARGIN);
    if available < required {
        warn!(path = %dir.display(), required, available, "insufficient disk space");
        return Err(SinkError::InsufficientSpace { required, available });
    }
    Ok(())
}

/// Collects the whole resource into one growing buffer.
#[derive(Debug, Default)]
pub struct MemorySink {
    buf: BytesMut,
    finished: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[async_trait]
impl ChunkSink for MemorySink {
    async fn write(&mut self, offset: u64, data: Bytes) -> Result<(), SinkError> {
        if self.finished {
            return Err(SinkError::Finished);
        }
        let expected = self.buf.len() as u64;
        if offset != expected {
            return Err(SinkError::OutOfOrder { expected, got: offset });
        }
        self.buf.extend_from_slice(&data);
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), SinkError> {
        if self.finished {
            return Err(SinkError::Finished);
        }
        self.buf.clear();
        Ok(())
    }

    async fn finish(&mut self) -> Result<TransferOutput, SinkError> {
        if self.finished {
            return Err(SinkError::Finished);
        }
        self.finished = true;
        Ok(TransferOutput::Memory(std::mem::take(&mut self.buf).freeze()))
    }

    async fn abort(&mut self) {
        self.buf.clear();
        self.finished = true;
    }
}

/// Streams into `<destination>.chunkstream-part` and renames on success.
#[derive(Debug)]
pub struct FileSink {
    destination: PathBuf,
    temp_path: PathBuf,
    /// Directory whose filesystem receives the writes.
    dir: PathBuf,
    writer: Option<BufWriter<File>>,
    position: u64,
}

impl FileSink {
    pub async fn create(destination: &Path, expected_size: Option<u64>) -> Result<Self, SinkError> {
        let temp_path = temporary_path(destination);
        let dir = match temp_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        tokio::fs::create_dir_all(&dir).await?;
        if let Some(size) = expected_size {
            ensure_space(&dir, size).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)
            .await?;
        debug!(path = %temp_path.display(), "opened temporary output");
        Ok(Self {
            destination: destination.to_path_buf(),
            temp_path,
            dir,
            writer: Some(BufWriter::new(file)),
            position: 0,
        })
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    async fn persist(&self, mut writer: BufWriter<File>) -> Result<(), SinkError> {
        writer.flush().await?;
        let file = writer.into_inner();
        file.sync_all().await?;
        drop(file);

        if let Some(parent) = self.destination.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        // rename replaces an existing destination file in one step
        tokio::fs::rename(&self.temp_path, &self.destination).await?;
        Ok(())
    }

    async fn remove_temp(&self) {
        match tokio::fs::remove_file(&self.temp_path).await {
            Ok(()) => debug!(path = %self.temp_path.display(), "removed partial output"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.temp_path.display(), error = %e, "failed to remove partial output"),
        }
    }
}

/// e.g. "/path/to/file.zip" becomes "/path/to/file.zip.chunkstream-part"
pub fn temporary_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(".chunkstream-part");
    PathBuf::from(name)
}

#[async_trait]
impl ChunkSink for FileSink {
    async fn write(&mut self, offset: u64, data: Bytes) -> Result<(), SinkError> {
        if self.writer.is_none() {
            return Err(SinkError::Finished);
        }
        if offset != self.position {
            return Err(SinkError::OutOfOrder { expected: self.position, got: offset });
        }
        ensure_space(&self.dir, data.len() as u64).await?;
        let writer = self.writer.as_mut().ok_or(SinkError::Finished)?;
        writer.write_all(&data).await?;
        self.position += data.len() as u64;
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), SinkError> {
        let writer = self.writer.as_mut().ok_or(SinkError::Finished)?;
        writer.flush().await?;
        let file = writer.get_mut();
        file.set_len(0).await?;
        file.seek(SeekFrom::Start(0)).await?;
        debug!(path = %self.temp_path.display(), discarded = self.position, "restarting output");
        self.position = 0;
        Ok(())
    }

    async fn finish(&mut self) -> Result<TransferOutput, SinkError> {
        let writer = self.writer.take().ok_or(SinkError::Finished)?;
        if let Err(e) = self.persist(writer).await {
            self.remove_temp().await;
            return Err(e);
        }
        debug!(path = %self.destination.display(), bytes = self.position, "output moved into place");
        Ok(TransferOutput::File(self.destination.clone()))
    }

    async fn abort(&mut self) {
        self.writer = None;
        self.remove_temp().await;
    }
}
