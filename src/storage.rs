//! Append-only per-shape change log with an atomic committed watermark: one
//! directory per shape, holding a binary log of length-prefixed
//! `rmp-serde` frames and a small watermark file advanced via
//! write-to-temp-then-rename, mirroring the durable-progress-marker idiom
//! in `backend::replication::logical::publisher::{slot,progress}`.

use std::path::{Path, PathBuf};
use std::pin::Pin;

use async_trait::async_trait;
use futures::stream::{self, Stream};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;

use crate::change::{Change, Offset};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("frame decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("log corrupt: truncated frame at byte offset {0}")]
    TruncatedFrame(u64),
    #[error("append called with a change before the current latest offset that isn't already in the log")]
    NonMonotonicAppend,
}

pub type ReadItem = Result<(Offset, Change), StorageError>;
pub type ReadStream = Pin<Box<dyn Stream<Item = ReadItem> + Send>>;

/// Append-only per-shape log.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Append `changes`, assigning each the offset carried on the `Change`
    /// itself (the producer's own LSN/op_index). Not atomic with respect to
    /// the committed watermark. Idempotent with respect to replay: an
    /// offset already present in the log is skipped rather than re-written,
    /// so a consumer that replays a transaction from its start after a
    /// crash converges instead of erroring on its own prior writes. Only a
    /// genuinely out-of-order or gapped offset is rejected.
    async fn append(&self, txn_lsn: u64, changes: &[Change]) -> Result<Offset, StorageError>;

    /// Atomically advance the committed watermark. Idempotent: committing
    /// an offset at or before the current watermark is a no-op.
    async fn commit(&self, upto_offset: Offset) -> Result<(), StorageError>;

    async fn fetch_latest_offset(&self) -> Result<Offset, StorageError>;

    async fn fetch_latest_committed_offset(&self) -> Result<Offset, StorageError>;

    /// A lazy, finite, restartable sequence of changes with offsets
    /// strictly greater than `from_offset` and at or before `to_offset`
    /// (unbounded above when `to_offset` is `None`), in offset order.
    async fn read(&self, from_offset: Offset, to_offset: Option<Offset>) -> Result<ReadStream, StorageError>;

    /// Convenience for external readers: reads are bounded by the committed
    /// watermark, so a reader never observes a change from a transaction
    /// that hasn't committed yet.
    async fn read_committed(&self, from_offset: Offset) -> Result<ReadStream, StorageError> {
        let committed = self.fetch_latest_committed_offset().await?;
        self.read(from_offset, Some(committed)).await
    }
}

const HEADER_LEN: u64 = 8 + 4 + 4; // txn_lsn, op_index, payload length

struct Inner {
    log: fs::File,
    /// (offset, byte position of this frame's header) in append order.
    index: Vec<(Offset, u64)>,
    latest_offset: Offset,
    latest_committed_offset: Offset,
}

/// File-backed [`Storage`] implementation: one directory per shape.
pub struct FileStorage {
    dir: PathBuf,
    inner: Mutex<Inner>,
}

impl FileStorage {
    /// Open (creating if necessary) the log directory for one shape.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;

        let log_path = dir.join("log.bin");
        let mut log = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&log_path)
            .await?;

        let index = scan_index(&mut log).await?;
        let latest_offset = index.last().map(|(offset, _)| *offset).unwrap_or(Offset::ZERO);
        let latest_committed_offset = read_watermark(&dir).await?.unwrap_or(Offset::ZERO);

        Ok(Self {
            dir,
            inner: Mutex::new(Inner {
                log,
                index,
                latest_offset,
                latest_committed_offset,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

async fn scan_index(log: &mut fs::File) -> Result<Vec<(Offset, u64)>, StorageError> {
    log.seek(SeekFrom::Start(0)).await?;
    let mut index = Vec::new();
    let mut pos: u64 = 0;

    loop {
        let header_pos = pos;
        let mut header = [0u8; HEADER_LEN as usize];
        match log.read_exact(&mut header).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let txn_lsn = u64::from_le_bytes(header[0..8].try_into().unwrap());
        let op_index = u32::from_le_bytes(header[8..12].try_into().unwrap());
        let payload_len = u32::from_le_bytes(header[12..16].try_into().unwrap()) as u64;

        let mut skip = vec![0u8; payload_len as usize];
        log.read_exact(&mut skip)
            .await
            .map_err(|_| StorageError::TruncatedFrame(header_pos))?;

        index.push((Offset::new(txn_lsn, op_index), header_pos));
        pos = header_pos + HEADER_LEN + payload_len;
    }

    // Leave the cursor positioned for subsequent appends; `append` opens
    // the file handle separately via its own OpenOptions below, so this is
    // just hygiene.
    log.seek(SeekFrom::End(0)).await?;

    Ok(index)
}

async fn read_watermark(dir: &Path) -> Result<Option<Offset>, StorageError> {
    let path = dir.join("committed");
    match fs::read(&path).await {
        Ok(bytes) if bytes.len() == 12 => {
            let txn_lsn = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
            let op_index = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
            Ok(Some(Offset::new(txn_lsn, op_index)))
        }
        Ok(_) => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_watermark(dir: &Path, offset: Offset) -> Result<(), StorageError> {
    let tmp_path = dir.join("committed.tmp");
    let final_path = dir.join("committed");

    let mut bytes = Vec::with_capacity(12);
    bytes.extend_from_slice(&offset.txn_lsn.to_le_bytes());
    bytes.extend_from_slice(&offset.op_index.to_le_bytes());

    let mut tmp = fs::File::create(&tmp_path).await?;
    tmp.write_all(&bytes).await?;
    tmp.sync_all().await?;
    drop(tmp);

    fs::rename(&tmp_path, &final_path).await?;
    Ok(())
}

fn encode_frame(txn_lsn: u64, op_index: u32, change: &Change) -> Result<Vec<u8>, StorageError> {
    let payload = rmp_serde::to_vec(change)?;
    let mut frame = Vec::with_capacity(HEADER_LEN as usize + payload.len());
    frame.extend_from_slice(&txn_lsn.to_le_bytes());
    frame.extend_from_slice(&op_index.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

#[async_trait]
impl Storage for FileStorage {
    async fn append(&self, txn_lsn: u64, changes: &[Change]) -> Result<Offset, StorageError> {
        let mut inner = self.inner.lock().await;

        for change in changes {
            let offset = change.offset(txn_lsn);
            if !inner.index.is_empty() && offset <= inner.latest_offset {
                // Already durable from a prior append — a replaying
                // consumer resends its whole transaction from the start
                // after a crash, so re-appending an offset it already
                // wrote must converge rather than fail again.
                if inner.index.binary_search_by_key(&offset, |(o, _)| *o).is_ok() {
                    continue;
                }
                return Err(StorageError::NonMonotonicAppend);
            }

            let pos = inner.log.stream_position().await?;
            let frame = encode_frame(txn_lsn, change.op_index(), change)?;
            inner.log.write_all(&frame).await?;

            inner.index.push((offset, pos));
            inner.latest_offset = offset;
        }
        inner.log.flush().await?;

        Ok(inner.latest_offset)
    }

    async fn commit(&self, upto_offset: Offset) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        if upto_offset <= inner.latest_committed_offset {
            return Ok(());
        }
        write_watermark(&self.dir, upto_offset).await?;
        inner.latest_committed_offset = upto_offset;
        Ok(())
    }

    async fn fetch_latest_offset(&self) -> Result<Offset, StorageError> {
        Ok(self.inner.lock().await.latest_offset)
    }

    async fn fetch_latest_committed_offset(&self) -> Result<Offset, StorageError> {
        Ok(self.inner.lock().await.latest_committed_offset)
    }

    async fn read(&self, from_offset: Offset, to_offset: Option<Offset>) -> Result<ReadStream, StorageError> {
        let inner = self.inner.lock().await;

        let start = inner
            .index
            .partition_point(|(offset, _)| *offset <= from_offset);
        let end = match to_offset {
            Some(to_offset) => inner.index.partition_point(|(offset, _)| *offset <= to_offset),
            None => inner.index.len(),
        };
        let to_read: Vec<u64> = inner.index[start..end].iter().map(|(_, pos)| *pos).collect();
        let path = self.dir.join("log.bin");
        drop(inner);

        let items = stream::unfold((path, to_read.into_iter()), |(path, mut positions)| async move {
            let pos = positions.next()?;
            match read_frame_at(&path, pos).await {
                Ok((offset, change)) => Some((Ok((offset, change)), (path, positions))),
                Err(e) => Some((Err(e), (path, positions))),
            }
        });

        Ok(Box::pin(items))
    }
}

async fn read_frame_at(path: &Path, pos: u64) -> Result<(Offset, Change), StorageError> {
    let mut file = fs::File::open(path).await?;
    file.seek(SeekFrom::Start(pos)).await?;

    let mut header = [0u8; HEADER_LEN as usize];
    file.read_exact(&mut header).await?;
    let txn_lsn = u64::from_le_bytes(header[0..8].try_into().unwrap());
    let op_index = u32::from_le_bytes(header[8..12].try_into().unwrap());
    let payload_len = u32::from_le_bytes(header[12..16].try_into().unwrap()) as usize;

    let mut payload = vec![0u8; payload_len];
    file.read_exact(&mut payload).await?;
    let change: Change = rmp_serde::from_slice(&payload)?;

    Ok((Offset::new(txn_lsn, op_index), change))
}
