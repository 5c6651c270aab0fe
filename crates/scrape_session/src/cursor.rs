use std::{
    io::{self, SeekFrom},
    mem,
    path::{Path, PathBuf},
};

use tail_events::{
    finish, scan, ChannelKey, OpenRecord, Record, RecordShape, ScanLimits, ScanOutput,
};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};
use tracing::{debug, warn};

/// Per-file tail state.
///
/// `offset` counts the bytes already scanned. Bytes that did not yet form a complete record
/// are carried in memory and prepended to the next read, so `offset` never rewinds and no
/// byte is scanned twice.
#[derive(Debug)]
pub struct FileCursor {
    key: ChannelKey,
    path: PathBuf,
    shape: RecordShape,
    offset: u64,
    pending: Vec<u8>,
    /// Set after an oversized carry was dropped; bytes are skipped until that record ends.
    discarding: Option<OpenRecord>,
    read_in_progress: bool,
}

/// A read handed out by [`FileCursor::begin_read`].
#[derive(Debug, Clone)]
pub(crate) struct ReadRequest {
    pub(crate) key: ChannelKey,
    pub(crate) path: PathBuf,
    pub(crate) offset: u64,
}

impl FileCursor {
    /// Cursor whose record shape follows the file extension.
    pub fn new(key: ChannelKey, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let shape = RecordShape::from_path(&path);
        Self::with_shape(key, path, shape)
    }

    pub fn with_shape(key: ChannelKey, path: impl Into<PathBuf>, shape: RecordShape) -> Self {
        Self {
            key,
            path: path.into(),
            shape,
            offset: 0,
            pending: Vec::new(),
            discarding: None,
            read_in_progress: false,
        }
    }

    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn shape(&self) -> RecordShape {
        self.shape
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// True while the tail of a dropped oversized record is still being skipped.
    pub fn is_discarding(&self) -> bool {
        self.discarding.is_some()
    }

    pub fn is_reading(&self) -> bool {
        self.read_in_progress
    }

    /// True when the file has grown past `offset` and no read is outstanding.
    pub fn should_read(&self, file_size: u64) -> bool {
        !self.read_in_progress && file_size > self.offset
    }

    pub(crate) fn begin_read(&mut self) -> ReadRequest {
        self.read_in_progress = true;
        ReadRequest {
            key: self.key.clone(),
            path: self.path.clone(),
            offset: self.offset,
        }
    }

    /// Releases the read guard without advancing `offset`; the bytes are retried later.
    pub(crate) fn abort_read(&mut self) {
        self.read_in_progress = false;
    }

    /// Scans the bytes read from `offset` and advances past them.
    pub fn complete_read(&mut self, bytes: &[u8], limits: &ScanLimits) -> Vec<Record> {
        self.offset += bytes.len() as u64;
        self.read_in_progress = false;
        let Some(bytes) = self.skip_discarded(bytes) else {
            return Vec::new();
        };

        let mut buffer = mem::take(&mut self.pending);
        buffer.extend_from_slice(bytes);

        let ScanOutput {
            records,
            remainder,
            malformed,
        } = scan(&buffer, self.shape);
        if malformed > 0 {
            debug!(channel = %self.key, malformed, "discarded malformed JSON spans");
        }

        if remainder.len() > limits.max_pending_bytes {
            warn!(
                channel = %self.key,
                pending = remainder.len(),
                max_pending_bytes = limits.max_pending_bytes,
                "incomplete record exceeds pending limit; dropping it"
            );
            self.discarding = Some(OpenRecord::at_end_of(remainder, self.shape));
        } else {
            self.pending = remainder.to_vec();
        }
        records
    }

    /// Scans the final bytes of the file, flushing whatever can still form a record.
    pub fn finish(&mut self, bytes: &[u8]) -> Vec<Record> {
        self.offset += bytes.len() as u64;
        self.read_in_progress = false;
        let Some(bytes) = self.skip_discarded(bytes) else {
            return Vec::new();
        };

        let mut buffer = mem::take(&mut self.pending);
        buffer.extend_from_slice(bytes);

        let (records, dropped) = finish(&buffer, self.shape);
        if dropped > 0 {
            warn!(
                channel = %self.key,
                bytes = dropped,
                "discarding incomplete record at end of file"
            );
        }
        records
    }

    /// Strips the rest of a dropped record from the front of `bytes`.
    ///
    /// Returns `None` when every byte still belongs to that record.
    fn skip_discarded<'a>(&mut self, bytes: &'a [u8]) -> Option<&'a [u8]> {
        let Some(open) = self.discarding.as_mut() else {
            return Some(bytes);
        };
        let end = open.skip_rest(bytes)?;
        self.discarding = None;
        debug!(channel = %self.key, skipped = end, "resumed after dropped record");
        Some(&bytes[end..])
    }
}

/// Reads from `offset` to end of file, or at most `limit` bytes when given.
pub(crate) async fn read_from(path: &Path, offset: u64, limit: Option<u64>) -> io::Result<Vec<u8>> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut bytes = Vec::new();
    match limit {
        Some(limit) => {
            file.take(limit).read_to_end(&mut bytes).await?;
        }
        None => {
            file.read_to_end(&mut bytes).await?;
        }
    }
    Ok(bytes)
}
