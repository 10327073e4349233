//! Per-descriptor block cache.
//!
//! Every cacheable open file gets a slot holding the last block fetched from
//! the backend and a write-behind buffer that coalesces contiguous writes.
//! The buffer only reaches the backend when it would outgrow the block size,
//! when a write jumps away from the cursor, or on flush/release/read.
//!
//! Slot ids are slab keys shifted by one so that 0 can mean "not cached".

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use regex::Regex;
use slab::Slab;
use tracing::{debug, trace};

use crate::error::{Errno, FsResult};

/// Descriptor id handed out for paths that bypass the cache.
pub const UNCACHED: u64 = 0;

/// Backend byte-range I/O used to fill and drain slots.
#[async_trait]
pub trait BlockIo: Send + Sync {
    /// Reads up to `len` bytes; fewer means end of file.
    async fn read_at(&self, path: &str, offset: u64, len: usize) -> FsResult<Bytes>;

    async fn write_at(&self, path: &str, offset: u64, data: Bytes) -> FsResult<u32>;
}

#[derive(Debug)]
pub struct ReadBlock {
    pub offset: u64,
    pub data: Bytes,
}

impl ReadBlock {
    fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }

    /// The requested range, if this block covers all of it.
    fn serve(&self, offset: u64, len: usize) -> Option<Bytes> {
        let end = offset.checked_add(len as u64)?;
        if offset < self.offset || end > self.end() {
            return None;
        }
        let start = (offset - self.offset) as usize;
        Some(self.data.slice(start..start + len))
    }

    fn overlaps(&self, offset: u64, len: usize) -> bool {
        offset < self.end() && offset.saturating_add(len as u64) > self.offset
    }
}

/// Pending write fragments. `cursor == start + buffered()` at all times.
#[derive(Debug, Default)]
pub struct WriteBuffer {
    fragments: Vec<Bytes>,
    start: u64,
    cursor: u64,
}

impl WriteBuffer {
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn buffered(&self) -> usize {
        (self.cursor - self.start) as usize
    }

    fn accepts(&self, offset: u64, len: usize, blocksize: usize) -> bool {
        offset == self.cursor && self.buffered() + len <= blocksize
    }

    fn push(&mut self, data: Bytes) {
        self.cursor += data.len() as u64;
        self.fragments.push(data);
    }

    /// Moves an empty buffer to `offset`.
    fn reset(&mut self, offset: u64) {
        debug_assert!(self.is_empty());
        self.start = offset;
        self.cursor = offset;
    }

    /// Empties the buffer, returning its start offset and the concatenated bytes.
    fn take(&mut self) -> (u64, Bytes) {
        let start = self.start;
        let data = match self.fragments.len() {
            1 => self.fragments.pop().unwrap_or_default(),
            _ => {
                let mut buf = BytesMut::with_capacity(self.buffered());
                for fragment in self.fragments.drain(..) {
                    buf.extend_from_slice(&fragment);
                }
                buf.freeze()
            }
        };
        self.start = self.cursor;
        (start, data)
    }
}

#[derive(Debug)]
pub struct CacheSlot {
    pub path: String,
    pub read_block: Option<ReadBlock>,
    pub write: WriteBuffer,
}

impl CacheSlot {
    fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            read_block: None,
            write: WriteBuffer::default(),
        }
    }

    async fn flush<I: BlockIo + ?Sized>(&mut self, io: &I) -> FsResult<()> {
        if self.write.is_empty() {
            return Ok(());
        }
        let (offset, data) = self.write.take();
        debug!(path = %self.path, offset, len = data.len(), "flushing write buffer");
        io.write_at(&self.path, offset, data).await?;
        Ok(())
    }
}

type SharedSlot = Arc<tokio::sync::Mutex<CacheSlot>>;

/// The slot table. Each slot has its own async lock so operations on one
/// descriptor are totally ordered while the table lock is never held across
/// a backend call.
pub struct BlockCache {
    blocksize: usize,
    nocache: Option<Regex>,
    slots: Mutex<Slab<SharedSlot>>,
}

impl BlockCache {
    /// A `blocksize` of 0 disables caching entirely.
    pub fn new(blocksize: usize, nocache: Option<Regex>) -> Self {
        Self {
            blocksize,
            nocache,
            slots: Mutex::new(Slab::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.blocksize > 0
    }

    pub fn blocksize(&self) -> usize {
        self.blocksize
    }

    pub fn open_slots(&self) -> usize {
        self.slots().len()
    }

    fn slots(&self) -> MutexGuard<'_, Slab<SharedSlot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slot(&self, id: u64) -> FsResult<SharedSlot> {
        let key = id.checked_sub(1).ok_or(Errno::EBADF)? as usize;
        self.slots().get(key).cloned().ok_or(Errno::EBADF)
    }

    pub fn is_cacheable(&self, path: &str) -> bool {
        self.enabled() && !self.nocache.as_ref().is_some_and(|re| re.is_match(path))
    }

    /// Allocates a slot for `path`, or returns [`UNCACHED`].
    pub fn open(&self, path: &str) -> u64 {
        if !self.is_cacheable(path) {
            return UNCACHED;
        }
        let key = self
            .slots()
            .insert(Arc::new(tokio::sync::Mutex::new(CacheSlot::new(path))));
        trace!(path, id = key + 1, "opened cache slot");
        key as u64 + 1
    }

    pub async fn read<I: BlockIo + ?Sized>(
        &self,
        io: &I,
        id: u64,
        offset: u64,
        len: usize,
    ) -> FsResult<Bytes> {
        let slot = self.slot(id)?;
        let mut slot = slot.lock().await;
        // a read must observe bytes written through this descriptor
        slot.flush(io).await?;

        if let Some(data) = slot.read_block.as_ref().and_then(|b| b.serve(offset, len)) {
            trace!(path = %slot.path, offset, len, "read served from block");
            return Ok(data);
        }

        let want = len.max(self.blocksize);
        let block = io.read_at(&slot.path, offset, want).await?;
        let data = block.slice(..len.min(block.len()));
        slot.read_block = Some(ReadBlock {
            offset,
            data: block,
        });
        Ok(data)
    }

    pub async fn write<I: BlockIo + ?Sized>(
        &self,
        io: &I,
        id: u64,
        offset: u64,
        data: Bytes,
    ) -> FsResult<u32> {
        let slot = self.slot(id)?;
        let mut slot = slot.lock().await;
        let len = data.len();
        if len == 0 {
            return Ok(0);
        }

        if slot
            .read_block
            .as_ref()
            .is_some_and(|b| b.overlaps(offset, len))
        {
            slot.read_block = None;
        }

        if slot.write.accepts(offset, len, self.blocksize) {
            slot.write.push(data);
            return Ok(len as u32);
        }

        slot.flush(io).await?;
        if len > self.blocksize {
            let written = io.write_at(&slot.path, offset, data).await?;
            slot.write.reset(offset + len as u64);
            return Ok(written);
        }
        slot.write.reset(offset);
        slot.write.push(data);
        Ok(len as u32)
    }

    pub async fn flush<I: BlockIo + ?Sized>(&self, io: &I, id: u64) -> FsResult<()> {
        let slot = self.slot(id)?;
        let mut slot = slot.lock().await;
        slot.flush(io).await
    }

    /// Frees the slot, then sends whatever it still buffered.
    pub async fn release<I: BlockIo + ?Sized>(&self, io: &I, id: u64) -> FsResult<()> {
        let slot = {
            let key = id.checked_sub(1).ok_or(Errno::EBADF)? as usize;
            let mut slots = self.slots();
            if !slots.contains(key) {
                return Err(Errno::EBADF);
            }
            slots.remove(key)
        };
        let mut slot = slot.lock().await;
        slot.flush(io).await
    }
}
