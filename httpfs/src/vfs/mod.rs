//! Operation dispatcher
//!
//! [`HttpFs`] owns the call manager and both caches and exposes one async
//! handler per filesystem verb. Handlers return `FsResult`; a negative wire
//! status becomes the matching [`Errno`].
//!
//! Mutating verbs drop the attribute cache entry of their path before the
//! request is submitted, never after it completes.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{error, instrument};

use crate::cache::attr::AttrCache;
use crate::cache::block::{BlockCache, BlockIo, UNCACHED};
use crate::config::MountConfig;
use crate::error::{Errno, FsResult};
use crate::rpc::CallManager;
use crate::wire::transport::Transport;
use crate::wire::{BincodeCodec, Codec, Reply, Stat, Timespec, Value, Verb};

pub struct HttpFs {
    rpc: CallManager,
    attrs: Option<AttrCache>,
    blocks: BlockCache,
    config: Arc<MountConfig>,
}

impl HttpFs {
    pub fn new(transport: Arc<dyn Transport>, config: MountConfig) -> Self {
        Self::with_codec(transport, Arc::new(BincodeCodec), config)
    }

    pub fn with_codec(
        transport: Arc<dyn Transport>,
        codec: Arc<dyn Codec>,
        config: MountConfig,
    ) -> Self {
        let rpc = CallManager::new(transport, codec, config.timeout, config.retry_delay);
        let attrs = config
            .attr_cache
            .then(|| AttrCache::new(config.attr_cache_capacity));
        let blocks = BlockCache::new(config.effective_blocksize(), config.nocache.clone());
        Self {
            rpc,
            attrs,
            blocks,
            config: Arc::new(config),
        }
    }

    pub fn rpc(&self) -> &CallManager {
        &self.rpc
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    pub fn blocks(&self) -> &BlockCache {
        &self.blocks
    }

    /// Sends one call and turns a negative status into an error.
    async fn call(&self, verb: Verb, args: Vec<Value>) -> FsResult<Reply> {
        let reply = self.rpc.call(verb, args).await;
        if reply.is_ok() {
            Ok(reply)
        } else {
            Err(Errno::from_status(reply.status))
        }
    }

    async fn call_unit(&self, verb: Verb, args: Vec<Value>) -> FsResult<()> {
        self.call(verb, args).await.map(|_| ())
    }

    async fn invalidate(&self, path: &str) {
        if let Some(attrs) = &self.attrs {
            attrs.invalidate(path).await;
        }
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn getattr(&self, path: &str) -> FsResult<Stat> {
        if let Some(attrs) = &self.attrs
            && let Some(entry) = attrs.lookup(path).await
        {
            return Ok(entry.stat);
        }

        let reply = self.call(Verb::Getattr, vec![path.into()]).await?;
        let status = reply.status;
        let stat = match reply.into_first() {
            Some(Value::Stat(stat)) => stat,
            other => {
                error!(path, "getattr reply without stat: {other:?}");
                return Err(Errno::GENERIC);
            }
        };
        if let Some(attrs) = &self.attrs {
            attrs.store(path, status, stat.clone()).await;
        }
        Ok(stat)
    }

    pub async fn readdir(&self, path: &str) -> FsResult<Vec<String>> {
        let reply = self.call(Verb::Readdir, vec![path.into()]).await?;
        match reply.into_first() {
            Some(Value::Names(names)) => Ok(names),
            None => Ok(Vec::new()),
            Some(other) => {
                error!(path, "readdir reply without names: {other:?}");
                Err(Errno::GENERIC)
            }
        }
    }

    pub async fn readlink(&self, path: &str) -> FsResult<String> {
        let reply = self.call(Verb::Readlink, vec![path.into()]).await?;
        match reply.into_first() {
            Some(Value::Str(target)) => Ok(target),
            other => {
                error!(path, "readlink reply without target: {other:?}");
                Err(Errno::GENERIC)
            }
        }
    }

    pub async fn truncate(&self, path: &str, size: u64) -> FsResult<()> {
        self.invalidate(path).await;
        self.call_unit(Verb::Truncate, vec![path.into(), size.into()])
            .await
    }

    pub async fn chown(&self, path: &str, uid: u32, gid: u32) -> FsResult<()> {
        self.invalidate(path).await;
        self.call_unit(Verb::Chown, vec![path.into(), uid.into(), gid.into()])
            .await
    }

    pub async fn chmod(&self, path: &str, mode: u32) -> FsResult<()> {
        self.invalidate(path).await;
        self.call_unit(Verb::Chmod, vec![path.into(), mode.into()])
            .await
    }

    pub async fn utimens(&self, path: &str, atime: Timespec, mtime: Timespec) -> FsResult<()> {
        self.invalidate(path).await;
        self.call_unit(Verb::Utimens, vec![path.into(), atime.into(), mtime.into()])
            .await
    }

    /// Local only: allocates a descriptor, 0 when the path is not cached.
    pub async fn open(&self, path: &str) -> FsResult<u64> {
        Ok(self.blocks.open(path))
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn create(&self, path: &str, mode: u32) -> FsResult<u64> {
        self.invalidate(path).await;
        self.call_unit(Verb::Create, vec![path.into(), mode.into()])
            .await?;
        Ok(self.blocks.open(path))
    }

    pub async fn read(&self, path: &str, fh: u64, offset: u64, len: usize) -> FsResult<Bytes> {
        if fh == UNCACHED {
            return self.read_at(path, offset, len).await;
        }
        self.blocks.read(self, fh, offset, len).await
    }

    pub async fn write(&self, path: &str, fh: u64, offset: u64, data: Bytes) -> FsResult<u32> {
        if fh == UNCACHED {
            return self.write_at(path, offset, data).await;
        }
        self.blocks.write(self, fh, offset, data).await
    }

    pub async fn flush(&self, fh: u64) -> FsResult<()> {
        if fh == UNCACHED {
            return Ok(());
        }
        self.blocks.flush(self, fh).await
    }

    pub async fn release(&self, fh: u64) -> FsResult<()> {
        if fh == UNCACHED {
            return Ok(());
        }
        self.blocks.release(self, fh).await
    }

    pub async fn unlink(&self, path: &str) -> FsResult<()> {
        self.invalidate(path).await;
        self.call_unit(Verb::Unlink, vec![path.into()]).await
    }

    pub async fn rename(&self, path: &str, dest: &str) -> FsResult<()> {
        self.invalidate(path).await;
        self.invalidate(dest).await;
        self.call_unit(Verb::Rename, vec![path.into(), dest.into()])
            .await
    }

    /// Hard link `path` to the existing `target`. The wire order is (path, target).
    pub async fn link(&self, target: &str, path: &str) -> FsResult<()> {
        self.call_unit(Verb::Link, vec![path.into(), target.into()])
            .await
    }

    /// Symlink at `path` pointing to `target`. The wire order is (path, target).
    pub async fn symlink(&self, target: &str, path: &str) -> FsResult<()> {
        self.call_unit(Verb::Symlink, vec![path.into(), target.into()])
            .await
    }

    pub async fn mkdir(&self, path: &str, mode: u32) -> FsResult<()> {
        self.call_unit(Verb::Mkdir, vec![path.into(), mode.into()])
            .await
    }

    pub async fn rmdir(&self, path: &str) -> FsResult<()> {
        self.invalidate(path).await;
        self.call_unit(Verb::Rmdir, vec![path.into()]).await
    }
}

/// Uncached I/O, also used by the block cache to fill and drain slots.
#[async_trait]
impl BlockIo for HttpFs {
    async fn read_at(&self, path: &str, offset: u64, len: usize) -> FsResult<Bytes> {
        let reply = self
            .call(Verb::Read, vec![path.into(), offset.into(), (len as u64).into()])
            .await?;
        let count = reply.status as usize;
        match reply.into_first() {
            Some(Value::Bytes(mut data)) => {
                data.truncate(count.min(len));
                Ok(Bytes::from(data))
            }
            None if count == 0 => Ok(Bytes::new()),
            other => {
                error!(path, offset, "read reply without data: {other:?}");
                Err(Errno::GENERIC)
            }
        }
    }

    async fn write_at(&self, path: &str, offset: u64, data: Bytes) -> FsResult<u32> {
        self.invalidate(path).await;
        let reply = self
            .call(Verb::Write, vec![path.into(), data.into(), offset.into()])
            .await?;
        Ok(reply.status as u32)
    }
}
