//! RAM-backed protocol driver.
//!
//! Every limit and optional primitive can be configured, which makes this the driver of choice
//! for exercising the engine: it records the operations it receives, tracks which ranges were
//! written for block status, and can be told to fail operations or eject its medium.

use crate::helpers::{Bitmap, IoVector, IoVectorMut};
use crate::node::{
    BlockStatusFlag, BlockStatusReport, DriverCap, DriverCaps, NodeDriver, NodeLimits,
    RequestFlag, RequestFlags,
};
use crate::{BlockError, BlockResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Granularity at which written ranges are tracked if the request alignment is finer
const ALLOCATION_GRANULARITY: u64 = 512;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub size: u64,

    #[serde(default = "default_alignment")]
    pub request_alignment: u64,
    #[serde(default)]
    pub max_transfer: u64,
    #[serde(default = "default_alignment_usize")]
    pub min_mem_alignment: usize,
    #[serde(default)]
    pub max_iov: usize,
    #[serde(default)]
    pub pwrite_zeroes_alignment: u64,
    #[serde(default)]
    pub max_pwrite_zeroes: u64,
    #[serde(default)]
    pub pdiscard_alignment: u64,
    #[serde(default)]
    pub max_pdiscard: u64,

    /// Offer native zero writes
    #[serde(default)]
    pub write_zeroes: bool,
    /// Offer native discards
    #[serde(default)]
    pub discard: bool,
    /// Handle FUA writes natively
    #[serde(default)]
    pub fua: bool,
    /// Report which ranges have been written
    #[serde(default = "default_true")]
    pub block_status: bool,

    /// Delay every data operation by this many microseconds
    #[serde(default)]
    pub latency_us: u64,
}

fn default_alignment() -> u64 {
    1
}

fn default_alignment_usize() -> usize {
    1
}

fn default_true() -> bool {
    true
}

/// Operations as received by the driver, in order
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DriverOp {
    Read { offset: u64, bytes: u64 },
    Write { offset: u64, bytes: u64, fua: bool },
    WriteZeroes { offset: u64, bytes: u64, unmap: bool },
    Discard { offset: u64, bytes: u64 },
    Flush,
}

/// Operation kinds that can be made to fail
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorTarget {
    Read,
    Write,
    WriteZeroes,
    Discard,
    Flush,
}

pub struct Data {
    config: Config,
    storage: Mutex<Storage>,
    ops: Mutex<Vec<DriverOp>>,
    /// Each entry fails the next operation of its kind
    injected_errors: Mutex<Vec<ErrorTarget>>,
    inserted: AtomicBool,
}

struct Storage {
    data: Vec<u8>,
    allocated: Bitmap,
}

impl Config {
    pub fn new(size: u64) -> Self {
        Config {
            size,
            request_alignment: 1,
            max_transfer: 0,
            min_mem_alignment: 1,
            max_iov: 0,
            pwrite_zeroes_alignment: 0,
            max_pwrite_zeroes: 0,
            pdiscard_alignment: 0,
            max_pdiscard: 0,
            write_zeroes: false,
            discard: false,
            fua: false,
            block_status: true,
            latency_us: 0,
        }
    }
}

impl Data {
    pub fn new(node_name: &str, opts: &Config) -> BlockResult<Self> {
        let size: usize = opts
            .size
            .try_into()
            .map_err(|e| BlockError::from(e).prepend(&format!("Node \"{}\"", node_name)))?;
        let granularity = std::cmp::max(opts.request_alignment, ALLOCATION_GRANULARITY);

        Ok(Data {
            config: opts.clone(),
            storage: Mutex::new(Storage {
                data: vec![0; size],
                allocated: Bitmap::new(opts.size, granularity)?,
            }),
            ops: Default::default(),
            injected_errors: Default::default(),
            inserted: AtomicBool::new(true),
        })
    }

    /// Operations received since the last call
    pub fn take_ops(&self) -> Vec<DriverOp> {
        std::mem::take(&mut *self.ops.lock().unwrap())
    }

    /// Make the next operation of the given kind fail with an I/O error
    pub fn inject_error(&self, target: ErrorTarget) {
        self.injected_errors.lock().unwrap().push(target);
    }

    /// Eject (`false`) or insert (`true`) the medium
    pub fn set_inserted(&self, inserted: bool) {
        self.inserted.store(inserted, Ordering::SeqCst);
    }

    /// Copy of the whole content
    pub fn contents(&self) -> Vec<u8> {
        self.storage.lock().unwrap().data.clone()
    }

    fn record(&self, op: DriverOp) {
        self.ops.lock().unwrap().push(op);
    }

    fn check_injected(&self, target: ErrorTarget) -> BlockResult<()> {
        let mut injected = self.injected_errors.lock().unwrap();
        match injected.iter().position(|t| *t == target) {
            Some(i) => {
                injected.remove(i);
                Err(BlockError::from(std::io::Error::from_raw_os_error(libc::EIO))
                    .prepend(&format!("Injected {:?} error", target)))
            }
            None => Ok(()),
        }
    }

    async fn delay(&self) {
        if self.config.latency_us > 0 {
            tokio::time::sleep(Duration::from_micros(self.config.latency_us)).await;
        }
    }
}

impl Storage {
    /// Make room for `[offset, offset + bytes)`
    fn grow_to_cover(&mut self, offset: u64, bytes: u64) -> BlockResult<()> {
        let end = offset + bytes;
        if end > self.data.len() as u64 {
            self.data.resize(end.try_into()?, 0);
            self.allocated.resize(end)?;
        }
        Ok(())
    }

    fn zero(&mut self, offset: u64, bytes: u64) {
        let len = self.data.len() as u64;
        let start = std::cmp::min(offset, len) as usize;
        let end = std::cmp::min(offset + bytes, len) as usize;
        self.data[start..end].fill(0);
    }
}

#[async_trait]
impl NodeDriver for Data {
    fn driver_name(&self) -> &'static str {
        "memory"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn capabilities(&self) -> DriverCaps {
        let mut caps: DriverCaps = DriverCap::FlushToDisk.into();
        if self.config.write_zeroes {
            caps.add(DriverCap::WriteZeroes);
        }
        if self.config.discard {
            caps.add(DriverCap::Discard);
        }
        if self.config.block_status {
            caps.add(DriverCap::BlockStatus);
        }
        caps
    }

    fn is_protocol(&self) -> bool {
        true
    }

    fn is_inserted(&self) -> bool {
        self.inserted.load(Ordering::SeqCst)
    }

    fn length(&self) -> BlockResult<u64> {
        Ok(self.storage.lock().unwrap().data.len() as u64)
    }

    fn refresh_limits(&self, limits: &mut NodeLimits) -> BlockResult<()> {
        let c = &self.config;
        limits.request_alignment = c.request_alignment;
        limits.max_transfer = c.max_transfer;
        limits.min_mem_alignment = std::cmp::max(c.min_mem_alignment, 1);
        limits.opt_mem_alignment = std::cmp::max(limits.opt_mem_alignment, limits.min_mem_alignment);
        if c.max_iov != 0 {
            limits.max_iov = c.max_iov;
        }
        limits.pwrite_zeroes_alignment = c.pwrite_zeroes_alignment;
        limits.max_pwrite_zeroes = c.max_pwrite_zeroes;
        limits.pdiscard_alignment = c.pdiscard_alignment;
        limits.max_pdiscard = c.max_pdiscard;
        Ok(())
    }

    fn supported_write_flags(&self) -> RequestFlags {
        if self.config.fua {
            RequestFlag::Fua.into()
        } else {
            RequestFlags::empty()
        }
    }

    fn supported_zero_flags(&self) -> RequestFlags {
        let mut flags = self.supported_write_flags();
        if self.config.discard {
            flags.add(RequestFlag::MayUnmap);
        }
        flags
    }

    async fn readv(
        &self,
        offset: u64,
        mut bufv: IoVectorMut<'_>,
        _flags: RequestFlags,
    ) -> BlockResult<()> {
        let bytes = bufv.len();
        self.record(DriverOp::Read { offset, bytes });
        self.delay().await;
        self.check_injected(ErrorTarget::Read)?;

        let storage = self.storage.lock().unwrap();
        let len = storage.data.len() as u64;
        if offset + bytes <= len {
            bufv.copy_from_slice(&storage.data[offset as usize..(offset + bytes) as usize]);
        } else {
            // Only the last unit can reach past the end
            let mut tmp = vec![0u8; bytes as usize];
            if offset < len {
                let avail = (len - offset) as usize;
                tmp[..avail].copy_from_slice(&storage.data[offset as usize..]);
            }
            bufv.copy_from_slice(&tmp);
        }
        Ok(())
    }

    async fn writev(&self, offset: u64, bufv: IoVector<'_>, flags: RequestFlags) -> BlockResult<()> {
        let bytes = bufv.len();
        self.record(DriverOp::Write {
            offset,
            bytes,
            fua: flags.contains(RequestFlag::Fua),
        });
        self.delay().await;
        self.check_injected(ErrorTarget::Write)?;

        let mut storage = self.storage.lock().unwrap();
        storage.grow_to_cover(offset, bytes)?;
        bufv.copy_into_slice(&mut storage.data[offset as usize..(offset + bytes) as usize]);
        storage.allocated.set(offset, bytes);
        Ok(())
    }

    async fn write_zeroes(&self, offset: u64, bytes: u64, flags: RequestFlags) -> BlockResult<()> {
        if !self.config.write_zeroes {
            return Err(BlockError::not_supported("Zero writes not enabled"));
        }

        let unmap = flags.contains(RequestFlag::MayUnmap);
        self.record(DriverOp::WriteZeroes {
            offset,
            bytes,
            unmap,
        });
        self.delay().await;
        self.check_injected(ErrorTarget::WriteZeroes)?;

        let mut storage = self.storage.lock().unwrap();
        storage.grow_to_cover(offset, bytes)?;
        storage.zero(offset, bytes);
        if unmap {
            storage.allocated.clear(offset, bytes);
        } else {
            storage.allocated.set(offset, bytes);
        }
        Ok(())
    }

    async fn discard(&self, offset: u64, bytes: u64) -> BlockResult<()> {
        if !self.config.discard {
            return Err(BlockError::not_supported("Discard not enabled"));
        }

        self.record(DriverOp::Discard { offset, bytes });
        self.delay().await;
        self.check_injected(ErrorTarget::Discard)?;

        let mut storage = self.storage.lock().unwrap();
        let granularity = storage.allocated.granularity();
        // Partially discarded granules keep their data
        let start = offset.div_ceil(granularity) * granularity;
        let end = std::cmp::min((offset + bytes) / granularity * granularity, storage.data.len() as u64);
        if end > start {
            storage.zero(start, end - start);
            storage.allocated.clear(start, end - start);
        }
        Ok(())
    }

    async fn flush_to_disk(&self) -> BlockResult<()> {
        self.record(DriverOp::Flush);
        self.check_injected(ErrorTarget::Flush)
    }

    async fn block_status(
        &self,
        _want_zero: bool,
        offset: u64,
        bytes: u64,
    ) -> BlockResult<BlockStatusReport> {
        let storage = self.storage.lock().unwrap();
        let len = storage.data.len() as u64;
        let bytes = std::cmp::min(bytes, len.saturating_sub(offset));
        if bytes == 0 {
            return Ok(BlockStatusReport::new(BlockStatusFlag::Eof, 0));
        }

        let (status, pnum) = if storage.allocated.is_set(offset) {
            (BlockStatusFlag::Data, storage.allocated.get_set_area(offset, bytes))
        } else {
            (BlockStatusFlag::Zero, storage.allocated.get_clear_area(offset, bytes))
        };
        Ok(BlockStatusReport::mapped(status, pnum, offset, None))
    }
}
