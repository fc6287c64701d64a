//! Protocol driver for host files and block devices.

use crate::helpers::{IoVector, IoVectorMut};
use crate::node::{
    BlockStatusFlag, BlockStatusReport, DriverCap, DriverCaps, NodeConfig, NodeDriver, NodeLimits,
    RequestFlag, RequestFlags,
};
use crate::{BlockError, BlockResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fs::File;
use std::io::{self, Seek, SeekFrom};
use std::os::fd::AsRawFd;
use std::path::PathBuf;

/// Request alignment for `O_DIRECT` access
const DIRECT_REQUEST_ALIGNMENT: u64 = 512;
/// Buffer alignment for `O_DIRECT` access
const DIRECT_MEM_ALIGNMENT: usize = 4096;

const BLOCK_IO_TYPE: u32 = 0x12;
/// `_IO(0x12, 119)`
const BLKDISCARD: u32 = (BLOCK_IO_TYPE << 8) | 119;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub filename: PathBuf,

    /// Take a `flock()` lock (shared if read-only, exclusive otherwise)
    #[serde(default = "default_locking")]
    pub locking: bool,
}

fn default_locking() -> bool {
    true
}

pub struct Data {
    file: File,
    filename: PathBuf,
    is_block_device: bool,
    direct: bool,
}

/// The operation to perform with `fallocate`.
enum FallocateMode {
    PunchHole,
    ZeroRange,
}

impl From<FallocateMode> for i32 {
    fn from(value: FallocateMode) -> Self {
        match value {
            FallocateMode::PunchHole => libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
            FallocateMode::ZeroRange => libc::FALLOC_FL_ZERO_RANGE | libc::FALLOC_FL_KEEP_SIZE,
        }
    }
}

impl Config {
    pub fn new<P: Into<PathBuf>>(filename: P) -> Self {
        Config {
            filename: filename.into(),
            locking: true,
        }
    }
}

impl Data {
    pub fn new(node_name: &str, opts: &Config, node_opts: &NodeConfig) -> BlockResult<Self> {
        let read_only = node_opts.read_only;
        let mut options = File::options();
        options.read(true).write(!read_only);

        let file = options.open(&opts.filename).map_err(|e| {
            BlockError::from(e).prepend(&format!(
                "Node \"{}\": Failed to open {}",
                node_name,
                opts.filename.display()
            ))
        })?;

        if opts.locking {
            let operation = if read_only {
                libc::LOCK_SH
            } else {
                libc::LOCK_EX
            };
            // SAFETY: Valid fd and flock operation; the return value is checked.  The lock is
            // dropped together with the file.
            if unsafe { libc::flock(file.as_raw_fd(), operation | libc::LOCK_NB) } < 0 {
                return Err(BlockError::from(io::Error::last_os_error()).prepend(&format!(
                    "Node \"{}\": Failed to lock {}",
                    node_name,
                    opts.filename.display()
                )));
            }
        }

        // Set via fcntl so it also applies to files opened through other means than `open()`
        if node_opts.cache.direct {
            // SAFETY: Plain fcntl calls on a valid fd; the return values are checked.
            let flags = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_GETFL) };
            if flags < 0
                || unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETFL, flags | libc::O_DIRECT) }
                    < 0
            {
                return Err(BlockError::from(io::Error::last_os_error())
                    .prepend(&format!("Node \"{}\": Failed to enable O_DIRECT", node_name)));
            }
        }

        let is_block_device = {
            use std::os::unix::fs::FileTypeExt;
            file.metadata()?.file_type().is_block_device()
        };

        Ok(Data {
            file,
            filename: opts.filename.clone(),
            is_block_device,
            direct: node_opts.cache.direct,
        })
    }

    fn fallocate(&self, mode: FallocateMode, offset: u64, len: u64) -> BlockResult<()> {
        let offset: libc::off64_t = offset.try_into()?;
        let len: libc::off64_t = len.try_into()?;
        // SAFETY: Valid fd and fallocate mode, offset and len are in range; the return value is
        // checked.
        let ret = unsafe { libc::fallocate64(self.file.as_raw_fd(), mode.into(), offset, len) };
        if ret < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn discard_block(&self, offset: u64, len: u64) -> BlockResult<()> {
        let range: [u64; 2] = [offset, len];
        // SAFETY: BLKDISCARD only reads the given range and does not keep the fd; the return
        // value is checked.
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), BLKDISCARD as _, &range) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOTTY) {
                return Err(BlockError::not_supported(err.to_string()));
            }
            return Err(err.into());
        }
        Ok(())
    }

    fn lseek(&self, offset: u64, whence: libc::c_int) -> io::Result<u64> {
        let offset: libc::off64_t = offset
            .try_into()
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        // SAFETY: lseek on a valid fd; the return value is checked.
        let ret = unsafe { libc::lseek64(self.file.as_raw_fd(), offset, whence) };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret as u64)
        }
    }
}

#[async_trait]
impl NodeDriver for Data {
    fn driver_name(&self) -> &'static str {
        "file"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn capabilities(&self) -> DriverCaps {
        DriverCap::WriteZeroes | DriverCap::Discard | DriverCap::BlockStatus | DriverCap::FlushToDisk
    }

    fn is_protocol(&self) -> bool {
        true
    }

    fn length(&self) -> BlockResult<u64> {
        if self.is_block_device {
            Ok((&self.file).seek(SeekFrom::End(0))?)
        } else {
            Ok(self.file.metadata()?.len())
        }
    }

    fn refresh_limits(&self, limits: &mut NodeLimits) -> BlockResult<()> {
        if self.direct {
            limits.request_alignment = DIRECT_REQUEST_ALIGNMENT;
            limits.min_mem_alignment = DIRECT_MEM_ALIGNMENT;
            limits.opt_mem_alignment = DIRECT_MEM_ALIGNMENT;
        }
        Ok(())
    }

    fn supported_zero_flags(&self) -> RequestFlags {
        RequestFlag::MayUnmap.into()
    }

    async fn readv(
        &self,
        mut offset: u64,
        mut bufv: IoVectorMut<'_>,
        _flags: RequestFlags,
    ) -> BlockResult<()> {
        while !bufv.is_empty() {
            let ret = {
                let iov = bufv.to_iovec();
                // SAFETY: `iov` describes the buffers of `bufv`, which is not touched until the
                // call returns
                unsafe {
                    libc::preadv(
                        self.file.as_raw_fd(),
                        iov.as_ptr(),
                        iov.len() as libc::c_int,
                        offset.try_into()?,
                    )
                }
            };

            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(BlockError::from(err)
                    .prepend(&format!("Reading from {}", self.filename.display())));
            }
            if ret == 0 {
                // End of file
                bufv.fill(0);
                break;
            }

            offset += ret as u64;
            bufv = bufv.split_tail_at(ret as u64);
        }
        Ok(())
    }

    async fn writev(
        &self,
        mut offset: u64,
        mut bufv: IoVector<'_>,
        _flags: RequestFlags,
    ) -> BlockResult<()> {
        while !bufv.is_empty() {
            let ret = {
                let iov = bufv.to_iovec();
                // SAFETY: `iov` describes the buffers of `bufv`, which outlives the call
                unsafe {
                    libc::pwritev(
                        self.file.as_raw_fd(),
                        iov.as_ptr(),
                        iov.len() as libc::c_int,
                        offset.try_into()?,
                    )
                }
            };

            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(BlockError::from(err)
                    .prepend(&format!("Writing to {}", self.filename.display())));
            }
            if ret == 0 {
                return Err(BlockError::from_desc(format!(
                    "Short write to {} at {:#x}",
                    self.filename.display(),
                    offset
                )));
            }

            offset += ret as u64;
            bufv = bufv.split_tail_at(ret as u64);
        }
        Ok(())
    }

    async fn write_zeroes(&self, offset: u64, bytes: u64, flags: RequestFlags) -> BlockResult<()> {
        if flags.contains(RequestFlag::MayUnmap) && !self.is_block_device {
            // Holes read as zeroes
            if self.fallocate(FallocateMode::PunchHole, offset, bytes).is_ok() {
                return self.grow_to(offset + bytes);
            }
        }

        self.fallocate(FallocateMode::ZeroRange, offset, bytes)?;
        self.grow_to(offset + bytes)
    }

    async fn discard(&self, offset: u64, bytes: u64) -> BlockResult<()> {
        if self.is_block_device {
            self.discard_block(offset, bytes)
        } else {
            self.fallocate(FallocateMode::PunchHole, offset, bytes)
        }
    }

    async fn flush_to_disk(&self) -> BlockResult<()> {
        self.file
            .sync_data()
            .map_err(|e| BlockError::from(e).prepend(&format!("Syncing {}", self.filename.display())))
    }

    async fn block_status(
        &self,
        _want_zero: bool,
        offset: u64,
        bytes: u64,
    ) -> BlockResult<BlockStatusReport> {
        if self.is_block_device {
            return Ok(BlockStatusReport::mapped(
                BlockStatusFlag::Data,
                bytes,
                offset,
                None,
            ));
        }

        let (status, pnum) = match self.lseek(offset, libc::SEEK_DATA) {
            // Trailing hole
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => (BlockStatusFlag::Zero, bytes),
            Err(e) => {
                debug!(
                    "SEEK_DATA on {} failed ({}), reporting data",
                    self.filename.display(),
                    e
                );
                (BlockStatusFlag::Data, bytes)
            }
            Ok(data) if data > offset => (BlockStatusFlag::Zero, data - offset),
            Ok(_) => match self.lseek(offset, libc::SEEK_HOLE) {
                Ok(hole) if hole > offset => (BlockStatusFlag::Data, hole - offset),
                _ => (BlockStatusFlag::Data, bytes),
            },
        };

        Ok(BlockStatusReport::mapped(
            status,
            std::cmp::min(pnum, bytes),
            offset,
            None,
        ))
    }

    async fn close(&self) {
        debug!("Closing {}", self.filename.display());
    }
}

impl Data {
    /// `fallocate()` keeps the size, so zero writes past the end extend the file explicitly
    fn grow_to(&self, end: u64) -> BlockResult<()> {
        if !self.is_block_device && end > self.file.metadata()?.len() {
            self.file.set_len(end)?;
        }
        Ok(())
    }
}
