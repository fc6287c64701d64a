//! Pass-through format driver: exposes (a window of) its file child unchanged.

use crate::helpers::{IoVector, IoVectorMut};
use crate::node::{
    BlockStatusFlag, BlockStatusReport, DriverCap, DriverCaps, NodeConfigOrReference, NodeDriver,
    NodePerm, NodeUser, RequestFlag, RequestFlags,
};
use crate::{BlockError, BlockResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub file: NodeConfigOrReference,

    /// Where the window starts in the file child
    #[serde(default)]
    pub offset: u64,

    /// Length of the window (the rest of the file child if not given)
    #[serde(default)]
    pub size: Option<u64>,
}

pub struct Data {
    file: Arc<NodeUser>,
    offset: u64,
    size: Option<u64>,
}

impl Config {
    pub fn new(file: impl Into<NodeConfigOrReference>) -> Self {
        Config {
            file: file.into(),
            offset: 0,
            size: None,
        }
    }
}

impl Data {
    pub async fn new(node_name: &str, opts: &Config, read_only: bool) -> BlockResult<Self> {
        let file_node = opts.file.open_or_lookup().await?;

        let file_length = file_node.length();
        if opts.offset > file_length {
            return Err(BlockError::invalid(format!(
                "Node \"{}\": offset {} is beyond the end of node \"{}\" ({} bytes)",
                node_name,
                opts.offset,
                file_node.name(),
                file_length
            )));
        }
        if let Some(size) = opts.size {
            if opts.offset.checked_add(size).map_or(true, |end| end > file_length) {
                return Err(BlockError::invalid(format!(
                    "Node \"{}\": window {:#x}+{:#x} exceeds node \"{}\"",
                    node_name,
                    opts.offset,
                    size,
                    file_node.name()
                )));
            }
        }

        let mut file_user =
            NodeUser::builder(node_name, "file").require(NodePerm::ConsistentRead);
        if !read_only {
            file_user = file_user.require(NodePerm::Write);
            if opts.size.is_none() {
                file_user = file_user.require(NodePerm::Resize);
            }
        }
        let file = file_node.add_user(file_user)?;

        Ok(Data {
            file,
            offset: opts.offset,
            size: opts.size,
        })
    }

    fn check_window(&self, offset: u64, bytes: u64) -> BlockResult<u64> {
        if let Some(size) = self.size {
            if offset.saturating_add(bytes) > size {
                return Err(BlockError::invalid(format!(
                    "Request {:#x}+{:#x} exceeds the window of {:#x} bytes",
                    offset, bytes, size
                )));
            }
        }
        Ok(self.offset + offset)
    }
}

#[async_trait]
impl NodeDriver for Data {
    fn driver_name(&self) -> &'static str {
        "raw"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn capabilities(&self) -> DriverCaps {
        DriverCap::WriteZeroes | DriverCap::Discard | DriverCap::BlockStatus
    }

    fn is_inserted(&self) -> bool {
        self.file.node().is_inserted()
    }

    fn length(&self) -> BlockResult<u64> {
        match self.size {
            Some(size) => Ok(size),
            None => Ok(self.file.node().length().saturating_sub(self.offset)),
        }
    }

    fn supported_write_flags(&self) -> RequestFlags {
        RequestFlag::Fua.into()
    }

    fn supported_zero_flags(&self) -> RequestFlags {
        RequestFlag::Fua | RequestFlag::MayUnmap
    }

    fn file_child(&self) -> Option<Arc<NodeUser>> {
        Some(Arc::clone(&self.file))
    }

    async fn readv(&self, offset: u64, bufv: IoVectorMut<'_>, flags: RequestFlags) -> BlockResult<()> {
        let offset = self.check_window(offset, bufv.len())?;
        self.file.preadv(offset, bufv, flags).await?;
        Ok(())
    }

    async fn writev(&self, offset: u64, bufv: IoVector<'_>, flags: RequestFlags) -> BlockResult<()> {
        let offset = self.check_window(offset, bufv.len())?;
        self.file.pwritev(offset, bufv, flags).await?;
        Ok(())
    }

    async fn write_zeroes(&self, offset: u64, bytes: u64, flags: RequestFlags) -> BlockResult<()> {
        let offset = self.check_window(offset, bytes)?;
        self.file
            .pwrite_zeroes(offset, bytes, flags.with(RequestFlag::NoFallback))
            .await
    }

    async fn discard(&self, offset: u64, bytes: u64) -> BlockResult<()> {
        let offset = self.check_window(offset, bytes)?;
        self.file.node().pdiscard(offset, bytes).await
    }

    async fn block_status(
        &self,
        _want_zero: bool,
        offset: u64,
        bytes: u64,
    ) -> BlockResult<BlockStatusReport> {
        Ok(BlockStatusReport::mapped(
            BlockStatusFlag::Raw,
            bytes,
            self.offset + offset,
            Some(Arc::clone(self.file.node())),
        ))
    }
}
