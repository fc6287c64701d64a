//! Blocking versions of the node operations, for callers outside of any coroutine.
//!
//! Each wrapper goes through [`coroutine::run()`] and drives the node's context until the
//! operation is done.  Coroutines await the async operations instead; calling a wrapper from a
//! coroutine panics.  Neither may be called from an async runtime's own thread.

use super::{BlockStatusReport, IoQueue, Node, NodeConfig, NodeUser, RequestFlags};
use crate::aio::AioContext;
use crate::coroutine;
use crate::helpers::{IoVector, IoVectorMut};
use crate::BlockResult;
use std::sync::Arc;

/// Open a node on the main context
pub fn open_sync(opts: NodeConfig) -> BlockResult<Arc<Node>> {
    let ctx = AioContext::main()?;
    coroutine::run(&ctx, super::open_in(opts, Arc::clone(&ctx)))
}

impl Node {
    pub fn pdiscard_sync(&self, offset: u64, bytes: u64) -> BlockResult<()> {
        coroutine::run(self.ctx(), self.pdiscard(offset, bytes))
    }

    pub fn flush_sync(&self) -> BlockResult<()> {
        coroutine::run(self.ctx(), self.flush())
    }

    pub fn block_status_sync(
        &self,
        want_zero: bool,
        offset: u64,
        bytes: u64,
    ) -> BlockResult<BlockStatusReport> {
        coroutine::run(self.ctx(), self.block_status(want_zero, offset, bytes))
    }

    pub fn block_status_above_sync(
        &self,
        base: Option<&Node>,
        offset: u64,
        bytes: u64,
    ) -> BlockResult<BlockStatusReport> {
        coroutine::run(self.ctx(), self.block_status_above(base, offset, bytes))
    }

    pub fn is_allocated_sync(&self, offset: u64, bytes: u64) -> BlockResult<(bool, u64)> {
        coroutine::run(self.ctx(), self.is_allocated(offset, bytes))
    }

    pub fn is_allocated_above_sync(
        &self,
        base: Option<&Node>,
        include_base: bool,
        offset: u64,
        bytes: u64,
    ) -> BlockResult<(bool, u64)> {
        coroutine::run(
            self.ctx(),
            self.is_allocated_above(base, include_base, offset, bytes),
        )
    }

    pub fn drained_begin_sync(&self) {
        coroutine::run(self.ctx(), self.drained_begin())
    }

    pub fn drained_end_sync(&self) {
        coroutine::run(self.ctx(), self.drained_end())
    }

    pub fn subtree_drained_begin_sync(&self) {
        coroutine::run(self.ctx(), self.subtree_drained_begin())
    }

    pub fn subtree_drained_end_sync(&self) {
        coroutine::run(self.ctx(), self.subtree_drained_end())
    }

    pub fn change_backing_sync(&self, backing: Option<&Arc<Node>>) -> BlockResult<()> {
        coroutine::run(self.ctx(), self.change_backing(backing))
    }

    pub fn close_sync(&self) {
        coroutine::run(self.ctx(), self.close())
    }
}

impl NodeUser {
    pub fn preadv_sync(
        &self,
        offset: u64,
        bufv: IoVectorMut<'_>,
        flags: RequestFlags,
    ) -> BlockResult<u64> {
        coroutine::run(self.node().ctx(), self.preadv(offset, bufv, flags))
    }

    pub fn read_sync(&self, buf: &mut [u8], offset: u64) -> BlockResult<u64> {
        coroutine::run(self.node().ctx(), self.read(buf, offset))
    }

    pub fn pwritev_sync(
        &self,
        offset: u64,
        bufv: IoVector<'_>,
        flags: RequestFlags,
    ) -> BlockResult<u64> {
        coroutine::run(self.node().ctx(), self.pwritev(offset, bufv, flags))
    }

    pub fn write_sync(&self, buf: &[u8], offset: u64) -> BlockResult<u64> {
        coroutine::run(self.node().ctx(), self.write(buf, offset))
    }

    pub fn pwrite_zeroes_sync(&self, offset: u64, bytes: u64, flags: RequestFlags) -> BlockResult<()> {
        coroutine::run(self.node().ctx(), self.pwrite_zeroes(offset, bytes, flags))
    }
}

impl IoQueue {
    pub fn read_sync(&self, buf: &mut [u8], offset: u64) -> BlockResult<u64> {
        coroutine::run(self.node().ctx(), self.read(buf, offset))
    }

    pub fn write_sync(&self, buf: &[u8], offset: u64) -> BlockResult<u64> {
        coroutine::run(self.node().ctx(), self.write(buf, offset))
    }

    pub fn pwrite_zeroes_sync(&self, offset: u64, bytes: u64, flags: RequestFlags) -> BlockResult<()> {
        coroutine::run(self.node().ctx(), self.pwrite_zeroes(offset, bytes, flags))
    }

    pub fn pdiscard_sync(&self, offset: u64, bytes: u64) -> BlockResult<()> {
        coroutine::run(self.node().ctx(), self.pdiscard(offset, bytes))
    }

    pub fn flush_sync(&self) -> BlockResult<()> {
        coroutine::run(self.node().ctx(), self.flush())
    }
}
