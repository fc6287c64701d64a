//! Allocation status of byte ranges, through a node's file child and down its backing chain.

use super::{DriverCap, Node, NodeDriver};
use crate::helpers::{BlockFutureResult, IntAlignment};
use crate::BlockResult;
use std::sync::Arc;

numerical_enum! {
    pub enum BlockStatusFlag as u32 {
        /// Data is read from this node's storage (or its file child)
        Data = 0x1,
        /// Reads return zeroes
        Zero = 0x2,
        /// `map` is the offset in `file` where the data lives
        OffsetValid = 0x4,
        /// Pass-through: ask `file` at `map` instead
        Raw = 0x8,
        /// The content is determined by this node, not by its backing chain
        Allocated = 0x10,
        /// The range reaches the end of the node
        Eof = 0x20,
        /// Ask `file` whether the data reads as zeroes
        Recurse = 0x40,
    }
}

flag_set! {
    pub struct BlockStatus(BlockStatusFlag as u32);
}

/// Result of a status query for `[offset, offset + pnum)`
#[derive(Clone, Debug)]
pub struct BlockStatusReport {
    pub status: BlockStatus,
    /// Number of bytes the status applies to
    pub pnum: u64,
    /// Offset in `file`, valid with `OffsetValid`
    pub map: u64,
    /// Node holding the data.  Drivers may leave this empty to refer to their own node.
    pub file: Option<Arc<Node>>,
}

impl BlockStatusReport {
    pub fn new(status: impl Into<BlockStatus>, pnum: u64) -> Self {
        BlockStatusReport {
            status: status.into(),
            pnum,
            map: 0,
            file: None,
        }
    }

    /// Data found at `map` in `file` (`None` for the reporting node itself)
    pub fn mapped(
        status: impl Into<BlockStatus>,
        pnum: u64,
        map: u64,
        file: Option<Arc<Node>>,
    ) -> Self {
        BlockStatusReport {
            status: status.into().with(BlockStatusFlag::OffsetValid),
            pnum,
            map,
            file,
        }
    }

    pub fn is_allocated(&self) -> bool {
        self.status.contains(BlockStatusFlag::Allocated)
    }

    pub fn is_zero(&self) -> bool {
        self.status.contains(BlockStatusFlag::Zero)
    }
}

impl Node {
    /// Status of `[offset, offset + bytes)` in this node.  The reported `pnum` is 0 only if
    /// `offset` is at or past the end of the node (then `Eof` is set).  Without `want_zero`, the
    /// walker may skip work that only serves to find zeroes.
    pub fn block_status(
        &self,
        want_zero: bool,
        offset: u64,
        bytes: u64,
    ) -> BlockFutureResult<'_, BlockStatusReport> {
        Box::pin(self.do_block_status(want_zero, offset, bytes))
    }

    async fn do_block_status(
        &self,
        want_zero: bool,
        offset: u64,
        bytes: u64,
    ) -> BlockResult<BlockStatusReport> {
        let driver = self.driver()?;
        let total = self.length();

        if offset >= total {
            return Ok(BlockStatusReport::new(BlockStatusFlag::Eof, 0));
        }
        if bytes == 0 {
            return Ok(BlockStatusReport::new(BlockStatus::empty(), 0));
        }
        let bytes = std::cmp::min(bytes, total - offset);

        if !driver.capabilities().contains(DriverCap::BlockStatus) {
            let mut report = if driver.is_protocol() {
                BlockStatusReport::mapped(
                    BlockStatusFlag::Data | BlockStatusFlag::Allocated,
                    bytes,
                    offset,
                    Some(self.arc()),
                )
            } else {
                BlockStatusReport::new(BlockStatusFlag::Data | BlockStatusFlag::Allocated, bytes)
            };
            if offset + bytes == total {
                report.status.add(BlockStatusFlag::Eof);
            }
            return Ok(report);
        }

        let in_flight = self.enter_in_flight();
        let result = self
            .driver_block_status(driver.as_ref(), want_zero, offset, bytes)
            .await;
        drop(in_flight);

        let mut report = result?;
        report.status.remove(BlockStatusFlag::Recurse);
        if offset + report.pnum == total {
            report.status.add(BlockStatusFlag::Eof);
        }
        Ok(report)
    }

    async fn driver_block_status(
        &self,
        driver: &dyn NodeDriver,
        want_zero: bool,
        offset: u64,
        bytes: u64,
    ) -> BlockResult<BlockStatusReport> {
        let align = self.limits().request_alignment;
        let aligned_offset = offset.align_down(align);
        let aligned_end = (offset + bytes).align_up(align).unwrap_or(u64::MAX);
        let skip = offset - aligned_offset;

        let mut report = driver
            .block_status(want_zero, aligned_offset, aligned_end - aligned_offset)
            .await?;
        assert!(
            report.pnum > skip,
            "Driver {} of node \"{}\" reported no progress at {:#x}",
            driver.driver_name(),
            self.name(),
            aligned_offset
        );

        report.pnum = std::cmp::min(report.pnum - skip, bytes);
        if report.status.contains(BlockStatusFlag::OffsetValid) {
            report.map += skip;
            if report.file.is_none() {
                report.file = Some(self.arc());
            }
        }

        if report.status.contains(BlockStatusFlag::Raw) {
            let file = match report.file.as_ref() {
                Some(file) if report.status.contains(BlockStatusFlag::OffsetValid) => {
                    Arc::clone(file)
                }
                _ => panic!("Raw block status without a mapping"),
            };
            return file.block_status(want_zero, report.map, report.pnum).await;
        }

        if !report
            .status
            .overlap_with(BlockStatusFlag::Data | BlockStatusFlag::Zero)
            .is_empty()
        {
            report.status.add(BlockStatusFlag::Allocated);
        } else if driver.supports_backing() {
            match self.backing_node() {
                None => report.status.add(BlockStatusFlag::Zero),
                // A shorter backing node reads as zeroes past its end
                Some(backing) if want_zero && offset >= backing.length() => {
                    report.status.add(BlockStatusFlag::Zero)
                }
                Some(_) => (),
            }
        }

        if want_zero
            && report.status.contains(BlockStatusFlag::Recurse)
            && report.status.contains(BlockStatusFlag::Data)
            && report.status.contains(BlockStatusFlag::OffsetValid)
            && !report.status.contains(BlockStatusFlag::Zero)
        {
            if let Some(file) = report.file.clone().filter(|f| !std::ptr::eq(&**f, self)) {
                // Only extra information; errors are not fatal
                if let Ok(file_report) = file.block_status(want_zero, report.map, report.pnum).await
                {
                    if file_report.status.contains(BlockStatusFlag::Eof)
                        && (file_report.pnum == 0 || file_report.is_zero())
                    {
                        report.status.add(BlockStatusFlag::Zero);
                    } else {
                        report.pnum = file_report.pnum;
                        report
                            .status
                            .add(file_report.status.overlap_with(BlockStatusFlag::Zero));
                    }
                }
            }
        }

        Ok(report)
    }

    /// Walk from this node down the backing chain until the range is found allocated, stopping
    /// before (or, with `include_base`, at) `base`.  Returns the report and the number of
    /// layers queried.
    async fn common_block_status_above(
        &self,
        base: Option<&Node>,
        include_base: bool,
        want_zero: bool,
        offset: u64,
        bytes: u64,
    ) -> BlockResult<(BlockStatusReport, usize)> {
        assert!(!include_base || base.is_some());
        let is_base = |node: &Node| base.map_or(false, |b| std::ptr::eq(node, b));

        if !include_base && is_base(self) {
            return Ok((BlockStatusReport::new(BlockStatus::empty(), bytes), 0));
        }

        let mut report = self.block_status(want_zero, offset, bytes).await?;
        let mut depth = 1;
        if report.pnum == 0 || report.is_allocated() || is_base(self) {
            return Ok((report, depth));
        }

        let eof = report
            .status
            .contains(BlockStatusFlag::Eof)
            .then_some(offset + report.pnum);
        let mut bytes = report.pnum;

        let mut layer = self.backing_node();
        while let Some(node) = layer {
            if !include_base && is_base(&node) {
                break;
            }

            report = node.block_status(want_zero, offset, bytes).await?;
            depth += 1;

            if report.pnum == 0 {
                // Short layer: what the upper layers defer to it reads as zeroes
                assert!(report.status.contains(BlockStatusFlag::Eof));
                report = BlockStatusReport {
                    status: BlockStatusFlag::Zero | BlockStatusFlag::Allocated,
                    pnum: bytes,
                    map: 0,
                    file: Some(node),
                };
                break;
            }
            if report.is_allocated() {
                report.status.remove(BlockStatusFlag::Eof);
                break;
            }
            if is_base(&node) {
                break;
            }

            bytes = report.pnum;
            layer = node.backing_node();
        }

        if Some(offset + report.pnum) == eof {
            report.status.add(BlockStatusFlag::Eof);
        }
        Ok((report, depth))
    }

    /// Status of the range as seen through the backing chain above (excluding) `base`
    pub async fn block_status_above(
        &self,
        base: Option<&Node>,
        offset: u64,
        bytes: u64,
    ) -> BlockResult<BlockStatusReport> {
        self.common_block_status_above(base, false, true, offset, bytes)
            .await
            .map(|(report, _)| report)
    }

    /// Whether the range starting at `offset` is allocated in this node, and for how many bytes
    /// that answer holds
    pub async fn is_allocated(&self, offset: u64, bytes: u64) -> BlockResult<(bool, u64)> {
        let (report, _) = self
            .common_block_status_above(Some(self), true, false, offset, bytes)
            .await?;
        Ok((report.is_allocated(), report.pnum))
    }

    /// Whether the range is allocated anywhere in the chain from this node down to `base`
    /// (included with `include_base`)
    pub async fn is_allocated_above(
        &self,
        base: Option<&Node>,
        include_base: bool,
        offset: u64,
        bytes: u64,
    ) -> BlockResult<(bool, u64)> {
        let (report, _) = self
            .common_block_status_above(base, include_base, false, offset, bytes)
            .await?;
        Ok((report.is_allocated(), report.pnum))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory;
    use crate::node::{self, NodeConfig, NodePerm, NodeUser};

    #[tokio::test]
    async fn memory_node_reports_data_and_zero() {
        let node = node::open(NodeConfig::new("bs-mem", memory::Config::new(65536)))
            .await
            .unwrap();
        let user = node
            .add_user(NodeUser::root("bs-mem-user").require(NodePerm::Write))
            .unwrap();
        user.write(&[0x5a; 8192], 4096).await.unwrap();

        let report = node.block_status(true, 0, 65536).await.unwrap();
        assert!(report.is_zero() && report.is_allocated());
        assert_eq!(report.pnum, 4096);

        let report = node.block_status(true, 4096, 65536).await.unwrap();
        assert!(report.status.contains(BlockStatusFlag::Data));
        assert!(report.status.contains(BlockStatusFlag::OffsetValid));
        assert_eq!(report.map, 4096);
        assert_eq!(report.pnum, 8192);
        assert!(Arc::ptr_eq(report.file.as_ref().unwrap(), &node));

        let report = node.block_status(true, 60000, 10000).await.unwrap();
        assert!(report.status.contains(BlockStatusFlag::Eof));
        assert_eq!(report.pnum, 65536 - 60000);

        let report = node.block_status(true, 65536, 512).await.unwrap();
        assert_eq!(report.pnum, 0);
        assert!(report.status.contains(BlockStatusFlag::Eof));
    }

    #[tokio::test]
    async fn missing_driver_support_means_allocated_data() {
        let mut config = memory::Config::new(8192);
        config.block_status = false;
        let node = node::open(NodeConfig::new("bs-nosupport", config))
            .await
            .unwrap();

        let report = node.block_status(true, 1000, 2000).await.unwrap();
        assert!(report.status.contains(BlockStatusFlag::Data));
        assert!(report.is_allocated());
        assert!(report.status.contains(BlockStatusFlag::OffsetValid));
        assert_eq!((report.pnum, report.map), (2000, 1000));
    }

    #[tokio::test]
    async fn unaligned_query_is_clamped_to_request() {
        let mut config = memory::Config::new(65536);
        config.request_alignment = 4096;
        let node = node::open(NodeConfig::new("bs-unaligned", config))
            .await
            .unwrap();

        let report = node.block_status(true, 100, 1000).await.unwrap();
        assert_eq!(report.pnum, 1000);
        assert_eq!(report.map, 100);
    }
}
