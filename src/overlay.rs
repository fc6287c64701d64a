//! Copy-on-write overlay: clusters written through this node land in its file child, everything
//! else is read from the backing child.
//!
//! The allocation map only lives in memory; this driver exists to build backing chains, not to
//! store images.  Clusters are mapped one-to-one onto the file child.

use crate::helpers::{Bitmap, IoVector, IoVectorMut};
use crate::node::{
    BlockStatus, BlockStatusFlag, BlockStatusReport, DriverCap, DriverCaps, NodeConfigOrReference,
    NodeDriver, NodeLimits, NodePerm, NodeUser, RequestFlag, RequestFlags,
};
use crate::{BlockError, BlockResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::{Arc, Mutex, RwLock};

const DEFAULT_CLUSTER_SIZE: u64 = 65536;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub file: NodeConfigOrReference,

    #[serde(default)]
    pub backing: Option<NodeConfigOrReference>,

    #[serde(default = "default_cluster_size")]
    pub cluster_size: u64,

    /// Virtual size; defaults to the backing node's length, or the file's if there is no backing
    /// node
    #[serde(default)]
    pub size: Option<u64>,
}

fn default_cluster_size() -> u64 {
    DEFAULT_CLUSTER_SIZE
}

pub struct Data {
    node_name: String,
    file: Arc<NodeUser>,
    backing: RwLock<Option<Arc<NodeUser>>>,
    cluster_size: u64,
    map: Mutex<ClusterMap>,
    /// Held by writes that allocate clusters, so partial-cluster copies do not interleave
    alloc_lock: tokio::sync::Mutex<()>,
}

/// A cluster is either unallocated (read from the backing node), holds data in the file child,
/// or reads as zeroes
struct ClusterMap {
    size: u64,
    data: Bitmap,
    zero: Bitmap,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ClusterState {
    Unallocated,
    Data,
    Zero,
}

impl Config {
    pub fn new(file: impl Into<NodeConfigOrReference>) -> Self {
        Config {
            file: file.into(),
            backing: None,
            cluster_size: DEFAULT_CLUSTER_SIZE,
            size: None,
        }
    }

    pub fn with_backing(mut self, backing: impl Into<NodeConfigOrReference>) -> Self {
        self.backing = Some(backing.into());
        self
    }
}

impl ClusterMap {
    fn new(size: u64, cluster_size: u64) -> BlockResult<Self> {
        Ok(ClusterMap {
            size,
            data: Bitmap::new(size, cluster_size)?,
            zero: Bitmap::new(size, cluster_size)?,
        })
    }

    fn grow(&mut self, size: u64) -> BlockResult<()> {
        if size > self.size {
            self.data.resize(size)?;
            self.zero.resize(size)?;
            self.size = size;
        }
        Ok(())
    }

    /// State at `offset`, and for how many bytes (up to `max`) it stays the same
    fn state_at(&self, offset: u64, max: u64) -> (ClusterState, u64) {
        if self.data.is_set(offset) {
            (ClusterState::Data, self.data.get_set_area(offset, max))
        } else if self.zero.is_set(offset) {
            (ClusterState::Zero, self.zero.get_set_area(offset, max))
        } else {
            let len = std::cmp::min(
                self.data.get_clear_area(offset, max),
                self.zero.get_clear_area(offset, max),
            );
            (ClusterState::Unallocated, len)
        }
    }
}

impl Data {
    pub async fn new(node_name: &str, opts: &Config, read_only: bool) -> BlockResult<Self> {
        let cluster_size = opts.cluster_size;
        if !cluster_size.is_power_of_two() || !(512..=(1 << 21)).contains(&cluster_size) {
            return Err(BlockError::invalid(format!(
                "Node \"{}\": cluster size {} is not a power of two between 512 B and 2 MiB",
                node_name, cluster_size
            )));
        }

        let file_node = opts.file.open_or_lookup().await?;
        let mut file_user = NodeUser::builder(node_name, "file")
            .require(NodePerm::ConsistentRead)
            .block(NodePerm::Write | NodePerm::Resize);
        if !read_only {
            file_user = file_user.require(NodePerm::Write | NodePerm::Resize);
        }
        let file = file_node.add_user(file_user)?;

        let backing = match opts.backing.as_ref() {
            Some(backing) => {
                let backing_node = backing.open_or_lookup().await?;
                Some(backing_node.add_user(
                    NodeUser::builder(node_name, "backing")
                        .require(NodePerm::ConsistentRead)
                        .block(NodePerm::Resize),
                )?)
            }
            None => None,
        };

        let size = match (opts.size, backing.as_ref()) {
            (Some(size), _) => size,
            (None, Some(backing)) => backing.node().length(),
            (None, None) => file.node().length(),
        };

        Ok(Data {
            node_name: node_name.to_string(),
            file,
            backing: RwLock::new(backing),
            cluster_size,
            map: Mutex::new(ClusterMap::new(size, cluster_size)?),
            alloc_lock: Default::default(),
        })
    }

    fn backing(&self) -> Option<Arc<NodeUser>> {
        self.backing.read().unwrap().clone()
    }

    fn is_cluster_aligned(&self, offset: u64, end: u64) -> bool {
        let size = self.map.lock().unwrap().size;
        offset % self.cluster_size == 0 && (end % self.cluster_size == 0 || end >= size)
    }

    /// Read from the backing node; whatever it does not cover reads as zeroes
    async fn read_backing(&self, offset: u64, bufv: IoVectorMut<'_>) -> BlockResult<()> {
        let backing = match self.backing() {
            Some(backing) => backing,
            None => {
                let mut bufv = bufv;
                bufv.fill(0);
                return Ok(());
            }
        };

        let backing_len = backing.node().length();
        let available = std::cmp::min(bufv.len(), backing_len.saturating_sub(offset));
        let (head, mut tail) = bufv.split_at(available);
        if !head.is_empty() {
            backing.preadv(offset, head, RequestFlags::empty()).await?;
        }
        if !tail.is_empty() {
            tail.fill(0);
        }
        Ok(())
    }

    /// Read `[offset, offset + bufv.len())` as seen through this node
    async fn read_range(&self, mut offset: u64, mut bufv: IoVectorMut<'_>) -> BlockResult<()> {
        while !bufv.is_empty() {
            let (state, len) = {
                let map = self.map.lock().unwrap();
                map.state_at(offset, bufv.len())
            };
            if len == 0 {
                // Past the virtual size
                bufv.fill(0);
                break;
            }

            let (mut chunk, rest) = bufv.split_at(len);
            match state {
                ClusterState::Data => {
                    self.file.preadv(offset, chunk, RequestFlags::empty()).await?;
                }
                ClusterState::Zero => chunk.fill(0),
                ClusterState::Unallocated => self.read_backing(offset, chunk).await?,
            }

            offset += len;
            bufv = rest;
        }
        Ok(())
    }

    /// Copy the current content of `[start, end)` into the file child, so the cluster around it
    /// can be switched to `Data` without losing what the rest of it reads as
    async fn copy_partial_cluster(&self, start: u64, end: u64) -> BlockResult<()> {
        if start >= end {
            return Ok(());
        }
        let state = self.map.lock().unwrap().state_at(start, end - start).0;
        if state == ClusterState::Data {
            return Ok(());
        }

        let mut buf = vec![0u8; (end - start) as usize];
        self.read_range(start, buf.as_mut_slice().into()).await?;
        self.file.write(&buf, start).await?;
        Ok(())
    }

    fn mark(&self, offset: u64, bytes: u64, state: ClusterState) -> BlockResult<()> {
        let mut map = self.map.lock().unwrap();
        map.grow(offset + bytes)?;
        match state {
            ClusterState::Data => {
                map.data.set(offset, bytes);
                map.zero.clear(offset, bytes);
            }
            ClusterState::Zero => {
                map.zero.set(offset, bytes);
                map.data.clear(offset, bytes);
            }
            ClusterState::Unallocated => {
                map.data.clear(offset, bytes);
                map.zero.clear(offset, bytes);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl NodeDriver for Data {
    fn driver_name(&self) -> &'static str {
        "overlay"
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

    fn supports_backing(&self) -> bool {
        true
    }

    fn length(&self) -> BlockResult<u64> {
        Ok(self.map.lock().unwrap().size)
    }

    fn cluster_size(&self) -> Option<u64> {
        Some(self.cluster_size)
    }

    fn refresh_limits(&self, limits: &mut NodeLimits) -> BlockResult<()> {
        limits.pwrite_zeroes_alignment = self.cluster_size;
        limits.pdiscard_alignment = self.cluster_size;
        Ok(())
    }

    fn supported_write_flags(&self) -> RequestFlags {
        RequestFlag::Fua.into()
    }

    fn supported_zero_flags(&self) -> RequestFlags {
        RequestFlag::MayUnmap.into()
    }

    fn file_child(&self) -> Option<Arc<NodeUser>> {
        Some(Arc::clone(&self.file))
    }

    fn backing_child(&self) -> Option<Arc<NodeUser>> {
        self.backing()
    }

    fn set_backing(&self, backing: Option<Arc<NodeUser>>) -> BlockResult<()> {
        *self.backing.write().unwrap() = backing;
        Ok(())
    }

    async fn readv(&self, offset: u64, bufv: IoVectorMut<'_>, _flags: RequestFlags) -> BlockResult<()> {
        self.read_range(offset, bufv).await
    }

    async fn writev(&self, offset: u64, bufv: IoVector<'_>, flags: RequestFlags) -> BlockResult<()> {
        let bytes = bufv.len();
        let end = offset + bytes;
        let cluster_start = offset - offset % self.cluster_size;
        let cluster_end = end.div_ceil(self.cluster_size) * self.cluster_size;

        let fully_allocated = {
            let map = self.map.lock().unwrap();
            end <= map.size && map.data.get_set_area(offset, bytes) == bytes
        };

        if fully_allocated {
            self.file
                .pwritev(offset, bufv, flags.overlap_with(RequestFlag::Fua))
                .await?;
            return Ok(());
        }

        let _alloc = self.alloc_lock.lock().await;
        let size = self.map.lock().unwrap().size;
        self.copy_partial_cluster(cluster_start, offset).await?;
        self.copy_partial_cluster(end, std::cmp::min(cluster_end, size))
            .await?;
        self.file
            .pwritev(offset, bufv, flags.overlap_with(RequestFlag::Fua))
            .await?;
        self.mark(
            cluster_start,
            std::cmp::max(std::cmp::min(cluster_end, size), end) - cluster_start,
            ClusterState::Data,
        )
    }

    async fn write_zeroes(&self, offset: u64, bytes: u64, _flags: RequestFlags) -> BlockResult<()> {
        if !self.is_cluster_aligned(offset, offset + bytes) {
            return Err(BlockError::not_supported(format!(
                "Node \"{}\": zero write {:#x}+{:#x} does not cover whole clusters",
                self.node_name, offset, bytes
            )));
        }

        let _alloc = self.alloc_lock.lock().await;
        self.mark(offset, bytes, ClusterState::Zero)
    }

    async fn discard(&self, offset: u64, bytes: u64) -> BlockResult<()> {
        // Partial clusters keep their data
        let start = offset.div_ceil(self.cluster_size) * self.cluster_size;
        let end = std::cmp::min(
            (offset + bytes) / self.cluster_size * self.cluster_size,
            self.map.lock().unwrap().size,
        );
        if start >= end {
            return Ok(());
        }

        let _alloc = self.alloc_lock.lock().await;
        self.mark(start, end - start, ClusterState::Unallocated)?;
        if let Err(err) = self.file.node().pdiscard(start, end - start).await {
            debug!(
                "Node \"{}\": discarding {:#x}+{:#x} in the file child failed: {}",
                self.node_name,
                start,
                end - start,
                err
            );
        }
        Ok(())
    }

    async fn block_status(
        &self,
        _want_zero: bool,
        offset: u64,
        bytes: u64,
    ) -> BlockResult<BlockStatusReport> {
        let (state, pnum) = self.map.lock().unwrap().state_at(offset, bytes);
        if pnum == 0 {
            return Ok(BlockStatusReport::new(BlockStatusFlag::Eof, 0));
        }

        Ok(match state {
            ClusterState::Data => BlockStatusReport::mapped(
                BlockStatusFlag::Data | BlockStatusFlag::Recurse,
                pnum,
                offset,
                Some(Arc::clone(self.file.node())),
            ),
            ClusterState::Zero => BlockStatusReport::new(BlockStatusFlag::Zero, pnum),
            ClusterState::Unallocated => BlockStatusReport::new(BlockStatus::empty(), pnum),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory;
    use crate::node::{self, Node, NodeConfig};

    const CLUSTER: u64 = 4096;

    async fn chain(prefix: &str, size: u64) -> (Arc<Node>, Arc<Node>) {
        let base = node::open(NodeConfig::new(
            &format!("{}-base", prefix),
            memory::Config::new(size),
        ))
        .await
        .unwrap();

        let mut opts = Config::new(NodeConfig::new(
            &format!("{}-file", prefix),
            memory::Config::new(0),
        ))
        .with_backing(NodeConfigOrReference::Reference(format!("{}-base", prefix)));
        opts.cluster_size = CLUSTER;
        let top = node::open(NodeConfig::new(&format!("{}-top", prefix), opts))
            .await
            .unwrap();
        (base, top)
    }

    #[tokio::test]
    async fn unallocated_clusters_read_from_backing() {
        let (base, top) = chain("ovl-read", 65536).await;
        let base_user = base
            .add_user(NodeUser::root("ovl-read-base-user").require(NodePerm::Write))
            .unwrap();
        base_user.write(&[7u8; 8192], 0).await.unwrap();

        assert_eq!(top.length(), 65536);
        let top_user = top
            .add_user(NodeUser::root("ovl-read-top-user").require(NodePerm::ConsistentRead))
            .unwrap();
        let mut buf = vec![0u8; 16384];
        top_user.read(&mut buf, 0).await.unwrap();
        assert!(buf[..8192].iter().all(|b| *b == 7));
        assert!(buf[8192..].iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn partial_write_copies_rest_of_cluster() {
        let (base, top) = chain("ovl-cow", 65536).await;
        let base_user = base
            .add_user(NodeUser::root("ovl-cow-base-user").require(NodePerm::Write))
            .unwrap();
        base_user.write(&[1u8; 65536], 0).await.unwrap();

        let top_user = top
            .add_user(NodeUser::root("ovl-cow-top-user").require(NodePerm::Write))
            .unwrap();
        top_user.write(&[2u8; 100], 5000).await.unwrap();

        // The base is untouched
        let mut buf = vec![0u8; CLUSTER as usize];
        base_user.read(&mut buf, CLUSTER).await.unwrap();
        assert!(buf.iter().all(|b| *b == 1));

        // The top cluster is complete
        top_user.read(&mut buf, CLUSTER).await.unwrap();
        assert!(buf[..904].iter().all(|b| *b == 1));
        assert!(buf[904..1004].iter().all(|b| *b == 2));
        assert!(buf[1004..].iter().all(|b| *b == 1));

        let (allocated, pnum) = top.is_allocated(CLUSTER, CLUSTER).await.unwrap();
        assert!(allocated);
        assert_eq!(pnum, CLUSTER);
        let (allocated, pnum) = top.is_allocated(0, CLUSTER).await.unwrap();
        assert!(!allocated);
        assert_eq!(pnum, CLUSTER);
    }

    #[tokio::test]
    async fn unaligned_zero_write_falls_back_to_buffers() {
        let (base, top) = chain("ovl-zero", 65536).await;
        let base_user = base
            .add_user(NodeUser::root("ovl-zero-base-user").require(NodePerm::Write))
            .unwrap();
        base_user.write(&[6u8; 65536], 0).await.unwrap();

        let driver = top.driver().unwrap();
        assert!(driver
            .write_zeroes(512, 4096, RequestFlags::empty())
            .await
            .unwrap_err()
            .is_not_supported());

        let top_user = top
            .add_user(NodeUser::root("ovl-zero-top-user").require(NodePerm::Write))
            .unwrap();
        top_user
            .pwrite_zeroes(512, 1024, RequestFlags::empty())
            .await
            .unwrap();

        let mut buf = vec![0u8; CLUSTER as usize];
        top_user.read(&mut buf, 0).await.unwrap();
        assert!(buf[..512].iter().all(|b| *b == 6));
        assert!(buf[512..1536].iter().all(|b| *b == 0));
        assert!(buf[1536..].iter().all(|b| *b == 6));
    }

    #[tokio::test]
    async fn whole_cluster_zero_write_reads_as_zero() {
        let (base, top) = chain("ovl-zero-full", 65536).await;
        let base_user = base
            .add_user(NodeUser::root("ovl-zero-full-base-user").require(NodePerm::Write))
            .unwrap();
        base_user.write(&[6u8; 65536], 0).await.unwrap();

        let top_user = top
            .add_user(NodeUser::root("ovl-zero-full-top-user").require(NodePerm::Write))
            .unwrap();
        top_user
            .pwrite_zeroes(CLUSTER, CLUSTER, RequestFlags::empty())
            .await
            .unwrap();

        let report = top.block_status(true, CLUSTER, CLUSTER).await.unwrap();
        assert!(report.status.contains(BlockStatusFlag::Zero));
        assert!(report.is_allocated());
    }

    #[tokio::test]
    async fn discard_falls_back_to_backing() {
        let (base, top) = chain("ovl-discard", 65536).await;
        let base_user = base
            .add_user(NodeUser::root("ovl-discard-base-user").require(NodePerm::Write))
            .unwrap();
        base_user.write(&[4u8; 65536], 0).await.unwrap();

        let top_user = top
            .add_user(NodeUser::root("ovl-discard-top-user").require(NodePerm::Write))
            .unwrap();
        top_user.write(&[5u8; 8192], 0).await.unwrap();
        top.driver().unwrap().discard(0, 4096).await.unwrap();

        let mut buf = vec![0u8; 8192];
        top_user.read(&mut buf, 0).await.unwrap();
        assert!(buf[..4096].iter().all(|b| *b == 4));
        assert!(buf[4096..].iter().all(|b| *b == 5));
    }
}
