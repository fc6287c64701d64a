//! Block nodes, their edges, and the request engine.
//!
//! A [`Node`] is one layer of a block device stack.  It owns its driver, its limits, and the
//! bookkeeping the engine needs (tracked requests, counters, flush state).  Parents reference a
//! node through a [`NodeUser`] edge; top-level users additionally create an [`IoQueue`] on their
//! edge, through which requests are admitted only while the node is not quiesced.

pub mod block_status;
pub mod copy_on_read;
pub mod drain;
pub mod flush;
pub mod io;
pub mod sync;
pub mod tracked;
pub mod zero_discard;

use crate::aio::{AioContext, AioWait};
use crate::helpers::{
    Bitmap, BlockFutureResult, IntAlignment, IoVector, IoVectorMut, WeakAutoDeleteIterator,
};
use crate::{coroutine, file, memory, overlay, raw, BlockError, BlockResult};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{HashMap, LinkedList};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::task::{Context, Poll, Waker};

pub use block_status::{BlockStatus, BlockStatusFlag, BlockStatusReport};
pub use drain::{co_drain_all_begin, co_drain_all_end, drain_all_begin, drain_all_end};
pub use tracked::{TrackedRequest, TrackedRequestType};
pub use zero_discard::Fragmenter;

/// Largest single request the engine hands to a driver
pub const MAX_REQUEST_BYTES: u64 = (i32::MAX as u64) & !511;

/// Largest byte offset (exclusive) any request may reach
pub const MAX_LENGTH: u64 = i64::MAX as u64 & !511;

/// Upper bound for internal staging buffers (copy-on-read, zero-write fallback)
pub const MAX_BOUNCE_BUFFER: u64 = 32768 << 9;

/// Default `max_iov` for leaf nodes
pub const MAX_IOV: usize = 1024;

pub struct Node {
    name: String,
    self_ref: Weak<Node>,
    ctx: Arc<AioContext>,
    opts: NodeConfig,

    driver: RwLock<Option<Arc<dyn NodeDriver>>>,
    limits: RwLock<NodeLimits>,
    total_size: AtomicU64,

    users: Mutex<Vec<Weak<NodeUser>>>,
    bitmaps: Mutex<HashMap<String, Arc<Mutex<Bitmap>>>>,

    tracked: Mutex<Vec<Arc<tracked::TrackedState>>>,
    serialising_in_flight: AtomicUsize,
    in_flight: AtomicUsize,
    quiesce_counter: AtomicUsize,
    recursive_quiesce_counter: AtomicUsize,
    copy_on_read: AtomicUsize,

    write_gen: AtomicU64,
    flushed_gen: AtomicU64,
    flush_state: tokio::sync::Mutex<flush::FlushState>,

    /// Queues waiting for the node to be un-quiesced
    quiesced_queues: Mutex<LinkedList<Waker>>,
}

/// Parents of nodes do not own those nodes directly, but through `NodeUser` objects.  These
/// describe the parent and the permissions the parent uses and blocks.
pub struct NodeUser {
    node: Arc<Node>,
    parent: NodeParent,
    permissions: NodePermPair,

    /// Requests admitted through queues on this edge that have not yet settled
    in_flight: AtomicUsize,
}

/// Helper object to construct a `NodeUser`
#[derive(Clone)]
pub struct NodeUserBuilder {
    parent: NodeParent,
    permissions: NodePermPair,
}

/// Who holds a `NodeUser` edge
#[derive(Clone, Debug)]
pub enum NodeParent {
    /// Another node, resolved by name through the node registry
    Node {
        node_name: String,
        child_name: String,
    },
    /// A top-level user (device model, export, test)
    Root { name: String },
}

/// Pair of permissions, i.e. those that have been taken, and those that have been blocked
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NodePermPair {
    /// Permissions for things this user can do with the node
    taken: NodePerms,
    /// Things other users are not allowed to do with the node
    blocked: NodePerms,
}

numerical_enum! {
    /// Permissions that can be taken/blocked on a node
    pub enum NodePerm as u64 {
        /// Guarantees that data read from the node represents a complete and self-consistent view
        /// of it
        ConsistentRead = 0x1,
        /// Allows writing
        Write = 0x2,
        /// Allows writing data such that the data read from the node will not change
        WriteUnchanged = 0x4,
        /// Allows changing the node's size
        Resize = 0x8,
    }
}

flag_set! {
    /// Represent any combination of permissions
    pub struct NodePerms(NodePerm as u64);
}

numerical_enum! {
    /// Per-request flags, selecting which engine paths a request takes
    pub enum RequestFlag as u32 {
        /// Populate this node from its backing chain while reading
        CopyOnRead = 0x1,
        /// Write zeroes; the data buffer is ignored
        ZeroWrite = 0x2,
        /// A zero write may deallocate the range
        MayUnmap = 0x4,
        /// Do not wait for overlapping serialising requests
        NoSerialising = 0x8,
        /// Data must be on stable storage when the request completes
        Fua = 0x10,
        WriteCompressed = 0x20,
        /// The write does not change what reading the range returns
        WriteUnchanged = 0x40,
        /// Make this request serialising at cluster granularity
        Serialising = 0x80,
        /// Fail a zero write with `NotSupported` instead of falling back to writing buffers
        NoFallback = 0x100,
    }
}

flag_set! {
    pub struct RequestFlags(RequestFlag as u32);
}

numerical_enum! {
    /// Optional driver primitives.  The engine falls back to generic implementations for
    /// everything a driver does not claim.
    pub enum DriverCap as u32 {
        WriteZeroes = 0x1,
        Discard = 0x2,
        BlockStatus = 0x4,
        /// `flush()` writes back all layers in one call
        Flush = 0x8,
        FlushToOs = 0x10,
        FlushToDisk = 0x20,
        WriteCompressed = 0x40,
    }
}

flag_set! {
    pub struct DriverCaps(DriverCap as u32);
}

/// Request limits of a node, merged from its children and then amended by its driver
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NodeLimits {
    /// Offsets and lengths of driver requests are multiples of this
    pub request_alignment: u64,
    /// 0 for unlimited
    pub max_transfer: u64,
    pub opt_transfer: u64,
    /// Buffers not aligned to this are bounced
    pub min_mem_alignment: usize,
    /// Alignment for buffers the engine allocates itself
    pub opt_mem_alignment: usize,
    /// 0 for unlimited
    pub max_iov: usize,
    pub max_pwrite_zeroes: u64,
    pub pwrite_zeroes_alignment: u64,
    pub max_pdiscard: u64,
    pub pdiscard_alignment: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeConfig {
    pub node_name: String,

    #[serde(default)]
    pub read_only: bool,

    #[serde(default)]
    pub cache: NodeCacheConfig,

    #[serde(default)]
    pub discard: DiscardMode,

    #[serde(default)]
    pub detect_zeroes: DetectZeroes,

    #[serde(default)]
    pub copy_on_read: bool,

    #[serde(flatten)]
    pub driver: NodeDriverConfig,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeCacheConfig {
    /// Bypass the host page cache
    #[serde(default)]
    pub direct: bool,
    /// Never flush to stable storage
    #[serde(default)]
    pub no_flush: bool,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscardMode {
    /// Discard requests succeed without doing anything
    #[default]
    Ignore,
    Unmap,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectZeroes {
    #[default]
    Off,
    /// Turn writes of all-zero buffers into zero writes
    On,
    /// Like `On`, and allow those zero writes to unmap
    Unmap,
}

splittable_enum! {
    #[derive(Clone, Debug, Deserialize, Serialize)]
    #[serde(tag = "driver", rename_all = "kebab-case")]
    pub enum NodeDriverConfig {
        File(file::Config),
        Memory(memory::Config),
        Overlay(overlay::Config),
        Raw(raw::Config),
    }
}

/// For use in block drivers to denote a reference to a child node (in their `NodeDriverConfig`
/// variant).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum NodeConfigOrReference {
    Reference(String),
    // Kept untyped: `NodeConfig` cannot contain itself
    Config(serde_json::Map<String, serde_json::Value>),
}

/// Driver backend of a node.  Only the data path (`readv()`, `writev()`) and `length()` are
/// mandatory; everything else has a default the engine knows how to work around.
#[async_trait]
pub trait NodeDriver: Send + Sync + Any {
    fn driver_name(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;

    fn capabilities(&self) -> DriverCaps {
        DriverCaps::empty()
    }

    /// Protocol drivers sit at the bottom of a stack and map offsets one-to-one onto storage
    fn is_protocol(&self) -> bool {
        false
    }

    fn is_inserted(&self) -> bool {
        true
    }

    /// Pass-through SCSI generic devices have nothing for the block layer to flush
    fn is_sg(&self) -> bool {
        false
    }

    fn supports_backing(&self) -> bool {
        false
    }

    fn length(&self) -> BlockResult<u64>;

    fn cluster_size(&self) -> Option<u64> {
        None
    }

    /// Apply driver overrides on top of the limits merged from the children
    fn refresh_limits(&self, _limits: &mut NodeLimits) -> BlockResult<()> {
        Ok(())
    }

    fn supported_write_flags(&self) -> RequestFlags {
        RequestFlags::empty()
    }

    fn supported_zero_flags(&self) -> RequestFlags {
        RequestFlags::empty()
    }

    fn file_child(&self) -> Option<Arc<NodeUser>> {
        None
    }

    fn backing_child(&self) -> Option<Arc<NodeUser>> {
        None
    }

    fn set_backing(&self, _backing: Option<Arc<NodeUser>>) -> BlockResult<()> {
        Err(BlockError::not_supported(format!(
            "Driver {} does not support backing nodes",
            self.driver_name()
        )))
    }

    async fn readv(&self, offset: u64, bufv: IoVectorMut<'_>, flags: RequestFlags)
        -> BlockResult<()>;

    async fn writev(&self, offset: u64, bufv: IoVector<'_>, flags: RequestFlags)
        -> BlockResult<()>;

    async fn writev_compressed(&self, _offset: u64, _bufv: IoVector<'_>) -> BlockResult<()> {
        Err(BlockError::not_supported("Compressed writes not supported"))
    }

    async fn write_zeroes(&self, _offset: u64, _bytes: u64, _flags: RequestFlags) -> BlockResult<()> {
        Err(BlockError::not_supported("Zero writes not supported"))
    }

    async fn discard(&self, _offset: u64, _bytes: u64) -> BlockResult<()> {
        Err(BlockError::not_supported("Discard not supported"))
    }

    async fn flush(&self) -> BlockResult<()> {
        Err(BlockError::not_supported("Flush not supported"))
    }

    async fn flush_to_os(&self) -> BlockResult<()> {
        Ok(())
    }

    async fn flush_to_disk(&self) -> BlockResult<()> {
        Err(BlockError::not_supported("Flush to disk not supported"))
    }

    /// Status of `[offset, offset + bytes)`, which is aligned to the node's request alignment.
    /// A report with `OffsetValid` but no `file` refers to this very node.
    async fn block_status(
        &self,
        _want_zero: bool,
        _offset: u64,
        _bytes: u64,
    ) -> BlockResult<BlockStatusReport> {
        Err(BlockError::not_supported("Block status not supported"))
    }

    async fn drain_begin(&self) {}

    async fn drain_end(&self) {}

    async fn close(&self) {}
}

/// Requests admitted through a top-level user's edge.  Each request runs as its own coroutine
/// and is held back while the node is quiesced.
pub struct IoQueue {
    node: Arc<Node>,
    user: Arc<NodeUser>,
}

/// Keeps an admitted queue request counted on its edge
struct QueueRequest<'a> {
    user: &'a NodeUser,
}

/// Keeps a request counted in the node's in-flight counter until dropped, including when the
/// request future is dropped before it completes
pub(crate) struct InFlight<'a> {
    node: &'a Node,
}

/// Waits until a quiesced node is resumed
struct QuiescedQueueWaiter<'a> {
    node: &'a Node,
}

static NODES: Lazy<Mutex<Vec<Weak<Node>>>> = Lazy::new(Default::default);

/// Look up an open node by name
pub fn lookup(name: &str) -> BlockResult<Arc<Node>> {
    let mut nodes = NODES.lock().unwrap();
    WeakAutoDeleteIterator::from_vec(&mut nodes, Weak::upgrade)
        .find(|node| node.name == name)
        .ok_or_else(|| BlockError::invalid(format!("Node \"{}\" not found", name)))
}

/// All open nodes
pub fn all_nodes() -> Vec<Arc<Node>> {
    let mut nodes = NODES.lock().unwrap();
    WeakAutoDeleteIterator::from_vec(&mut nodes, Weak::upgrade).collect()
}

fn register(node: &Arc<Node>) -> BlockResult<()> {
    let mut nodes = NODES.lock().unwrap();
    if WeakAutoDeleteIterator::from_vec(&mut nodes, Weak::upgrade).any(|n| n.name == node.name) {
        return Err(BlockError::invalid(format!(
            "Node name \"{}\" is already in use",
            node.name
        )));
    }
    nodes.push(Arc::downgrade(node));
    Ok(())
}

fn unregister(node: &Node) {
    let mut nodes = NODES.lock().unwrap();
    nodes.retain(|n| !std::ptr::eq(n.as_ptr(), node));
}

/// Open a node on the main context
pub async fn open(opts: NodeConfig) -> BlockResult<Arc<Node>> {
    open_in(opts, AioContext::main()?).await
}

/// Open a node attached to `ctx`.  Children given inline in the driver configuration are opened
/// first.
pub fn open_in(opts: NodeConfig, ctx: Arc<AioContext>) -> BlockFutureResult<'static, Arc<Node>> {
    Box::pin(async move {
        opts.check_validity()?;
        let name = opts.node_name.clone();
        if lookup(&name).is_ok() {
            return Err(BlockError::invalid(format!(
                "Node name \"{}\" is already in use",
                name
            )));
        }

        let driver: Arc<dyn NodeDriver> = match &opts.driver {
            NodeDriverConfig::File(o) => Arc::new(file::Data::new(&name, o, &opts)?),
            NodeDriverConfig::Memory(o) => Arc::new(memory::Data::new(&name, o)?),
            NodeDriverConfig::Overlay(o) => {
                Arc::new(overlay::Data::new(&name, o, opts.read_only).await?)
            }
            NodeDriverConfig::Raw(o) => Arc::new(raw::Data::new(&name, o, opts.read_only).await?),
        };

        let limits = NodeLimits::compute(driver.as_ref())
            .map_err(|e| e.prepend(&format!("Node \"{}\"", name)))?;
        let length = driver.length()?;
        let driver_name = driver.driver_name();

        let node = Arc::new_cyclic(|self_ref| Node {
            name: name.clone(),
            self_ref: self_ref.clone(),
            ctx,
            opts,
            driver: RwLock::new(Some(driver)),
            limits: RwLock::new(limits),
            total_size: AtomicU64::new(length),
            users: Default::default(),
            bitmaps: Default::default(),
            tracked: Default::default(),
            serialising_in_flight: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            quiesce_counter: AtomicUsize::new(0),
            recursive_quiesce_counter: AtomicUsize::new(0),
            copy_on_read: AtomicUsize::new(0),
            write_gen: AtomicU64::new(0),
            flushed_gen: AtomicU64::new(0),
            flush_state: Default::default(),
            quiesced_queues: Default::default(),
        });
        register(&node)?;

        if node.opts.copy_on_read {
            node.enable_copy_on_read();
        }

        // Nodes created during a whole-system drain start out quiesced
        for _ in 0..drain::drain_all_count() {
            node.do_drained_begin(false, None, true, false).await;
        }

        info!(
            "Opened node \"{}\" ({}, {} bytes)",
            node.name, driver_name, length
        );
        Ok(node)
    })
}

impl Node {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ctx(&self) -> &Arc<AioContext> {
        &self.ctx
    }

    pub fn opts(&self) -> &NodeConfig {
        &self.opts
    }

    pub fn is_read_only(&self) -> bool {
        self.opts.read_only
    }

    /// Strong reference to this node
    pub fn arc(&self) -> Arc<Node> {
        // The registry and all edges hand out `Arc<Node>`, so `self` is always inside one
        match self.self_ref.upgrade() {
            Some(node) => node,
            None => unreachable!(),
        }
    }

    pub fn limits(&self) -> NodeLimits {
        *self.limits.read().unwrap()
    }

    /// Cached length in bytes
    pub fn length(&self) -> u64 {
        self.total_size.load(Ordering::Acquire)
    }

    /// Re-read the length from the driver
    pub fn refresh_length(&self) -> BlockResult<u64> {
        let length = self.driver()?.length()?;
        self.total_size.store(length, Ordering::Release);
        Ok(length)
    }

    /// Recompute limits after the driver chain changed
    pub fn refresh_limits(&self) -> BlockResult<()> {
        let limits = NodeLimits::compute(self.driver()?.as_ref())
            .map_err(|e| e.prepend(&format!("Node \"{}\"", self.name)))?;
        *self.limits.write().unwrap() = limits;
        Ok(())
    }

    /// The open driver, or `NoMedium`
    pub fn driver(&self) -> BlockResult<Arc<dyn NodeDriver>> {
        self.driver_opt()
            .ok_or_else(|| BlockError::no_medium(&self.name))
    }

    pub fn driver_opt(&self) -> Option<Arc<dyn NodeDriver>> {
        self.driver.read().unwrap().clone()
    }

    /// Run `f` on the driver if it is of type `T`
    pub fn with_driver<T: NodeDriver, R, F: FnOnce(&T) -> R>(&self, f: F) -> Option<R> {
        let driver = self.driver_opt()?;
        driver.as_any().downcast_ref::<T>().map(f)
    }

    pub fn is_inserted(&self) -> bool {
        self.driver_opt().map(|d| d.is_inserted()).unwrap_or(false)
    }

    /// Granularity at which this node allocates data (request alignment if the driver has no
    /// notion of clusters)
    pub fn cluster_size(&self) -> u64 {
        let align = self.limits().request_alignment;
        match self.driver_opt().and_then(|d| d.cluster_size()) {
            Some(cluster_size) => std::cmp::max(cluster_size, align),
            None => align,
        }
    }

    pub fn file_child(&self) -> Option<Arc<NodeUser>> {
        self.driver_opt()?.file_child()
    }

    pub fn backing_child(&self) -> Option<Arc<NodeUser>> {
        self.driver_opt()?.backing_child()
    }

    /// The node this one shadows, if any
    pub fn backing_node(&self) -> Option<Arc<Node>> {
        self.backing_child().map(|child| Arc::clone(child.node()))
    }

    /// Edges to this node's children: the file child first, then the backing child
    pub fn children(&self) -> Vec<Arc<NodeUser>> {
        match self.driver_opt() {
            Some(driver) => driver
                .file_child()
                .into_iter()
                .chain(driver.backing_child())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Edges pointing at this node
    pub fn parents(&self) -> Vec<Arc<NodeUser>> {
        let mut users = self.users.lock().unwrap();
        WeakAutoDeleteIterator::from_vec(&mut users, Weak::upgrade).collect()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn quiesce_counter(&self) -> usize {
        self.quiesce_counter.load(Ordering::SeqCst)
    }

    pub fn write_generation(&self) -> u64 {
        self.write_gen.load(Ordering::SeqCst)
    }

    pub fn flushed_generation(&self) -> u64 {
        self.flushed_gen.load(Ordering::SeqCst)
    }

    pub fn inc_in_flight(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub fn dec_in_flight(&self) {
        let old = self.in_flight.fetch_sub(1, Ordering::SeqCst);
        assert!(old > 0, "In-flight counter of node \"{}\" underflow", self.name);
        AioWait::kick();
    }

    pub(crate) fn enter_in_flight(&self) -> InFlight<'_> {
        self.inc_in_flight();
        InFlight { node: self }
    }

    /// Attach a new parent edge, checking it against the permissions of all existing edges
    pub fn add_user(self: &Arc<Self>, user: NodeUserBuilder) -> BlockResult<Arc<NodeUser>> {
        if self.is_read_only()
            && (user.permissions.has(NodePerm::Write) || user.permissions.has(NodePerm::Resize))
        {
            return Err(BlockError::permission(format!(
                "Node \"{}\" is read-only, cannot grant {} write access",
                self.name, user.parent
            )));
        }

        let user = Arc::new(NodeUser {
            node: Arc::clone(self),
            parent: user.parent,
            permissions: user.permissions,
            in_flight: AtomicUsize::new(0),
        });

        self.check_perm_conflicts(&user)?;
        self.users.lock().unwrap().push(Arc::downgrade(&user));
        Ok(user)
    }

    /// Fail if `new_user` would take what another user blocks, or block what another user has
    /// taken.  The first conflict found is reported.
    fn check_perm_conflicts(&self, new_user: &NodeUser) -> BlockResult<()> {
        let mut users = self.users.lock().unwrap();
        let new_perms = &new_user.permissions;

        for user in WeakAutoDeleteIterator::from_vec(&mut users, Weak::upgrade) {
            let unshared = user.permissions.blocked.overlap_with(new_perms.taken);
            if !unshared.is_empty() {
                return Err(BlockError::permission(format!(
                    "Node \"{}\": {} needs {}, which {} does not share",
                    self.name, new_user.parent, unshared, user.parent
                )));
            }

            let in_use = user.permissions.taken.overlap_with(new_perms.blocked);
            if !in_use.is_empty() {
                return Err(BlockError::permission(format!(
                    "Node \"{}\": {} cannot block {}, {} is using it",
                    self.name, new_user.parent, in_use, user.parent
                )));
            }
        }

        Ok(())
    }

    /// Calculate the cumulative permissions taken by all users on this node.
    pub fn get_perms(&self) -> NodePermPair {
        let mut users = self.users.lock().unwrap();
        let mut perms = NodePermPair::default();

        for user in WeakAutoDeleteIterator::from_vec(&mut users, Weak::upgrade) {
            perms.taken.add(user.permissions.taken);
            perms.blocked.add(user.permissions.blocked);
        }

        perms
    }

    /// Validate a request range before anything is allocated for it
    pub(crate) fn check_request(&self, offset: u64, bytes: u64, buffers: usize) -> BlockResult<()> {
        match offset.checked_add(bytes) {
            Some(end) if end <= MAX_LENGTH => (),
            _ => {
                return Err(BlockError::invalid(format!(
                    "Request {:#x}+{:#x} on node \"{}\" is out of range",
                    offset, bytes, self.name
                )))
            }
        }

        if bytes > MAX_REQUEST_BYTES {
            return Err(BlockError::invalid(format!(
                "Request length {:#x} on node \"{}\" exceeds {:#x}",
                bytes, self.name, MAX_REQUEST_BYTES
            )));
        }

        let max_iov = self.limits().max_iov;
        if max_iov != 0 && buffers > max_iov {
            return Err(BlockError::invalid(format!(
                "Too many vector segments ({}, node \"{}\" allows {})",
                buffers, self.name, max_iov
            )));
        }

        Ok(())
    }

    /// Reject writes the edge `user` or the node itself does not allow
    fn check_write_permitted(&self, user: &NodeUser, offset: u64, bytes: u64) -> BlockResult<()> {
        if self.is_read_only() {
            return Err(BlockError::permission(format!(
                "Node \"{}\" is read-only",
                self.name
            )));
        }

        if !user.permissions.has(NodePerm::Write) && !user.permissions.has(NodePerm::WriteUnchanged)
        {
            return Err(BlockError::permission(format!(
                "{} has not taken the write permission on node \"{}\"",
                user.parent, self.name
            )));
        }

        if offset.saturating_add(bytes) > self.length() && !user.permissions.has(NodePerm::Resize)
        {
            return Err(BlockError::permission(format!(
                "Write past the end of node \"{}\" requires the resize permission, which {} has \
                 not taken",
                self.name, user.parent
            )));
        }

        Ok(())
    }

    /// Record a completed data-modifying request
    fn write_completed(&self, offset: u64, bytes: u64) {
        self.write_gen.fetch_add(1, Ordering::SeqCst);
        self.total_size
            .fetch_max(offset.saturating_add(bytes), Ordering::AcqRel);
        self.mark_dirty(offset, bytes);
    }

    fn mark_dirty(&self, offset: u64, bytes: u64) {
        for bitmap in self.bitmaps.lock().unwrap().values() {
            let mut bitmap = bitmap.lock().unwrap();
            if bitmap.len() < offset + bytes {
                // Bitmaps follow the node when it grows; this cannot fail for a valid request
                let _ = bitmap.resize(offset + bytes);
            }
            bitmap.set(offset, bytes);
        }
    }

    /// Create a bitmap that records every range written from now on
    pub fn add_dirty_bitmap(&self, name: &str, granularity: u64) -> BlockResult<Arc<Mutex<Bitmap>>> {
        let mut bitmaps = self.bitmaps.lock().unwrap();
        if bitmaps.contains_key(name) {
            return Err(BlockError::invalid(format!(
                "Node \"{}\" already has a dirty bitmap named \"{}\"",
                self.name, name
            )));
        }

        let bitmap = Arc::new(Mutex::new(Bitmap::new(self.length(), granularity)?));
        bitmaps.insert(name.to_string(), Arc::clone(&bitmap));
        Ok(bitmap)
    }

    pub fn remove_dirty_bitmap(&self, name: &str) -> BlockResult<()> {
        self.bitmaps
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| {
                BlockError::invalid(format!(
                    "Node \"{}\" has no dirty bitmap named \"{}\"",
                    self.name, name
                ))
            })
    }

    pub fn get_dirty_bitmap(&self, name: &str) -> BlockResult<Arc<Mutex<Bitmap>>> {
        self.bitmaps
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| {
                BlockError::invalid(format!(
                    "Node \"{}\" has no dirty bitmap named \"{}\"",
                    self.name, name
                ))
            })
    }

    /// Replace the backing child.  The subtree is drained while the graph changes.
    pub async fn change_backing(&self, backing: Option<&Arc<Node>>) -> BlockResult<()> {
        let driver = self.driver()?;
        if !driver.supports_backing() {
            return Err(BlockError::invalid(format!(
                "Driver {} of node \"{}\" does not support backing nodes",
                driver.driver_name(),
                self.name
            )));
        }

        let new_user = match backing {
            Some(backing) => Some(
                backing.add_user(
                    NodeUser::builder(&self.name, "backing").require(NodePerm::ConsistentRead),
                )?,
            ),
            None => None,
        };

        self.subtree_drained_begin().await;
        let old_user = driver.backing_child();
        let result = driver.set_backing(new_user.clone());
        if result.is_ok() {
            if let Some(old) = old_user.as_ref() {
                self.unapply_subtree_drain(old).await;
            }
            if let Some(new) = new_user.as_ref() {
                self.apply_subtree_drain(new).await;
            }
        }
        let result = result.and_then(|()| self.refresh_limits());
        self.subtree_drained_end().await;

        if result.is_ok() {
            info!(
                "Node \"{}\" now backed by {}",
                self.name,
                backing.map(|b| format!("\"{}\"", b.name)).as_deref().unwrap_or("nothing")
            );
        }
        result
    }

    /// Drain the node, shut its driver down, and remove it from the registry.  Edges that still
    /// point at the node see `NoMedium` from then on.
    pub async fn close(&self) {
        self.drained_begin().await;

        let driver = self.driver.write().unwrap().take();
        if let Some(driver) = driver {
            driver.close().await;
        }
        unregister(self);

        self.drained_end().await;
        info!("Closed node \"{}\"", self.name);
    }

    /// Wake queues parked on this node's quiesce state
    fn wake_quiesced_queues(&self) {
        let wakers = std::mem::take(&mut *self.quiesced_queues.lock().unwrap());
        for waker in wakers {
            waker.wake();
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("in_flight", &self.in_flight())
            .field("quiesce_counter", &self.quiesce_counter())
            .finish()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        assert_eq!(
            self.in_flight.load(Ordering::SeqCst),
            0,
            "Node \"{}\" dropped with requests in flight",
            self.name
        );
        debug!("Dropping node \"{}\"", self.name);
    }
}

impl NodeLimits {
    /// Merge the children's limits, then let the driver override them
    fn compute(driver: &dyn NodeDriver) -> BlockResult<Self> {
        let mut limits = NodeLimits::default();
        let children: Vec<Arc<NodeUser>> = driver
            .file_child()
            .into_iter()
            .chain(driver.backing_child())
            .collect();

        if children.is_empty() {
            limits.min_mem_alignment = 1;
            limits.opt_mem_alignment = 4096;
            limits.max_iov = MAX_IOV;
        }
        for child in children {
            limits.merge(&child.node().limits());
        }

        driver.refresh_limits(&mut limits)?;
        limits.check_validity()?;
        Ok(limits)
    }

    /// Take over the constraints of a child: the stricter alignments and maxima, the larger
    /// optimal sizes
    pub fn merge(&mut self, child: &NodeLimits) {
        self.opt_transfer = std::cmp::max(self.opt_transfer, child.opt_transfer);
        self.max_transfer = crate::helpers::min_non_zero(self.max_transfer, child.max_transfer);
        self.opt_mem_alignment = std::cmp::max(self.opt_mem_alignment, child.opt_mem_alignment);
        self.min_mem_alignment = std::cmp::max(self.min_mem_alignment, child.min_mem_alignment);
        self.max_iov = crate::helpers::min_non_zero(self.max_iov as u64, child.max_iov as u64)
            as usize;
    }

    fn check_validity(&self) -> BlockResult<()> {
        let align = self.request_alignment;
        if !align.is_power_of_two() || align > (1 << 30) {
            return Err(BlockError::invalid(format!(
                "Request alignment {} is not a power of two up to 1 GiB",
                align
            )));
        }

        for (name, value) in [
            ("minimum memory alignment", self.min_mem_alignment as u64),
            ("optimal memory alignment", self.opt_mem_alignment as u64),
        ] {
            if !value.is_power_of_two() {
                return Err(BlockError::invalid(format!(
                    "The {} ({}) is not a power of two",
                    name, value
                )));
            }
        }

        for (name, value) in [
            ("maximum transfer size", self.max_transfer),
            ("maximum zero write size", self.max_pwrite_zeroes),
            ("maximum discard size", self.max_pdiscard),
        ] {
            if !value.is_aligned(align) {
                return Err(BlockError::invalid(format!(
                    "The {} ({}) is not a multiple of the request alignment ({})",
                    name, value, align
                )));
            }
        }

        for (name, value, max) in [
            (
                "zero write",
                self.pwrite_zeroes_alignment,
                self.max_pwrite_zeroes,
            ),
            ("discard", self.pdiscard_alignment, self.max_pdiscard),
        ] {
            if value != 0 && !value.is_power_of_two() {
                return Err(BlockError::invalid(format!(
                    "The {} alignment ({}) is not a power of two",
                    name, value
                )));
            }
            if max != 0 && max < std::cmp::max(value, align) {
                return Err(BlockError::invalid(format!(
                    "The maximum {} size ({}) is below its alignment",
                    name, max
                )));
            }
        }

        Ok(())
    }
}

impl Default for NodeLimits {
    fn default() -> Self {
        NodeLimits {
            request_alignment: 1,
            max_transfer: 0,
            opt_transfer: 0,
            min_mem_alignment: 1,
            opt_mem_alignment: 1,
            max_iov: 0,
            max_pwrite_zeroes: 0,
            pwrite_zeroes_alignment: 0,
            max_pdiscard: 0,
            pdiscard_alignment: 0,
        }
    }
}

impl NodeConfig {
    /// Configuration with default options for the given driver
    pub fn new(node_name: &str, driver: impl Into<NodeDriverConfig>) -> Self {
        NodeConfig {
            node_name: node_name.to_string(),
            read_only: false,
            cache: Default::default(),
            discard: Default::default(),
            detect_zeroes: Default::default(),
            copy_on_read: false,
            driver: driver.into(),
        }
    }

    fn check_validity(&self) -> BlockResult<()> {
        if self.node_name.is_empty() {
            return Err(BlockError::invalid("Node name must not be empty"));
        }
        if self.detect_zeroes == DetectZeroes::Unmap && self.discard != DiscardMode::Unmap {
            return Err(BlockError::invalid(format!(
                "Node \"{}\": detect-zeroes=unmap requires discard=unmap",
                self.node_name
            )));
        }
        Ok(())
    }
}

impl NodeConfigOrReference {
    /// Open the inline configuration, or look up the referenced node
    pub async fn open_or_lookup(&self) -> BlockResult<Arc<Node>> {
        match self {
            NodeConfigOrReference::Reference(name) => lookup(name),
            NodeConfigOrReference::Config(map) => {
                let opts: NodeConfig =
                    serde_json::from_value(serde_json::Value::Object(map.clone()))?;
                open(opts).await
            }
        }
    }
}

impl From<NodeConfig> for NodeConfigOrReference {
    fn from(opts: NodeConfig) -> Self {
        match serde_json::to_value(opts) {
            Ok(serde_json::Value::Object(map)) => NodeConfigOrReference::Config(map),
            // `NodeConfig` is a struct, so it always serializes to an object
            _ => unreachable!(),
        }
    }
}

impl NodePermPair {
    pub fn has(&self, perm: NodePerm) -> bool {
        self.taken.contains(perm)
    }

    pub fn blocks(&self, perm: NodePerm) -> bool {
        self.blocked.contains(perm)
    }
}

impl NodeUser {
    pub fn builder(parent_node_name: &str, child_name: &str) -> NodeUserBuilder {
        NodeUserBuilder {
            parent: NodeParent::Node {
                node_name: String::from(parent_node_name),
                child_name: String::from(child_name),
            },
            permissions: Default::default(),
        }
    }

    /// Builder for a top-level user's edge
    pub fn root(name: &str) -> NodeUserBuilder {
        NodeUserBuilder {
            parent: NodeParent::Root {
                name: String::from(name),
            },
            permissions: Default::default(),
        }
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn parent(&self) -> &NodeParent {
        &self.parent
    }

    pub fn permissions(&self) -> &NodePermPair {
        &self.permissions
    }

    /// The parent node, if the parent is a node that is still open
    pub fn parent_node(&self) -> Option<Arc<Node>> {
        match &self.parent {
            NodeParent::Node { node_name, .. } => lookup(node_name).ok(),
            NodeParent::Root { .. } => None,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn new_queue(self: &Arc<Self>) -> BlockResult<IoQueue> {
        if !matches!(self.parent, NodeParent::Root { .. }) {
            return Err(BlockError::invalid(format!(
                "Cannot create a queue on the edge of {}",
                self.parent
            )));
        }

        Ok(IoQueue {
            node: Arc::clone(&self.node),
            user: Arc::clone(self),
        })
    }

    /// Read into `bufv`; returns the number of bytes read
    pub async fn preadv(
        &self,
        offset: u64,
        bufv: IoVectorMut<'_>,
        flags: RequestFlags,
    ) -> BlockResult<u64> {
        let bytes = bufv.len();
        self.node.co_preadv(offset, bufv, flags).await?;
        Ok(bytes)
    }

    pub async fn read(&self, buf: &mut [u8], offset: u64) -> BlockResult<u64> {
        self.preadv(offset, buf.into(), RequestFlags::empty()).await
    }

    /// Write `bufv`; returns the number of bytes written
    pub async fn pwritev(
        &self,
        offset: u64,
        bufv: IoVector<'_>,
        flags: RequestFlags,
    ) -> BlockResult<u64> {
        let bytes = bufv.len();
        self.node
            .co_pwritev(self, offset, bytes, bufv, flags.without(RequestFlag::ZeroWrite))
            .await?;
        Ok(bytes)
    }

    pub async fn write(&self, buf: &[u8], offset: u64) -> BlockResult<u64> {
        self.pwritev(offset, buf.into(), RequestFlags::empty()).await
    }

    pub async fn pwrite_zeroes(
        &self,
        offset: u64,
        bytes: u64,
        mut flags: RequestFlags,
    ) -> BlockResult<()> {
        if self.node.opts.discard != DiscardMode::Unmap {
            flags.remove(RequestFlag::MayUnmap);
        }
        self.node
            .co_pwritev(
                self,
                offset,
                bytes,
                IoVector::new(),
                flags.with(RequestFlag::ZeroWrite),
            )
            .await
    }
}

impl NodeUserBuilder {
    pub fn require(mut self, permissions: impl Into<NodePerms>) -> Self {
        self.permissions.taken.add(permissions);
        self
    }

    pub fn block(mut self, permissions: impl Into<NodePerms>) -> Self {
        self.permissions.blocked.add(permissions);
        self
    }
}

impl IoQueue {
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn node_user(&self) -> &Arc<NodeUser> {
        &self.user
    }

    /// Wait until the node accepts requests, then count one in on our edge
    async fn enter(&self) -> QueueRequest<'_> {
        loop {
            self.user.in_flight.fetch_add(1, Ordering::SeqCst);
            if self.node.quiesce_counter.load(Ordering::SeqCst) == 0 {
                return QueueRequest { user: &self.user };
            }

            // Back out so a drain in progress does not wait for us
            drop(QueueRequest { user: &self.user });
            QuiescedQueueWaiter { node: &self.node }.await;
        }
    }

    pub async fn preadv(
        &self,
        offset: u64,
        bufv: IoVectorMut<'_>,
        flags: RequestFlags,
    ) -> BlockResult<u64> {
        coroutine::co(async {
            let _req = self.enter().await;
            self.user.preadv(offset, bufv, flags).await
        })
        .await
    }

    pub async fn read(&self, buf: &mut [u8], offset: u64) -> BlockResult<u64> {
        self.preadv(offset, buf.into(), RequestFlags::empty()).await
    }

    pub async fn pwritev(
        &self,
        offset: u64,
        bufv: IoVector<'_>,
        flags: RequestFlags,
    ) -> BlockResult<u64> {
        coroutine::co(async {
            let _req = self.enter().await;
            self.user.pwritev(offset, bufv, flags).await
        })
        .await
    }

    pub async fn write(&self, buf: &[u8], offset: u64) -> BlockResult<u64> {
        self.pwritev(offset, buf.into(), RequestFlags::empty()).await
    }

    pub async fn pwrite_zeroes(&self, offset: u64, bytes: u64, flags: RequestFlags) -> BlockResult<()> {
        coroutine::co(async {
            let _req = self.enter().await;
            self.user.pwrite_zeroes(offset, bytes, flags).await
        })
        .await
    }

    pub async fn pdiscard(&self, offset: u64, bytes: u64) -> BlockResult<()> {
        coroutine::co(async {
            let _req = self.enter().await;
            self.node.pdiscard(offset, bytes).await
        })
        .await
    }

    pub async fn flush(&self) -> BlockResult<()> {
        coroutine::co(async {
            let _req = self.enter().await;
            self.node.flush().await
        })
        .await
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.node.dec_in_flight();
    }
}

impl Drop for QueueRequest<'_> {
    fn drop(&mut self) {
        self.user.in_flight.fetch_sub(1, Ordering::SeqCst);
        AioWait::kick();
    }
}

impl Future for QuiescedQueueWaiter<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.node.quiesce_counter.load(Ordering::SeqCst) == 0 {
            return Poll::Ready(());
        }

        self.node
            .quiesced_queues
            .lock()
            .unwrap()
            .push_back(cx.waker().clone());

        // Resumed between the check and the registration
        if self.node.quiesce_counter.load(Ordering::SeqCst) == 0 {
            return Poll::Ready(());
        }
        Poll::Pending
    }
}

impl std::fmt::Debug for NodeUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeUser")
            .field("node", &self.node.name)
            .field("parent", &self.parent)
            .field("permissions", &self.permissions)
            .finish()
    }
}

impl std::fmt::Display for NodeParent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeParent::Node {
                node_name,
                child_name,
            } => write!(f, "node \"{}\" (as child \"{}\")", node_name, child_name),
            NodeParent::Root { name } => write!(f, "user \"{}\"", name),
        }
    }
}

impl std::fmt::Display for NodePerms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const NAMES: [(NodePerm, &str); 4] = [
            (NodePerm::ConsistentRead, "consistent-read"),
            (NodePerm::Write, "write"),
            (NodePerm::WriteUnchanged, "write-unchanged"),
            (NodePerm::Resize, "resize"),
        ];

        let mut rest = self.bits();
        let mut first = true;
        for (perm, name) in NAMES {
            if self.contains(perm) {
                rest &= !(perm as u64);
                write!(f, "{}{}", if first { "" } else { ", " }, name)?;
                first = false;
            }
        }
        if rest != 0 {
            write!(f, "{}unknown({:#x})", if first { "" } else { ", " }, rest)?;
        }
        Ok(())
    }
}
