//! Quiescing nodes: keep new requests out and wait for the ones in flight.
//!
//! Begin notifies the parent edges first (parents stop issuing to us), then the driver, then
//! optionally the children; end goes the other way round.  Root edges do not need a
//! notification, their queues check the node's quiesce counter when admitting a request.

use super::{Node, NodeParent, NodeUser};
use crate::aio::{self, AioWait};
use crate::coroutine;
use crate::helpers::InfallibleFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;

/// Number of whole-system drain sections currently open
static DRAIN_ALL_COUNT: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn drain_all_count() -> usize {
    DRAIN_ALL_COUNT.load(Ordering::SeqCst)
}

fn is_edge(edge: Option<&NodeUser>, user: &NodeUser) -> bool {
    edge.map_or(false, |edge| std::ptr::eq(edge, user))
}

impl Node {
    pub fn is_quiesced(&self) -> bool {
        self.quiesce_counter.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn do_drained_begin<'a>(
        &'a self,
        recursive: bool,
        parent: Option<&'a NodeUser>,
        ignore_bds_parents: bool,
        poll: bool,
    ) -> InfallibleFuture<'a> {
        Box::pin(async move {
            let first = self.quiesce_counter.fetch_add(1, Ordering::SeqCst) == 0;
            self.parent_drained_begin(parent, ignore_bds_parents).await;
            if first {
                if let Some(driver) = self.driver_opt() {
                    driver.drain_begin().await;
                }
                debug!("Node \"{}\" quiesced", self.name);
            }

            if recursive {
                assert!(!ignore_bds_parents);
                self.recursive_quiesce_counter
                    .fetch_add(1, Ordering::SeqCst);
                for child in self.children() {
                    child
                        .node()
                        .do_drained_begin(true, Some(&*child), false, false)
                        .await;
                }
            }

            if poll {
                AioWait::wait_while(|| self.drain_poll(recursive, parent, ignore_bds_parents)).await;
            }
        })
    }

    pub(crate) fn do_drained_end<'a>(
        &'a self,
        recursive: bool,
        parent: Option<&'a NodeUser>,
        ignore_bds_parents: bool,
    ) -> InfallibleFuture<'a> {
        Box::pin(async move {
            let counter = self.quiesce_counter.load(Ordering::SeqCst);
            assert!(
                counter > 0,
                "Node \"{}\" drain ended more often than begun",
                self.name
            );

            if counter == 1 {
                if let Some(driver) = self.driver_opt() {
                    driver.drain_end().await;
                }
            }
            self.parent_drained_end(parent, ignore_bds_parents).await;

            if self.quiesce_counter.fetch_sub(1, Ordering::SeqCst) == 1 {
                debug!("Node \"{}\" resumed", self.name);
                self.wake_quiesced_queues();
            }

            if recursive {
                assert!(!ignore_bds_parents);
                self.recursive_quiesce_counter
                    .fetch_sub(1, Ordering::SeqCst);
                for child in self.children() {
                    child
                        .node()
                        .do_drained_end(true, Some(&*child), false)
                        .await;
                }
            }
        })
    }

    async fn parent_drained_begin(&self, ignore: Option<&NodeUser>, ignore_bds_parents: bool) {
        for user in self.parents() {
            if is_edge(ignore, &user) || ignore_bds_parents {
                continue;
            }
            if let NodeParent::Node { .. } = user.parent() {
                if let Some(parent) = user.parent_node() {
                    parent.do_drained_begin(false, None, false, false).await;
                }
            }
        }
    }

    async fn parent_drained_end(&self, ignore: Option<&NodeUser>, ignore_bds_parents: bool) {
        for user in self.parents() {
            if is_edge(ignore, &user) || ignore_bds_parents {
                continue;
            }
            if let NodeParent::Node { .. } = user.parent() {
                if let Some(parent) = user.parent_node() {
                    parent.do_drained_end(false, None, false).await;
                }
            }
        }
    }

    /// Whether anything relevant to a drain of this node is still in flight: requests of its
    /// parents, its own, and (if `recursive`) its children's
    fn drain_poll(&self, recursive: bool, ignore: Option<&NodeUser>, ignore_bds_parents: bool) -> bool {
        let parent_busy = self.parents().iter().any(|user| {
            if is_edge(ignore, user) {
                return false;
            }
            match user.parent() {
                NodeParent::Node { .. } => {
                    !ignore_bds_parents
                        && user
                            .parent_node()
                            .map_or(false, |parent| parent.drain_poll(false, None, false))
                }
                NodeParent::Root { .. } => user.in_flight() > 0,
            }
        });
        if parent_busy || self.in_flight() > 0 {
            return true;
        }

        recursive
            && self
                .children()
                .iter()
                .any(|child| child.node().drain_poll(true, Some(&**child), false))
    }

    /// Let the other coroutines of the context run before the caller's drain section starts
    async fn yield_if_coroutine() {
        if coroutine::in_coroutine() {
            tokio::task::yield_now().await;
        }
    }

    /// Quiesce this node and wait until it has no requests in flight.  Sections nest.
    pub async fn drained_begin(&self) {
        Self::yield_if_coroutine().await;
        self.do_drained_begin(false, None, false, true).await;
    }

    pub async fn drained_end(&self) {
        Self::yield_if_coroutine().await;
        self.do_drained_end(false, None, false).await;
    }

    /// Like [`Node::drained_begin()`], for this node and everything below it
    pub async fn subtree_drained_begin(&self) {
        Self::yield_if_coroutine().await;
        self.do_drained_begin(true, None, false, true).await;
    }

    pub async fn subtree_drained_end(&self) {
        Self::yield_if_coroutine().await;
        self.do_drained_end(true, None, false).await;
    }

    /// Give a new child the subtree drain sections this node is in
    pub async fn apply_subtree_drain(&self, child: &NodeUser) {
        let count = self.recursive_quiesce_counter.load(Ordering::SeqCst);
        for _ in 0..count {
            child
                .node()
                .do_drained_begin(true, Some(child), false, true)
                .await;
        }
    }

    /// Take this node's subtree drain sections away from a child that is being detached
    pub async fn unapply_subtree_drain(&self, child: &NodeUser) {
        let count = self.recursive_quiesce_counter.load(Ordering::SeqCst);
        for _ in 0..count {
            child.node().do_drained_end(true, Some(child), false).await;
        }
    }
}

/// Quiesce every node and wait until none of them has requests in flight.  Nodes opened before
/// the matching [`drain_all_end()`] start out quiesced.
///
/// This polls every execution context it can acquire, so it must be called from a plain thread
/// (neither a coroutine nor an async runtime); use [`co_drain_all_begin()`] from coroutines.
pub fn drain_all_begin() {
    assert!(
        !coroutine::in_coroutine(),
        "drain_all_begin() called from a coroutine"
    );

    DRAIN_ALL_COUNT.fetch_add(1, Ordering::SeqCst);
    for node in super::all_nodes() {
        futures::executor::block_on(node.do_drained_begin(false, None, true, false));
    }

    // Completing one request may issue others (on other nodes, possibly in other contexts), so
    // keep going until one full pass finds nothing in flight.  Requests issued directly on a
    // `NodeUser` bypass the quiesce counter and may start again right after that pass.
    let mut passes = 0u64;
    loop {
        let generation = AioWait::generation();
        for ctx in aio::all_contexts() {
            if let Some(guard) = ctx.try_acquire() {
                guard.poll();
            }
        }

        let busy = super::all_nodes()
            .iter()
            .any(|node| node.in_flight() > 0 || node.drain_poll(false, None, true));
        if !busy {
            break;
        }

        passes += 1;
        AioWait::wait_kick(generation, Duration::from_millis(10));
    }

    info!("Drained all nodes ({} polling passes)", passes);
}

pub fn drain_all_end() {
    assert!(
        !coroutine::in_coroutine(),
        "drain_all_end() called from a coroutine"
    );

    for node in super::all_nodes() {
        futures::executor::block_on(node.do_drained_end(false, None, true));
    }
    let old = DRAIN_ALL_COUNT.fetch_sub(1, Ordering::SeqCst);
    assert!(old > 0, "drain_all_end() without drain_all_begin()");
    debug!("Whole-system drain section ended");
}

/// [`drain_all_begin()`] for coroutine callers: the drain runs on a helper thread while the
/// calling coroutine is suspended, so its own context can keep completing requests.
pub async fn co_drain_all_begin() {
    run_on_helper_thread(drain_all_begin).await;
}

pub async fn co_drain_all_end() {
    run_on_helper_thread(drain_all_end).await;
}

async fn run_on_helper_thread(f: fn()) {
    let (sender, receiver) = oneshot::channel();
    std::thread::spawn(move || {
        f();
        let _ = sender.send(());
    });
    // The sender is only dropped without sending if `f` panicked
    if receiver.await.is_err() {
        panic!("Whole-system drain failed");
    }
}
