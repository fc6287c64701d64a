//! Tracked requests: overlap detection and serialisation between in-flight requests on a node.

use super::Node;
use crate::coroutine::{self, CoroutineId};
use crate::helpers::{IntAlignment, Overlaps};
use std::ops::Range;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TrackedRequestType {
    Read,
    Write,
    Discard,
}

/// Shared part of a tracked request, kept in its node's list.  `inner` is only locked while the
/// node's list lock is held.
pub(crate) struct TrackedState {
    offset: u64,
    bytes: u64,
    req_type: TrackedRequestType,
    co: Option<CoroutineId>,
    inner: Mutex<TrackedInner>,
}

struct TrackedInner {
    serialising: bool,
    /// Range other serialising requests must not overlap; grows when the request is made
    /// serialising at some alignment
    overlap: Range<u64>,
    waiting_for: Option<Arc<TrackedState>>,
    waiters: Vec<oneshot::Sender<()>>,
}

enum Conflict {
    None,
    Wait(Arc<TrackedState>),
    SameCoroutine,
}

/// A request registered with its node from begin to end.  Dropping it ends the request and wakes
/// everything waiting on it.
pub struct TrackedRequest<'a> {
    node: &'a Node,
    state: Arc<TrackedState>,
}

impl Node {
    pub fn tracked_request_begin(
        &self,
        offset: u64,
        bytes: u64,
        req_type: TrackedRequestType,
    ) -> TrackedRequest<'_> {
        assert!(
            offset.checked_add(bytes).is_some(),
            "Tracked request {:#x}+{:#x} overflows",
            offset,
            bytes
        );

        let state = Arc::new(TrackedState {
            offset,
            bytes,
            req_type,
            co: coroutine::current(),
            inner: Mutex::new(TrackedInner {
                serialising: false,
                overlap: offset..(offset + bytes),
                waiting_for: None,
                waiters: Vec::new(),
            }),
        });

        self.tracked.lock().unwrap().push(Arc::clone(&state));
        TrackedRequest { node: self, state }
    }

    /// Number of requests currently tracked on this node
    pub fn tracked_request_count(&self) -> usize {
        self.tracked.lock().unwrap().len()
    }
}

impl TrackedRequest<'_> {
    pub fn offset(&self) -> u64 {
        self.state.offset
    }

    pub fn bytes(&self) -> u64 {
        self.state.bytes
    }

    pub fn req_type(&self) -> TrackedRequestType {
        self.state.req_type
    }

    pub fn is_serialising(&self) -> bool {
        let _list = self.node.tracked.lock().unwrap();
        let serialising = self.state.inner.lock().unwrap().serialising;
        serialising
    }

    pub fn overlap(&self) -> Range<u64> {
        let _list = self.node.tracked.lock().unwrap();
        let overlap = self.state.inner.lock().unwrap().overlap.clone();
        overlap
    }

    /// Make this request serialising, widening its overlap range to `align` boundaries
    pub fn mark_serialising(&self, align: u64) {
        let start = self.state.offset.align_down(align);
        let end = (self.state.offset + self.state.bytes)
            .align_up(align)
            .unwrap_or(u64::MAX);

        let _list = self.node.tracked.lock().unwrap();
        let mut inner = self.state.inner.lock().unwrap();
        if !inner.serialising {
            self.node
                .serialising_in_flight
                .fetch_add(1, Ordering::SeqCst);
            inner.serialising = true;
        }

        inner.overlap = std::cmp::min(inner.overlap.start, start)
            ..std::cmp::max(inner.overlap.end, end);
    }

    /// Find an overlapping request this one has to wait for.  Must be called with the node's
    /// list lock held.
    fn find_conflict(&self, list: &[Arc<TrackedState>]) -> Conflict {
        let (serialising, overlap) = {
            let inner = self.state.inner.lock().unwrap();
            (inner.serialising, inner.overlap.clone())
        };

        for req in list {
            if Arc::ptr_eq(req, &self.state) {
                continue;
            }

            let inner = req.inner.lock().unwrap();
            if !inner.serialising && !serialising {
                continue;
            }
            if !inner.overlap.overlaps(&overlap) {
                continue;
            }

            // Waiting for a request of our own coroutine would never end
            if req.co.is_some() && req.co == self.state.co {
                return Conflict::SameCoroutine;
            }

            // A request that is already waiting (possibly for us) is let go; it will wait for
            // us once it wakes up
            if inner.waiting_for.is_none() {
                return Conflict::Wait(Arc::clone(req));
            }
        }

        Conflict::None
    }

    /// Whether `req` waits for this request, directly or indirectly
    fn waited_on_by(&self, req: &TrackedState) -> bool {
        let mut next = req.inner.lock().unwrap().waiting_for.clone();
        while let Some(req) = next {
            if Arc::ptr_eq(&req, &self.state) {
                return true;
            }
            next = req.inner.lock().unwrap().waiting_for.clone();
        }
        false
    }

    /// Wait until no overlapping request conflicts with this one anymore.  Returns whether it
    /// had to wait at all.
    pub async fn wait_for_serialising_requests(&self) -> bool {
        if self.node.serialising_in_flight.load(Ordering::SeqCst) == 0 {
            return false;
        }

        let mut waited = false;
        loop {
            let receiver = {
                let list = self.node.tracked.lock().unwrap();
                let conflict = match self.find_conflict(&list) {
                    Conflict::None => break,
                    Conflict::Wait(conflict) => conflict,
                    Conflict::SameCoroutine => {
                        drop(list);
                        panic!("Request waits for another request of the same coroutine");
                    }
                };

                if self.waited_on_by(&conflict) {
                    drop(list);
                    panic!(
                        "Deadlock between tracked requests on node \"{}\"",
                        self.node.name()
                    );
                }

                let (sender, receiver) = oneshot::channel();
                conflict.inner.lock().unwrap().waiters.push(sender);
                self.state.inner.lock().unwrap().waiting_for = Some(conflict);
                receiver
            };

            // The sender is dropped or fired when the conflicting request ends; both wake us
            let _ = receiver.await;

            let _list = self.node.tracked.lock().unwrap();
            self.state.inner.lock().unwrap().waiting_for = None;
            waited = true;
        }

        waited
    }
}

impl Drop for TrackedRequest<'_> {
    fn drop(&mut self) {
        let waiters = {
            let mut list = self.node.tracked.lock().unwrap();
            list.retain(|req| !Arc::ptr_eq(req, &self.state));

            let mut inner = self.state.inner.lock().unwrap();
            if inner.serialising {
                self.node
                    .serialising_in_flight
                    .fetch_sub(1, Ordering::SeqCst);
                inner.serialising = false;
            }
            std::mem::take(&mut inner.waiters)
        };

        for waiter in waiters {
            let _ = waiter.send(());
        }
    }
}

impl std::fmt::Debug for TrackedRequest<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedRequest")
            .field("offset", &self.state.offset)
            .field("bytes", &self.state.bytes)
            .field("type", &self.state.req_type)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory;
    use crate::node::{self, NodeConfig};

    async fn test_node(name: &str) -> Arc<Node> {
        node::open(NodeConfig::new(name, memory::Config::new(1 << 20)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn plain_requests_do_not_wait() {
        let node = test_node("tracked-plain").await;
        let a = node.tracked_request_begin(0, 4096, TrackedRequestType::Write);
        let b = node.tracked_request_begin(0, 4096, TrackedRequestType::Read);

        assert!(!a.wait_for_serialising_requests().await);
        assert!(!b.wait_for_serialising_requests().await);
        assert_eq!(node.tracked_request_count(), 2);
        drop((a, b));
        assert_eq!(node.tracked_request_count(), 0);
    }

    #[tokio::test]
    async fn mark_serialising_widens_overlap() {
        let node = test_node("tracked-widen").await;
        let req = node.tracked_request_begin(5000, 100, TrackedRequestType::Write);
        assert_eq!(req.overlap(), 5000..5100);

        req.mark_serialising(4096);
        assert!(req.is_serialising());
        assert_eq!(req.overlap(), 4096..8192);

        req.mark_serialising(512);
        assert_eq!(req.overlap(), 4096..8192);
        assert_eq!(node.serialising_in_flight.load(Ordering::SeqCst), 1);

        drop(req);
        assert_eq!(node.serialising_in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn overlapping_request_waits_for_serialising_one() {
        let node = test_node("tracked-wait").await;
        let first = node.tracked_request_begin(0, 512, TrackedRequestType::Write);
        first.mark_serialising(4096);

        let waiter = coroutine::co(async {
            let second = node.tracked_request_begin(1024, 512, TrackedRequestType::Read);
            second.wait_for_serialising_requests().await
        });
        tokio::pin!(waiter);
        assert!(futures::poll!(&mut waiter).is_pending());

        // Disjoint requests are not held up
        let other = node.tracked_request_begin(8192, 512, TrackedRequestType::Read);
        assert!(!other.wait_for_serialising_requests().await);

        drop(first);
        assert!(waiter.await);
    }

    #[tokio::test]
    #[should_panic(expected = "same coroutine")]
    async fn waiting_on_own_coroutine_is_fatal() {
        let node = test_node("tracked-self").await;
        coroutine::co(async {
            let first = node.tracked_request_begin(0, 512, TrackedRequestType::Write);
            first.mark_serialising(512);
            let second = node.tracked_request_begin(0, 512, TrackedRequestType::Write);
            second.wait_for_serialising_requests().await;
        })
        .await;
    }
}
