//! Coroutine identity and the blocking bridge.
//!
//! A coroutine is a future scoped with its own [`CoroutineId`]; nested operations awaited by it
//! run inline as part of the same coroutine.  [`run()`] lets ordinary (non-async) call sites issue
//! an operation: it creates a coroutine, drives the execution context until the coroutine's
//! completion slot is filled, and returns the result.  Code that already runs in a coroutine
//! awaits the operation instead.

use crate::aio::AioContext;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct CoroutineId(u64);

tokio::task_local! {
    static CURRENT: CoroutineId;
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub fn in_coroutine() -> bool {
    CURRENT.try_with(|_| ()).is_ok()
}

pub fn current() -> Option<CoroutineId> {
    CURRENT.try_with(|id| *id).ok()
}

/// Turn `fut` into a new coroutine with its own identity
pub fn co<F: Future>(fut: F) -> impl Future<Output = F::Output> {
    let id = CoroutineId(NEXT_ID.fetch_add(1, Ordering::Relaxed));
    CURRENT.scope(id, fut)
}

/// Holds the result of a bridged coroutine until the blocking caller picks it up
pub struct CompletionSlot<T> {
    done: AtomicBool,
    value: Mutex<Option<T>>,
}

impl<T> CompletionSlot<T> {
    pub fn new() -> Self {
        CompletionSlot {
            done: AtomicBool::new(false),
            value: Mutex::new(None),
        }
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Store the result.  Only the coroutine's own completion path may do this, and only once.
    pub fn complete(&self, value: T) {
        let mut slot = self.value.lock().unwrap();
        assert!(
            !self.done.load(Ordering::Relaxed),
            "Coroutine completion slot filled twice"
        );
        *slot = Some(value);
        self.done.store(true, Ordering::Release);
    }

    pub fn take(&self) -> T {
        assert!(self.is_done(), "Coroutine result taken before completion");
        match self.value.lock().unwrap().take() {
            Some(value) => value,
            None => panic!("Coroutine result taken twice"),
        }
    }
}

impl<T> Default for CompletionSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `fut` to completion from an ordinary call site.
///
/// `fut` becomes a new coroutine on `ctx` and the calling thread drives `ctx` until it is done.
/// Blocking inside a coroutine would stall the context (and its timers) that the coroutine runs
/// on, so that is fatal: coroutines `.await` the operation, which runs it inline.
pub fn run<T, F: Future<Output = T>>(ctx: &AioContext, fut: F) -> T {
    assert!(
        !in_coroutine(),
        "Blocking call on context \"{}\" from inside a coroutine; await the operation instead",
        ctx.name()
    );

    let slot = CompletionSlot::new();
    ctx.block_on(co(async {
        let result = fut.await;
        slot.complete(result);
    }));
    slot.take()
}
