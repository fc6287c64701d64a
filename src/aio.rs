//! Execution contexts.
//!
//! An [`AioContext`] is a single-threaded executor: coroutines scheduled on it never run
//! concurrently with each other, only interleaved at suspension points.  Whoever drives the
//! context (via [`AioContext::block_on`]) holds its execution lock for that time; other threads
//! must use [`AioContext::try_acquire`] and never block while holding the lock.
//!
//! [`AioWait`] is the global "something completed" notification that drain polling waits on.

use crate::coroutine;
use crate::helpers::WeakAutoDeleteIterator;
use crate::BlockResult;
use once_cell::sync::{Lazy, OnceCell};
use std::collections::LinkedList;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, TryLockError, Weak};
use std::task::{Context, Poll, Waker};
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;

pub struct AioContext {
    name: String,
    runtime: Runtime,
    lock: Mutex<()>,
}

/// Proof that the holder may run the context's event loop
pub struct AioContextGuard<'a> {
    ctx: &'a AioContext,
    _lock: MutexGuard<'a, ()>,
}

static CONTEXTS: Lazy<Mutex<Vec<Weak<AioContext>>>> = Lazy::new(Default::default);
static MAIN_CONTEXT: OnceCell<Arc<AioContext>> = OnceCell::new();

impl AioContext {
    pub fn new(name: &str) -> BlockResult<Arc<Self>> {
        let runtime = Builder::new_current_thread()
            .enable_time()
            .thread_name(format!("aio-{}", name))
            .build()
            .map_err(|err| {
                crate::BlockError::from(err).prepend(&format!("Creating context \"{}\"", name))
            })?;

        let ctx = Arc::new(AioContext {
            name: name.to_string(),
            runtime,
            lock: Mutex::new(()),
        });
        CONTEXTS.lock().unwrap().push(Arc::downgrade(&ctx));
        debug!("Created execution context \"{}\"", name);
        Ok(ctx)
    }

    /// The default context, which nodes are attached to unless told otherwise
    pub fn main() -> BlockResult<Arc<Self>> {
        MAIN_CONTEXT
            .get_or_try_init(|| AioContext::new("main"))
            .map(Arc::clone)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take the execution lock, blocking until whoever drives the context lets go
    pub fn acquire(&self) -> AioContextGuard<'_> {
        AioContextGuard {
            ctx: self,
            // Guards no data, so poisoning carries no meaning
            _lock: self.lock.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Take the execution lock only if nobody is driving the context right now
    pub fn try_acquire(&self) -> Option<AioContextGuard<'_>> {
        let lock = match self.lock.try_lock() {
            Ok(lock) => lock,
            Err(TryLockError::Poisoned(err)) => err.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        Some(AioContextGuard {
            ctx: self,
            _lock: lock,
        })
    }

    /// Drive this context until `fut` completes.  Must not be called from inside a coroutine.
    pub fn block_on<F: Future>(&self, fut: F) -> F::Output {
        assert!(
            !coroutine::in_coroutine(),
            "Blocking on context \"{}\" from inside a coroutine",
            self.name
        );
        let guard = self.acquire();
        guard.ctx.runtime.block_on(fut)
    }

    /// Schedule `fut` as a new coroutine on this context.  It runs whenever the context is
    /// driven.
    pub fn spawn<F: Future<Output = ()> + Send + 'static>(&self, fut: F) -> JoinHandle<()> {
        self.runtime.spawn(coroutine::co(fut))
    }
}

impl AioContextGuard<'_> {
    /// Run everything on the context that is ready to run, without waiting for anything
    pub fn poll(&self) {
        self.ctx.runtime.block_on(tokio::task::yield_now());
    }
}

impl std::fmt::Debug for AioContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AioContext").field("name", &self.name).finish()
    }
}

/// All contexts that are still alive
pub fn all_contexts() -> Vec<Arc<AioContext>> {
    let mut contexts = CONTEXTS.lock().unwrap();
    WeakAutoDeleteIterator::from_vec(&mut contexts, Weak::upgrade).collect()
}

pub struct AioWait {
    generation: Mutex<u64>,
    cond: Condvar,
    wakers: Mutex<LinkedList<Waker>>,
}

static AIO_WAIT: Lazy<AioWait> = Lazy::new(|| AioWait {
    generation: Mutex::new(0),
    cond: Condvar::new(),
    wakers: Mutex::new(LinkedList::new()),
});

/// Future returned by [`AioWait::wait_while()`]
pub struct AioWaitFuture<F: Fn() -> bool> {
    condition: F,
}

impl AioWait {
    /// Signal that some condition a waiter may be polling on could have changed
    pub fn kick() {
        *AIO_WAIT.generation.lock().unwrap() += 1;
        AIO_WAIT.cond.notify_all();

        let wakers = std::mem::take(&mut *AIO_WAIT.wakers.lock().unwrap());
        for waker in wakers {
            waker.wake();
        }
    }

    /// Suspend the calling coroutine while `condition` holds, re-checking after every kick
    pub fn wait_while<F: Fn() -> bool>(condition: F) -> AioWaitFuture<F> {
        AioWaitFuture { condition }
    }

    /// Number of kicks so far
    pub fn generation() -> u64 {
        *AIO_WAIT.generation.lock().unwrap()
    }

    /// Block the calling thread until the generation moves past `seen`, or `timeout` expires
    pub fn wait_kick(seen: u64, timeout: Duration) {
        let generation = AIO_WAIT.generation.lock().unwrap();
        let _unused = AIO_WAIT
            .cond
            .wait_timeout_while(generation, timeout, |g| *g == seen)
            .unwrap();
    }
}

impl<F: Fn() -> bool> Future for AioWaitFuture<F> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if !(self.condition)() {
            return Poll::Ready(());
        }

        AIO_WAIT.wakers.lock().unwrap().push_back(cx.waker().clone());

        // A kick may have happened between the check and the registration
        if !(self.condition)() {
            return Poll::Ready(());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn spawned_coroutines_run_when_polled() {
        let ctx = AioContext::new("test-poll").unwrap();
        let done = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&done);
        ctx.spawn(async move {
            assert!(coroutine::in_coroutine());
            flag.store(true, Ordering::SeqCst);
        });

        assert!(!done.load(Ordering::SeqCst));
        ctx.try_acquire().unwrap().poll();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn try_acquire_fails_while_held() {
        let ctx = AioContext::new("test-lock").unwrap();
        let guard = ctx.acquire();
        assert!(ctx.try_acquire().is_none());
        drop(guard);
        assert!(ctx.try_acquire().is_some());
    }

    #[test]
    fn wait_while_resumes_on_kick() {
        let ctx = AioContext::new("test-wait").unwrap();
        let flag = Arc::new(AtomicBool::new(true));

        let setter = Arc::clone(&flag);
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            setter.store(false, Ordering::SeqCst);
            AioWait::kick();
        });

        let waiter = Arc::clone(&flag);
        ctx.block_on(AioWait::wait_while(move || waiter.load(Ordering::SeqCst)));
        assert!(!flag.load(Ordering::SeqCst));
        thread.join().unwrap();
    }
}
