//! Flushing nodes to stable storage.

use super::{DriverCap, Node, NodeDriver, NodePerm};
use crate::helpers::BlockFutureResult;
use crate::{BlockError, BlockResult};
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use tokio::sync::oneshot;

/// Per-node flush serialisation: at most one flush runs the driver at a time, the others queue
#[derive(Debug, Default)]
pub(crate) struct FlushState {
    active: bool,
    queue: VecDeque<oneshot::Sender<()>>,
}

impl FlushState {
    /// Hand the flush over to the next queued caller still waiting
    fn wake_next(&mut self) {
        while let Some(waiter) = self.queue.pop_front() {
            if waiter.send(()).is_ok() {
                break;
            }
        }
    }
}

impl Node {
    /// Write back everything written to this node so far, including its file child.  Concurrent
    /// flushes are serialised; each one returns success only once all data written before it
    /// was called is stable.
    ///
    /// Nodes that are read-only, have no medium, or pass SCSI commands through have nothing to
    /// flush and succeed immediately.
    pub fn flush(&self) -> BlockFutureResult<'_, ()> {
        Box::pin(async move {
            let _in_flight = self.enter_in_flight();
            self.do_flush(false).await
        })
    }

    /// Flush completing an emulated FUA write.  The write has not been counted in the write
    /// generation yet, so the disk flush must not be skipped for a clean generation.
    pub(super) fn flush_for_fua(&self) -> BlockFutureResult<'_, ()> {
        Box::pin(async move {
            let _in_flight = self.enter_in_flight();
            self.do_flush(true).await
        })
    }

    async fn do_flush(&self, force: bool) -> BlockResult<()> {
        let driver = match self.driver_opt() {
            Some(driver) if driver.is_inserted() => driver,
            _ => return Ok(()),
        };
        if self.is_read_only() || driver.is_sg() {
            return Ok(());
        }

        let current_gen = {
            let mut state = self.flush_state.lock().await;
            let current_gen = self.write_gen.load(Ordering::SeqCst);

            while state.active {
                let (sender, receiver) = oneshot::channel();
                state.queue.push_back(sender);
                drop(state);
                let _ = receiver.await;
                state = self.flush_state.lock().await;
            }

            // Flushes get here in nondecreasing order of `current_gen`
            state.active = true;
            current_gen
        };

        let result = self.flush_layers(driver.as_ref(), current_gen, force).await;
        if result.is_ok() {
            self.flushed_gen.fetch_max(current_gen, Ordering::SeqCst);
        }

        let mut state = self.flush_state.lock().await;
        state.active = false;
        state.wake_next();

        result
    }

    async fn flush_layers(
        &self,
        driver: &dyn NodeDriver,
        current_gen: u64,
        force: bool,
    ) -> BlockResult<()> {
        let caps = driver.capabilities();
        if caps.contains(DriverCap::Flush) {
            return driver.flush().await;
        }

        // Even without flushing to disk, get the data out of our own caches
        driver.flush_to_os().await?;

        if self.opts.cache.no_flush {
            return Ok(());
        }

        if force || self.flushed_gen.load(Ordering::SeqCst) != current_gen {
            // The flush to the OS may have ejected the medium
            if self.driver_opt().is_none() {
                return Err(BlockError::no_medium(&self.name));
            }
            if caps.contains(DriverCap::FlushToDisk) {
                driver.flush_to_disk().await?;
            } else {
                // Drivers that cannot flush are taken to be write-through
                debug!(
                    "Driver {} of node \"{}\" cannot flush to disk",
                    driver.driver_name(),
                    self.name
                );
            }
        }

        // Children we may have written to have their own data to flush
        let mut result = Ok(());
        for child in self.children() {
            let perms = child.permissions();
            if perms.has(NodePerm::Write) || perms.has(NodePerm::WriteUnchanged) {
                let child_result = child.node().flush().await;
                if result.is_ok() {
                    result = child_result;
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use crate::memory::{self, DriverOp};
    use crate::node::{self, NodeConfig, NodePerm, NodeUser};

    #[tokio::test]
    async fn flush_advances_flushed_generation() {
        let node = node::open(NodeConfig::new("flush-gen", memory::Config::new(65536)))
            .await
            .unwrap();
        let user = node
            .add_user(NodeUser::root("flush-gen-user").require(NodePerm::Write))
            .unwrap();

        user.write(&[1; 512], 0).await.unwrap();
        user.write(&[2; 512], 512).await.unwrap();
        assert_eq!(node.write_generation(), 2);
        assert_eq!(node.flushed_generation(), 0);

        node.flush().await.unwrap();
        assert_eq!(node.flushed_generation(), 2);
    }

    #[tokio::test]
    async fn clean_node_skips_disk_flush() {
        let node = node::open(NodeConfig::new("flush-clean", memory::Config::new(65536)))
            .await
            .unwrap();
        let user = node
            .add_user(NodeUser::root("flush-clean-user").require(NodePerm::Write))
            .unwrap();

        user.write(&[1; 512], 0).await.unwrap();
        node.flush().await.unwrap();
        node.flush().await.unwrap();

        let flushes = node
            .with_driver(|d: &memory::Data| d.take_ops())
            .unwrap()
            .into_iter()
            .filter(|op| matches!(op, DriverOp::Flush))
            .count();
        assert_eq!(flushes, 1);
    }

    #[tokio::test]
    async fn no_flush_cache_mode_never_reaches_disk() {
        let mut opts = NodeConfig::new("flush-unsafe", memory::Config::new(65536));
        opts.cache.no_flush = true;
        let node = node::open(opts).await.unwrap();
        let user = node
            .add_user(NodeUser::root("flush-unsafe-user").require(NodePerm::Write))
            .unwrap();

        user.write(&[1; 512], 0).await.unwrap();
        node.flush().await.unwrap();

        let ops = node.with_driver(|d: &memory::Data| d.take_ops()).unwrap();
        assert!(!ops.iter().any(|op| matches!(op, DriverOp::Flush)));
        assert_eq!(node.flushed_generation(), 1);
    }

    #[tokio::test]
    async fn read_only_node_flush_is_a_no_op() {
        let mut opts = NodeConfig::new("flush-ro", memory::Config::new(4096));
        opts.read_only = true;
        let node = node::open(opts).await.unwrap();
        node.flush().await.unwrap();

        let ops = node.with_driver(|d: &memory::Data| d.take_ops()).unwrap();
        assert!(ops.is_empty());
    }

    #[tokio::test]
    async fn failed_flush_keeps_generation() {
        let node = node::open(NodeConfig::new("flush-fail", memory::Config::new(4096)))
            .await
            .unwrap();
        let user = node
            .add_user(NodeUser::root("flush-fail-user").require(NodePerm::Write))
            .unwrap();
        user.write(&[1; 512], 0).await.unwrap();

        node.with_driver(|d: &memory::Data| d.inject_error(memory::ErrorTarget::Flush))
            .unwrap();
        assert!(node.flush().await.is_err());
        assert_eq!(node.flushed_generation(), 0);

        node.flush().await.unwrap();
        assert_eq!(node.flushed_generation(), 1);
    }
}
