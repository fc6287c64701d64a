//! Copy-on-read: populate a node from its backing chain while reading through it.

use super::tracked::TrackedRequest;
use super::{DriverCap, Node, NodeDriver, RequestFlag, RequestFlags};
use super::{MAX_BOUNCE_BUFFER, MAX_REQUEST_BYTES};
use crate::helpers::{buffer_is_zero, min_non_zero, IntAlignment, IoBuffer, IoVectorMut};
use crate::BlockResult;
use std::sync::atomic::Ordering;

impl Node {
    pub fn enable_copy_on_read(&self) {
        self.copy_on_read.fetch_add(1, Ordering::SeqCst);
    }

    pub fn disable_copy_on_read(&self) {
        let old = self.copy_on_read.fetch_sub(1, Ordering::SeqCst);
        assert!(
            old > 0,
            "Copy-on-read disabled more often than enabled on node \"{}\"",
            self.name()
        );
    }

    pub fn copy_on_read_count(&self) -> usize {
        self.copy_on_read.load(Ordering::SeqCst)
    }

    /// Read `[offset, offset + bytes)` into `bufv`, writing every part not yet allocated in this
    /// node back into it.  `req` must already be serialising at cluster granularity.
    pub(super) async fn copy_on_readv(
        &self,
        req: &TrackedRequest<'_>,
        driver: &dyn NodeDriver,
        offset: u64,
        bytes: u64,
        bufv: IoVectorMut<'_>,
        _flags: RequestFlags,
    ) -> BlockResult<()> {
        debug_assert!(req.is_serialising());

        let limits = self.limits();
        let cluster_size = self.cluster_size();
        let max_transfer = min_non_zero(limits.max_transfer, MAX_REQUEST_BYTES);

        let mut cluster_offset = offset.align_down(cluster_size);
        let cluster_end = (offset + bytes)
            .align_up(cluster_size)
            .unwrap_or(u64::MAX);
        let mut cluster_bytes = cluster_end - cluster_offset;
        let mut skip_bytes = offset - cluster_offset;

        let bounce_len = std::cmp::min(
            MAX_BOUNCE_BUFFER,
            std::cmp::min(cluster_bytes, max_transfer),
        );
        let mut bounce: Option<IoBuffer> = None;

        let mut bufv = bufv;
        let mut progress = 0;
        while cluster_bytes > 0 {
            let probe = std::cmp::min(cluster_bytes, max_transfer);
            let (allocated, pnum) = match self.is_allocated(cluster_offset, probe).await {
                Ok(result) => result,
                // Reading will most likely fail too, with a more precise error
                Err(_) => (false, probe),
            };

            if !allocated && pnum == 0 {
                // The node ends within the last cluster
                break;
            }
            assert!(skip_bytes < pnum);

            let pnum = if allocated {
                pnum
            } else {
                std::cmp::min(pnum, MAX_BOUNCE_BUFFER)
            };
            let take = std::cmp::min(pnum - skip_bytes, bytes.saturating_sub(progress));
            let (chunk, rest) = bufv.split_at(take);
            bufv = rest;

            if allocated {
                if take > 0 {
                    self.driver_preadv(driver, offset + progress, chunk).await?;
                }
            } else {
                if bounce.is_none() {
                    bounce = Some(IoBuffer::new(
                        bounce_len as usize,
                        limits.opt_mem_alignment,
                    )?);
                }
                let buf = match bounce.as_mut() {
                    Some(buf) => buf,
                    None => unreachable!(),
                };
                self.driver_preadv(driver, cluster_offset, (&mut buf[..pnum as usize]).into())
                    .await
                    .map_err(|err| {
                        warn!(
                            "Copy-on-read of {:#x}+{:#x} on node \"{}\" failed to read: {}",
                            cluster_offset,
                            pnum,
                            self.name(),
                            err
                        );
                        err
                    })?;

                let data = &buf[..pnum as usize];
                let result = if driver.capabilities().contains(DriverCap::WriteZeroes)
                    && buffer_is_zero(data)
                {
                    self.do_pwrite_zeroes(
                        driver,
                        cluster_offset,
                        pnum,
                        RequestFlag::ZeroWrite | RequestFlag::WriteUnchanged,
                    )
                    .await
                } else {
                    self.driver_pwritev(
                        driver,
                        cluster_offset,
                        data.into(),
                        RequestFlag::WriteUnchanged.into(),
                    )
                    .await
                };
                if let Err(err) = result {
                    warn!(
                        "Copy-on-read of {:#x}+{:#x} on node \"{}\" failed to write back: {}",
                        cluster_offset,
                        pnum,
                        self.name(),
                        err
                    );
                    return Err(err);
                }

                let skip = skip_bytes as usize;
                let mut chunk = chunk;
                chunk.copy_from_slice(&data[skip..skip + take as usize]);
            }

            cluster_offset += pnum;
            cluster_bytes -= pnum;
            progress += pnum - skip_bytes;
            skip_bytes = 0;
        }

        // Whatever lies past the end of the node reads as zeroes
        if !bufv.is_empty() {
            bufv.fill(0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::memory;
    use crate::node::{self, NodeConfig};

    #[tokio::test]
    async fn counter_follows_enable_and_disable() {
        let node = node::open(NodeConfig::new("cor-count", memory::Config::new(4096)))
            .await
            .unwrap();

        node.enable_copy_on_read();
        node.enable_copy_on_read();
        node.disable_copy_on_read();
        assert_eq!(node.copy_on_read_count(), 1);
        node.disable_copy_on_read();
        assert_eq!(node.copy_on_read_count(), 0);
    }

    #[tokio::test]
    #[should_panic(expected = "more often than enabled")]
    async fn unbalanced_disable_is_fatal() {
        let node = node::open(NodeConfig::new("cor-unbalanced", memory::Config::new(4096)))
            .await
            .unwrap();
        node.disable_copy_on_read();
    }
}
