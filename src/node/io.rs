//! Read and write paths: padding to the request alignment, splitting to the transfer limit,
//! read-modify-write of partial units, and memory-alignment bouncing before the driver.

use super::tracked::{TrackedRequest, TrackedRequestType};
use super::{DetectZeroes, DiscardMode, DriverCap, Node, NodeDriver, NodeUser, RequestFlag};
use super::{RequestFlags, MAX_REQUEST_BYTES};
use crate::coroutine;
use crate::helpers::{min_non_zero, IntAlignment, IoBuffer, IoVector, IoVectorMut};
use crate::{BlockError, BlockResult};
use std::sync::atomic::Ordering;

/// Bytes a request has to be extended by on either side to become aligned
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct Padding {
    pub head: u64,
    pub tail: u64,
}

impl Padding {
    pub fn new(offset: u64, bytes: u64, align: u64) -> Self {
        let end = offset + bytes;
        Padding {
            head: offset - offset.align_down(align),
            tail: end.align_up(align).unwrap_or(end) - end,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head == 0 && self.tail == 0
    }
}

impl Node {
    pub(super) fn check_inserted(&self) -> BlockResult<std::sync::Arc<dyn NodeDriver>> {
        let driver = self.driver()?;
        if !driver.is_inserted() {
            return Err(BlockError::no_medium(self.name()));
        }
        Ok(driver)
    }

    /// Effective transfer limit for `align`-aligned requests
    fn max_transfer(&self, align: u64) -> u64 {
        min_non_zero(self.limits().max_transfer, MAX_REQUEST_BYTES).align_down(align)
    }

    pub(crate) async fn co_preadv(
        &self,
        offset: u64,
        bufv: IoVectorMut<'_>,
        flags: RequestFlags,
    ) -> BlockResult<()> {
        let driver = self.check_inserted()?;
        let bytes = bufv.len();
        self.check_request(offset, bytes, bufv.buffer_count())?;
        if bytes == 0 {
            return Ok(());
        }

        let _in_flight = self.enter_in_flight();
        // Requests joined by one caller are still told apart by the tracker
        coroutine::co(self.do_preadv(driver.as_ref(), offset, bufv, flags)).await
    }

    async fn do_preadv(
        &self,
        driver: &dyn NodeDriver,
        offset: u64,
        bufv: IoVectorMut<'_>,
        mut flags: RequestFlags,
    ) -> BlockResult<()> {
        if self.copy_on_read.load(Ordering::SeqCst) > 0
            && !flags.contains(RequestFlag::NoSerialising)
        {
            flags.add(RequestFlag::CopyOnRead);
        }

        let limits = self.limits();
        let align = limits.request_alignment;
        let bytes = bufv.len();
        let pad = Padding::new(offset, bytes, align);

        let mut head_buf = match pad.head {
            0 => None,
            head => Some(IoBuffer::new(head as usize, limits.opt_mem_alignment)?),
        };
        let mut tail_buf = match pad.tail {
            0 => None,
            tail => Some(IoBuffer::new(tail as usize, limits.opt_mem_alignment)?),
        };

        let bufv = match head_buf.as_mut() {
            Some(buf) => bufv.with_inserted(0, &mut buf[..]),
            None => bufv,
        };
        let bufv = match tail_buf.as_mut() {
            Some(buf) => bufv.with_pushed(&mut buf[..]),
            None => bufv,
        };

        let req = self.tracked_request_begin(offset, bytes, TrackedRequestType::Read);
        self.aligned_preadv(
            &req,
            driver,
            offset - pad.head,
            bytes + pad.head + pad.tail,
            align,
            bufv,
            flags,
        )
        .await
    }

    /// Read an aligned range on behalf of `req`.  Data past the end of the node reads as zeroes.
    #[allow(clippy::too_many_arguments)]
    pub(super) async fn aligned_preadv(
        &self,
        req: &TrackedRequest<'_>,
        driver: &dyn NodeDriver,
        offset: u64,
        bytes: u64,
        align: u64,
        bufv: IoVectorMut<'_>,
        mut flags: RequestFlags,
    ) -> BlockResult<()> {
        assert!(offset.is_aligned(align) && bytes.is_aligned(align));
        assert_eq!(bufv.len(), bytes);

        if flags.contains(RequestFlag::Serialising) {
            req.mark_serialising(self.cluster_size());
        }
        if !flags.contains(RequestFlag::NoSerialising) {
            req.wait_for_serialising_requests().await;
        }

        if flags.contains(RequestFlag::CopyOnRead) {
            flags.remove(RequestFlag::CopyOnRead);

            let (allocated, pnum) = self.is_allocated(offset, bytes).await?;
            if !allocated || pnum != bytes {
                req.mark_serialising(self.cluster_size());
                req.wait_for_serialising_requests().await;
                return self
                    .copy_on_readv(req, driver, offset, bytes, bufv, flags)
                    .await;
            }
        }

        let total = self.length();
        let mut max_bytes = total
            .saturating_sub(offset)
            .align_up(align)
            .unwrap_or(u64::MAX);
        let max_transfer = self.max_transfer(align);

        if bytes <= max_bytes && bytes <= max_transfer {
            return self.driver_preadv(driver, offset, bufv).await;
        }

        let mut bufv = bufv;
        let mut done = 0;
        while done < bytes {
            let remaining = bytes - done;
            if max_bytes > 0 {
                let num = std::cmp::min(remaining, std::cmp::min(max_bytes, max_transfer));
                let (chunk, rest) = bufv.split_at(num);
                bufv = rest;
                self.driver_preadv(driver, offset + done, chunk).await?;
                max_bytes -= num;
                done += num;
            } else {
                bufv.fill(0);
                done += remaining;
            }
        }

        Ok(())
    }

    /// Hand a read to the driver.  A vector with any buffer that does not meet the memory
    /// alignment is read through a single bounce buffer.
    pub(super) async fn driver_preadv(
        &self,
        driver: &dyn NodeDriver,
        offset: u64,
        mut bufv: IoVectorMut<'_>,
    ) -> BlockResult<()> {
        let mem_align = self.limits().min_mem_alignment;
        if bufv.is_aligned(mem_align, 1) {
            return driver.readv(offset, bufv, RequestFlags::empty()).await;
        }

        let mut bounce = IoBuffer::new(bufv.len().try_into()?, mem_align)?;
        driver
            .readv(offset, (&mut bounce[..]).into(), RequestFlags::empty())
            .await?;
        bufv.copy_from_slice(&bounce);
        Ok(())
    }

    /// Hand a write to the driver: mask the flags to what it supports, emulate FUA with a
    /// flush, and bounce misaligned buffers
    pub(super) async fn driver_pwritev(
        &self,
        driver: &dyn NodeDriver,
        offset: u64,
        bufv: IoVector<'_>,
        flags: RequestFlags,
    ) -> BlockResult<()> {
        let supported = driver.supported_write_flags();
        let emulate_fua =
            flags.contains(RequestFlag::Fua) && !supported.contains(RequestFlag::Fua);

        let result = if flags.contains(RequestFlag::WriteCompressed)
            && driver
                .capabilities()
                .contains(DriverCap::WriteCompressed)
        {
            driver.writev_compressed(offset, bufv).await
        } else {
            self.driver_writev_aligned(driver, offset, bufv, flags.overlap_with(supported))
                .await
        };

        if result.is_ok() && emulate_fua {
            debug!(
                "Emulating FUA with a flush on node \"{}\" ({:#x})",
                self.name(),
                offset
            );
            return self.flush_for_fua().await;
        }
        result
    }

    async fn driver_writev_aligned(
        &self,
        driver: &dyn NodeDriver,
        offset: u64,
        bufv: IoVector<'_>,
        flags: RequestFlags,
    ) -> BlockResult<()> {
        let mem_align = self.limits().min_mem_alignment;
        if bufv.is_aligned(mem_align, 1) {
            return driver.writev(offset, bufv, flags).await;
        }

        let mut bounce = IoBuffer::new(bufv.len().try_into()?, mem_align)?;
        bufv.copy_into_slice(&mut bounce);
        driver.writev(offset, (&bounce[..]).into(), flags).await
    }

    pub(crate) async fn co_pwritev(
        &self,
        user: &NodeUser,
        offset: u64,
        bytes: u64,
        bufv: IoVector<'_>,
        flags: RequestFlags,
    ) -> BlockResult<()> {
        let driver = self.check_inserted()?;
        self.check_write_permitted(user, offset, bytes)?;
        self.check_request(offset, bytes, bufv.buffer_count())?;
        if !flags.contains(RequestFlag::ZeroWrite) {
            assert_eq!(bufv.len(), bytes);
        }
        if bytes == 0 {
            return Ok(());
        }

        let _in_flight = self.enter_in_flight();
        coroutine::co(self.do_pwritev(driver.as_ref(), offset, bytes, bufv, flags)).await
    }

    async fn do_pwritev(
        &self,
        driver: &dyn NodeDriver,
        offset: u64,
        bytes: u64,
        bufv: IoVector<'_>,
        flags: RequestFlags,
    ) -> BlockResult<()> {
        let limits = self.limits();
        let align = limits.request_alignment;
        let req = self.tracked_request_begin(offset, bytes, TrackedRequestType::Write);

        if flags.contains(RequestFlag::ZeroWrite) {
            return self.zero_pwritev(&req, driver, offset, bytes, flags).await;
        }

        let pad = Padding::new(offset, bytes, align);
        if pad.is_empty() {
            return self
                .aligned_pwritev(&req, driver, offset, bytes, align, bufv, flags)
                .await;
        }

        // Nobody may touch the partial units between our read and our write
        req.mark_serialising(align);
        req.wait_for_serialising_requests().await;

        let start = offset - pad.head;
        let end = offset + bytes + pad.tail;
        let (head_buf, tail_buf) = self
            .read_padding_units(&req, driver, start, end, align, pad)
            .await?;

        if end - start == align {
            // Everything lives in a single unit: splice the data in and write that unit
            let Some(mut unit) = head_buf else {
                unreachable!();
            };
            let range = pad.head as usize..(pad.head + bytes) as usize;
            bufv.copy_into_slice(&mut unit[range]);
            return self
                .aligned_pwritev(
                    &req,
                    driver,
                    start,
                    align,
                    align,
                    (&unit[..]).into(),
                    flags,
                )
                .await;
        }

        self.write_with_padding(
            &req,
            driver,
            start,
            end,
            align,
            pad,
            head_buf.as_ref(),
            tail_buf.as_ref(),
            bufv,
            flags,
        )
        .await
    }

    /// Read the full units containing the head and tail padding of `[start, end)`.  If both are
    /// the same unit, it is read only once and returned as the head.
    pub(super) async fn read_padding_units(
        &self,
        req: &TrackedRequest<'_>,
        driver: &dyn NodeDriver,
        start: u64,
        end: u64,
        align: u64,
        pad: Padding,
    ) -> BlockResult<(Option<IoBuffer>, Option<IoBuffer>)> {
        let mem_align = self.limits().opt_mem_alignment;
        let single_unit = end - start == align;

        let head_buf = if pad.head > 0 || (single_unit && pad.tail > 0) {
            let mut buf = IoBuffer::new(align as usize, mem_align)?;
            self.aligned_preadv(
                req,
                driver,
                start,
                align,
                align,
                (&mut buf[..]).into(),
                RequestFlags::empty(),
            )
            .await?;
            Some(buf)
        } else {
            None
        };

        let tail_buf = if pad.tail > 0 && !single_unit {
            let mut buf = IoBuffer::new(align as usize, mem_align)?;
            self.aligned_preadv(
                req,
                driver,
                end - align,
                align,
                align,
                (&mut buf[..]).into(),
                RequestFlags::empty(),
            )
            .await?;
            Some(buf)
        } else {
            None
        };

        Ok((head_buf, tail_buf))
    }

    /// Write `bufv` surrounded by the preserved parts of the padding units
    #[allow(clippy::too_many_arguments)]
    async fn write_with_padding(
        &self,
        req: &TrackedRequest<'_>,
        driver: &dyn NodeDriver,
        start: u64,
        end: u64,
        align: u64,
        pad: Padding,
        head_buf: Option<&IoBuffer>,
        tail_buf: Option<&IoBuffer>,
        bufv: IoVector<'_>,
        flags: RequestFlags,
    ) -> BlockResult<()> {
        let bufv = match head_buf {
            Some(buf) => bufv.with_inserted(0, &buf[..pad.head as usize]),
            None => bufv,
        };
        let bufv = match tail_buf {
            Some(buf) => bufv.with_pushed(&buf[(align - pad.tail) as usize..]),
            None => bufv,
        };

        self.aligned_pwritev(req, driver, start, end - start, align, bufv, flags)
            .await
    }

    /// Write an aligned range on behalf of `req`
    #[allow(clippy::too_many_arguments)]
    pub(super) async fn aligned_pwritev(
        &self,
        req: &TrackedRequest<'_>,
        driver: &dyn NodeDriver,
        offset: u64,
        bytes: u64,
        align: u64,
        bufv: IoVector<'_>,
        mut flags: RequestFlags,
    ) -> BlockResult<()> {
        assert!(offset.is_aligned(align) && bytes.is_aligned(align));

        if flags.contains(RequestFlag::Serialising) {
            req.mark_serialising(self.cluster_size());
        }
        flags.remove(RequestFlag::Serialising | RequestFlag::NoSerialising);
        req.wait_for_serialising_requests().await;

        let opts = self.opts();
        if opts.detect_zeroes != DetectZeroes::Off
            && !flags.contains(RequestFlag::ZeroWrite)
            && bufv.is_zero()
        {
            flags.add(RequestFlag::ZeroWrite);
            if opts.detect_zeroes == DetectZeroes::Unmap && opts.discard == DiscardMode::Unmap {
                flags.add(RequestFlag::MayUnmap);
            }
        }

        let max_transfer = self.max_transfer(align);
        let result = if flags.contains(RequestFlag::ZeroWrite) {
            self.do_pwrite_zeroes(driver, offset, bytes, flags).await
        } else if bytes <= max_transfer {
            self.driver_pwritev(driver, offset, bufv, flags).await
        } else {
            let emulated_fua = flags.contains(RequestFlag::Fua)
                && !driver.supported_write_flags().contains(RequestFlag::Fua);

            let mut bufv = bufv;
            let mut done = 0;
            let mut result = Ok(());
            while done < bytes {
                let num = std::cmp::min(bytes - done, max_transfer);
                let (chunk, rest) = bufv.split_at(num);
                bufv = rest;

                // An emulated FUA only needs its flush after the last chunk
                let chunk_flags = if emulated_fua && done + num < bytes {
                    flags.without(RequestFlag::Fua)
                } else {
                    flags
                };

                result = self
                    .driver_pwritev(driver, offset + done, chunk, chunk_flags)
                    .await;
                if result.is_err() {
                    break;
                }
                done += num;
            }
            result
        };

        if result.is_ok() {
            self.write_completed(offset, bytes);
        }
        result
    }
}
