//! Zero writes and discards, fragmented to the driver's alignment and size limits.

use super::tracked::{TrackedRequest, TrackedRequestType};
use super::{DiscardMode, DriverCap, Node, NodeDriver, RequestFlag, RequestFlags};
use super::MAX_BOUNCE_BUFFER;
use super::io::Padding;
use crate::coroutine;
use crate::helpers::{min_non_zero, IntAlignment, IoBuffer, IoVector};
use crate::{BlockError, BlockResult};
use std::sync::atomic::Ordering;

/// Splits a byte range into chunks a driver with alignment `align` accepts: a short head up to
/// the first `align` boundary, aligned bulk chunks of at most `max_chunk` bytes, and a short
/// tail after the last boundary.  Head and tail are further split at `sub_align` boundaries so
/// that no chunk shorter than `sub_align` is produced except at an unaligned start or at the
/// very end of the range.
#[derive(Clone, Debug)]
pub struct Fragmenter {
    offset: u64,
    remaining: u64,
    align: u64,
    sub_align: u64,
    max_chunk: u64,
    max_head: u64,
}

impl Fragmenter {
    /// `align` and `sub_align` must be powers of two; `max_chunk` is rounded down to `align`,
    /// but never below it.
    pub fn new(offset: u64, bytes: u64, align: u64, sub_align: u64, max_chunk: u64) -> Self {
        assert!(align.is_power_of_two() && sub_align.is_power_of_two());
        let max_chunk = std::cmp::max(max_chunk.align_down(align), align);

        Fragmenter {
            offset,
            remaining: bytes,
            align,
            sub_align: std::cmp::min(sub_align, align),
            max_chunk,
            max_head: max_chunk,
        }
    }

    /// Additionally limit the unaligned head chunk to `max_head` bytes
    pub fn limit_head(mut self, max_head: u64) -> Self {
        self.max_head = std::cmp::max(std::cmp::min(self.max_head, max_head), 1);
        self
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn is_done(&self) -> bool {
        self.remaining == 0
    }

    /// Length of the next chunk (0 once done)
    pub fn next_len(&self) -> u64 {
        let bytes = self.remaining;
        let head = self.offset % self.align;
        let tail = (self.offset + bytes) % self.align;

        let mut num = bytes;
        if head != 0 {
            num = std::cmp::min(bytes, self.align - head);
            let sub_head = self.offset % self.sub_align;
            if sub_head != 0 {
                num = std::cmp::min(num, self.sub_align - sub_head);
            }
            num = std::cmp::min(num, self.max_head);
        } else if tail != 0 {
            if num > self.align {
                num -= tail;
            } else {
                let sub_tail = tail % self.sub_align;
                if sub_tail != 0 && num > sub_tail {
                    num -= sub_tail;
                }
            }
        }

        std::cmp::min(num, self.max_chunk)
    }

    /// Consume `bytes` from the front of the range; may be less than `next_len()`
    pub fn advance(&mut self, bytes: u64) {
        assert!(bytes <= self.remaining);
        self.offset += bytes;
        self.remaining -= bytes;
    }
}

impl Iterator for Fragmenter {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<(u64, u64)> {
        if self.is_done() {
            return None;
        }
        let chunk = (self.offset, self.next_len());
        self.advance(chunk.1);
        Some(chunk)
    }
}

impl Node {
    /// Zero `[offset, offset + bytes)` on behalf of `req`.  Partial units at either end are
    /// read, zeroed and written back as data; the aligned middle becomes a zero write.
    pub(super) async fn zero_pwritev(
        &self,
        req: &TrackedRequest<'_>,
        driver: &dyn NodeDriver,
        mut offset: u64,
        mut bytes: u64,
        flags: RequestFlags,
    ) -> BlockResult<()> {
        let align = self.limits().request_alignment;
        let pad = Padding::new(offset, bytes, align);
        let data_flags = flags.without(RequestFlag::ZeroWrite | RequestFlag::MayUnmap);

        let mut tail_buf = None;
        if !pad.is_empty() {
            req.mark_serialising(align);
            req.wait_for_serialising_requests().await;

            let start = offset - pad.head;
            let end = offset + bytes + pad.tail;
            let (head_buf, tail) = self
                .read_padding_units(req, driver, start, end, align, pad)
                .await?;
            tail_buf = tail;

            if let Some(mut unit) = head_buf {
                let single_unit = end - start == align;
                let zero_end = if single_unit { pad.head + bytes } else { align };
                unit[pad.head as usize..zero_end as usize].fill(0);

                self.aligned_pwritev(
                    req,
                    driver,
                    start,
                    align,
                    align,
                    (&unit[..]).into(),
                    data_flags,
                )
                .await?;
                if single_unit {
                    return Ok(());
                }

                bytes -= align - pad.head;
                offset = start + align;
            }
        }

        debug_assert!(bytes == 0 || offset.is_aligned(align));
        if bytes >= align {
            let aligned_bytes = bytes.align_down(align);
            self.aligned_pwritev(
                req,
                driver,
                offset,
                aligned_bytes,
                align,
                IoVector::new(),
                flags,
            )
            .await?;
            bytes -= aligned_bytes;
            offset += aligned_bytes;
        }

        if bytes > 0 {
            assert_eq!(bytes + pad.tail, align);
            let Some(mut unit) = tail_buf else {
                unreachable!();
            };
            unit[..bytes as usize].fill(0);
            self.aligned_pwritev(
                req,
                driver,
                offset,
                align,
                align,
                (&unit[..]).into(),
                data_flags,
            )
            .await?;
        }

        Ok(())
    }

    /// Zero an aligned range through the driver, falling back to writing zero buffers where the
    /// driver has no (working) native zero write
    pub(super) async fn do_pwrite_zeroes(
        &self,
        driver: &dyn NodeDriver,
        offset: u64,
        bytes: u64,
        flags: RequestFlags,
    ) -> BlockResult<()> {
        let limits = self.limits();
        let native = driver.capabilities().contains(DriverCap::WriteZeroes);
        if flags.contains(RequestFlag::NoFallback) && !native {
            return Err(BlockError::not_supported(format!(
                "Driver {} of node \"{}\" cannot write zeroes efficiently",
                driver.driver_name(),
                self.name()
            )));
        }

        let align = std::cmp::max(limits.pwrite_zeroes_alignment, limits.request_alignment);
        let max_zeroes = min_non_zero(limits.max_pwrite_zeroes, i64::MAX as u64);
        let max_transfer = min_non_zero(limits.max_transfer, MAX_BOUNCE_BUFFER);
        let supported_zero = driver.supported_zero_flags();
        let supported_write = driver.supported_write_flags();

        let mut need_flush = false;
        let mut zero_buf: Option<IoBuffer> = None;
        let mut fragments =
            Fragmenter::new(offset, bytes, align, 1, max_zeroes).limit_head(max_transfer);

        while !fragments.is_done() {
            let chunk_offset = fragments.offset();
            let mut num = fragments.next_len();

            let mut result = Err(BlockError::not_supported("No native zero write"));
            if native {
                result = driver
                    .write_zeroes(chunk_offset, num, flags.overlap_with(supported_zero))
                    .await;
                let unsupported = matches!(&result, Err(err) if err.is_not_supported());
                if !unsupported
                    && flags.contains(RequestFlag::Fua)
                    && !supported_zero.contains(RequestFlag::Fua)
                {
                    need_flush = true;
                }
            }

            if matches!(&result, Err(err) if err.is_not_supported())
                && !flags.contains(RequestFlag::NoFallback)
            {
                let mut write_flags = flags.without(RequestFlag::ZeroWrite);
                if flags.contains(RequestFlag::Fua) && !supported_write.contains(RequestFlag::Fua) {
                    // One flush at the end instead of one per chunk
                    write_flags.remove(RequestFlag::Fua);
                    need_flush = true;
                }

                num = std::cmp::min(num, max_transfer);
                if zero_buf.as_ref().map_or(true, |buf| (buf.len() as u64) < num) {
                    debug!(
                        "Writing zero buffers on node \"{}\" ({:#x}+{:#x})",
                        self.name(),
                        chunk_offset,
                        num
                    );
                    zero_buf = Some(IoBuffer::new(
                        num as usize,
                        limits.opt_mem_alignment,
                    )?);
                }
                let buf = match zero_buf.as_ref() {
                    Some(buf) => buf,
                    None => unreachable!(),
                };

                result = self
                    .driver_pwritev(
                        driver,
                        chunk_offset,
                        (&buf[..num as usize]).into(),
                        write_flags,
                    )
                    .await;
            }

            result?;
            fragments.advance(num);
        }

        if need_flush {
            return self.flush_for_fua().await;
        }
        Ok(())
    }

    /// Tell the driver `[offset, offset + bytes)` is no longer needed.  Advisory: a no-op unless
    /// the node was opened with `discard: unmap`, and chunks the driver does not support are
    /// skipped.
    pub async fn pdiscard(&self, offset: u64, bytes: u64) -> BlockResult<()> {
        let driver = self.check_inserted()?;
        if self.is_read_only() {
            return Err(BlockError::permission(format!(
                "Node \"{}\" is read-only",
                self.name()
            )));
        }
        self.check_request(offset, bytes, 0)?;

        if self.opts().discard != DiscardMode::Unmap
            || !driver.capabilities().contains(DriverCap::Discard)
            || bytes == 0
        {
            return Ok(());
        }

        let _in_flight = self.enter_in_flight();
        coroutine::co(self.do_pdiscard(driver.as_ref(), offset, bytes)).await
    }

    async fn do_pdiscard(&self, driver: &dyn NodeDriver, offset: u64, bytes: u64) -> BlockResult<()> {
        let limits = self.limits();
        let align = std::cmp::max(limits.pdiscard_alignment, limits.request_alignment);
        let max_pdiscard = min_non_zero(limits.max_pdiscard, i64::MAX as u64);

        let req = self.tracked_request_begin(offset, bytes, TrackedRequestType::Discard);
        req.wait_for_serialising_requests().await;

        let mut result = Ok(());
        let fragments = Fragmenter::new(
            offset,
            bytes,
            align,
            limits.request_alignment,
            max_pdiscard,
        );
        for (chunk_offset, num) in fragments {
            match driver.discard(chunk_offset, num).await {
                Ok(()) => (),
                Err(err) if err.is_not_supported() => {
                    debug!(
                        "Discard of {:#x}+{:#x} not supported on node \"{}\": {}",
                        chunk_offset,
                        num,
                        self.name(),
                        err
                    );
                }
                Err(err)
                    if err.kind() == crate::ErrorKind::InvalidArgument
                        && !(chunk_offset.is_aligned(align) && num.is_aligned(align)) =>
                {
                    debug!(
                        "Unaligned discard of {:#x}+{:#x} rejected on node \"{}\"",
                        chunk_offset,
                        num,
                        self.name()
                    );
                }
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }

        self.discard_completed(offset, bytes);
        result
    }

    fn discard_completed(&self, offset: u64, bytes: u64) {
        self.write_gen.fetch_add(1, Ordering::SeqCst);
        self.mark_dirty(offset, bytes);
    }
}
