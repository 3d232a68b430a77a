// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Message segmentation and reassembly — the channel datapath.
//
// Outgoing messages are fragmented into a chain of pool buffers linked by
// slot index; only the head index travels on app-tx, which keeps the ring
// cheap regardless of message size, and the stack follows SG/next from
// there. Incoming chains are drained into the caller's scatter-gather
// vector and every buffer is released back to the pool on every exit path,
// in batches of 16.
//
// Nothing here blocks: a full transmit ring and an empty receive ring are
// reported to the caller, who owns the retry policy.

use std::cmp;
use std::ptr;
use std::sync::atomic::Ordering;

use crate::buf::{MsgBuf, Pool, FLAG_FIN, FLAG_NOTIFY_DELIVERY, FLAG_SG, FLAG_SYN};
use crate::channel::ChannelCtx;
use crate::error::{fatal, Error, Result};
use crate::flow::NetFlow;

/// Maximum payload of a single message.
pub const MSG_MAX_LEN: usize = 64 * 1024;

/// Buffers staged per free-bulk call during receive.
const FREE_BATCH: usize = 16;

/// An outgoing message: a destination flow, optional flags (only
/// [`FLAG_NOTIFY_DELIVERY`] is recognised) and a scatter-gather vector.
///
/// `msg_size` must equal the sum of the segment lengths; the mismatch is
/// rejected up front, and a disagreement discovered after copying would
/// mean pool corruption and aborts.
#[derive(Debug, Clone, Copy)]
pub struct SendMsg<'a> {
    pub flow: NetFlow,
    pub flags: u16,
    pub msg_size: usize,
    pub segments: &'a [&'a [u8]],
}

impl<'a> SendMsg<'a> {
    /// Build a header over `segments` with `msg_size` derived from them.
    pub fn new(flow: NetFlow, segments: &'a [&'a [u8]]) -> SendMsg<'a> {
        SendMsg {
            flow,
            flags: 0,
            msg_size: segments.iter().map(|s| s.len()).sum(),
            segments,
        }
    }
}

/// Metadata of a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvInfo {
    pub msg_size: usize,
    pub flow: NetFlow,
}

// ---------------------------------------------------------------------------
// Batched release staging
// ---------------------------------------------------------------------------

/// Collects drained slot indices and returns them to the pool in batches.
/// Dropping the stage flushes whatever is pending, so no exit path from
/// recvmsg can leak buffers.
struct ReleaseStage<'p, 'a> {
    pool: &'p Pool<'a>,
    ixs: [u32; FREE_BATCH],
    n: usize,
}

impl<'p, 'a> ReleaseStage<'p, 'a> {
    fn new(pool: &'p Pool<'a>) -> ReleaseStage<'p, 'a> {
        ReleaseStage {
            pool,
            ixs: [0; FREE_BATCH],
            n: 0,
        }
    }

    fn push(&mut self, ix: u32) {
        self.ixs[self.n] = ix;
        self.n += 1;
        if self.n == FREE_BATCH {
            self.flush();
        }
    }

    fn flush(&mut self) {
        if self.n > 0 {
            self.pool.free_bulk(&self.ixs[..self.n]);
            self.n = 0;
        }
    }
}

impl Drop for ReleaseStage<'_, '_> {
    fn drop(&mut self) {
        self.flush();
    }
}

// ---------------------------------------------------------------------------
// Datapath operations
// ---------------------------------------------------------------------------

impl ChannelCtx {
    /// Send a contiguous payload to `flow`.
    pub fn send(&self, flow: NetFlow, data: &[u8]) -> Result<()> {
        let segments: [&[u8]; 1] = [data];
        self.sendmsg(&SendMsg {
            flow,
            flags: 0,
            msg_size: data.len(),
            segments: &segments,
        })
    }

    /// Fragment `msg` into a buffer chain and enqueue it for transmission.
    ///
    /// On any failure nothing is enqueued and every allocated buffer is
    /// back on the free list.
    pub fn sendmsg(&self, msg: &SendMsg<'_>) -> Result<()> {
        if msg.msg_size == 0 {
            return Err(Error::InvalidArgument("empty message"));
        }
        if msg.msg_size > MSG_MAX_LEN {
            return Err(Error::InvalidArgument("message exceeds MSG_MAX_LEN"));
        }
        let total_len: usize = msg.segments.iter().map(|s| s.len()).sum();
        if total_len != msg.msg_size {
            return Err(Error::InvalidArgument("msg_size does not match segment lengths"));
        }

        let pool = self.pool();
        let mss = pool.mss();
        let needed = msg.msg_size.div_ceil(mss as usize);
        let mut chain = vec![0u32; needed];
        if pool.alloc_bulk(&mut chain) == 0 {
            return Err(Error::ResourceExhausted("buffer pool exhausted"));
        }

        // Two cursors: input over the current segment, output into the
        // current buffer. Spill to the next allocated buffer whenever the
        // tailroom runs out with input bytes remaining.
        let mut cur = 0usize;
        let mut copied = 0usize;
        for seg in msg.segments {
            let mut seg_ofs = 0usize;
            while seg_ofs < seg.len() {
                let buf = pool.buf_ptr(chain[cur]);
                unsafe {
                    if !(*buf).magic_ok() {
                        fatal("buffer magic mismatch in sendmsg");
                    }
                    let n = cmp::min(seg.len() - seg_ofs, (*buf).tailroom(mss) as usize);
                    let dst = MsgBuf::append(buf, n as u32);
                    ptr::copy_nonoverlapping(seg.as_ptr().add(seg_ofs), dst, n);
                    MsgBuf::or_flags(buf, FLAG_SG);
                    seg_ofs += n;
                    copied += n;
                    if (*buf).tailroom(mss) == 0 && seg_ofs < seg.len() {
                        cur += 1;
                        if cur >= needed {
                            fatal("buffer chain shorter than message");
                        }
                        MsgBuf::set_next(buf, chain[cur]);
                    }
                }
            }
        }
        if copied != msg.msg_size {
            fatal("copied bytes do not match message size");
        }

        let tail = pool.buf_ptr(chain[needed - 1]);
        unsafe {
            MsgBuf::or_flags(tail, FLAG_FIN);
            MsgBuf::clear_flags(tail, FLAG_SG);
        }
        let head = pool.buf_ptr(chain[0]);
        unsafe {
            MsgBuf::or_flags(head, FLAG_SYN | (msg.flags & FLAG_NOTIFY_DELIVERY));
            MsgBuf::set_head_meta(head, msg.flow, msg.msg_size as u32, chain[needed - 1]);
        }

        // Only the head slot travels on the ring. Once this succeeds the
        // whole chain belongs to the stack; on rejection it is still ours
        // and goes back to the pool.
        if self.app_tx().enqueue_bulk(&chain[..1]) != 1 {
            pool.free_bulk(&chain);
            self.stats_ref().tx_ring_full.fetch_add(1, Ordering::Relaxed);
            return Err(Error::ResourceExhausted("transmit ring full"));
        }

        let stats = self.stats_ref();
        stats.tx_msgs.fetch_add(1, Ordering::Relaxed);
        stats.tx_bytes.fetch_add(msg.msg_size as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Send a batch of messages; stops at the first failure and returns
    /// the number actually enqueued.
    pub fn sendmmsg(&self, msgs: &[SendMsg<'_>]) -> usize {
        let mut sent = 0;
        for msg in msgs {
            if let Err(e) = self.sendmsg(msg) {
                log::debug!("sendmmsg stopped after {sent} messages: {e}");
                break;
            }
            sent += 1;
        }
        sent
    }

    /// Receive one message into a contiguous buffer.
    pub fn recv(&self, data: &mut [u8]) -> Result<Option<RecvInfo>> {
        let mut segments = [data];
        self.recvmsg(&mut segments)
    }

    /// Receive one message into a scatter-gather vector.
    ///
    /// Returns `Ok(None)` when no message is pending; never blocks. If the
    /// vector is smaller than the message, the whole incoming chain is
    /// released and `Error::Truncated` is returned. Every buffer dequeued
    /// here goes back to the pool on every exit path.
    pub fn recvmsg(&self, segments: &mut [&mut [u8]]) -> Result<Option<RecvInfo>> {
        let pool = self.pool();

        let mut head = [0u32];
        if self.stack_rx().dequeue_bulk(&mut head) != 1 {
            return Ok(None);
        }
        let mut cur_ix = head[0];
        let mut buf = pool.buf_ptr(cur_ix);
        unsafe {
            if !(*buf).magic_ok() {
                fatal("buffer magic mismatch in recvmsg");
            }
        }
        let flow = unsafe { (*buf).flow() };

        let mut stage = ReleaseStage::new(&pool);
        let mut buf_ofs = 0u32;
        let mut iov_ix = 0usize;
        let mut seg_ofs = 0usize;
        let mut total = 0usize;

        loop {
            let buf_len = unsafe { (*buf).len() };
            if buf_len <= buf_ofs {
                break; // chain drained
            }

            if iov_ix >= segments.len() {
                // The caller's vector is full but the chain still has
                // data: release everything that remains and report the
                // truncation.
                loop {
                    stage.push(cur_ix);
                    if unsafe { !(*buf).has_flag(FLAG_SG) } {
                        break;
                    }
                    cur_ix = unsafe { (*buf).next() };
                    buf = pool.buf_ptr(cur_ix);
                    unsafe {
                        if !(*buf).magic_ok() {
                            fatal("buffer magic mismatch in recvmsg");
                        }
                    }
                }
                stage.flush();
                return Err(Error::Truncated);
            }

            let seg_len = segments[iov_ix].len();
            if seg_len == 0 {
                iov_ix += 1;
                continue;
            }

            let n = cmp::min(seg_len - seg_ofs, (buf_len - buf_ofs) as usize);
            unsafe {
                let src = MsgBuf::data_at(buf, buf_ofs);
                ptr::copy_nonoverlapping(src, segments[iov_ix].as_mut_ptr().add(seg_ofs), n);
            }
            buf_ofs += n as u32;
            seg_ofs += n;
            total += n;

            if buf_ofs == buf_len {
                stage.push(cur_ix);
                // SG is the authoritative advance signal; FIN is
                // informational only.
                if unsafe { (*buf).has_flag(FLAG_SG) } {
                    cur_ix = unsafe { (*buf).next() };
                    buf = pool.buf_ptr(cur_ix);
                    unsafe {
                        if !(*buf).magic_ok() {
                            fatal("buffer magic mismatch in recvmsg");
                        }
                    }
                    buf_ofs = 0;
                }
            }

            if seg_ofs == seg_len {
                iov_ix += 1;
                seg_ofs = 0;
            }
        }

        stage.flush();
        let stats = self.stats_ref();
        stats.rx_msgs.fetch_add(1, Ordering::Relaxed);
        stats.rx_bytes.fetch_add(total as u64, Ordering::Relaxed);
        Ok(Some(RecvInfo {
            msg_size: total,
            flow,
        }))
    }
}
