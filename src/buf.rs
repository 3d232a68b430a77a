// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Fixed-stride message buffers and the pool free list.
//
// Buffers live in the channel segment and are addressed by 32-bit slot
// index everywhere a reference is persisted: the segment is mapped at
// different virtual addresses in the controller and the application, so a
// stored pointer would be meaningless.
//
// Per-buffer record layout within the segment:
//
//   [ MsgBuf header ]          (magic, flags, chain links, lengths, flow)
//   [ payload, MSS bytes ]     (starts at MSGBUF_DATA_OFS from the record)
//
// A message is a chain of buffers linked through `next`: the head carries
// SYN plus the message metadata (`msg_len`, `flow`, `last`), the tail
// carries FIN, and every buffer followed by another has SG set.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::fatal;
use crate::flow::NetFlow;
use crate::ring::Ring;

/// Magic stamped into every buffer header for the lifetime of the channel.
pub const MSGBUF_MAGIC: u32 = 0x4e53_4d42;

/// Chain continuation: `next` holds the slot index of the following buffer.
pub const FLAG_SG: u16 = 1 << 0;
/// Head of a message.
pub const FLAG_SYN: u16 = 1 << 1;
/// Tail of a message.
pub const FLAG_FIN: u16 = 1 << 2;
/// Caller requests a delivery notification from the stack.
pub const FLAG_NOTIFY_DELIVERY: u16 = 1 << 3;

/// Offset of the payload within a buffer record. Fixed (one cache line)
/// rather than derived from the header size so both sides of the segment
/// agree independently of compiler padding.
pub const MSGBUF_DATA_OFS: usize = 64;

/// Buffer header. Fields other than `magic`, `flags` and `len` are only
/// meaningful on particular chain positions (see the field docs).
#[repr(C)]
pub struct MsgBuf {
    magic: u32,
    flags: u16,
    _pad: u16,
    /// Slot index of the next buffer in the chain. Valid when SG is set.
    next: u32,
    /// Slot index of the tail buffer. Valid on the head only.
    last: u32,
    /// Payload bytes currently in this buffer.
    len: u32,
    /// Total message length. Valid on the head only.
    msg_len: u32,
    /// Flow 4-tuple. Valid on the head only.
    flow: NetFlow,
}

impl MsgBuf {
    pub fn flags(&self) -> u16 {
        self.flags
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn msg_len(&self) -> u32 {
        self.msg_len
    }

    pub fn next(&self) -> u32 {
        self.next
    }

    pub fn last(&self) -> u32 {
        self.last
    }

    pub fn flow(&self) -> NetFlow {
        self.flow
    }

    /// Free payload bytes remaining behind `len`.
    pub fn tailroom(&self, mss: u32) -> u32 {
        mss - self.len
    }

    pub(crate) fn magic_ok(&self) -> bool {
        self.magic == MSGBUF_MAGIC
    }

    fn reset(&mut self) {
        self.flags = 0;
        self.next = 0;
        self.last = 0;
        self.len = 0;
        self.msg_len = 0;
        self.flow = NetFlow::default();
    }

    /// Stamp a fresh record during segment layout.
    ///
    /// # Safety
    /// `buf` must point to a writable buffer record.
    pub(crate) unsafe fn init(buf: *mut MsgBuf) {
        (*buf).magic = MSGBUF_MAGIC;
        (*buf).reset();
        (*buf)._pad = 0;
    }

    /// Claim the next `n` payload bytes, advancing `len`, and return the
    /// write cursor. The caller must have checked tailroom.
    ///
    /// # Safety
    /// `buf` must point to a valid buffer record with at least `n` bytes
    /// of tailroom.
    pub(crate) unsafe fn append(buf: *mut MsgBuf, n: u32) -> *mut u8 {
        let ofs = (*buf).len as usize;
        (*buf).len += n;
        (buf as *mut u8).add(MSGBUF_DATA_OFS + ofs)
    }

    /// Read cursor at `ofs` bytes into the payload.
    ///
    /// # Safety
    /// `buf` must point to a valid buffer record with `ofs <= len`.
    pub(crate) unsafe fn data_at(buf: *const MsgBuf, ofs: u32) -> *const u8 {
        (buf as *const u8).add(MSGBUF_DATA_OFS + ofs as usize)
    }

    pub(crate) unsafe fn or_flags(buf: *mut MsgBuf, flags: u16) {
        (*buf).flags |= flags;
    }

    pub(crate) unsafe fn clear_flags(buf: *mut MsgBuf, flags: u16) {
        (*buf).flags &= !flags;
    }

    pub(crate) unsafe fn set_next(buf: *mut MsgBuf, next: u32) {
        (*buf).next = next;
    }

    pub(crate) unsafe fn set_head_meta(buf: *mut MsgBuf, flow: NetFlow, msg_len: u32, last: u32) {
        (*buf).flow = flow;
        (*buf).msg_len = msg_len;
        (*buf).last = last;
    }
}

/// Total record bytes per buffer, cache-line aligned.
pub const fn buf_stride(mss: u32) -> usize {
    let raw = MSGBUF_DATA_OFS + mss as usize;
    (raw + 63) & !63
}

// ---------------------------------------------------------------------------
// Pool — batched alloc/free against the free-list ring
// ---------------------------------------------------------------------------

/// View over the channel's buffer region and free-list ring.
///
/// The free ring is sized equal to the buffer count, so returning buffers
/// can never fail; a full ring on free means the accounting is corrupt and
/// the process aborts.
pub struct Pool<'a> {
    free: Ring<'a, u32>,
    base: *mut u8,
    stride: usize,
    count: u32,
    mss: u32,
    alloc_failures: &'a AtomicU64,
}

impl<'a> Pool<'a> {
    pub(crate) fn new(
        free: Ring<'a, u32>,
        base: *mut u8,
        stride: usize,
        count: u32,
        mss: u32,
        alloc_failures: &'a AtomicU64,
    ) -> Pool<'a> {
        Pool {
            free,
            base,
            stride,
            count,
            mss,
            alloc_failures,
        }
    }

    /// Per-buffer maximum payload size, fixed at channel creation.
    pub fn mss(&self) -> u32 {
        self.mss
    }

    /// Number of buffers in the pool.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Buffers currently on the free list.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Pop `out.len()` slot indices from the free ring — all or nothing.
    ///
    /// Every delivered buffer has its flags, lengths and chain links reset
    /// and its magic verified. Returns `out.len()` or 0.
    pub fn alloc_bulk(&self, out: &mut [u32]) -> usize {
        let n = self.free.dequeue_bulk(out);
        if n == 0 {
            self.alloc_failures.fetch_add(1, Ordering::Relaxed);
            return 0;
        }
        for &ix in out.iter() {
            let buf = self.buf_ptr(ix);
            unsafe {
                if !(*buf).magic_ok() {
                    fatal("buffer magic mismatch on alloc");
                }
                (*buf).reset();
            }
        }
        n
    }

    /// Push slot indices back onto the free ring. Never fails.
    pub fn free_bulk(&self, ixs: &[u32]) {
        if ixs.is_empty() {
            return;
        }
        if self.free.enqueue_bulk(ixs) != ixs.len() {
            // The free ring holds as many slots as there are buffers;
            // rejection means an index was freed twice or forged.
            fatal("buffer free ring full");
        }
    }

    /// Shared view of the buffer at slot `ix`.
    pub fn buf(&self, ix: u32) -> &MsgBuf {
        unsafe { &*self.buf_ptr(ix) }
    }

    /// Payload bytes currently held by the buffer at slot `ix`.
    pub fn buf_payload(&self, ix: u32) -> &[u8] {
        let buf = self.buf_ptr(ix);
        unsafe { std::slice::from_raw_parts(MsgBuf::data_at(buf, 0), (*buf).len as usize) }
    }

    /// O(1) slot-index-to-address translation.
    pub(crate) fn buf_ptr(&self, ix: u32) -> *mut MsgBuf {
        if ix >= self.count {
            fatal("buffer slot index out of range");
        }
        unsafe { self.base.add(ix as usize * self.stride) as *mut MsgBuf }
    }
}
