// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Channel context: a typed view over one mapped shared-memory segment.
//
// Segment layout (offsets are carried in the header, all 64-byte aligned):
//
//   [ ChannelHeader ]
//   [ app-tx ring ]      application -> stack, u32 slot indices
//   [ stack-rx ring ]    stack -> application, u32 slot indices
//   [ ctrl-sq ring ]     application -> controller, CtrlQueueEntry records
//   [ ctrl-cq ring ]     controller -> application, CtrlQueueEntry records
//   [ pool-free ring ]   buffer free list, u32 slot indices
//   [ buffers ]          buf_count records of buf_stride bytes each
//
// The controller creates and sizes the segment; the application maps it
// via `bind` and validates the magic before touching anything else. The
// header layout must match bit-exactly on both sides.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::buf::{buf_stride, MsgBuf, Pool, MSGBUF_DATA_OFS};
use crate::ctrl::CtrlQueueEntry;
use crate::error::{Error, Result};
use crate::platform;
use crate::ring::{ring_bytes, Ring};

/// First word of every channel segment.
pub const CHANNEL_CTX_MAGIC: u32 = 0x4e53_4348;

/// Header layout revision.
pub const CHANNEL_VERSION: u32 = 1;

/// Descriptor-ring sizing requested by `attach` when the caller does not
/// say otherwise.
pub const RING_SLOTS_DEFAULT: u32 = 1024;

/// Buffer-count sizing requested by `attach` when the caller does not say
/// otherwise.
pub const BUFFER_COUNT_DEFAULT: u32 = 4096;

// ---------------------------------------------------------------------------
// Header structures
// ---------------------------------------------------------------------------

/// Buffer-region geometry, fixed at channel creation.
#[repr(C)]
pub struct DataCtx {
    buf_ofs: u64,
    buf_stride: u32,
    /// Maximum payload bytes per buffer.
    buf_mss: u32,
    buf_count: u32,
    _pad: u32,
}

/// Datapath counters, updated by the application side.
#[repr(C)]
#[derive(Default)]
pub struct ChannelStats {
    pub(crate) tx_msgs: AtomicU64,
    pub(crate) tx_bytes: AtomicU64,
    pub(crate) rx_msgs: AtomicU64,
    pub(crate) rx_bytes: AtomicU64,
    pub(crate) tx_ring_full: AtomicU64,
    pub(crate) pool_exhausted: AtomicU64,
}

/// Control-plane state shared with the controller.
#[repr(C)]
pub struct CtrlCtx {
    /// Next outgoing control-ring request id.
    req_id: AtomicU64,
    stats: ChannelStats,
}

/// Segment header. The first word is the magic; nothing else in the
/// segment may be read before it is validated.
#[repr(C)]
pub struct ChannelHeader {
    magic: u32,
    version: u32,
    size: u64,
    data_ctx: DataCtx,
    ctrl_ctx: CtrlCtx,
    app_tx_ofs: u64,
    stack_rx_ofs: u64,
    ctrl_sq_ofs: u64,
    ctrl_cq_ofs: u64,
    pool_free_ofs: u64,
}

/// Point-in-time copy of the datapath counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub tx_msgs: u64,
    pub tx_bytes: u64,
    pub rx_msgs: u64,
    pub rx_bytes: u64,
    pub tx_ring_full: u64,
    pub pool_exhausted: u64,
}

const fn align64(x: usize) -> usize {
    (x + 63) & !63
}

// ---------------------------------------------------------------------------
// ChannelCtx
// ---------------------------------------------------------------------------

/// An attached channel: one mapped segment, owned by one application
/// thread.
///
/// `ChannelCtx` is `Send` but deliberately not `Sync` — sends and receives
/// on the same channel from two threads concurrently are undefined, and
/// the missing `Sync` impl makes that unrepresentable. The control-socket
/// plane (`init`/`attach`) is thread-safe separately.
#[derive(Debug)]
pub struct ChannelCtx {
    base: NonNull<u8>,
    size: usize,
}

unsafe impl Send for ChannelCtx {}

impl ChannelCtx {
    /// Map an existing channel segment descriptor.
    ///
    /// This is the primitive `attach` builds on; callers that already hold
    /// a segment fd can bind it directly. The descriptor is closed once
    /// the mapping is established (the mapping keeps the segment alive).
    pub fn bind(fd: OwnedFd) -> Result<ChannelCtx> {
        platform::check_fd(fd.as_raw_fd())
            .map_err(|_| Error::InvalidArgument("channel descriptor is not open"))?;
        let size = platform::fd_size(fd.as_raw_fd())
            .map_err(|_| Error::InvalidArgument("cannot stat channel descriptor"))?;
        if size < mem::size_of::<ChannelHeader>() {
            return Err(Error::ProtocolViolation(format!(
                "segment of {size} bytes is smaller than the channel header"
            )));
        }

        let base = platform::map_shared(fd.as_raw_fd(), size)
            .map_err(|e| Error::ControllerUnavailable(format!("cannot map channel segment: {e}")))?;

        // From here on the mapping is owned by the context; dropping it on
        // a validation error unmaps.
        let ctx = ChannelCtx {
            base: NonNull::new(base).expect("mmap returned null"),
            size,
        };
        ctx.validate()?;
        Ok(ctx)
    }

    /// Validate the header against this mapping before any accessor runs.
    fn validate(&self) -> Result<()> {
        let hdr = self.hdr();
        if hdr.magic != CHANNEL_CTX_MAGIC {
            return Err(Error::ProtocolViolation(format!(
                "bad channel magic {:#010x}",
                hdr.magic
            )));
        }
        if hdr.version != CHANNEL_VERSION {
            return Err(Error::ProtocolViolation(format!(
                "unsupported channel version {}",
                hdr.version
            )));
        }
        if hdr.size as usize > self.size {
            return Err(Error::ProtocolViolation(
                "header claims more bytes than the mapping holds".into(),
            ));
        }

        // A ring descriptor is usable when its header lies inside the
        // mapping, its fields are self-consistent, and its full slot
        // array fits.
        unsafe fn ring_in_range<T: Copy>(base: *const u8, ofs: u64, size: usize) -> bool {
            let ofs = ofs as usize;
            if ofs.checked_add(ring_bytes::<T>(0)).map(|e| e <= size) != Some(true) {
                return false;
            }
            if !Ring::<T>::validate(base.add(ofs)) {
                return false;
            }
            let capacity = Ring::<T>::from_raw(base.add(ofs) as *mut u8).capacity();
            ofs.checked_add(ring_bytes::<T>(capacity)).map(|e| e <= size) == Some(true)
        }

        let ok = unsafe {
            let base = self.base.as_ptr();
            ring_in_range::<u32>(base, hdr.app_tx_ofs, self.size)
                && ring_in_range::<u32>(base, hdr.stack_rx_ofs, self.size)
                && ring_in_range::<CtrlQueueEntry>(base, hdr.ctrl_sq_ofs, self.size)
                && ring_in_range::<CtrlQueueEntry>(base, hdr.ctrl_cq_ofs, self.size)
                && ring_in_range::<u32>(base, hdr.pool_free_ofs, self.size)
        };
        if !ok {
            return Err(Error::ProtocolViolation("malformed ring descriptors".into()));
        }

        let d = &hdr.data_ctx;
        let buf_bytes = (d.buf_count as usize).checked_mul(d.buf_stride as usize);
        let in_range = buf_bytes
            .and_then(|b| (d.buf_ofs as usize).checked_add(b))
            .map(|end| end <= self.size)
            .unwrap_or(false);
        if !in_range
            || d.buf_count == 0
            || d.buf_mss == 0
            || (d.buf_stride as usize) < MSGBUF_DATA_OFS + d.buf_mss as usize
        {
            return Err(Error::ProtocolViolation("malformed buffer geometry".into()));
        }
        Ok(())
    }

    fn hdr(&self) -> &ChannelHeader {
        unsafe { &*(self.base.as_ptr() as *const ChannelHeader) }
    }

    /// Mapped segment size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Maximum payload per buffer.
    pub fn mss(&self) -> u32 {
        self.hdr().data_ctx.buf_mss
    }

    /// Number of buffers in the pool.
    pub fn buf_count(&self) -> u32 {
        self.hdr().data_ctx.buf_count
    }

    fn ring_u32(&self, ofs: u64) -> Ring<'_, u32> {
        unsafe { Ring::from_raw(self.base.as_ptr().add(ofs as usize)) }
    }

    fn ring_ctrl(&self, ofs: u64) -> Ring<'_, CtrlQueueEntry> {
        unsafe { Ring::from_raw(self.base.as_ptr().add(ofs as usize)) }
    }

    /// Application → stack message ring (the application produces).
    pub fn app_tx(&self) -> Ring<'_, u32> {
        self.ring_u32(self.hdr().app_tx_ofs)
    }

    /// Stack → application message ring (the application consumes).
    pub fn stack_rx(&self) -> Ring<'_, u32> {
        self.ring_u32(self.hdr().stack_rx_ofs)
    }

    /// Control submission ring (the application produces).
    pub fn ctrl_sq(&self) -> Ring<'_, CtrlQueueEntry> {
        self.ring_ctrl(self.hdr().ctrl_sq_ofs)
    }

    /// Control completion ring (the application consumes).
    pub fn ctrl_cq(&self) -> Ring<'_, CtrlQueueEntry> {
        self.ring_ctrl(self.hdr().ctrl_cq_ofs)
    }

    /// Buffer pool view.
    pub fn pool(&self) -> Pool<'_> {
        let hdr = self.hdr();
        let d = &hdr.data_ctx;
        Pool::new(
            self.ring_u32(hdr.pool_free_ofs),
            unsafe { self.base.as_ptr().add(d.buf_ofs as usize) },
            d.buf_stride as usize,
            d.buf_count,
            d.buf_mss,
            &hdr.ctrl_ctx.stats.pool_exhausted,
        )
    }

    /// Shared view of the buffer at slot `ix`.
    pub fn buf(&self, ix: u32) -> &MsgBuf {
        // Route through a pool view so the index check is shared.
        unsafe { &*self.pool().buf_ptr(ix) }
    }

    pub(crate) fn next_req_id(&self) -> u64 {
        self.hdr().ctrl_ctx.req_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn stats_ref(&self) -> &ChannelStats {
        &self.hdr().ctrl_ctx.stats
    }

    /// Copy of the datapath counters.
    pub fn stats(&self) -> StatsSnapshot {
        let s = self.stats_ref();
        StatsSnapshot {
            tx_msgs: s.tx_msgs.load(Ordering::Relaxed),
            tx_bytes: s.tx_bytes.load(Ordering::Relaxed),
            rx_msgs: s.rx_msgs.load(Ordering::Relaxed),
            rx_bytes: s.rx_bytes.load(Ordering::Relaxed),
            tx_ring_full: s.tx_ring_full.load(Ordering::Relaxed),
            pool_exhausted: s.pool_exhausted.load(Ordering::Relaxed),
        }
    }

    /// Release the local mapping. The segment itself stays under
    /// controller ownership; de-registration happens only when the
    /// process-lifetime control socket closes.
    pub fn detach(self) {}
}

impl Drop for ChannelCtx {
    fn drop(&mut self) {
        unsafe { platform::unmap(self.base.as_ptr(), self.size) };
    }
}

// ---------------------------------------------------------------------------
// Segment creation — the controller-side layout step
// ---------------------------------------------------------------------------

/// Sizing for a channel segment.
#[derive(Debug, Clone, Copy)]
pub struct ChannelConfig {
    /// Slots in each of the four descriptor rings (power of two).
    pub ring_slots: u32,
    /// Buffers in the pool (power of two; also the free-ring capacity).
    pub buffer_count: u32,
    /// Maximum payload bytes per buffer.
    pub mss: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            ring_slots: RING_SLOTS_DEFAULT,
            buffer_count: BUFFER_COUNT_DEFAULT,
            mss: 4096,
        }
    }
}

/// Create and lay out a channel segment on an anonymous memfd.
///
/// This mirrors the controller's segment initialisation bit for bit; the
/// library itself only ever maps. It exists so tests, benchmarks, and
/// co-resident mock controllers can fabricate channels and hand the fd to
/// [`ChannelCtx::bind`].
pub fn create(cfg: &ChannelConfig) -> io::Result<OwnedFd> {
    if !cfg.ring_slots.is_power_of_two() || !cfg.buffer_count.is_power_of_two() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "ring_slots and buffer_count must be powers of two",
        ));
    }
    if cfg.mss == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "mss must be non-zero"));
    }

    let stride = buf_stride(cfg.mss);
    let app_tx_ofs = align64(mem::size_of::<ChannelHeader>());
    let stack_rx_ofs = app_tx_ofs + align64(ring_bytes::<u32>(cfg.ring_slots));
    let ctrl_sq_ofs = stack_rx_ofs + align64(ring_bytes::<u32>(cfg.ring_slots));
    let ctrl_cq_ofs = ctrl_sq_ofs + align64(ring_bytes::<CtrlQueueEntry>(cfg.ring_slots));
    let pool_free_ofs = ctrl_cq_ofs + align64(ring_bytes::<CtrlQueueEntry>(cfg.ring_slots));
    let buf_ofs = pool_free_ofs + align64(ring_bytes::<u32>(cfg.buffer_count));
    let total = buf_ofs + cfg.buffer_count as usize * stride;

    let fd = platform::memfd_segment("nsaas_channel", total)?;
    let base = platform::map_shared(fd.as_raw_fd(), total)?;

    unsafe {
        let hdr = base as *mut ChannelHeader;
        hdr.write(ChannelHeader {
            magic: CHANNEL_CTX_MAGIC,
            version: CHANNEL_VERSION,
            size: total as u64,
            data_ctx: DataCtx {
                buf_ofs: buf_ofs as u64,
                buf_stride: stride as u32,
                buf_mss: cfg.mss,
                buf_count: cfg.buffer_count,
                _pad: 0,
            },
            ctrl_ctx: CtrlCtx {
                req_id: AtomicU64::new(0),
                stats: ChannelStats::default(),
            },
            app_tx_ofs: app_tx_ofs as u64,
            stack_rx_ofs: stack_rx_ofs as u64,
            ctrl_sq_ofs: ctrl_sq_ofs as u64,
            ctrl_cq_ofs: ctrl_cq_ofs as u64,
            pool_free_ofs: pool_free_ofs as u64,
        });

        Ring::<u32>::init(base.add(app_tx_ofs), cfg.ring_slots);
        Ring::<u32>::init(base.add(stack_rx_ofs), cfg.ring_slots);
        Ring::<CtrlQueueEntry>::init(base.add(ctrl_sq_ofs), cfg.ring_slots);
        Ring::<CtrlQueueEntry>::init(base.add(ctrl_cq_ofs), cfg.ring_slots);
        Ring::<u32>::init(base.add(pool_free_ofs), cfg.buffer_count);

        for ix in 0..cfg.buffer_count {
            MsgBuf::init(base.add(buf_ofs + ix as usize * stride) as *mut MsgBuf);
        }

        // Seed the free list with every buffer; the free ring capacity
        // equals the buffer count, so this cannot fail.
        let free = Ring::<u32>::from_raw(base.add(pool_free_ofs));
        let all: Vec<u32> = (0..cfg.buffer_count).collect();
        assert_eq!(free.enqueue_bulk(&all), all.len());

        platform::unmap(base, total);
    }

    Ok(fd)
}
