// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Tests for segment creation, bind-time validation, and the channel
// context accessors.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use nsaas::channel::{self, ChannelConfig};
use nsaas::ChannelCtx;

fn small_cfg() -> ChannelConfig {
    // Every test starts here; surface the mapping-fallback diagnostics
    // when RUST_LOG is set.
    env_logger::builder().is_test(true).try_init().ok();
    ChannelConfig {
        ring_slots: 16,
        buffer_count: 64,
        mss: 1024,
    }
}

#[test]
fn create_then_bind_roundtrips_geometry() {
    let fd = channel::create(&small_cfg()).expect("create segment");
    let ctx = ChannelCtx::bind(fd).expect("bind segment");

    assert_eq!(ctx.mss(), 1024);
    assert_eq!(ctx.buf_count(), 64);
    assert!(ctx.size() > 0);

    // Fresh channel: free list full, message rings empty, counters zero.
    assert_eq!(ctx.pool().count(), 64);
    assert_eq!(ctx.pool().free_count(), 64);
    assert!(ctx.app_tx().is_empty());
    assert!(ctx.stack_rx().is_empty());
    assert!(ctx.ctrl_sq().is_empty());
    assert!(ctx.ctrl_cq().is_empty());
    assert_eq!(ctx.stats(), Default::default());
}

#[test]
fn create_rejects_bad_sizing() {
    let mut cfg = small_cfg();
    cfg.ring_slots = 12; // not a power of two
    assert!(channel::create(&cfg).is_err());

    let mut cfg = small_cfg();
    cfg.buffer_count = 100;
    assert!(channel::create(&cfg).is_err());

    let mut cfg = small_cfg();
    cfg.mss = 0;
    assert!(channel::create(&cfg).is_err());
}

#[test]
fn bind_rejects_corrupted_magic() {
    let fd = channel::create(&small_cfg()).expect("create segment");

    // Corrupt the first word through a scratch mapping, as a buggy or
    // hostile controller would present it.
    unsafe {
        let len = 4096;
        let mem = libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd.as_raw_fd(),
            0,
        );
        assert_ne!(mem, libc::MAP_FAILED);
        *(mem as *mut u32) ^= 0xdead_beef;
        libc::munmap(mem, len);
    }

    let err = ChannelCtx::bind(fd).err().expect("bind must fail on bad magic");
    assert!(
        matches!(err, nsaas::Error::ProtocolViolation(_)),
        "unexpected error: {err}"
    );
}

#[test]
fn bind_rejects_undersized_segment() {
    // A descriptor whose object cannot even hold the header.
    let fd = unsafe {
        let raw = libc::memfd_create(b"nsaas_test_tiny\0".as_ptr() as *const libc::c_char, 0);
        assert!(raw >= 0);
        assert_eq!(libc::ftruncate(raw, 64), 0);
        OwnedFd::from_raw_fd(raw)
    };
    assert!(ChannelCtx::bind(fd).is_err());
}

#[test]
fn bind_consumes_descriptor_but_mapping_survives() {
    let fd = channel::create(&small_cfg()).expect("create segment");
    let ctx = ChannelCtx::bind(fd).expect("bind segment");

    // The fd is closed after mmap; the mapping must still be readable.
    assert_eq!(ctx.pool().free_count(), 64);
    ctx.detach();
}

#[test]
fn two_mappings_share_one_segment() {
    // The controller and the application each map the same fd; writes on
    // one side must be visible on the other.
    let fd = channel::create(&small_cfg()).expect("create segment");
    let fd2 = fd.try_clone().expect("dup");

    let app = ChannelCtx::bind(fd).expect("bind app side");
    let stack = ChannelCtx::bind(fd2).expect("bind stack side");

    let mut chain = [0u32; 1];
    assert_eq!(app.pool().alloc_bulk(&mut chain), 1);
    assert_eq!(stack.pool().free_count(), 63);

    app.pool().free_bulk(&chain);
    assert_eq!(stack.pool().free_count(), 64);
}
