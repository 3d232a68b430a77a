// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Control-ring tests. A second mapping of the same segment plays the
// controller: it drains ctrl-sq and pushes completions onto ctrl-cq, the
// same way the real controller drives the channel from its own address
// space.

use std::thread;
use std::time::Duration;

use nsaas::channel::{self, ChannelConfig};
use nsaas::ctrl::{CTRL_OP_CREATE_FLOW, CTRL_OP_LISTEN, CTRL_STATUS_OK};
use nsaas::{ChannelCtx, CtrlQueueEntry, Error, RetryPolicy};

fn make_pair() -> (ChannelCtx, ChannelCtx) {
    env_logger::builder().is_test(true).try_init().ok();
    let fd = channel::create(&ChannelConfig {
        ring_slots: 16,
        buffer_count: 16,
        mss: 1024,
    })
    .expect("create segment");
    let fd2 = fd.try_clone().expect("dup");
    let app = ChannelCtx::bind(fd).expect("bind app side");
    let controller = ChannelCtx::bind(fd2).expect("bind controller side");
    (app, controller)
}

fn fast_policy(max_tries: u32) -> RetryPolicy {
    RetryPolicy {
        max_tries,
        interval: Duration::from_millis(10),
    }
}

/// Serve exactly one control request on the controller-side mapping.
fn serve_one(controller: &ChannelCtx, respond: impl Fn(&CtrlQueueEntry) -> CtrlQueueEntry) {
    for _ in 0..500 {
        if let Some(req) = {
            let mut out = [CtrlQueueEntry::zeroed()];
            if controller.ctrl_sq().dequeue_bulk(&mut out) == 1 {
                Some(out[0])
            } else {
                None
            }
        } {
            let resp = respond(&req);
            assert_eq!(
                controller.ctrl_cq().enqueue_bulk(std::slice::from_ref(&resp)),
                1
            );
            return;
        }
        thread::sleep(Duration::from_millis(2));
    }
    panic!("no control request arrived");
}

#[test]
fn connect_allocates_flow() {
    let (app, controller) = make_pair();

    let server = thread::spawn(move || {
        serve_one(&controller, |req| {
            assert_eq!(req.opcode, CTRL_OP_CREATE_FLOW);
            let mut flow = req.flow();
            assert_eq!(flow.src_ip, 0x0a00_0001); // 10.0.0.1
            assert_eq!(flow.dst_ip, 0x0a00_0002); // 10.0.0.2
            assert_eq!(flow.dst_port, 9000);
            flow.src_port = 4242; // controller picks the source port

            let mut resp = CtrlQueueEntry::zeroed();
            resp.id = req.id;
            resp.opcode = req.opcode;
            resp.status = CTRL_STATUS_OK;
            resp.op.flow = flow;
            resp
        });
    });

    let flow = app
        .connect_with("10.0.0.1", "10.0.0.2", 9000, &fast_policy(50))
        .expect("connect");
    assert_eq!(flow.src_port, 4242);
    assert_eq!(flow.dst_port, 9000);
    server.join().unwrap();
}

#[test]
fn listen_installs_listener() {
    let (app, controller) = make_pair();

    let server = thread::spawn(move || {
        serve_one(&controller, |req| {
            assert_eq!(req.opcode, CTRL_OP_LISTEN);
            let listener = req.listener();
            assert_eq!(listener.ip, 0x0a00_0001);
            assert_eq!(listener.port, 7777);

            let mut resp = CtrlQueueEntry::zeroed();
            resp.id = req.id;
            resp.opcode = req.opcode;
            resp.status = CTRL_STATUS_OK;
            resp
        });
    });

    app.listen_with("10.0.0.1", 7777, &fast_policy(50))
        .expect("listen");
    server.join().unwrap();
}

#[test]
fn failure_status_is_reported() {
    let (app, controller) = make_pair();

    let server = thread::spawn(move || {
        serve_one(&controller, |req| {
            let mut resp = CtrlQueueEntry::zeroed();
            resp.id = req.id;
            resp.opcode = req.opcode;
            resp.status = 5;
            resp
        });
    });

    let err = app
        .listen_with("10.0.0.1", 7777, &fast_policy(50))
        .expect_err("controller rejected the listener");
    assert!(matches!(err, Error::ControllerUnavailable(_)), "unexpected error: {err}");
    server.join().unwrap();
}

#[test]
fn timeout_leaves_request_enqueued_exactly_once() {
    let (app, controller) = make_pair();

    // Nobody serves ctrl-cq: the bounded poll must give up.
    let err = app
        .connect_with("10.0.0.1", "10.0.0.2", 9000, &fast_policy(2))
        .expect_err("no controller is responding");
    assert!(matches!(err, Error::ControllerUnavailable(_)), "unexpected error: {err}");

    // Exactly one request was submitted, no partial retries.
    let mut out = [CtrlQueueEntry::zeroed()];
    assert_eq!(controller.ctrl_sq().dequeue_bulk(&mut out), 1);
    assert_eq!(out[0].opcode, CTRL_OP_CREATE_FLOW);
    assert_eq!(controller.ctrl_sq().dequeue_bulk(&mut out), 0);
}

#[test]
fn mismatched_completion_id_is_a_hard_failure() {
    let (app, controller) = make_pair();

    // A stale completion for a request this channel never issued.
    let mut stale = CtrlQueueEntry::zeroed();
    stale.id = 999;
    stale.status = CTRL_STATUS_OK;
    assert_eq!(
        controller.ctrl_cq().enqueue_bulk(std::slice::from_ref(&stale)),
        1
    );

    let err = app
        .connect_with("10.0.0.1", "10.0.0.2", 9000, &fast_policy(1))
        .expect_err("stale completion id");
    assert!(matches!(err, Error::ProtocolViolation(_)), "unexpected error: {err}");
}

#[test]
fn bad_addresses_never_reach_the_ring() {
    let (app, controller) = make_pair();

    assert!(app.connect_with("0.0.0.0", "10.0.0.2", 1, &fast_policy(1)).is_err());
    assert!(app.connect_with("255.255.255.255", "10.0.0.2", 1, &fast_policy(1)).is_err());
    assert!(app.connect_with("10.0.0.1", "0.0.0.0", 1, &fast_policy(1)).is_err());
    assert!(app.connect_with("nonsense", "10.0.0.2", 1, &fast_policy(1)).is_err());
    assert!(app.listen_with("299.0.0.1", 1, &fast_policy(1)).is_err());

    assert!(controller.ctrl_sq().is_empty());
}

#[test]
fn request_ids_are_monotonic_across_operations() {
    let (app, controller) = make_pair();

    let _ = app.connect_with("10.0.0.1", "10.0.0.2", 1, &fast_policy(0));
    let _ = app.listen_with("10.0.0.1", 7, &fast_policy(0));

    let mut out = [CtrlQueueEntry::zeroed()];
    assert_eq!(controller.ctrl_sq().dequeue_bulk(&mut out), 1);
    let first = out[0].id;
    assert_eq!(controller.ctrl_sq().dequeue_bulk(&mut out), 1);
    assert_eq!(out[0].id, first + 1);
}
