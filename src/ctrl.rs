// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Control-plane client.
//
// Two transports:
//
//  * The AF_UNIX controller socket carries registration and channel
//    requests as fixed-size records; a successful channel response carries
//    exactly one file descriptor in SCM_RIGHTS ancillary data. Each
//    request (other than registration) opens a fresh connection, which
//    makes concurrent requests from multiple threads safe without locks.
//
//  * The in-channel control rings carry flow-create and listen requests.
//    A request is enqueued once on ctrl-sq; the completion is polled from
//    ctrl-cq under a bounded retry budget. Responses correlate by id; a
//    mismatched id is a hard failure.

use std::io::{IoSlice, IoSliceMut};
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use nix::sys::socket::{recvmsg, sendmsg, ControlMessageOwned, MsgFlags};

use crate::channel::ChannelCtx;
use crate::error::{Error, Result};
use crate::flow::{parse_unicast, NetFlow};

/// Well-known controller socket path. Overridable at run time through the
/// `NSAAS_CTRL_SOCKET` environment variable.
pub const CONTROLLER_SOCKET_DEFAULT: &str = "/var/run/nsaas/nsaas_ctrl.sock";

pub(crate) fn controller_path() -> PathBuf {
    std::env::var_os("NSAAS_CTRL_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(CONTROLLER_SOCKET_DEFAULT))
}

// ---------------------------------------------------------------------------
// Socket wire format
// ---------------------------------------------------------------------------

pub const SOCK_MSG_REQ_REGISTER: u32 = 1;
pub const SOCK_MSG_REQ_CHANNEL: u32 = 2;
pub const SOCK_MSG_RESPONSE: u32 = 3;

pub const SOCK_STATUS_SUCCESS: i32 = 0;

/// Channel sizing carried in an attach request.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ChannelInfo {
    pub channel_uuid: [u8; 16],
    pub ring_slots: u32,
    pub buffer_count: u32,
}

/// Listener endpoint (host byte order).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ListenerInfo {
    pub ip: u32,
    pub port: u16,
    pub _pad: u16,
}

/// Request/response operand on the controller socket.
#[repr(C)]
#[derive(Clone, Copy)]
pub union SockOperand {
    pub channel: ChannelInfo,
    pub flow: NetFlow,
    pub listener: ListenerInfo,
}

/// Fixed-size record exchanged on the controller socket. Requests and
/// responses share the layout; responses have `kind == SOCK_MSG_RESPONSE`
/// and echo the request's `msg_id`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CtrlSockMsg {
    pub kind: u32,
    pub msg_id: u32,
    pub app_uuid: [u8; 16],
    pub status: i32,
    pub _pad: u32,
    pub op: SockOperand,
}

impl CtrlSockMsg {
    pub fn zeroed() -> CtrlSockMsg {
        unsafe { mem::zeroed() }
    }
}

fn record_bytes<T: Copy>(v: &T) -> &[u8] {
    unsafe { std::slice::from_raw_parts(v as *const T as *const u8, mem::size_of::<T>()) }
}

// ---------------------------------------------------------------------------
// Socket transport
// ---------------------------------------------------------------------------

/// Send one fixed-size record on `stream`. Partial writes are failures.
pub(crate) fn sock_send(stream: &UnixStream, msg: &CtrlSockMsg) -> Result<()> {
    let iov = [IoSlice::new(record_bytes(msg))];
    let n = sendmsg::<()>(stream.as_raw_fd(), &iov, &[], MsgFlags::empty(), None)
        .map_err(|e| Error::ControllerUnavailable(format!("sendmsg to controller failed: {e}")))?;
    if n != mem::size_of::<CtrlSockMsg>() {
        return Err(Error::ControllerUnavailable(format!(
            "short write to controller ({n} bytes)"
        )));
    }
    Ok(())
}

/// Receive one fixed-size record, collecting at most one SCM_RIGHTS fd
/// when `want_fd` is set. Partial reads are failures.
pub(crate) fn sock_recv(stream: &UnixStream, want_fd: bool) -> Result<(CtrlSockMsg, Option<OwnedFd>)> {
    let mut resp = CtrlSockMsg::zeroed();
    let resp_bytes = unsafe {
        std::slice::from_raw_parts_mut(
            &mut resp as *mut CtrlSockMsg as *mut u8,
            mem::size_of::<CtrlSockMsg>(),
        )
    };
    let mut iov = [IoSliceMut::new(resp_bytes)];
    let mut cmsg_buf = nix::cmsg_space!([std::os::fd::RawFd; 1]);
    let cmsg = if want_fd { Some(cmsg_buf.as_mut_slice()) } else { None };

    let fd = {
        let msg = recvmsg::<()>(stream.as_raw_fd(), &mut iov, cmsg, MsgFlags::empty())
            .map_err(|e| Error::ControllerUnavailable(format!("recvmsg from controller failed: {e}")))?;
        if msg.bytes != mem::size_of::<CtrlSockMsg>() {
            return Err(Error::ControllerUnavailable(format!(
                "short read from controller ({} bytes)",
                msg.bytes
            )));
        }
        let mut fd = None;
        if want_fd {
            let cmsgs = msg.cmsgs().map_err(|e| {
                Error::ControllerUnavailable(format!("bad ancillary data from controller: {e}"))
            })?;
            for c in cmsgs {
                if let ControlMessageOwned::ScmRights(fds) = c {
                    // The descriptor was installed in this process by the
                    // kernel; we are its sole owner.
                    fd = fds.into_iter().next().map(|raw| unsafe { OwnedFd::from_raw_fd(raw) });
                }
            }
        }
        fd
    };

    Ok((resp, fd))
}

/// Issue a request over a fresh controller connection and wait for the
/// response. A new connection per request keeps concurrent callers safe
/// without locks; registration alone uses the long-lived socket instead.
pub(crate) fn sock_request(req: &CtrlSockMsg, want_fd: bool) -> Result<(CtrlSockMsg, Option<OwnedFd>)> {
    let path = controller_path();
    let stream = UnixStream::connect(&path).map_err(|e| {
        Error::ControllerUnavailable(format!("cannot connect to controller at {}: {e}", path.display()))
    })?;
    sock_send(&stream, req)?;
    let (resp, fd) = sock_recv(&stream, want_fd)?;
    if resp.kind != SOCK_MSG_RESPONSE || resp.msg_id != req.msg_id {
        return Err(Error::ProtocolViolation(format!(
            "controller response kind {} / id {} does not match request id {}",
            resp.kind, resp.msg_id, req.msg_id
        )));
    }
    Ok((resp, fd))
}

// ---------------------------------------------------------------------------
// In-channel control queue
// ---------------------------------------------------------------------------

pub const CTRL_OP_CREATE_FLOW: u32 = 1;
pub const CTRL_OP_LISTEN: u32 = 2;

pub const CTRL_STATUS_OK: u32 = 0;

/// Operand of a control-ring request or response.
#[repr(C)]
#[derive(Clone, Copy)]
pub union CtrlOperand {
    pub flow: NetFlow,
    pub listener: ListenerInfo,
}

/// Fixed-size record carried on ctrl-sq and ctrl-cq. Requests and
/// responses share the format; correlation is by `id`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CtrlQueueEntry {
    pub id: u64,
    pub opcode: u32,
    pub status: u32,
    pub op: CtrlOperand,
    pub _pad: u32,
}

impl CtrlQueueEntry {
    pub fn zeroed() -> CtrlQueueEntry {
        unsafe { mem::zeroed() }
    }

    pub fn create_flow(id: u64, src_ip: u32, dst_ip: u32, dst_port: u16) -> CtrlQueueEntry {
        let mut e = CtrlQueueEntry::zeroed();
        e.id = id;
        e.opcode = CTRL_OP_CREATE_FLOW;
        e.op.flow = NetFlow {
            src_ip,
            dst_ip,
            src_port: 0,
            dst_port,
        };
        e
    }

    pub fn listen(id: u64, ip: u32, port: u16) -> CtrlQueueEntry {
        let mut e = CtrlQueueEntry::zeroed();
        e.id = id;
        e.opcode = CTRL_OP_LISTEN;
        e.op.listener = ListenerInfo { ip, port, _pad: 0 };
        e
    }

    /// Flow operand view (valid for flow-create entries).
    pub fn flow(&self) -> NetFlow {
        unsafe { self.op.flow }
    }

    /// Listener operand view (valid for listen entries).
    pub fn listener(&self) -> ListenerInfo {
        unsafe { self.op.listener }
    }
}

/// Bounded polling cadence for control-ring completions.
///
/// The defaults match the reference behaviour (10 tries, one second
/// apart). Event loops that cannot sleep should drive
/// [`ChannelCtx::ctrl_submit`] / [`ChannelCtx::ctrl_poll`] directly.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_tries: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_tries: 10,
            interval: Duration::from_secs(1),
        }
    }
}

impl ChannelCtx {
    /// Enqueue one control request on ctrl-sq.
    pub fn ctrl_submit(&self, entry: &CtrlQueueEntry) -> Result<()> {
        if self.ctrl_sq().enqueue_bulk(std::slice::from_ref(entry)) != 1 {
            log::error!("control submission ring full");
            return Err(Error::ResourceExhausted("control submission ring full"));
        }
        Ok(())
    }

    /// Dequeue one control completion from ctrl-cq, if any. Never blocks.
    pub fn ctrl_poll(&self) -> Option<CtrlQueueEntry> {
        let mut out = [CtrlQueueEntry::zeroed()];
        if self.ctrl_cq().dequeue_bulk(&mut out) == 1 {
            Some(out[0])
        } else {
            None
        }
    }

    /// Submit `req` once and poll for its completion under `policy`.
    fn ctrl_transact(&self, req: CtrlQueueEntry, policy: &RetryPolicy) -> Result<CtrlQueueEntry> {
        self.ctrl_submit(&req)?;

        let mut tries = policy.max_tries;
        loop {
            if let Some(resp) = self.ctrl_poll() {
                if resp.id != req.id {
                    log::error!("control response id {} does not match request {}", resp.id, req.id);
                    return Err(Error::ProtocolViolation(format!(
                        "control response id {} for request {}",
                        resp.id, req.id
                    )));
                }
                if resp.status != CTRL_STATUS_OK {
                    return Err(Error::ControllerUnavailable(format!(
                        "control request {} failed with status {}",
                        req.id, resp.status
                    )));
                }
                return Ok(resp);
            }
            if tries == 0 {
                log::error!("control request {} timed out", req.id);
                return Err(Error::ControllerUnavailable(
                    "timed out waiting for control-ring completion".into(),
                ));
            }
            tries -= 1;
            thread::sleep(policy.interval);
        }
    }

    /// Allocate a flow 4-tuple for traffic from `src_ip` to
    /// `dst_ip:dst_port`. The controller picks the source port.
    pub fn connect(&self, src_ip: &str, dst_ip: &str, dst_port: u16) -> Result<NetFlow> {
        self.connect_with(src_ip, dst_ip, dst_port, &RetryPolicy::default())
    }

    /// [`connect`](Self::connect) with an explicit polling cadence.
    pub fn connect_with(
        &self,
        src_ip: &str,
        dst_ip: &str,
        dst_port: u16,
        policy: &RetryPolicy,
    ) -> Result<NetFlow> {
        let src = parse_unicast(src_ip)?;
        let dst = parse_unicast(dst_ip)?;
        let req = CtrlQueueEntry::create_flow(self.next_req_id(), src, dst, dst_port);
        let resp = self.ctrl_transact(req, policy)?;
        Ok(resp.flow())
    }

    /// Install a listener on `local_ip:local_port`.
    pub fn listen(&self, local_ip: &str, local_port: u16) -> Result<()> {
        self.listen_with(local_ip, local_port, &RetryPolicy::default())
    }

    /// [`listen`](Self::listen) with an explicit polling cadence.
    pub fn listen_with(&self, local_ip: &str, local_port: u16, policy: &RetryPolicy) -> Result<()> {
        let ip = parse_unicast(local_ip)?;
        let req = CtrlQueueEntry::listen(self.next_req_id(), ip, local_port);
        self.ctrl_transact(req, policy)?;
        Ok(())
    }
}
