// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Process-wide application state: identity, the long-lived controller
// socket, and the socket message-id counter.
//
// The state is an explicit value (`AppState`) so embedders can thread it
// through their own plumbing; `init`/`attach` wrap one process-global
// instance for convenience.

use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, OnceLock};

use uuid::Uuid;

use crate::channel::{ChannelCtx, BUFFER_COUNT_DEFAULT, RING_SLOTS_DEFAULT};
use crate::ctrl::{
    self, ChannelInfo, CtrlSockMsg, SOCK_MSG_REQ_CHANNEL, SOCK_MSG_REQ_REGISTER,
    SOCK_MSG_RESPONSE, SOCK_STATUS_SUCCESS,
};
use crate::error::{Error, Result};

/// Registered application identity plus its controller session.
pub struct AppState {
    uuid: Uuid,
    /// Kept open for the process lifetime. The controller treats closure
    /// of this socket as de-registration and garbage-collects every
    /// resource this application holds, so it must never be dropped
    /// before exit.
    _ctrl_socket: UnixStream,
    msg_id: AtomicU32,
}

impl AppState {
    /// Generate an identity and register it with the controller over a
    /// fresh long-lived socket.
    pub fn register() -> Result<AppState> {
        let uuid = Uuid::new_v4();
        let path = ctrl::controller_path();
        let stream = UnixStream::connect(&path).map_err(|e| {
            Error::ControllerUnavailable(format!(
                "cannot connect to controller at {}: {e}",
                path.display()
            ))
        })?;

        let mut req = CtrlSockMsg::zeroed();
        req.kind = SOCK_MSG_REQ_REGISTER;
        req.msg_id = 0;
        req.app_uuid = *uuid.as_bytes();
        ctrl::sock_send(&stream, &req)?;

        let (resp, _) = ctrl::sock_recv(&stream, false)?;
        if resp.kind != SOCK_MSG_RESPONSE || resp.msg_id != req.msg_id {
            return Err(Error::ProtocolViolation(
                "mismatched registration response".into(),
            ));
        }
        if resp.status != SOCK_STATUS_SUCCESS {
            return Err(Error::ControllerUnavailable(format!(
                "registration rejected with status {}",
                resp.status
            )));
        }

        log::info!("registered application {uuid} with controller");
        Ok(AppState {
            uuid,
            _ctrl_socket: stream,
            msg_id: AtomicU32::new(1),
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn next_msg_id(&self) -> u32 {
        self.msg_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Request a channel from the controller and map the returned
    /// descriptor. Safe to call from multiple threads concurrently; each
    /// request rides its own controller connection.
    pub fn attach(&self) -> Result<ChannelCtx> {
        let channel_uuid = Uuid::new_v4();
        let mut req = CtrlSockMsg::zeroed();
        req.kind = SOCK_MSG_REQ_CHANNEL;
        req.msg_id = self.next_msg_id();
        req.app_uuid = *self.uuid.as_bytes();
        req.op.channel = ChannelInfo {
            channel_uuid: *channel_uuid.as_bytes(),
            ring_slots: RING_SLOTS_DEFAULT,
            buffer_count: BUFFER_COUNT_DEFAULT,
        };

        let (resp, fd) = ctrl::sock_request(&req, true)?;
        if resp.status != SOCK_STATUS_SUCCESS {
            return Err(Error::ControllerUnavailable(format!(
                "channel request rejected with status {}",
                resp.status
            )));
        }
        let fd = fd.ok_or_else(|| {
            Error::ProtocolViolation("channel response carried no descriptor".into())
        })?;
        ChannelCtx::bind(fd)
    }
}

fn app_state() -> &'static Mutex<Option<AppState>> {
    static STATE: OnceLock<Mutex<Option<AppState>>> = OnceLock::new();
    STATE.get_or_init(|| Mutex::new(None))
}

/// Register this process with the controller.
///
/// Idempotent: once the application identity exists, further calls are
/// no-op successes and no second registration is sent.
pub fn init() -> Result<()> {
    let mut guard = app_state().lock().unwrap();
    if guard.is_some() {
        return Ok(());
    }
    *guard = Some(AppState::register()?);
    Ok(())
}

/// Obtain a new channel from the controller using the process-global
/// registration established by [`init`].
pub fn attach() -> Result<ChannelCtx> {
    let guard = app_state().lock().unwrap();
    let state = guard
        .as_ref()
        .ok_or(Error::InvalidArgument("process not registered; call init() first"))?;
    state.attach()
}

/// UUID of the process-global registration, if [`init`] has completed.
pub fn identity() -> Option<Uuid> {
    app_state().lock().unwrap().as_ref().map(|s| s.uuid())
}
