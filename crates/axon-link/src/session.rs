//! Transport sessions and the sub-session id pool
//!
//! A [`Session`] wraps one transport with per-call sequence correlation:
//! each blocking call stamps a fresh sequence id, sends, and receives
//! until the response with that id arrives or the deadline passes.
//! Responses carrying a stale sequence id (a late reply to a call that
//! already timed out) go to the session's out-of-band sink when one is
//! installed, and are otherwise discarded with a warning.

use crate::transport::{ConnectionStatus, Transport};
use axon_core::{Body, CapabilityLevel, DeviceId, Message, ServiceRole, Status};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Sub-session ids available per device.
pub const SUB_SESSION_POOL_SIZE: u16 = 96;

/// Fixed-size pool of sub-session ids for one device.
///
/// Ids are recycled on release; acquisition fails once all are in use.
#[derive(Debug)]
pub struct SessionIdPool {
    free: Vec<u16>,
}

impl SessionIdPool {
    pub fn new() -> Self {
        // Popping from the back hands out low ids first.
        Self {
            free: (0..SUB_SESSION_POOL_SIZE).rev().collect(),
        }
    }

    pub fn acquire(&mut self) -> Option<u16> {
        self.free.pop()
    }

    pub fn release(&mut self, id: u16) {
        debug_assert!(!self.free.contains(&id));
        self.free.push(id);
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}

impl Default for SessionIdPool {
    fn default() -> Self {
        Self::new()
    }
}

/// One live session to a device daemon.
pub struct Session {
    device: DeviceId,
    role: ServiceRole,
    sub_id: u16,
    transport: Box<dyn Transport>,
    next_seq: u64,
    capability: Option<CapabilityLevel>,
    sink: Option<Box<dyn Fn(&Message) + Send + Sync>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("device", &self.device)
            .field("role", &self.role)
            .field("sub_id", &self.sub_id)
            .field("capability", &self.capability)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(
        device: DeviceId,
        role: ServiceRole,
        sub_id: u16,
        transport: Box<dyn Transport>,
    ) -> Self {
        Self {
            device,
            role,
            sub_id,
            transport,
            next_seq: 1,
            capability: None,
            sink: None,
        }
    }

    /// Install the handler for responses that match no in-flight call.
    pub fn set_sink(&mut self, sink: Box<dyn Fn(&Message) + Send + Sync>) {
        self.sink = Some(sink);
    }

    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn role(&self) -> ServiceRole {
        self.role
    }

    pub fn sub_id(&self) -> u16 {
        self.sub_id
    }

    pub fn status(&self) -> ConnectionStatus {
        self.transport.status()
    }

    /// Capability level negotiated on this session, if any yet.
    pub fn capability(&self) -> Option<CapabilityLevel> {
        self.capability
    }

    pub fn set_capability(&mut self, level: CapabilityLevel) {
        self.capability = Some(level);
    }

    /// One blocking request/response round trip.
    ///
    /// Returns the peer's response on success. A response with a
    /// non-zero code is mapped to a [`Status`] via its structured error
    /// info before the caller sees it.
    pub fn call(&mut self, body: Body, timeout: Duration) -> Result<Message, Status> {
        let rsp = self.call_raw(body, timeout)?;
        if rsp.is_success() {
            return Ok(rsp);
        }
        match &rsp.error {
            Some(info) => {
                if !info.log.is_empty() {
                    warn!(device = %self.device, log = %info.log, "device error log");
                }
                Err(Status::from_peer_code(&info.code, &info.message))
            }
            None => Err(Status::Internal(format!(
                "device {} response code {} without error info",
                self.device, rsp.response_code
            ))),
        }
    }

    /// Like [`Session::call`] but hands back failed responses unmapped.
    /// Package-check flows inspect the response code themselves.
    pub fn call_raw(&mut self, body: Body, timeout: Duration) -> Result<Message, Status> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let req = Message::request(seq, self.device.as_u32(), body);
        debug!(device = %self.device, role = ?self.role, seq, kind = ?req.kind(), "sending request");
        self.transport.send(&req)?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(Status::Timeout)?;
            let msg = self.transport.recv_timeout(remaining)?;
            if msg.seq == seq {
                debug!(device = %self.device, seq, kind = ?msg.kind(), "matched response");
                return Ok(msg);
            }
            match &self.sink {
                Some(sink) => sink(&msg),
                None => warn!(
                    device = %self.device,
                    expected = seq,
                    got = msg.seq,
                    kind = ?msg.kind(),
                    "discarding stale response"
                ),
            }
        }
    }

    /// Push a package file over this session's side channel.
    pub fn send_file(&mut self, local: &Path, device_subdir: &str) -> Result<(), Status> {
        self.transport.send_file(local, device_subdir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackEndpoint;

    #[test]
    fn test_id_pool_exhaustion_and_recycle() {
        let mut pool = SessionIdPool::new();
        let mut held = Vec::new();
        for _ in 0..SUB_SESSION_POOL_SIZE {
            held.push(pool.acquire().unwrap());
        }
        assert!(pool.acquire().is_none());
        pool.release(held.pop().unwrap());
        assert_eq!(pool.available(), 1);
        assert!(pool.acquire().is_some());
    }

    #[test]
    fn test_call_matches_by_seq() {
        let (host, mut dev) = LoopbackEndpoint::pair();
        let handle = std::thread::spawn(move || {
            let req = dev.recv_timeout(Duration::from_secs(1)).unwrap();
            // A stale reply first, then the real one.
            let mut stale = req.reply(Body::CapabilityRsp { level: 1 });
            stale.seq = req.seq + 100;
            dev.send(&stale).unwrap();
            dev.send(&req.reply(Body::CapabilityRsp { level: 7 })).unwrap();
        });
        let mut session = Session::new(DeviceId(0), ServiceRole::Control, 0, Box::new(host));
        let rsp = session
            .call(Body::GetCapability, Duration::from_secs(1))
            .unwrap();
        assert_eq!(rsp.body, Body::CapabilityRsp { level: 7 });
        handle.join().unwrap();
    }

    #[test]
    fn test_call_maps_peer_error() {
        let (host, mut dev) = LoopbackEndpoint::pair();
        let handle = std::thread::spawn(move || {
            let req = dev.recv_timeout(Duration::from_secs(1)).unwrap();
            dev.send(&req.reply_error(Body::OpenSubProcessRsp { pid: 0 }, "E30003", "limit"))
                .unwrap();
        });
        let mut session = Session::new(DeviceId(0), ServiceRole::Control, 0, Box::new(host));
        let err = session
            .call(Body::GetCapability, Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, Status::ResourceLimitExceeded));
        handle.join().unwrap();
    }

    #[test]
    fn test_stale_response_routed_to_sink() {
        use std::sync::atomic::{AtomicU64, Ordering};
        use std::sync::Arc;
        let (host, mut dev) = LoopbackEndpoint::pair();
        let handle = std::thread::spawn(move || {
            let req = dev.recv_timeout(Duration::from_secs(1)).unwrap();
            let mut stale = req.reply(Body::CapabilityRsp { level: 1 });
            stale.seq = 9999;
            dev.send(&stale).unwrap();
            dev.send(&req.reply(Body::CapabilityRsp { level: 7 })).unwrap();
        });
        let mut session = Session::new(DeviceId(0), ServiceRole::Control, 0, Box::new(host));
        let seen = Arc::new(AtomicU64::new(0));
        let seen2 = Arc::clone(&seen);
        session.set_sink(Box::new(move |msg| {
            seen2.store(msg.seq, Ordering::SeqCst);
        }));
        session
            .call(Body::GetCapability, Duration::from_secs(1))
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 9999);
        handle.join().unwrap();
    }

    #[test]
    fn test_session_is_debuggable() {
        // unwrap/unwrap_err on registry results needs this to hold.
        let (host, _dev) = LoopbackEndpoint::pair();
        let session = Session::new(DeviceId(4), ServiceRole::Control, 7, Box::new(host));
        let rendered = format!("{session:?}");
        assert!(rendered.contains("sub_id: 7"));
    }

    #[test]
    fn test_call_times_out_without_response() {
        let (host, _dev) = LoopbackEndpoint::pair();
        let mut session = Session::new(DeviceId(0), ServiceRole::Control, 0, Box::new(host));
        let err = session
            .call(Body::GetCapability, Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, Status::Timeout));
    }
}
