//! In-process loopback transport
//!
//! A pair of connected endpoints over std channels. Tests hand the
//! device-side endpoint to a responder thread that plays the device
//! daemon; the host side goes into the session registry through
//! [`LoopbackFactory`]. File pushes are recorded instead of written
//! anywhere, so tests can assert how many transfers happened.

use crate::transport::{ConnectionStatus, Transport, TransportFactory};
use axon_core::{DeviceId, Message, ServiceRole, Status};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One side of an in-process transport pair.
pub struct LoopbackEndpoint {
    tx: Sender<Message>,
    rx: Receiver<Message>,
    closed: Arc<AtomicBool>,
    files: Arc<Mutex<Vec<(PathBuf, String)>>>,
}

impl LoopbackEndpoint {
    /// Create a connected pair of endpoints.
    pub fn pair() -> (LoopbackEndpoint, LoopbackEndpoint) {
        let (a_tx, b_rx) = mpsc::channel();
        let (b_tx, a_rx) = mpsc::channel();
        let closed = Arc::new(AtomicBool::new(false));
        let files = Arc::new(Mutex::new(Vec::new()));
        let a = LoopbackEndpoint {
            tx: a_tx,
            rx: a_rx,
            closed: Arc::clone(&closed),
            files: Arc::clone(&files),
        };
        let b = LoopbackEndpoint {
            tx: b_tx,
            rx: b_rx,
            closed,
            files,
        };
        (a, b)
    }

    /// Mark the pair as closed. Both sides observe it.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Files pushed over this pair so far, as (host path, device subdir).
    pub fn sent_files(&self) -> Vec<(PathBuf, String)> {
        self.files.lock().unwrap().clone()
    }

    /// Shared handle to the pushed-file record. Both ends see the same
    /// list, so a harness can keep watching after the endpoint moves
    /// into a responder thread.
    pub fn files_handle(&self) -> Arc<Mutex<Vec<(PathBuf, String)>>> {
        Arc::clone(&self.files)
    }
}

impl Transport for LoopbackEndpoint {
    fn send(&mut self, msg: &Message) -> Result<(), Status> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Status::SocketClosed);
        }
        self.tx.send(msg.clone()).map_err(|_| Status::SocketClosed)
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Message, Status> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Status::SocketClosed);
        }
        match self.rx.recv_timeout(timeout) {
            Ok(msg) => Ok(msg),
            Err(RecvTimeoutError::Timeout) => Err(Status::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(Status::SocketClosed),
        }
    }

    fn send_file(&mut self, local: &Path, device_subdir: &str) -> Result<(), Status> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Status::SocketClosed);
        }
        self.files
            .lock()
            .unwrap()
            .push((local.to_path_buf(), device_subdir.to_string()));
        Ok(())
    }

    fn status(&self) -> ConnectionStatus {
        if self.closed.load(Ordering::SeqCst) {
            ConnectionStatus::Disconnected
        } else {
            ConnectionStatus::Connected
        }
    }
}

type ServeFn = dyn Fn(DeviceId, ServiceRole, LoopbackEndpoint) + Send + Sync;

/// Transport factory producing loopback pairs.
///
/// On each connect the device-side endpoint is handed to the serve
/// callback, which usually spawns a responder thread. A configurable
/// number of leading connect attempts can be made to fail, for
/// exercising the registry's retry loop.
pub struct LoopbackFactory {
    serve: Arc<ServeFn>,
    fail_connects: AtomicU32,
    connects: AtomicU32,
}

impl LoopbackFactory {
    pub fn new<F>(serve: F) -> Self
    where
        F: Fn(DeviceId, ServiceRole, LoopbackEndpoint) + Send + Sync + 'static,
    {
        Self {
            serve: Arc::new(serve),
            fail_connects: AtomicU32::new(0),
            connects: AtomicU32::new(0),
        }
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Number of successful connects so far.
    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

impl TransportFactory for LoopbackFactory {
    fn connect(
        &self,
        device: DeviceId,
        role: ServiceRole,
    ) -> Result<Box<dyn Transport>, Status> {
        if self
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Status::NotConnected);
        }
        let (host, dev) = LoopbackEndpoint::pair();
        (self.serve)(device, role, dev);
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_core::Body;

    #[test]
    fn test_pair_round_trip() {
        let (mut host, mut dev) = LoopbackEndpoint::pair();
        let req = Message::request(1, 0, Body::GetCapability);
        host.send(&req).unwrap();
        let got = dev.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(got, req);
        dev.send(&got.reply(Body::CapabilityRsp { level: 0 })).unwrap();
        let rsp = host.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(rsp.seq, 1);
    }

    #[test]
    fn test_recv_times_out() {
        let (mut host, _dev) = LoopbackEndpoint::pair();
        assert!(matches!(
            host.recv_timeout(Duration::from_millis(10)),
            Err(Status::Timeout)
        ));
    }

    #[test]
    fn test_closed_pair_reports_disconnected() {
        let (mut host, dev) = LoopbackEndpoint::pair();
        assert_eq!(host.status(), ConnectionStatus::Connected);
        dev.close();
        assert_eq!(host.status(), ConnectionStatus::Disconnected);
        assert!(matches!(
            host.send(&Message::request(1, 0, Body::GetCapability)),
            Err(Status::SocketClosed)
        ));
    }

    #[test]
    fn test_dropped_peer_surfaces_as_closed() {
        let (mut host, dev) = LoopbackEndpoint::pair();
        drop(dev);
        assert!(matches!(
            host.recv_timeout(Duration::from_millis(10)),
            Err(Status::SocketClosed)
        ));
    }

    #[test]
    fn test_factory_fails_leading_connects() {
        let factory = LoopbackFactory::new(|_, _, _| {});
        factory.fail_next_connects(2);
        assert!(factory.connect(DeviceId(0), ServiceRole::Control).is_err());
        assert!(factory.connect(DeviceId(0), ServiceRole::Control).is_err());
        assert!(factory.connect(DeviceId(0), ServiceRole::Control).is_ok());
        assert_eq!(factory.connect_count(), 1);
    }
}
