//! Message dispatcher for out-of-band traffic
//!
//! Blocking calls consume their own responses by sequence id; anything
//! the transport delivers outside a call (late replies, device-initiated
//! notifications) goes through this table instead. The table is built
//! once at startup from a fixed list of (kind, handler) pairs. The
//! owning device is resolved from the message's embedded
//! `real_device_id`, not from the transport that delivered it. Unknown
//! kinds are logged and dropped. Handlers must be idempotent and must
//! not block.

use axon_core::{DeviceId, Message, MessageKind};
use std::collections::HashMap;
use tracing::{debug, warn};

pub type Handler = Box<dyn Fn(DeviceId, &Message) + Send + Sync>;

pub struct Dispatcher {
    handlers: HashMap<MessageKind, Handler>,
}

impl Dispatcher {
    /// Build a dispatcher from a fixed handler list.
    pub fn new(entries: Vec<(MessageKind, Handler)>) -> Self {
        let mut handlers = HashMap::new();
        for (kind, handler) in entries {
            let prev = handlers.insert(kind, handler);
            debug_assert!(prev.is_none(), "duplicate handler for {kind:?}");
        }
        Self { handlers }
    }

    /// The default table: every response kind a device may emit late is
    /// acknowledged at debug level so stale replies never surface as
    /// errors.
    pub fn with_defaults() -> Self {
        fn log_late(kind: MessageKind) -> (MessageKind, Handler) {
            (
                kind,
                Box::new(move |device, msg| {
                    debug!(device = %device, ?kind, seq = msg.seq, "late response dropped");
                }),
            )
        }
        Self::new(vec![
            log_late(MessageKind::ConnectivityTestRsp),
            log_late(MessageKind::CapabilityRsp),
            log_late(MessageKind::AdprofSupportRsp),
            log_late(MessageKind::StartAllRsp),
            log_late(MessageKind::StopAllRsp),
            log_late(MessageKind::StartQueueSchedulerRsp),
            log_late(MessageKind::UpdateProfilingRsp),
            log_late(MessageKind::OpenSubProcessRsp),
            log_late(MessageKind::CloseSubProcessRsp),
            log_late(MessageKind::CloseSubProcessListRsp),
            log_late(MessageKind::SubProcessStatusRsp),
            log_late(MessageKind::CheckPackageRsp),
            log_late(MessageKind::PackageHashRsp),
            log_late(MessageKind::UpdatePackageConfigRsp),
            log_late(MessageKind::RemoveFileRsp),
        ])
    }

    /// Route one message. Returns whether a handler ran.
    pub fn dispatch(&self, msg: &Message) -> bool {
        let device = DeviceId(msg.real_device_id);
        match self.handlers.get(&msg.kind()) {
            Some(handler) => {
                handler(device, msg);
                true
            }
            None => {
                warn!(device = %device, kind = ?msg.kind(), "no handler, message dropped");
                false
            }
        }
    }

    pub fn handles(&self, kind: MessageKind) -> bool {
        self.handlers.contains_key(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_core::Body;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_dispatch_resolves_by_real_device_id() {
        let seen = Arc::new(AtomicU32::new(u32::MAX));
        let seen2 = Arc::clone(&seen);
        let handler: Handler = Box::new(move |device, _msg| {
            seen2.store(device.as_u32(), Ordering::SeqCst);
        });
        let dispatcher = Dispatcher::new(vec![(MessageKind::CapabilityRsp, handler)]);
        let mut msg = Message::request(1, 0, Body::CapabilityRsp { level: 0 });
        msg.real_device_id = 5;
        assert!(dispatcher.dispatch(&msg));
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_unknown_kind_dropped() {
        let dispatcher = Dispatcher::new(vec![]);
        let msg = Message::request(1, 0, Body::GetCapability);
        assert!(!dispatcher.dispatch(&msg));
    }

    #[test]
    fn test_default_table_covers_response_kinds() {
        let dispatcher = Dispatcher::with_defaults();
        assert!(dispatcher.handles(MessageKind::OpenSubProcessRsp));
        assert!(dispatcher.handles(MessageKind::PackageHashRsp));
        assert!(!dispatcher.handles(MessageKind::OpenSubProcess));
    }
}
