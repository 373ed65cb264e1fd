//! The message envelope shared by the outbound and inbound paths.
//!
//! A message is shared as `Arc<RpcMessage>`: the matcher owns the pending
//! request while it is in flight, transports hold it while queued, and the
//! completion path receives it back. The last owner frees it. Hot fields
//! that change while shared (id on redirect, retry counter, forwarded flag)
//! are atomics; the addressing header lives under a single small mutex.

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::ErrorCode;
use crate::network::{HeaderFormat, RpcSession};
use crate::task_code::TaskCode;
use crate::types::{Gpid, RpcAddress};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Addressing and per-call fields mutated under one lock.
#[derive(Clone)]
pub struct MessageHeader {
    pub from_address: RpcAddress,
    pub to_address: RpcAddress,
    /// The original logical target, before group/URI indirection.
    pub server_address: RpcAddress,
    pub timeout: Duration,
    pub partition_hash: u64,
    pub thread_hash: u64,
    pub gpid: Gpid,
    /// Status stamped on responses.
    pub error: ErrorCode,
}

pub struct RpcMessage {
    id: AtomicU64,
    trace_id: AtomicU64,
    local_code: AtomicU32,
    rpc_name: String,
    is_request: bool,
    is_forwarded: AtomicBool,
    is_forward_supported: AtomicBool,
    send_retry_count: AtomicU32,
    hdr_format: HeaderFormat,
    body: Bytes,
    created_at: Instant,
    header: Mutex<MessageHeader>,
    session: Mutex<Option<Weak<dyn RpcSession>>>,
}

impl RpcMessage {
    /// Allocate a request id; ids are process-unique and never zero.
    pub fn new_id() -> u64 {
        NEXT_ID.fetch_add(1, Ordering::Relaxed)
    }

    pub fn new_request(
        code: TaskCode,
        server_address: RpcAddress,
        timeout: Duration,
        body: Bytes,
    ) -> Arc<RpcMessage> {
        let spec = code.spec();
        Arc::new(RpcMessage {
            id: AtomicU64::new(Self::new_id()),
            trace_id: AtomicU64::new(0),
            local_code: AtomicU32::new(code.raw()),
            rpc_name: spec.name().to_string(),
            is_request: true,
            is_forwarded: AtomicBool::new(false),
            is_forward_supported: AtomicBool::new(true),
            send_retry_count: AtomicU32::new(0),
            hdr_format: spec.rpc_call_header_format(),
            body,
            created_at: Instant::now(),
            header: Mutex::new(MessageHeader {
                from_address: RpcAddress::Invalid,
                to_address: RpcAddress::Invalid,
                server_address,
                timeout,
                partition_hash: 0,
                thread_hash: 0,
                gpid: Gpid::ZERO,
                error: ErrorCode::Ok,
            }),
            session: Mutex::new(None),
        })
    }

    /// Build the response for this request: same id, trace id and code,
    /// addressing reversed, forwarded flag and session carried over so the
    /// reply router can pick the right path.
    pub fn create_response(&self) -> Arc<RpcMessage> {
        self.create_response_with_body(Bytes::new())
    }

    pub fn create_response_with_body(&self, body: Bytes) -> Arc<RpcMessage> {
        let header = self.header.lock().clone();
        Arc::new(RpcMessage {
            id: AtomicU64::new(self.id()),
            trace_id: AtomicU64::new(self.trace_id()),
            local_code: AtomicU32::new(self.local_code.load(Ordering::Relaxed)),
            rpc_name: self.rpc_name.clone(),
            is_request: false,
            is_forwarded: AtomicBool::new(self.is_forwarded()),
            is_forward_supported: AtomicBool::new(self.is_forward_supported()),
            send_retry_count: AtomicU32::new(0),
            hdr_format: self.hdr_format,
            body,
            created_at: Instant::now(),
            header: Mutex::new(MessageHeader {
                from_address: header.to_address.clone(),
                to_address: header.from_address,
                server_address: header.server_address,
                timeout: header.timeout,
                partition_hash: header.partition_hash,
                thread_hash: header.thread_hash,
                gpid: header.gpid,
                error: ErrorCode::Ok,
            }),
            session: Mutex::new(self.session.lock().clone()),
        })
    }

    /// Clone this request for forwarding: identical header, flags and
    /// body, but detached from the inbound session.
    pub fn copy(&self) -> Arc<RpcMessage> {
        Arc::new(RpcMessage {
            id: AtomicU64::new(self.id()),
            trace_id: AtomicU64::new(self.trace_id()),
            local_code: AtomicU32::new(self.local_code.load(Ordering::Relaxed)),
            rpc_name: self.rpc_name.clone(),
            is_request: self.is_request,
            is_forwarded: AtomicBool::new(self.is_forwarded()),
            is_forward_supported: AtomicBool::new(self.is_forward_supported()),
            send_retry_count: AtomicU32::new(self.send_retry_count()),
            hdr_format: self.hdr_format,
            body: self.body.clone(),
            created_at: Instant::now(),
            header: Mutex::new(self.header.lock().clone()),
            session: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id.load(Ordering::Relaxed)
    }

    /// Give the message a fresh id, detaching it from any previous matcher
    /// registration. Used when a redirect re-issues the request.
    pub fn reset_id(&self) {
        self.id.store(Self::new_id(), Ordering::Relaxed);
    }

    pub fn trace_id(&self) -> u64 {
        self.trace_id.load(Ordering::Relaxed)
    }

    pub fn set_trace_id(&self, trace_id: u64) {
        self.trace_id.store(trace_id, Ordering::Relaxed);
    }

    pub fn local_code(&self) -> TaskCode {
        let raw = self.local_code.load(Ordering::Relaxed);
        if raw == TaskCode::INVALID.raw() {
            TaskCode::INVALID
        } else {
            TaskCode::from_raw(raw)
        }
    }

    pub fn set_local_code(&self, code: TaskCode) {
        self.local_code.store(code.raw(), Ordering::Relaxed);
    }

    /// Resolve the task code, looking it up by rpc name and writing it
    /// back when this message arrived without one.
    pub fn resolve_code(&self) -> TaskCode {
        let code = self.local_code();
        if code.is_valid() {
            return code;
        }
        match TaskCode::find(&self.rpc_name) {
            Some(code) => {
                self.set_local_code(code);
                code
            }
            None => TaskCode::INVALID,
        }
    }

    pub fn rpc_name(&self) -> &str {
        &self.rpc_name
    }

    pub fn is_request(&self) -> bool {
        self.is_request
    }

    pub fn is_forwarded(&self) -> bool {
        self.is_forwarded.load(Ordering::Relaxed)
    }

    pub fn set_forwarded(&self, value: bool) {
        self.is_forwarded.store(value, Ordering::Relaxed);
    }

    pub fn is_forward_supported(&self) -> bool {
        self.is_forward_supported.load(Ordering::Relaxed)
    }

    pub fn set_forward_supported(&self, value: bool) {
        self.is_forward_supported.store(value, Ordering::Relaxed);
    }

    pub fn send_retry_count(&self) -> u32 {
        self.send_retry_count.load(Ordering::Relaxed)
    }

    pub fn bump_send_retry_count(&self) {
        self.send_retry_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hdr_format(&self) -> HeaderFormat {
        self.hdr_format
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Lock the addressing header. Keep the guard short-lived; never hold
    /// it across a transport call or an await point.
    pub fn header(&self) -> MutexGuard<'_, MessageHeader> {
        self.header.lock()
    }

    pub fn session(&self) -> Option<Arc<dyn RpcSession>> {
        self.session.lock().as_ref().and_then(Weak::upgrade)
    }

    pub fn set_session(&self, session: &Arc<dyn RpcSession>) {
        *self.session.lock() = Some(Arc::downgrade(session));
    }
}

/// Trace ids are logged as 16-digit hex so they can be grepped across
/// nodes.
pub(crate) fn trace_hex(trace_id: u64) -> String {
    format!("{trace_id:016x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn test_code() -> TaskCode {
        TaskCode::register("RPC_TEST_MESSAGE")
    }

    fn ep(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), port)
    }

    #[test]
    fn request_ids_are_unique_and_nonzero() {
        let mut seen = HashSet::new();
        for _ in 0..256 {
            let id = RpcMessage::new_id();
            assert_ne!(id, 0);
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn response_reverses_addressing_and_keeps_identity() {
        let req = RpcMessage::new_request(
            test_code(),
            RpcAddress::Ipv4(ep(7000)),
            Duration::from_secs(1),
            Bytes::new(),
        );
        {
            let mut hdr = req.header();
            hdr.from_address = RpcAddress::Ipv4(ep(2000));
            hdr.to_address = RpcAddress::Ipv4(ep(7000));
        }
        req.set_forwarded(true);

        let resp = req.create_response_with_body(Bytes::from_static(b"hi"));
        assert_eq!(resp.id(), req.id());
        assert_eq!(resp.trace_id(), req.trace_id());
        assert!(!resp.is_request());
        assert!(resp.is_forwarded());
        assert_eq!(resp.body().as_ref(), b"hi");

        let hdr = resp.header();
        assert_eq!(hdr.from_address, RpcAddress::Ipv4(ep(7000)));
        assert_eq!(hdr.to_address, RpcAddress::Ipv4(ep(2000)));
    }

    #[test]
    fn reset_id_detaches_from_old_identity() {
        let req = RpcMessage::new_request(
            test_code(),
            RpcAddress::Ipv4(ep(7000)),
            Duration::from_secs(1),
            Bytes::new(),
        );
        let old = req.id();
        req.reset_id();
        assert_ne!(req.id(), old);
        assert_ne!(req.id(), 0);
    }

    #[test]
    fn copy_shares_body_but_not_session_bookkeeping() {
        let req = RpcMessage::new_request(
            test_code(),
            RpcAddress::Ipv4(ep(7000)),
            Duration::from_secs(1),
            Bytes::from_static(b"payload"),
        );
        req.bump_send_retry_count();

        let copy = req.copy();
        assert_eq!(copy.id(), req.id());
        assert_eq!(copy.body().as_ref(), b"payload");
        assert_eq!(copy.send_retry_count(), 1);
        assert!(copy.session().is_none());
    }

    #[test]
    fn resolve_code_writes_back() {
        let code = test_code();
        let req = RpcMessage::new_request(
            code,
            RpcAddress::Ipv4(ep(7000)),
            Duration::from_secs(1),
            Bytes::new(),
        );
        // Simulate a message that arrived with only the name resolved.
        req.set_local_code(TaskCode::INVALID);
        assert_eq!(req.resolve_code(), code);
        assert_eq!(req.local_code(), code);
    }
}
