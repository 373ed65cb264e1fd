//! Correlates outbound requests with inbound replies and drives per-call
//! timeouts and the single-shot resend.
//!
//! The table is striped into buckets keyed by `id % BUCKET_COUNT`; each
//! bucket guards its map with its own lock, so contention is bounded by
//! the in-flight count per bucket and critical sections contain map
//! operations only. Membership in the table is the sole authoritative
//! record of an in-flight request: the reply path and the timeout path
//! race for the entry under the bucket lock, the first to remove it wins,
//! and the loser's work is discarded.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::engine::RpcEngine;
use crate::error::ErrorCode;
use crate::message::{trace_hex, RpcMessage};
use crate::metrics::EngineMetrics;
use crate::network::Network;
use crate::task::{ResponseTask, TaskState};
use crate::task_code::GrpcMode;
use crate::types::{decode_redirect_address, GroupAddress};

const BUCKET_COUNT: usize = 64;

fn bucket_index(id: u64) -> usize {
    (id % BUCKET_COUNT as u64) as usize
}

struct TimerHandle {
    cancel: CancellationToken,
}

impl TimerHandle {
    /// Non-blocking and idempotent; safe to call from the timer itself.
    fn cancel(&self) {
        self.cancel.cancel();
    }
}

struct MatchEntry {
    call: Arc<ResponseTask>,
    timer: TimerHandle,
    /// Absolute deadline while a resend is still possible; `None` means
    /// the next timer fire times the call out.
    deadline: Option<Instant>,
}

pub struct ClientMatcher {
    engine: OnceLock<Weak<RpcEngine>>,
    buckets: Vec<Mutex<HashMap<u64, MatchEntry>>>,
    metrics: Arc<EngineMetrics>,
}

impl ClientMatcher {
    pub fn new(metrics: Arc<EngineMetrics>) -> Arc<Self> {
        Arc::new(Self {
            engine: OnceLock::new(),
            buckets: (0..BUCKET_COUNT)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
            metrics,
        })
    }

    pub(crate) fn bind_engine(&self, engine: Weak<RpcEngine>) {
        let _ = self.engine.set(engine);
    }

    fn engine(&self) -> Option<Arc<RpcEngine>> {
        self.engine.get().and_then(Weak::upgrade)
    }

    /// Number of requests currently awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().len()).sum()
    }

    /// Register a pending call and arm its timeout timer.
    ///
    /// When the operation's resend threshold is configured and smaller
    /// than the call timeout, the timer first fires at the threshold and
    /// the entry remembers the absolute deadline; otherwise the timer
    /// fires at the timeout and resend stays disabled.
    ///
    /// # Panics
    ///
    /// Panics if the request id is already in flight.
    pub fn on_call(self: &Arc<Self>, request: &Arc<RpcMessage>, call: Arc<ResponseTask>) {
        let id = request.id();
        let spec = request.local_code().spec();
        let timeout = request.header().timeout;
        let resend_threshold = spec.rpc_request_resend_timeout();

        let (first_fire, deadline) = if !resend_threshold.is_zero() && timeout > resend_threshold {
            (resend_threshold, Some(Instant::now() + timeout))
        } else {
            (timeout, None)
        };

        let token = CancellationToken::new();
        {
            let mut bucket = self.buckets[bucket_index(id)].lock();
            let prev = bucket.insert(
                id,
                MatchEntry {
                    call,
                    timer: TimerHandle {
                        cancel: token.clone(),
                    },
                    deadline,
                },
            );
            assert!(prev.is_none(), "request id {id} is already in flight");
        }
        self.metrics.inflight_requests.inc();
        self.arm_timer(id, token, first_fire);
    }

    fn arm_timer(self: &Arc<Self>, id: u64, token: CancellationToken, delay: Duration) {
        let matcher = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => matcher.on_rpc_timeout(id),
            }
        });
    }

    /// Hand an inbound reply (or an early transport failure, as `None`) to
    /// the pending call.
    ///
    /// Returns `false` when no call is pending under `id`; the reply is
    /// discarded, since the caller has already been timed out.
    pub fn on_recv_reply(
        &self,
        net: &dyn Network,
        id: u64,
        reply: Option<Arc<RpcMessage>>,
        delay: Duration,
    ) -> bool {
        let entry = self.buckets[bucket_index(id)].lock().remove(&id);
        let Some(entry) = entry else {
            if let Some(reply) = reply {
                debug!(
                    id,
                    trace_id = %trace_hex(reply.trace_id()),
                    "discarding reply with no pending call"
                );
            }
            return false;
        };
        entry.timer.cancel();
        self.metrics.inflight_requests.dec();

        let call = entry.call;
        let request = Arc::clone(call.request());

        // Early termination: the transport lost the session before any
        // reply. A leader-directed group rotates its hint so the next
        // attempt tries another member.
        let Some(reply) = reply else {
            if let Some(group) = auto_leader_group(&request) {
                group.leader_forward();
            }
            call.set_delay(delay);
            call.enqueue(ErrorCode::NetworkFailure, None);
            return true;
        };

        let err = reply.header().error;
        if err == ErrorCode::ForwardToOthers {
            let redirect = match decode_redirect_address(reply.body()) {
                Ok(addr) => addr,
                Err(error) => {
                    warn!(
                        trace_id = %trace_hex(request.trace_id()),
                        %error,
                        "redirect reply carries an undecodable address"
                    );
                    call.enqueue(ErrorCode::NetworkFailure, None);
                    return true;
                }
            };
            if let Some(group) = auto_leader_group(&request) {
                group.set_leader(redirect);
            }
            self.metrics.redirects_total.inc();

            // Re-issue at the redirect target under a fresh id so a new
            // entry is created; the redirect reply itself is discarded.
            match self.engine() {
                Some(engine) => {
                    if !engine.config().redirect_keeps_original_timeout {
                        let elapsed = request.created_at().elapsed();
                        let mut hdr = request.header();
                        hdr.timeout = hdr.timeout.saturating_sub(elapsed);
                    }
                    engine.call_ip(redirect, &request, Some(call), true, false);
                }
                None => {
                    call.enqueue(ErrorCode::NetworkFailure, None);
                }
            }
            return true;
        }

        // A forwarded OK reply reveals the group's actual leader.
        if err.is_ok() && reply.is_forwarded() {
            if let Some(group) = auto_leader_group(&request) {
                if let Some(leader) = reply.header().from_address.ipv4() {
                    group.set_leader(leader);
                }
            }
        }

        call.set_delay(delay);
        self.metrics.replies_delivered_total.inc();
        if !call.enqueue(err, Some(Arc::clone(&reply))) {
            debug!(
                name = reply.rpc_name(),
                trace_id = %trace_hex(reply.trace_id()),
                "rpc reply dropped (fault inject)"
            );
            self.metrics.dropped_messages_total.inc();
            net.inject_drop_message(&reply, false);
        }
        true
    }

    /// Timer fire for `id`: time the call out, or resend it once if the
    /// deadline still has budget and the call was not cancelled.
    pub fn on_rpc_timeout(self: &Arc<Self>, id: u64) {
        let index = bucket_index(id);
        let call;
        let deadline;
        {
            let mut bucket = self.buckets[index].lock();
            match bucket.get(&id) {
                None => return,
                Some(entry) => {
                    call = Arc::clone(&entry.call);
                    deadline = entry.deadline;
                    if deadline.is_none() {
                        bucket.remove(&id);
                    }
                }
            }
        }

        let Some(deadline) = deadline else {
            self.metrics.inflight_requests.dec();
            self.metrics.timeouts_total.inc();
            call.enqueue(ErrorCode::Timeout, None);
            return;
        };

        // Resend is decided outside the lock, then re-verified under it:
        // the reply may win the race in between.
        let now = Instant::now();
        let mut resend = now < deadline && call.state() == TaskState::Ready;
        let token = CancellationToken::new();
        let mut reply_won = false;
        {
            let mut bucket = self.buckets[index].lock();
            match bucket.get_mut(&id) {
                Some(entry) => {
                    if resend {
                        entry.timer = TimerHandle {
                            cancel: token.clone(),
                        };
                        // Clearing the deadline caps the call at one
                        // resend: the re-armed timer can only time out.
                        entry.deadline = None;
                    } else {
                        bucket.remove(&id);
                    }
                }
                None => {
                    resend = false;
                    reply_won = true;
                }
            }
        }

        if resend {
            let request = Arc::clone(call.request());
            let to = request.header().to_address.clone();
            debug!(
                id,
                trace_id = %trace_hex(request.trace_id()),
                "resending request with the remaining budget"
            );
            if let (Some(engine), Some(addr)) = (self.engine(), to.ipv4()) {
                self.metrics.resends_total.inc();
                engine.call_ip(addr, &request, None, false, false);
            }
            self.arm_timer(id, token, deadline - now);
            return;
        }

        if !reply_won {
            self.metrics.inflight_requests.dec();
            self.metrics.timeouts_total.inc();
            call.enqueue(ErrorCode::Timeout, None);
        }
    }
}

impl Drop for ClientMatcher {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        for bucket in &self.buckets {
            assert!(
                bucket.lock().is_empty(),
                "all pending calls must complete before the matcher is dropped"
            );
        }
    }
}

/// The group to update when replies carry leader hints: the request must
/// target a group in leader mode with automatic updates enabled.
fn auto_leader_group(request: &Arc<RpcMessage>) -> Option<Arc<GroupAddress>> {
    let spec = request.local_code().try_spec()?;
    if spec.grpc_mode() != GrpcMode::ToLeader {
        return None;
    }
    let server = request.header().server_address.clone();
    let group = server.group()?;
    group
        .is_update_leader_automatically()
        .then(|| Arc::clone(group))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_code::TaskCode;
    use crate::types::RpcAddress;
    use bytes::Bytes;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use tokio::sync::mpsc;

    struct NoopNetwork;

    impl Network for NoopNetwork {
        fn start(
            &self,
            _channel: crate::network::RpcChannel,
            _port: u16,
            _client_only: bool,
        ) -> Result<(), crate::error::EngineError> {
            Ok(())
        }

        fn address(&self) -> RpcAddress {
            RpcAddress::Invalid
        }

        fn send_message(&self, _msg: Arc<RpcMessage>) {}

        fn inject_drop_message(&self, _msg: &Arc<RpcMessage>, _is_send: bool) {}
    }

    fn ep(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), port)
    }

    fn pending_call(
        code: &str,
        timeout: Duration,
    ) -> (
        Arc<RpcMessage>,
        Arc<ResponseTask>,
        mpsc::UnboundedReceiver<(ErrorCode, Option<Arc<RpcMessage>>)>,
    ) {
        let request = RpcMessage::new_request(
            TaskCode::register(code),
            RpcAddress::Ipv4(ep(7000)),
            timeout,
            Bytes::new(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let task = ResponseTask::new(
            Arc::clone(&request),
            Box::new(move |err, _req, reply| {
                let _ = tx.send((err, reply));
            }),
        );
        (request, task, rx)
    }

    fn matcher() -> Arc<ClientMatcher> {
        ClientMatcher::new(Arc::new(EngineMetrics::unregistered()))
    }

    #[tokio::test]
    async fn reply_completes_the_pending_call() {
        let matcher = matcher();
        let (request, task, mut rx) =
            pending_call("RPC_TEST_MATCHER_REPLY", Duration::from_secs(5));
        matcher.on_call(&request, task);
        assert_eq!(matcher.pending_count(), 1);

        let reply = request.create_response_with_body(Bytes::from_static(b"hi"));
        assert!(matcher.on_recv_reply(&NoopNetwork, request.id(), Some(reply), Duration::ZERO));

        let (err, reply) = rx.recv().await.unwrap();
        assert_eq!(err, ErrorCode::Ok);
        assert_eq!(reply.unwrap().body().as_ref(), b"hi");
        assert_eq!(matcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn timeout_completes_when_no_reply_arrives() {
        let matcher = matcher();
        let (request, task, mut rx) =
            pending_call("RPC_TEST_MATCHER_TIMEOUT", Duration::from_millis(50));
        matcher.on_call(&request, task);

        let (err, reply) = rx.recv().await.unwrap();
        assert_eq!(err, ErrorCode::Timeout);
        assert!(reply.is_none());
        assert_eq!(matcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn late_reply_is_discarded_without_delivery() {
        let matcher = matcher();
        let (request, task, mut rx) =
            pending_call("RPC_TEST_MATCHER_LATE", Duration::from_millis(30));
        matcher.on_call(&request, task);

        let (err, _) = rx.recv().await.unwrap();
        assert_eq!(err, ErrorCode::Timeout);

        let reply = request.create_response();
        assert!(!matcher.on_recv_reply(&NoopNetwork, request.id(), Some(reply), Duration::ZERO));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn timeout_after_reply_is_a_noop() {
        let matcher = matcher();
        let (request, task, mut rx) =
            pending_call("RPC_TEST_MATCHER_REPLY_FIRST", Duration::from_millis(60));
        matcher.on_call(&request, task);

        let reply = request.create_response();
        assert!(matcher.on_recv_reply(&NoopNetwork, request.id(), Some(reply), Duration::ZERO));
        let (err, _) = rx.recv().await.unwrap();
        assert_eq!(err, ErrorCode::Ok);

        // Let the timer fire against the now-empty bucket.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(matcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn null_reply_surfaces_network_failure_and_rotates_leader() {
        let matcher = matcher();
        let group = Arc::new(GroupAddress::with_members("meta", [ep(7000), ep(7001)]));
        group.set_leader(ep(7000));

        let request = RpcMessage::new_request(
            TaskCode::register("RPC_TEST_MATCHER_NULL_REPLY"),
            RpcAddress::Group(Arc::clone(&group)),
            Duration::from_secs(5),
            Bytes::new(),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = ResponseTask::new(
            Arc::clone(&request),
            Box::new(move |err, _req, reply| {
                let _ = tx.send((err, reply));
            }),
        );
        matcher.on_call(&request, task);

        assert!(matcher.on_recv_reply(&NoopNetwork, request.id(), None, Duration::ZERO));
        let (err, reply) = rx.recv().await.unwrap();
        assert_eq!(err, ErrorCode::NetworkFailure);
        assert!(reply.is_none());
        assert_eq!(group.leader(), Some(ep(7001)));
    }

    #[tokio::test]
    #[should_panic(expected = "already in flight")]
    async fn duplicate_in_flight_id_is_fatal() {
        let matcher = matcher();
        let (request, task, _rx) =
            pending_call("RPC_TEST_MATCHER_DUPLICATE", Duration::from_secs(5));
        matcher.on_call(&request, Arc::clone(&task));
        // A second registration under the same id must abort; clean the
        // first entry out so only the panic remains observable.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            matcher.on_call(&request, task);
        }));
        matcher.on_recv_reply(&NoopNetwork, request.id(), None, Duration::ZERO);
        if let Err(panic) = result {
            std::panic::resume_unwind(panic);
        }
    }
}
