//! In-process test harness: a recording transport plus a started engine.
//!
//! `MockNetwork` records every send and can run a scripted responder, so
//! tests drive the full outbound path (matcher registration, timers,
//! resends) without sockets. `TestEngine` wires one up behind the factory
//! registry and starts serving.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::{EngineConfig, ServerNetworkConfig};
use crate::engine::RpcEngine;
use crate::error::{EngineError, ErrorCode};
use crate::message::RpcMessage;
use crate::network::{Network, RpcChannel, RpcSession};
use crate::task::ResponseTask;
use crate::task_code::TaskCode;

/// Server port used by [`TestEngine::default_config`].
pub const TEST_SERVER_PORT: u16 = 7000;

pub type Responder = Arc<dyn Fn(Arc<MockNetwork>, Arc<RpcMessage>) + Send + Sync>;

/// A transport that records sends instead of framing bytes.
pub struct MockNetwork {
    engine: Weak<RpcEngine>,
    self_ref: OnceLock<Weak<MockNetwork>>,
    sent: Mutex<Vec<Arc<RpcMessage>>>,
    dropped: Mutex<Vec<Arc<RpcMessage>>>,
    responder: RwLock<Option<Responder>>,
}

impl MockNetwork {
    pub fn new(engine: Weak<RpcEngine>) -> Arc<Self> {
        let net = Arc::new(Self {
            engine,
            self_ref: OnceLock::new(),
            sent: Mutex::new(Vec::new()),
            dropped: Mutex::new(Vec::new()),
            responder: RwLock::new(None),
        });
        let _ = net.self_ref.set(Arc::downgrade(&net));
        net
    }

    fn arc(&self) -> Arc<MockNetwork> {
        self.self_ref
            .get()
            .and_then(Weak::upgrade)
            .expect("mock network is alive")
    }

    /// Every message sent so far, in order.
    pub fn sent(&self) -> Vec<Arc<RpcMessage>> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    /// Messages handed to fault-injection drop accounting.
    pub fn dropped_count(&self) -> usize {
        self.dropped.lock().len()
    }

    /// Script the remote side: the responder runs synchronously on every
    /// send and may spawn to answer later.
    pub fn set_responder(
        &self,
        responder: impl Fn(Arc<MockNetwork>, Arc<RpcMessage>) + Send + Sync + 'static,
    ) {
        *self.responder.write() = Some(Arc::new(responder));
    }

    /// Feed a reply for `request` back into the engine, as if it arrived
    /// from the remote side.
    pub fn deliver_reply(&self, request: &Arc<RpcMessage>, err: ErrorCode, body: Bytes) {
        let reply = request.create_response_with_body(body);
        reply.header().error = err;
        if let Some(engine) = self.engine.upgrade() {
            engine.on_recv_reply(self, reply.id(), Some(reply), Duration::ZERO);
        }
    }

    /// Signal an early transport failure for `request` (session lost
    /// before any reply).
    pub fn deliver_failure(&self, request: &Arc<RpcMessage>) {
        if let Some(engine) = self.engine.upgrade() {
            engine.on_recv_reply(self, request.id(), None, Duration::ZERO);
        }
    }
}

impl Network for MockNetwork {
    fn start(
        &self,
        _channel: RpcChannel,
        _port: u16,
        _client_only: bool,
    ) -> Result<(), EngineError> {
        Ok(())
    }

    fn address(&self) -> crate::types::RpcAddress {
        crate::types::RpcAddress::Ipv4(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 0))
    }

    fn send_message(&self, msg: Arc<RpcMessage>) {
        self.sent.lock().push(Arc::clone(&msg));
        let responder = self.responder.read().clone();
        if let Some(responder) = responder {
            responder(self.arc(), msg);
        }
    }

    fn inject_drop_message(&self, msg: &Arc<RpcMessage>, _is_send: bool) {
        self.dropped.lock().push(Arc::clone(msg));
    }
}

/// One connection of a connection-oriented mock transport; responses sent
/// through it are recorded instead of written to a socket.
pub struct MockSession {
    net: Arc<MockNetwork>,
    sent: Mutex<Vec<Arc<RpcMessage>>>,
}

impl MockSession {
    pub fn new(net: Arc<MockNetwork>) -> Arc<Self> {
        Arc::new(Self {
            net,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> Vec<Arc<RpcMessage>> {
        self.sent.lock().clone()
    }
}

impl RpcSession for MockSession {
    fn send_message(&self, msg: Arc<RpcMessage>) {
        self.sent.lock().push(msg);
    }

    fn cancel(&self, _msg: &Arc<RpcMessage>) {}

    fn net(&self) -> Arc<dyn Network> {
        Arc::clone(&self.net) as Arc<dyn Network>
    }
}

/// A completion channel for a pending call: the receiver yields every
/// delivery, so tests can assert both the outcome and that it happened
/// exactly once.
pub fn response_channel(
    request: Arc<RpcMessage>,
) -> (
    Arc<ResponseTask>,
    mpsc::UnboundedReceiver<(ErrorCode, Option<Arc<RpcMessage>>)>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = ResponseTask::new(
        request,
        Box::new(move |err, _req, reply| {
            let _ = tx.send((err, reply));
        }),
    );
    (task, rx)
}

/// A single-node engine over mock transports, started and serving.
pub struct TestEngine {
    engine: Arc<RpcEngine>,
    nets: Arc<Mutex<Vec<Arc<MockNetwork>>>>,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_config(Self::default_config())
    }

    /// Mock transports on every default channel plus one serving port.
    pub fn default_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.client_networks[0].factory_name = "mock".to_string();
        config.server_networks = vec![ServerNetworkConfig {
            port: TEST_SERVER_PORT,
            channel: RpcChannel::Tcp,
            factory_name: "mock".to_string(),
            message_buffer_block_size: 65536,
        }];
        config
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let engine = RpcEngine::new(config);
        let nets: Arc<Mutex<Vec<Arc<MockNetwork>>>> = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&nets);
        engine
            .network_factories()
            .register_provider("mock", move |weak| {
                let net = MockNetwork::new(weak);
                record.lock().push(Arc::clone(&net));
                net as Arc<dyn Network>
            });
        engine.start().expect("test engine starts");
        engine.start_serving();
        Self { engine, nets }
    }

    pub fn engine(&self) -> &Arc<RpcEngine> {
        &self.engine
    }

    /// The outbound transport for the native format on TCP — the first
    /// one the engine creates, so every plain call goes through it.
    pub fn client_net(&self) -> Arc<MockNetwork> {
        Arc::clone(&self.nets.lock()[0])
    }

    /// The serving transport (created last, after all client formats).
    pub fn server_net(&self) -> Arc<MockNetwork> {
        let nets = self.nets.lock();
        Arc::clone(nets.last().expect("server network configured"))
    }

    /// Issue a call and return its completion stream.
    pub fn call(
        &self,
        request: Arc<RpcMessage>,
    ) -> mpsc::UnboundedReceiver<(ErrorCode, Option<Arc<RpcMessage>>)> {
        let (task, rx) = response_channel(Arc::clone(&request));
        self.engine.call(request, Some(task));
        rx
    }

    /// Register a handler that echoes the request body back with OK.
    pub fn register_echo(&self, code: TaskCode, extra_name: &str) {
        let engine = Arc::downgrade(&self.engine);
        self.engine.register_rpc_handler(
            code,
            extra_name,
            Arc::new(move |msg: Arc<RpcMessage>| {
                if let Some(engine) = engine.upgrade() {
                    let response = msg.create_response_with_body(msg.body().clone());
                    engine.reply(response, ErrorCode::Ok);
                }
            }),
        );
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::HeaderFormat;
    use crate::types::RpcAddress;

    #[tokio::test]
    async fn scripted_responder_completes_a_call() {
        let test = TestEngine::new();
        let code = TaskCode::register("RPC_TEST_HARNESS_SMOKE");

        test.client_net().set_responder(|net, request| {
            net.deliver_reply(&request, ErrorCode::Ok, Bytes::from_static(b"pong"));
        });

        let request = RpcMessage::new_request(
            code,
            RpcAddress::Ipv4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 7100)),
            Duration::from_secs(1),
            Bytes::from_static(b"ping"),
        );
        let mut rx = test.call(request);

        let (err, reply) = rx.recv().await.unwrap();
        assert_eq!(err, ErrorCode::Ok);
        assert_eq!(reply.unwrap().body().as_ref(), b"pong");
        assert_eq!(test.client_net().sent_count(), 1);
        assert_eq!(test.engine().matcher().pending_count(), 0);
    }

    #[tokio::test]
    async fn harness_exposes_distinct_transports() {
        let test = TestEngine::new();
        // One client transport per header format, then the serving one.
        assert_eq!(test.nets.lock().len(), HeaderFormat::COUNT + 1);
        assert!(!Arc::ptr_eq(&test.client_net(), &test.server_net()));
    }
}
