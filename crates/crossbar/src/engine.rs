//! The RPC engine: dispatches outbound calls by address kind, owns the
//! transports, routes replies, and feeds inbound requests to registered
//! handlers.
//!
//! Transports are fixed after `start()`: outbound ones are indexed by
//! `(header format, channel)`, serving ones by `(port, channel)`. Each is
//! built through the factory registry as a main provider wrapped by the
//! configured aspect decorators in declared order.

use parking_lot::RwLock;
use rand::Rng;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::dispatcher::ServerDispatcher;
use crate::error::{EngineError, ErrorCode};
use crate::matcher::ClientMatcher;
use crate::message::{trace_hex, RpcMessage};
use crate::metrics::EngineMetrics;
use crate::network::{HeaderFormat, Network, NetworkFactoryRegistry, RpcChannel};
use crate::resolver::UriResolverManager;
use crate::task::{RequestHandler, RequestTask, ResponseTask};
use crate::task_code::{GrpcMode, TaskCode};
use crate::types::{
    encode_redirect_address, GroupAddress, RpcAddress, UriAddress, MAX_CLIENT_PORT,
};

/// Hosting hook for partitioned applications: inbound requests carrying a
/// bound partition id are offered here before the plain handler registry.
pub trait RequestInterceptor: Send + Sync {
    fn intercept(&self, msg: &Arc<RpcMessage>) -> Option<RequestTask>;
}

pub struct RpcEngine {
    config: EngineConfig,
    metrics: Arc<EngineMetrics>,
    matcher: Arc<ClientMatcher>,
    dispatcher: ServerDispatcher,
    factories: NetworkFactoryRegistry,
    resolvers: UriResolverManager,
    client_nets: RwLock<Vec<Vec<Option<Arc<dyn Network>>>>>,
    server_nets: RwLock<Vec<(u16, Vec<Option<Arc<dyn Network>>>)>>,
    primary_address: RwLock<RpcAddress>,
    is_running: AtomicBool,
    is_serving: AtomicBool,
    interceptor: RwLock<Option<Arc<dyn RequestInterceptor>>>,
    self_ref: OnceLock<Weak<RpcEngine>>,
}

impl RpcEngine {
    pub fn new(config: EngineConfig) -> Arc<Self> {
        Self::with_metrics(config, Arc::new(EngineMetrics::unregistered()))
    }

    pub fn with_metrics(config: EngineConfig, metrics: Arc<EngineMetrics>) -> Arc<Self> {
        let matcher = ClientMatcher::new(Arc::clone(&metrics));
        let engine = Arc::new(Self {
            config,
            metrics,
            matcher,
            dispatcher: ServerDispatcher::new(),
            factories: NetworkFactoryRegistry::new(),
            resolvers: UriResolverManager::new(),
            client_nets: RwLock::new(Vec::new()),
            server_nets: RwLock::new(Vec::new()),
            primary_address: RwLock::new(RpcAddress::Invalid),
            is_running: AtomicBool::new(false),
            is_serving: AtomicBool::new(false),
            interceptor: RwLock::new(None),
            self_ref: OnceLock::new(),
        });
        // Cannot fail: the OnceLock was created just above.
        let _ = engine.self_ref.set(Arc::downgrade(&engine));
        engine.matcher.bind_engine(Arc::downgrade(&engine));
        engine
    }

    fn weak(&self) -> Weak<RpcEngine> {
        self.self_ref.get().cloned().unwrap_or_else(Weak::new)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn matcher(&self) -> &Arc<ClientMatcher> {
        &self.matcher
    }

    pub fn network_factories(&self) -> &NetworkFactoryRegistry {
        &self.factories
    }

    pub fn uri_resolvers(&self) -> &UriResolverManager {
        &self.resolvers
    }

    pub fn primary_address(&self) -> RpcAddress {
        self.primary_address.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    pub fn is_serving(&self) -> bool {
        self.is_serving.load(Ordering::Acquire)
    }

    /// Begin accepting inbound requests. The service layer flips this once
    /// its handlers are registered; requests arriving earlier are dropped.
    pub fn start_serving(&self) {
        self.is_serving.store(true, Ordering::Release);
    }

    pub fn stop_serving(&self) {
        self.is_serving.store(false, Ordering::Release);
    }

    /// Build all transports and compute the primary address.
    pub fn start(&self) -> Result<(), EngineError> {
        if self.is_running() {
            return Err(EngineError::AlreadyRunning);
        }
        self.config.validate()?;

        // Outbound transports: one per header format over each configured
        // channel, so redirected responses can be answered in the dialect
        // they arrived with.
        let mut client_nets: Vec<Vec<Option<Arc<dyn Network>>>> =
            vec![vec![None; RpcChannel::COUNT]; HeaderFormat::COUNT];
        for format in HeaderFormat::ALL {
            for conf in &self.config.client_networks {
                let net =
                    self.create_network(&conf.factory_name, format, conf.message_buffer_block_size)?;
                net.start(conf.channel, 0, true)?;
                info!(
                    channel = conf.channel.as_str(),
                    format = format.as_str(),
                    "network client started"
                );
                client_nets[format.index()][conf.channel.index()] = Some(net);
            }
        }
        *self.client_nets.write() = client_nets;

        for conf in &self.config.server_networks {
            let net = self.create_network(
                &conf.factory_name,
                HeaderFormat::Native,
                conf.message_buffer_block_size,
            )?;
            net.start(conf.channel, conf.port, false)?;
            info!(
                port = conf.port,
                channel = conf.channel.as_str(),
                "network server started"
            );
            let mut server_nets = self.server_nets.write();
            match server_nets.iter_mut().find(|(port, _)| *port == conf.port) {
                Some((_, nets)) => nets[conf.channel.index()] = Some(net),
                None => {
                    let mut nets: Vec<Option<Arc<dyn Network>>> = vec![None; RpcChannel::COUNT];
                    nets[conf.channel.index()] = Some(net);
                    server_nets.push((conf.port, nets));
                }
            }
        }

        let base = self
            .client_net(HeaderFormat::Native, RpcChannel::Tcp)
            .expect("validated: a TCP client network is configured");
        let primary = match base.address() {
            RpcAddress::Ipv4(addr) => {
                RpcAddress::Ipv4(SocketAddrV4::new(*addr.ip(), self.config.primary_port))
            }
            other => other,
        };
        *self.primary_address.write() = primary.clone();

        info!(primary_address = %primary, "rpc engine started");
        self.is_running.store(true, Ordering::Release);
        Ok(())
    }

    fn create_network(
        &self,
        factory: &str,
        client_format: HeaderFormat,
        buffer_block_size: usize,
    ) -> Result<Arc<dyn Network>, EngineError> {
        let engine = self.weak();
        let mut net = self.factories.create_provider(factory, engine.clone())?;
        net.reset_parser_attr(client_format, buffer_block_size);
        for aspect in &self.config.network_aspects {
            net = self.factories.wrap_aspect(aspect, engine.clone(), net)?;
        }
        Ok(net)
    }

    pub fn client_net(&self, format: HeaderFormat, channel: RpcChannel) -> Option<Arc<dyn Network>> {
        self.client_nets
            .read()
            .get(format.index())
            .and_then(|row| row.get(channel.index()))
            .cloned()
            .flatten()
    }

    pub fn server_net(&self, port: u16, channel: RpcChannel) -> Option<Arc<dyn Network>> {
        self.server_nets
            .read()
            .iter()
            .find(|(p, _)| *p == port)
            .and_then(|(_, nets)| nets.get(channel.index()))
            .cloned()
            .flatten()
    }

    pub fn register_rpc_handler(
        &self,
        code: TaskCode,
        extra_name: &str,
        handler: RequestHandler,
    ) -> bool {
        self.dispatcher.register(code, extra_name, handler)
    }

    pub fn unregister_rpc_handler(&self, code: TaskCode) -> bool {
        self.dispatcher.unregister(code)
    }

    pub fn set_request_interceptor(&self, interceptor: Arc<dyn RequestInterceptor>) {
        *self.interceptor.write() = Some(interceptor);
    }

    /// Issue an outbound call: stamp the local identity on the request and
    /// dispatch it by the kind of its logical target.
    ///
    /// `call` is the pending completion; `None` sends fire-and-forget.
    #[instrument(skip_all, fields(name = %request.rpc_name()))]
    pub fn call(&self, request: Arc<RpcMessage>, call: Option<Arc<ResponseTask>>) {
        {
            let mut hdr = request.header();
            hdr.from_address = self.primary_address();
            if hdr.timeout.is_zero() {
                hdr.timeout = self.config.default_rpc_timeout;
            }
        }
        request.set_trace_id(rand::thread_rng().gen_range(1..=u64::MAX));

        let server = request.header().server_address.clone();
        self.call_address(server, request, call);
    }

    fn call_address(
        &self,
        address: RpcAddress,
        request: Arc<RpcMessage>,
        call: Option<Arc<ResponseTask>>,
    ) {
        match address {
            RpcAddress::Ipv4(addr) => self.call_ip(addr, &request, call, false, false),
            RpcAddress::Group(group) => self.call_group(&group, request, call),
            RpcAddress::Uri(uri) => self.call_uri(&uri, request, call),
            RpcAddress::Invalid => panic!("cannot call an invalid address"),
        }
    }

    fn call_group(
        &self,
        group: &Arc<GroupAddress>,
        request: Arc<RpcMessage>,
        call: Option<Arc<ResponseTask>>,
    ) {
        let spec = request.local_code().spec();
        match spec.grpc_mode() {
            GrpcMode::ToLeader => self.call_ip(group.possible_leader(), &request, call, false, false),
            GrpcMode::ToAny => self.call_ip(group.random_member(), &request, call, false, false),
            GrpcMode::ToAll => panic!("group broadcast is not implemented for {}", spec.name()),
        }
    }

    fn call_uri(
        &self,
        uri: &Arc<UriAddress>,
        request: Arc<RpcMessage>,
        call: Option<Arc<ResponseTask>>,
    ) {
        let Some(resolver) = uri.resolver() else {
            error!(uri = uri.uri(), "call failed: no partition resolver attached");
            if let Some(call) = call {
                call.enqueue(ErrorCode::ServiceNotFound, None);
            }
            return;
        };

        if let Some(call) = &call {
            self.install_uri_retry(call);
        }

        let (partition_hash, timeout) = {
            let hdr = request.header();
            (hdr.partition_hash, hdr.timeout)
        };
        let engine = self.weak();
        tokio::spawn(async move {
            match resolver.resolve(partition_hash, timeout).await {
                Ok(result) => {
                    {
                        let mut hdr = request.header();
                        if hdr.gpid != result.gpid {
                            assert!(
                                hdr.gpid.is_zero(),
                                "request already bound to partition {} but resolved to {}",
                                hdr.gpid,
                                result.gpid
                            );
                            hdr.gpid = result.gpid;
                            if hdr.thread_hash == 0 {
                                hdr.thread_hash = result.gpid.thread_hash();
                            }
                        }
                    }
                    if let Some(engine) = engine.upgrade() {
                        engine.call_address(result.address, request, call);
                    }
                }
                Err(err) => {
                    if let Some(call) = call {
                        call.enqueue(err, None);
                    }
                }
            }
        });
    }

    /// Wrap the pending call's handler so partition access failures turn
    /// into bounded-backoff retries until the original deadline.
    ///
    /// On retry the shim restores the user's callback before re-issuing,
    /// so every attempt starts with a clean callback chain.
    fn install_uri_retry(&self, call: &Arc<ResponseTask>) {
        let deadline = Instant::now() + call.request().header().timeout;
        let Some(user_handler) = call.take_handler() else {
            return;
        };
        let engine = self.weak();
        let task = Arc::downgrade(call);
        let metrics = Arc::clone(&self.metrics);

        call.replace_handler(Box::new(move |mut err, request, reply| {
            let gpid = request.header().gpid;
            let transient = !err.is_ok()
                && !matches!(
                    err,
                    ErrorCode::HandlerNotFound
                        | ErrorCode::AppNotExist
                        | ErrorCode::OperationDisabled
                );
            if transient && !gpid.is_zero() {
                let server = request.header().server_address.clone();
                let resolver = server.uri().and_then(|u| u.resolver());
                if let Some(resolver) = resolver {
                    resolver.on_access_failure(gpid.partition_index, err);

                    let now = Instant::now();
                    let gap =
                        Duration::from_millis((8u64 << request.send_retry_count().min(32)).min(1000));
                    if now + gap < deadline {
                        if let (Some(task), Some(engine)) = (task.upgrade(), engine.upgrade()) {
                            request.bump_send_retry_count();
                            request.header().timeout = deadline - now - gap;
                            task.replace_handler(user_handler);
                            assert!(task.set_retry(), "pending call must be running to retry");
                            metrics.uri_retries_total.inc();

                            let retry_request = Arc::clone(&request);
                            tokio::spawn(async move {
                                tokio::time::sleep(gap).await;
                                engine.call(retry_request, Some(task));
                            });
                            return;
                        }
                    } else {
                        warn!(
                            %err,
                            trace_id = %trace_hex(request.trace_id()),
                            "service access failed with no budget left, reporting timeout"
                        );
                        err = ErrorCode::Timeout;
                    }
                }
            }
            user_handler(err, request, reply);
        }));
    }

    /// Send a request to a concrete endpoint, registering the pending call
    /// with the matcher first when one is attached.
    ///
    /// `reset_id` gives the request a fresh identity (redirect re-issue);
    /// `set_forwarded` marks it as travelling on behalf of another node.
    pub fn call_ip(
        &self,
        addr: SocketAddrV4,
        request: &Arc<RpcMessage>,
        call: Option<Arc<ResponseTask>>,
        reset_id: bool,
        set_forwarded: bool,
    ) {
        assert!(
            addr.port() > MAX_CLIENT_PORT,
            "call target {addr} must have a server-range port"
        );
        assert!(
            !request.header().from_address.is_invalid(),
            "from address must be stamped before transport send"
        );

        // A redirect can re-issue a request still queued on a session from
        // the previous attempt; detach it first.
        if let Some(session) = request.session() {
            session.cancel(request);
        }

        request.header().to_address = RpcAddress::Ipv4(addr);

        let spec = request.local_code().spec();
        let channel = spec.rpc_call_channel();
        let format = request.hdr_format();
        let net = self.client_net(format, channel).unwrap_or_else(|| {
            panic!(
                "client network not present for channel '{}' with format '{}' used by rpc {}",
                channel.as_str(),
                format.as_str(),
                request.rpc_name()
            )
        });

        if reset_id {
            request.reset_id();
        }
        if set_forwarded {
            request.set_forwarded(true);
        }

        debug!(
            name = request.rpc_name(),
            remote = %addr,
            id = request.id(),
            trace_id = %trace_hex(request.trace_id()),
            "sending request"
        );

        if !spec.on_rpc_call.execute(request, true) {
            debug!(
                name = request.rpc_name(),
                trace_id = %trace_hex(request.trace_id()),
                "rpc request dropped (fault inject)"
            );
            self.metrics.dropped_messages_total.inc();
            net.inject_drop_message(request, true);
            if let Some(call) = call {
                let timeout = request.header().timeout;
                call.set_delay(timeout);
                call.enqueue(ErrorCode::Timeout, None);
            }
            return;
        }

        if let Some(call) = call {
            self.matcher.on_call(request, call);
        }
        net.send_message(Arc::clone(request));
    }

    /// Inbound request from a transport.
    #[instrument(skip_all, fields(name = %msg.rpc_name()))]
    pub fn on_recv_request(&self, net: &dyn Network, msg: Arc<RpcMessage>, delay: Duration) {
        if !self.is_serving() {
            warn!(
                from = %msg.header().from_address,
                trace_id = %trace_hex(msg.trace_id()),
                "dropping request received while not serving"
            );
            return;
        }

        let code = msg.resolve_code();
        if !code.is_valid() {
            warn!(
                from = %msg.header().from_address,
                trace_id = %trace_hex(msg.trace_id()),
                "received request with unknown rpc name"
            );
            let response = msg.create_response();
            self.reply(response, ErrorCode::HandlerNotFound);
            return;
        }

        // Requests bound to a hosted partition go to the interceptor
        // first; everything else falls through to the handler registry.
        let mut task = None;
        if msg.header().gpid.app_id > 0 {
            let interceptor = self.interceptor.read().clone();
            if let Some(interceptor) = interceptor {
                task = interceptor.intercept(&msg);
            }
        }
        let task = match task {
            Some(task) => Some(task),
            None => self.dispatcher.on_request(&msg),
        };

        match task {
            Some(task) => {
                let spec = code.spec();
                if spec.on_rpc_request_enqueue.execute(&task, true) {
                    // Keep a fault-injected delay if one was already set.
                    if task.delay().is_zero() {
                        task.set_delay(delay);
                    }
                    self.metrics.requests_dispatched_total.inc();
                    task.enqueue();
                } else {
                    debug!(
                        trace_id = %trace_hex(msg.trace_id()),
                        "rpc request dropped (fault inject)"
                    );
                    self.metrics.dropped_messages_total.inc();
                    net.inject_drop_message(&msg, false);
                }
            }
            None => {
                warn!(
                    from = %msg.header().from_address,
                    trace_id = %trace_hex(msg.trace_id()),
                    "no handler registered for rpc"
                );
                let response = msg.create_response();
                self.reply(response, ErrorCode::HandlerNotFound);
            }
        }
    }

    /// Inbound reply from a transport; `None` signals the transport lost
    /// the session before any reply arrived.
    pub fn on_recv_reply(
        &self,
        net: &dyn Network,
        id: u64,
        reply: Option<Arc<RpcMessage>>,
        delay: Duration,
    ) -> bool {
        self.matcher.on_recv_reply(net, id, reply, delay)
    }

    /// Send a response back to the caller.
    ///
    /// Routing: the inbound session when one exists and the response is
    /// not forwarded; the client transport matching the response's header
    /// format when it is; the serving transport on the response's own port
    /// for sessionless (datagram) traffic.
    pub fn reply(&self, response: Arc<RpcMessage>, err: ErrorCode) {
        let session = response.session();
        // A message nobody can route is released quietly, without firing
        // reply hooks: interceptors must not account a reply never sent.
        if session.is_none() && response.header().to_address.is_invalid() {
            debug!(
                name = response.rpc_name(),
                trace_id = %trace_hex(response.trace_id()),
                "rpc reply dropped (invalid to-address)"
            );
            return;
        }

        response.header().error = err;

        let spec = response.local_code().try_spec();
        let no_fail = match &spec {
            Some(spec) => spec.on_rpc_reply.execute(&response, true),
            None => true,
        };

        match session {
            Some(session) => {
                if !response.is_forwarded() {
                    if no_fail {
                        session.send_message(response);
                    } else {
                        self.metrics.dropped_messages_total.inc();
                        session.net().inject_drop_message(&response, true);
                    }
                } else {
                    // The original session belongs to the node that
                    // forwarded the request; answer the real caller over a
                    // client transport instead.
                    assert!(
                        response.header().to_address.port() > MAX_CLIENT_PORT,
                        "forwarded response needs a server-range target"
                    );
                    let channel = spec
                        .as_ref()
                        .map(|s| s.rpc_call_channel())
                        .unwrap_or(RpcChannel::Tcp);
                    let net = self
                        .client_net(response.hdr_format(), channel)
                        .unwrap_or_else(|| {
                            panic!(
                                "client network not present for channel '{}' with format '{}'",
                                channel.as_str(),
                                response.hdr_format().as_str()
                            )
                        });
                    if no_fail {
                        net.send_message(response);
                    } else {
                        self.metrics.dropped_messages_total.inc();
                        net.inject_drop_message(&response, true);
                    }
                }
            }
            None => {
                let port = response.header().from_address.port();
                let channel = spec
                    .as_ref()
                    .map(|s| s.rpc_call_channel())
                    .unwrap_or(RpcChannel::Tcp);
                let net = self.server_net(port, channel).unwrap_or_else(|| {
                    panic!(
                        "server network not present on port {port} channel '{}'",
                        channel.as_str()
                    )
                });
                if no_fail {
                    net.send_message(response);
                } else {
                    self.metrics.dropped_messages_total.inc();
                    net.inject_drop_message(&response, true);
                }
            }
        }
    }

    /// Hand an inbound request over to another node.
    ///
    /// A request from a pure client cannot be pushed anywhere on its
    /// behalf; the engine bounces a redirect carrying the target address
    /// back over the session the client opened instead.
    pub fn forward(&self, request: &Arc<RpcMessage>, address: RpcAddress) {
        assert!(request.is_request(), "only requests can be forwarded");
        assert!(
            request.is_forward_supported(),
            "rpc {} does not support forwarding",
            request.rpc_name()
        );
        assert!(
            address != self.primary_address(),
            "cannot forward {} to the local node",
            request.rpc_name()
        );
        let target = address
            .ipv4()
            .expect("forward target must be a concrete endpoint");

        self.metrics.forwards_total.inc();

        if request.header().from_address.port() <= MAX_CLIENT_PORT {
            let response = request.create_response_with_body(encode_redirect_address(target));
            self.reply(response, ErrorCode::ForwardToOthers);
        } else {
            let copy = request.copy();
            self.call_ip(target, &copy, None, false, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerNetworkConfig;

    struct NullNetwork;

    impl Network for NullNetwork {
        fn start(
            &self,
            _channel: RpcChannel,
            _port: u16,
            _client_only: bool,
        ) -> Result<(), EngineError> {
            Ok(())
        }

        fn address(&self) -> RpcAddress {
            RpcAddress::Ipv4(SocketAddrV4::new(std::net::Ipv4Addr::new(127, 0, 0, 1), 0))
        }

        fn send_message(&self, _msg: Arc<RpcMessage>) {}

        fn inject_drop_message(&self, _msg: &Arc<RpcMessage>, _is_send: bool) {}
    }

    fn null_config(factory: &str) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.client_networks[0].factory_name = factory.to_string();
        config.server_networks = vec![ServerNetworkConfig {
            port: 7000,
            channel: RpcChannel::Tcp,
            factory_name: factory.to_string(),
            message_buffer_block_size: 65536,
        }];
        config
    }

    #[tokio::test]
    async fn start_builds_transports_and_primary_address() {
        let engine = RpcEngine::new(null_config("null"));
        engine
            .network_factories()
            .register_provider("null", |_| Arc::new(NullNetwork));

        engine.start().unwrap();
        assert!(engine.is_running());
        assert!(!engine.is_serving());

        for format in HeaderFormat::ALL {
            assert!(engine.client_net(format, RpcChannel::Tcp).is_some());
            assert!(engine.client_net(format, RpcChannel::Udp).is_none());
        }
        assert!(engine.server_net(7000, RpcChannel::Tcp).is_some());
        assert!(engine.server_net(7001, RpcChannel::Tcp).is_none());
        assert_eq!(engine.primary_address().port(), 7000);
    }

    #[tokio::test]
    async fn starting_twice_is_an_error() {
        let engine = RpcEngine::new(null_config("null"));
        engine
            .network_factories()
            .register_provider("null", |_| Arc::new(NullNetwork));

        engine.start().unwrap();
        assert!(matches!(engine.start(), Err(EngineError::AlreadyRunning)));
    }

    #[tokio::test]
    async fn unknown_factory_fails_startup() {
        let engine = RpcEngine::new(null_config("missing"));
        assert!(matches!(
            engine.start(),
            Err(EngineError::UnknownFactory { .. })
        ));
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn aspects_wrap_in_declared_order() {
        struct TaggingAspect {
            inner: Arc<dyn Network>,
            tag: &'static str,
            seen: Arc<parking_lot::Mutex<Vec<&'static str>>>,
        }

        impl Network for TaggingAspect {
            fn start(
                &self,
                channel: RpcChannel,
                port: u16,
                client_only: bool,
            ) -> Result<(), EngineError> {
                self.inner.start(channel, port, client_only)
            }

            fn address(&self) -> RpcAddress {
                self.inner.address()
            }

            fn send_message(&self, msg: Arc<RpcMessage>) {
                self.seen.lock().push(self.tag);
                self.inner.send_message(msg);
            }

            fn inject_drop_message(&self, msg: &Arc<RpcMessage>, is_send: bool) {
                self.inner.inject_drop_message(msg, is_send);
            }
        }

        let seen: Arc<parking_lot::Mutex<Vec<&'static str>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut config = null_config("null");
        config.network_aspects = vec!["outer".to_string()];
        let engine = RpcEngine::new(config);
        engine
            .network_factories()
            .register_provider("null", |_| Arc::new(NullNetwork));
        let seen2 = Arc::clone(&seen);
        engine
            .network_factories()
            .register_aspect("outer", move |_, inner| {
                Arc::new(TaggingAspect {
                    inner,
                    tag: "outer",
                    seen: Arc::clone(&seen2),
                })
            });

        engine.start().unwrap();

        let net = engine
            .client_net(HeaderFormat::Native, RpcChannel::Tcp)
            .unwrap();
        let msg = RpcMessage::new_request(
            TaskCode::register("RPC_TEST_ENGINE_ASPECT"),
            RpcAddress::Invalid,
            Duration::from_secs(1),
            bytes::Bytes::new(),
        );
        net.send_message(msg);
        assert_eq!(seen.lock().as_slice(), ["outer"]);
    }
}
