//! Transport collaborator traits and the factory chain the engine builds
//! transports through.
//!
//! The engine never frames or parses bytes itself; it owns transports per
//! `(header format, channel)` for outbound calls and per `(port, channel)`
//! for serving, and transports feed inbound traffic back through
//! `RpcEngine::on_recv_request` / `RpcEngine::on_recv_reply`.

use dashmap::DashMap;
use std::sync::{Arc, Weak};

use crate::engine::RpcEngine;
use crate::error::EngineError;
use crate::message::RpcMessage;
use crate::types::RpcAddress;

/// Delivery channel a transport speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RpcChannel {
    #[default]
    Tcp,
    Udp,
}

impl RpcChannel {
    pub const COUNT: usize = 2;
    pub const ALL: [RpcChannel; Self::COUNT] = [RpcChannel::Tcp, RpcChannel::Udp];

    pub fn index(&self) -> usize {
        match self {
            RpcChannel::Tcp => 0,
            RpcChannel::Udp => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RpcChannel::Tcp => "RPC_CHANNEL_TCP",
            RpcChannel::Udp => "RPC_CHANNEL_UDP",
        }
    }
}

/// Wire header dialect a transport parses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum HeaderFormat {
    #[default]
    Native,
    Http,
}

impl HeaderFormat {
    pub const COUNT: usize = 2;
    pub const ALL: [HeaderFormat; Self::COUNT] = [HeaderFormat::Native, HeaderFormat::Http];

    pub fn index(&self) -> usize {
        match self {
            HeaderFormat::Native => 0,
            HeaderFormat::Http => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HeaderFormat::Native => "NET_HDR_NATIVE",
            HeaderFormat::Http => "NET_HDR_HTTP",
        }
    }
}

/// A framed message transport.
///
/// `send_message` must be non-blocking or short-blocking; it takes shared
/// ownership of the message for as long as it is queued.
pub trait Network: Send + Sync {
    fn start(&self, channel: RpcChannel, port: u16, client_only: bool) -> Result<(), EngineError>;

    /// The address this transport speaks from.
    fn address(&self) -> RpcAddress;

    fn send_message(&self, msg: Arc<RpcMessage>);

    /// Failure-model accounting for a message dropped by fault injection,
    /// on the send (`is_send`) or receive side.
    fn inject_drop_message(&self, msg: &Arc<RpcMessage>, is_send: bool);

    /// Configure the parser for the client header dialect.
    fn reset_parser_attr(&self, _client_hdr_format: HeaderFormat, _buffer_block_size: usize) {}
}

/// One connection of a connection-oriented transport.
///
/// Inbound requests carry a weak handle to their session so responses can
/// go back over the same connection.
pub trait RpcSession: Send + Sync {
    fn send_message(&self, msg: Arc<RpcMessage>);

    /// Detach a message from this session's sending queue, if it is still
    /// queued. Idempotent.
    fn cancel(&self, msg: &Arc<RpcMessage>);

    fn net(&self) -> Arc<dyn Network>;
}

pub type NetworkProviderFn = Arc<dyn Fn(Weak<RpcEngine>) -> Arc<dyn Network> + Send + Sync>;
pub type NetworkAspectFn =
    Arc<dyn Fn(Weak<RpcEngine>, Arc<dyn Network>) -> Arc<dyn Network> + Send + Sync>;

/// Named transport constructors: main providers plus aspect decorators
/// that wrap a provider to add cross-cutting behavior (tracing, fault
/// injection) without touching the send path itself.
pub struct NetworkFactoryRegistry {
    providers: DashMap<String, NetworkProviderFn>,
    aspects: DashMap<String, NetworkAspectFn>,
}

impl NetworkFactoryRegistry {
    pub fn new() -> Self {
        Self {
            providers: DashMap::new(),
            aspects: DashMap::new(),
        }
    }

    pub fn register_provider(
        &self,
        name: impl Into<String>,
        factory: impl Fn(Weak<RpcEngine>) -> Arc<dyn Network> + Send + Sync + 'static,
    ) {
        self.providers.insert(name.into(), Arc::new(factory));
    }

    pub fn register_aspect(
        &self,
        name: impl Into<String>,
        factory: impl Fn(Weak<RpcEngine>, Arc<dyn Network>) -> Arc<dyn Network> + Send + Sync + 'static,
    ) {
        self.aspects.insert(name.into(), Arc::new(factory));
    }

    pub fn create_provider(
        &self,
        name: &str,
        engine: Weak<RpcEngine>,
    ) -> Result<Arc<dyn Network>, EngineError> {
        let factory = self
            .providers
            .get(name)
            .map(|f| Arc::clone(&f))
            .ok_or_else(|| EngineError::UnknownFactory { name: name.into() })?;
        Ok(factory(engine))
    }

    pub fn wrap_aspect(
        &self,
        name: &str,
        engine: Weak<RpcEngine>,
        inner: Arc<dyn Network>,
    ) -> Result<Arc<dyn Network>, EngineError> {
        let factory = self
            .aspects
            .get(name)
            .map(|f| Arc::clone(&f))
            .ok_or_else(|| EngineError::UnknownAspect { name: name.into() })?;
        Ok(factory(engine, inner))
    }
}

impl Default for NetworkFactoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_indices_cover_all_variants() {
        for (i, channel) in RpcChannel::ALL.iter().enumerate() {
            assert_eq!(channel.index(), i);
        }
        for (i, format) in HeaderFormat::ALL.iter().enumerate() {
            assert_eq!(format.index(), i);
        }
    }

    #[test]
    fn unknown_factory_names_error() {
        let registry = NetworkFactoryRegistry::new();
        assert!(matches!(
            registry.create_provider("nope", Weak::new()),
            Err(EngineError::UnknownFactory { .. })
        ));
    }
}
