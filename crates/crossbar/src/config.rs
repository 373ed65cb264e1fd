use std::time::Duration;

use crate::error::EngineError;
use crate::network::RpcChannel;
use crate::types::MAX_CLIENT_PORT;

/// One outbound transport: the engine instantiates it once per header
/// format over this channel.
#[derive(Debug, Clone)]
pub struct ClientNetworkConfig {
    pub channel: RpcChannel,
    /// Registered provider name, see
    /// [`NetworkFactoryRegistry`](crate::network::NetworkFactoryRegistry).
    pub factory_name: String,
    pub message_buffer_block_size: usize,
}

/// One serving transport bound to a concrete port.
#[derive(Debug, Clone)]
pub struct ServerNetworkConfig {
    pub port: u16,
    pub channel: RpcChannel,
    pub factory_name: String,
    pub message_buffer_block_size: usize,
}

/// Configuration for the RPC engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Application id, used as the default client bind hint.
    pub app_id: u32,
    /// Port peers use to reach this node. A value at or below the pure
    /// client boundary marks a node that never serves.
    pub primary_port: u16,
    /// Outbound transports, one entry per channel.
    pub client_networks: Vec<ClientNetworkConfig>,
    /// Serving transports, one entry per (port, channel).
    pub server_networks: Vec<ServerNetworkConfig>,
    /// Aspect decorators applied around every transport, in order.
    pub network_aspects: Vec<String>,
    /// Whether a redirect re-issues the request with its original timeout
    /// (`true`) or only the remaining budget (`false`).
    pub redirect_keeps_original_timeout: bool,
    /// Default timeout for requests that do not set one.
    pub default_rpc_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            app_id: 1,
            primary_port: 7000,
            client_networks: vec![ClientNetworkConfig {
                channel: RpcChannel::Tcp,
                factory_name: "tcp".to_string(),
                message_buffer_block_size: 65536,
            }],
            server_networks: Vec::new(),
            network_aspects: Vec::new(),
            redirect_keeps_original_timeout: true,
            default_rpc_timeout: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    /// Validate configuration values.
    ///
    /// Checks:
    /// - at least one client transport, including one on TCP (the engine's
    ///   primary address comes from it)
    /// - at most one client transport per channel
    /// - server ports above the pure-client boundary, no duplicate
    ///   (port, channel) pairs
    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |reason: String| EngineError::InvalidConfig { reason };

        if self.client_networks.is_empty() {
            return Err(invalid("no client networks configured".into()));
        }
        if !self
            .client_networks
            .iter()
            .any(|c| c.channel == RpcChannel::Tcp)
        {
            return Err(invalid(
                "a TCP client network is required for the primary address".into(),
            ));
        }
        for (i, conf) in self.client_networks.iter().enumerate() {
            if self.client_networks[..i]
                .iter()
                .any(|c| c.channel == conf.channel)
            {
                return Err(invalid(format!(
                    "duplicate client network for channel {}",
                    conf.channel.as_str()
                )));
            }
        }
        for (i, conf) in self.server_networks.iter().enumerate() {
            if conf.port <= MAX_CLIENT_PORT {
                return Err(invalid(format!(
                    "server port {} is inside the pure-client range",
                    conf.port
                )));
            }
            if self.server_networks[..i]
                .iter()
                .any(|c| c.port == conf.port && c.channel == conf.channel)
            {
                return Err(invalid(format!(
                    "duplicate server network for port {} channel {}",
                    conf.port,
                    conf.channel.as_str()
                )));
            }
        }
        Ok(())
    }
}
