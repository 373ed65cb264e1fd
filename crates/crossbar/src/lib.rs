//! Client-side RPC engine core.
//!
//! `crossbar` dispatches outbound requests, matches inbound replies to
//! pending calls, manages per-call timeouts and single-shot resends,
//! resolves multi-hop addressing (URI to partition to endpoint, group to
//! leader or any member), and dispatches inbound requests to registered
//! handlers. Transports, the task executor and partition resolvers are
//! collaborators behind traits; the engine never frames bytes itself.
//!
//! # Example
//!
//! ```ignore
//! use crossbar::prelude::*;
//!
//! let engine = RpcEngine::new(EngineConfig::default());
//! engine.network_factories().register_provider("tcp", my_tcp_factory);
//! engine.start()?;
//!
//! let code = TaskCode::register("RPC_ECHO");
//! engine.register_rpc_handler(code, "Echo", Arc::new(|msg| { /* ... */ }));
//! engine.start_serving();
//!
//! let request = RpcMessage::new_request(code, server, timeout, body);
//! engine.call(request, Some(call));
//! ```

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod matcher;
pub mod message;
pub mod metrics;
pub mod network;
pub mod resolver;
pub mod task;
pub mod task_code;
pub mod testing;
pub mod types;

/// Prelude module for convenient glob imports.
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::engine::RpcEngine;
    pub use crate::error::{EngineError, ErrorCode};
    pub use crate::message::RpcMessage;
    pub use crate::resolver::{PartitionResolver, ResolveResult};
    pub use crate::task::{RequestHandler, ResponseTask};
    pub use crate::task_code::{GrpcMode, TaskCode};
    pub use crate::types::{Gpid, GroupAddress, RpcAddress, UriAddress};
}
