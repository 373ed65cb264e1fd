//! Task codes: compact integers identifying a logical operation, each
//! carrying per-operation policy and interceptor hooks.
//!
//! Codes are registered by name in a process-global registry; registering
//! the same name twice returns the same code, so libraries can declare
//! their codes independently of initialization order.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::message::RpcMessage;
use crate::network::{HeaderFormat, RpcChannel};
use crate::task::{RequestTask, ResponseTask};

/// Compact identity of a logical RPC operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskCode(u32);

/// Target-selection policy for group-addressed calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GrpcMode {
    /// Direct the call at the presumed leader; reply handling keeps the
    /// hint current when the group allows it.
    #[default]
    ToLeader,
    /// Pick a uniformly random member.
    ToAny,
    /// Broadcast to every member. Not implemented.
    ToAll,
}

/// Mutable per-operation policy.
#[derive(Debug, Clone)]
pub struct TaskPolicy {
    pub grpc_mode: GrpcMode,
    pub rpc_call_channel: RpcChannel,
    pub rpc_call_header_format: HeaderFormat,
    /// Resend the request once after this long without a reply, provided
    /// the overall timeout has budget left. Zero disables resend.
    pub rpc_request_resend_timeout: Duration,
}

impl Default for TaskPolicy {
    fn default() -> Self {
        Self {
            grpc_mode: GrpcMode::default(),
            rpc_call_channel: RpcChannel::Tcp,
            rpc_call_header_format: HeaderFormat::Native,
            rpc_request_resend_timeout: Duration::ZERO,
        }
    }
}

/// A list of interceptors invoked at a defined moment of a call's life.
///
/// Every advice returns accept (`true`) or deny (`false`); the join point
/// accepts only when all advice accept. An empty list returns the default.
pub struct JoinPoint<T: ?Sized> {
    advice: RwLock<Vec<Box<dyn Fn(&T) -> bool + Send + Sync>>>,
}

impl<T: ?Sized> JoinPoint<T> {
    pub fn new() -> Self {
        Self {
            advice: RwLock::new(Vec::new()),
        }
    }

    pub fn put(&self, advice: impl Fn(&T) -> bool + Send + Sync + 'static) {
        self.advice.write().push(Box::new(advice));
    }

    pub fn clear(&self) {
        self.advice.write().clear();
    }

    pub fn execute(&self, arg: &T, default: bool) -> bool {
        let advice = self.advice.read();
        if advice.is_empty() {
            return default;
        }
        advice.iter().all(|f| f(arg))
    }
}

impl<T: ?Sized> Default for JoinPoint<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-code policy and hooks, shared by every subsystem that touches the
/// operation.
pub struct TaskSpec {
    code: TaskCode,
    name: String,
    policy: RwLock<TaskPolicy>,

    /// Fired when the dispatcher materializes a request task.
    pub on_task_create: JoinPoint<RequestTask>,
    /// Fired before an outbound request reaches the transport; deny drops
    /// the request (fault injection).
    pub on_rpc_call: JoinPoint<RpcMessage>,
    /// Fired before an inbound request task is enqueued; deny drops it.
    pub on_rpc_request_enqueue: JoinPoint<RequestTask>,
    /// Fired before a completion is delivered to a pending call; deny
    /// drops the reply.
    pub on_rpc_response_enqueue: JoinPoint<ResponseTask>,
    /// Fired before an outbound response reaches the transport.
    pub on_rpc_reply: JoinPoint<RpcMessage>,
}

impl TaskSpec {
    fn new(code: TaskCode, name: String) -> Self {
        Self {
            code,
            name,
            policy: RwLock::new(TaskPolicy::default()),
            on_task_create: JoinPoint::new(),
            on_rpc_call: JoinPoint::new(),
            on_rpc_request_enqueue: JoinPoint::new(),
            on_rpc_response_enqueue: JoinPoint::new(),
            on_rpc_reply: JoinPoint::new(),
        }
    }

    pub fn code(&self) -> TaskCode {
        self.code
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn grpc_mode(&self) -> GrpcMode {
        self.policy.read().grpc_mode
    }

    pub fn set_grpc_mode(&self, mode: GrpcMode) {
        self.policy.write().grpc_mode = mode;
    }

    pub fn rpc_call_channel(&self) -> RpcChannel {
        self.policy.read().rpc_call_channel
    }

    pub fn set_rpc_call_channel(&self, channel: RpcChannel) {
        self.policy.write().rpc_call_channel = channel;
    }

    pub fn rpc_call_header_format(&self) -> HeaderFormat {
        self.policy.read().rpc_call_header_format
    }

    pub fn set_rpc_call_header_format(&self, format: HeaderFormat) {
        self.policy.write().rpc_call_header_format = format;
    }

    pub fn rpc_request_resend_timeout(&self) -> Duration {
        self.policy.read().rpc_request_resend_timeout
    }

    pub fn set_rpc_request_resend_timeout(&self, timeout: Duration) {
        self.policy.write().rpc_request_resend_timeout = timeout;
    }
}

struct Registry {
    by_name: RwLock<HashMap<String, TaskCode>>,
    specs: RwLock<Vec<Arc<TaskSpec>>>,
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Registry {
        by_name: RwLock::new(HashMap::new()),
        specs: RwLock::new(Vec::new()),
    })
}

impl TaskCode {
    pub const INVALID: TaskCode = TaskCode(u32::MAX);

    /// Register (or look up) the code for `name`.
    pub fn register(name: &str) -> TaskCode {
        let reg = registry();
        let mut by_name = reg.by_name.write();
        if let Some(code) = by_name.get(name) {
            return *code;
        }
        let mut specs = reg.specs.write();
        let code = TaskCode(specs.len() as u32);
        specs.push(Arc::new(TaskSpec::new(code, name.to_string())));
        by_name.insert(name.to_string(), code);
        code
    }

    pub fn find(name: &str) -> Option<TaskCode> {
        registry().by_name.read().get(name).copied()
    }

    pub fn is_valid(&self) -> bool {
        *self != TaskCode::INVALID
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    pub(crate) fn from_raw(raw: u32) -> TaskCode {
        TaskCode(raw)
    }

    /// Number of codes registered so far.
    pub fn registered_count() -> usize {
        registry().specs.read().len()
    }

    pub fn try_spec(&self) -> Option<Arc<TaskSpec>> {
        registry().specs.read().get(self.0 as usize).cloned()
    }

    /// The spec for this code.
    ///
    /// # Panics
    ///
    /// Panics on `INVALID` or an unregistered code; every message handed
    /// to the engine carries a registered code.
    pub fn spec(&self) -> Arc<TaskSpec> {
        self.try_spec()
            .unwrap_or_else(|| panic!("task code {} is not registered", self.0))
    }
}

impl fmt::Display for TaskCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_spec() {
            Some(spec) => f.write_str(spec.name()),
            None => f.write_str("TASK_CODE_INVALID"),
        }
    }
}
