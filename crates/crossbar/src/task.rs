//! Executor-facing task types: the pending call a reply or timeout
//! completes, and the server-side unit of work a dispatched request
//! becomes.
//!
//! Completions never run on the I/O path; `enqueue` hands them to the
//! runtime, optionally after a delay.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::ErrorCode;
use crate::message::RpcMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Ready = 0,
    Running = 1,
    Finished = 2,
    Cancelled = 3,
}

impl TaskState {
    fn from_u8(raw: u8) -> TaskState {
        match raw {
            0 => TaskState::Ready,
            1 => TaskState::Running,
            2 => TaskState::Finished,
            _ => TaskState::Cancelled,
        }
    }
}

/// Completion callback of a pending call: `(error, request, reply)`.
pub type ResponseHandler =
    Box<dyn FnOnce(ErrorCode, Arc<RpcMessage>, Option<Arc<RpcMessage>>) + Send + 'static>;

/// A pending call awaiting its reply.
///
/// The matcher owns the task while the request is in flight; exactly one
/// of reply delivery, timeout or redirect completes it. The handler slot
/// is replaceable so the URI retry layer can wrap and later restore the
/// user's callback.
pub struct ResponseTask {
    request: Arc<RpcMessage>,
    state: AtomicU8,
    delay_ms: AtomicU64,
    handler: Mutex<Option<ResponseHandler>>,
}

impl ResponseTask {
    pub fn new(request: Arc<RpcMessage>, handler: ResponseHandler) -> Arc<Self> {
        Arc::new(Self {
            request,
            state: AtomicU8::new(TaskState::Ready as u8),
            delay_ms: AtomicU64::new(0),
            handler: Mutex::new(Some(handler)),
        })
    }

    pub fn request(&self) -> &Arc<RpcMessage> {
        &self.request
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Abandon the call. Only a still-pending task can be cancelled; the
    /// matcher reads the state to suppress resends of cancelled calls.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(
                TaskState::Ready as u8,
                TaskState::Cancelled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Re-arm a task whose handler is currently running so it can be
    /// issued again with the same identity. Used by the URI retry layer.
    pub fn set_retry(&self) -> bool {
        self.state
            .compare_exchange(
                TaskState::Running as u8,
                TaskState::Ready as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn replace_handler(&self, handler: ResponseHandler) {
        *self.handler.lock() = Some(handler);
    }

    pub fn take_handler(&self) -> Option<ResponseHandler> {
        self.handler.lock().take()
    }

    /// Deliver a completion.
    ///
    /// Returns `false` when the per-code `on_rpc_response_enqueue` join
    /// point denies delivery (fault injection); the caller is responsible
    /// for drop accounting. A task that is no longer `Ready` swallows the
    /// completion: cancellation and double-completion races end here.
    pub fn enqueue(self: &Arc<Self>, err: ErrorCode, reply: Option<Arc<RpcMessage>>) -> bool {
        if let Some(spec) = self.request.local_code().try_spec() {
            if !spec.on_rpc_response_enqueue.execute(self, true) {
                return false;
            }
        }

        if self
            .state
            .compare_exchange(
                TaskState::Ready as u8,
                TaskState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return true;
        }

        let delay = Duration::from_millis(self.delay_ms.swap(0, Ordering::Relaxed));
        let task = Arc::clone(self);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Some(handler) = task.take_handler() {
                handler(err, Arc::clone(&task.request), reply);
            }
            // The handler may have re-armed the task for a retry; only an
            // un-retried run finishes it.
            let _ = task.state.compare_exchange(
                TaskState::Running as u8,
                TaskState::Finished as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        });
        true
    }
}

/// Server-side unit of work: an inbound request bound to its handler.
pub type RequestHandler = Arc<dyn Fn(Arc<RpcMessage>) + Send + Sync>;

pub struct RequestTask {
    request: Arc<RpcMessage>,
    handler: RequestHandler,
    delay_ms: AtomicU64,
}

impl RequestTask {
    pub fn new(request: Arc<RpcMessage>, handler: RequestHandler) -> Self {
        Self {
            request,
            handler,
            delay_ms: AtomicU64::new(0),
        }
    }

    pub fn request(&self) -> &Arc<RpcMessage> {
        &self.request
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms.load(Ordering::Relaxed))
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    /// Hand the task to the runtime, honoring the delay hint.
    pub fn enqueue(self) {
        tokio::spawn(async move {
            let delay = self.delay();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            (self.handler)(Arc::clone(&self.request));
        });
    }
}
