//! Handler registry for inbound requests.
//!
//! Handlers are indexed twice: a name index covering both the code's
//! canonical name and the registered alias, and a dense per-code slot
//! vector whose slots carry their own lock, so the hot code-keyed lookup
//! never touches the name index lock.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::message::RpcMessage;
use crate::task::{RequestHandler, RequestTask};
use crate::task_code::TaskCode;

struct HandlerEntry {
    code: TaskCode,
    extra_name: String,
    handler: RequestHandler,
}

type HandlerSlot = Arc<RwLock<Option<Arc<HandlerEntry>>>>;

pub struct ServerDispatcher {
    name_index: RwLock<HashMap<String, Arc<HandlerEntry>>>,
    code_slots: RwLock<Vec<HandlerSlot>>,
}

impl ServerDispatcher {
    pub fn new() -> Self {
        Self {
            name_index: RwLock::new(HashMap::new()),
            code_slots: RwLock::new(Vec::new()),
        }
    }

    fn slot(&self, code: TaskCode) -> HandlerSlot {
        let index = code.raw() as usize;
        {
            let slots = self.code_slots.read();
            if let Some(slot) = slots.get(index) {
                return Arc::clone(slot);
            }
        }
        let mut slots = self.code_slots.write();
        while slots.len() <= index {
            slots.push(Arc::new(RwLock::new(None)));
        }
        Arc::clone(&slots[index])
    }

    /// Install a handler under its code's name and an extra alias.
    ///
    /// # Panics
    ///
    /// Panics when either name is already registered; conflicting handler
    /// registrations are a programming error.
    pub fn register(&self, code: TaskCode, extra_name: &str, handler: RequestHandler) -> bool {
        let code_name = code.spec().name().to_string();
        let entry = Arc::new(HandlerEntry {
            code,
            extra_name: extra_name.to_string(),
            handler,
        });

        let mut names = self.name_index.write();
        assert!(
            !names.contains_key(&code_name) && !names.contains_key(extra_name),
            "rpc handler registration conflict for '{code_name}' / '{extra_name}'"
        );
        names.insert(code_name, Arc::clone(&entry));
        names.insert(extra_name.to_string(), Arc::clone(&entry));
        *self.slot(code).write() = Some(entry);
        true
    }

    /// Remove a handler; returns false when the code was not registered.
    pub fn unregister(&self, code: TaskCode) -> bool {
        let code_name = code.spec().name().to_string();
        let mut names = self.name_index.write();
        let Some(entry) = names.remove(&code_name) else {
            return false;
        };
        names.remove(&entry.extra_name);
        *self.slot(code).write() = None;
        true
    }

    /// Look up the handler for an inbound request and wrap the pair in a
    /// request task, firing the operation's `on_task_create` hook.
    ///
    /// A message that arrived with only its rpc name resolved gets the
    /// code written back so later hops skip the name lookup.
    pub fn on_request(&self, msg: &Arc<RpcMessage>) -> Option<RequestTask> {
        let code = msg.local_code();
        let handler = if code.is_valid() {
            let slot = {
                let slots = self.code_slots.read();
                slots.get(code.raw() as usize).cloned()
            };
            slot.and_then(|slot| slot.read().as_ref().map(|e| Arc::clone(&e.handler)))
        } else {
            let names = self.name_index.read();
            names.get(msg.rpc_name()).map(|entry| {
                msg.set_local_code(entry.code);
                Arc::clone(&entry.handler)
            })
        };

        let handler = handler?;
        let task = RequestTask::new(Arc::clone(msg), handler);
        if let Some(spec) = msg.local_code().try_spec() {
            spec.on_task_create.execute(&task, true);
        }
        Some(task)
    }
}

impl Default for ServerDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RpcAddress;
    use bytes::Bytes;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn noop_handler() -> RequestHandler {
        Arc::new(|_msg| {})
    }

    fn request_for(code: TaskCode) -> Arc<RpcMessage> {
        RpcMessage::new_request(
            code,
            RpcAddress::Ipv4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 7000)),
            Duration::from_secs(1),
            Bytes::new(),
        )
    }

    #[test]
    fn register_unregister_register_round_trip() {
        let dispatcher = ServerDispatcher::new();
        let code = TaskCode::register("RPC_TEST_DISPATCHER_ROUND_TRIP");

        assert!(dispatcher.register(code, "RoundTrip", noop_handler()));
        assert!(dispatcher.unregister(code));
        assert!(!dispatcher.unregister(code));
        assert!(dispatcher.register(code, "RoundTrip", noop_handler()));
    }

    #[test]
    #[should_panic(expected = "registration conflict")]
    fn duplicate_registration_is_fatal() {
        let dispatcher = ServerDispatcher::new();
        let code = TaskCode::register("RPC_TEST_DISPATCHER_CONFLICT");
        dispatcher.register(code, "Conflict", noop_handler());
        dispatcher.register(code, "Conflict", noop_handler());
    }

    #[test]
    fn lookup_by_code_and_by_name() {
        let dispatcher = ServerDispatcher::new();
        let code = TaskCode::register("RPC_TEST_DISPATCHER_LOOKUP");
        dispatcher.register(code, "Lookup", noop_handler());

        // Code-keyed lookup.
        let msg = request_for(code);
        assert!(dispatcher.on_request(&msg).is_some());

        // Name-keyed lookup writes the code back.
        let msg = request_for(code);
        msg.set_local_code(TaskCode::INVALID);
        assert!(dispatcher.on_request(&msg).is_some());
        assert_eq!(msg.local_code(), code);

        // Unregistered operation finds nothing.
        let other = TaskCode::register("RPC_TEST_DISPATCHER_UNKNOWN");
        assert!(dispatcher.on_request(&request_for(other)).is_none());
    }

    #[test]
    fn on_task_create_hook_fires() {
        let dispatcher = ServerDispatcher::new();
        let code = TaskCode::register("RPC_TEST_DISPATCHER_CREATE_HOOK");
        dispatcher.register(code, "CreateHook", noop_handler());

        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        code.spec().on_task_create.put(move |_task| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });

        dispatcher.on_request(&request_for(code));
        assert_eq!(created.load(Ordering::SeqCst), 1);
        code.spec().on_task_create.clear();
    }
}
