//! Event dispatch: handler/interceptor registries and per-frame routing
//!
//! Registrations are keyed by event name, with a separate global registry
//! receiving every event. Interceptors only see frames flagged as prefix
//! events; handlers only see completed events. Registries may be mutated
//! from the application side at any time; a mutation takes effect at the
//! next frame boundary.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use tracing::{debug, error};

use crate::frame::Frame;
use crate::protocol::{InterceptionResult, ParamMap};

/// Opaque handle identifying one registration
///
/// Returned by every `register_*` call; unregistration takes the handle
/// back rather than comparing callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(u64);

/// Cooperative cancellation handle passed to cancellable handlers
///
/// Cancelling requests that the session's receive loop stop after the
/// current frame; it does not interrupt a handler already running.
#[derive(Clone)]
pub struct CancelToken {
    running: Arc<AtomicBool>,
}

impl CancelToken {
    pub(crate) fn new(running: Arc<AtomicBool>) -> Self {
        Self { running }
    }

    /// Request the receive loop to stop after the current frame
    pub fn cancel(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        !self.running.load(Ordering::SeqCst)
    }
}

/// A registered event callback
///
/// The capability shape is chosen explicitly at registration time: a simple
/// handler observes the event, a cancellable handler additionally receives
/// a [`CancelToken`].
#[derive(Clone)]
pub enum Handler {
    Simple(Arc<dyn Fn(&str, &ParamMap) + Send + Sync>),
    Cancellable(Arc<dyn Fn(&str, &ParamMap, &CancelToken) + Send + Sync>),
}

impl Handler {
    /// A handler that observes the event name and parameters
    pub fn simple<F>(f: F) -> Self
    where
        F: Fn(&str, &ParamMap) + Send + Sync + 'static,
    {
        Handler::Simple(Arc::new(f))
    }

    /// A handler that can additionally request session cancellation
    pub fn cancellable<F>(f: F) -> Self
    where
        F: Fn(&str, &ParamMap, &CancelToken) + Send + Sync + 'static,
    {
        Handler::Cancellable(Arc::new(f))
    }

    fn invoke(&self, event: &str, params: &ParamMap, cancel: &CancelToken) {
        match self {
            Handler::Simple(f) => f(event, params),
            Handler::Cancellable(f) => f(event, params, cancel),
        }
    }
}

/// A registered interceptor for prefix events
///
/// Returning `None` blocks the event (the engine suppresses the underlying
/// action); returning `Some(params)` replaces the working parameter map and
/// lets the chain continue.
#[derive(Clone)]
pub struct Interceptor(Arc<dyn Fn(&str, &ParamMap) -> Option<ParamMap> + Send + Sync>);

impl Interceptor {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&str, &ParamMap) -> Option<ParamMap> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    fn invoke(&self, event: &str, params: &ParamMap) -> Option<ParamMap> {
        (self.0)(event, params)
    }
}

/// One or more event names for a registration
///
/// Converts from a single name or a list, so callers can write
/// `register_handler("MethodCall", ...)` as well as
/// `register_handler(["MethodCall", "ChampionKill"], ...)`.
#[derive(Debug, Clone)]
pub struct EventNames(Vec<String>);

impl From<&str> for EventNames {
    fn from(name: &str) -> Self {
        Self(vec![name.to_string()])
    }
}

impl From<String> for EventNames {
    fn from(name: String) -> Self {
        Self(vec![name])
    }
}

impl From<Vec<String>> for EventNames {
    fn from(names: Vec<String>) -> Self {
        Self(names)
    }
}

impl From<Vec<&str>> for EventNames {
    fn from(names: Vec<&str>) -> Self {
        Self(names.iter().map(|s| s.to_string()).collect())
    }
}

impl From<&[&str]> for EventNames {
    fn from(names: &[&str]) -> Self {
        Self(names.iter().map(|s| s.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for EventNames {
    fn from(names: [&str; N]) -> Self {
        Self(names.iter().map(|s| s.to_string()).collect())
    }
}

impl IntoIterator for EventNames {
    type Item = String;
    type IntoIter = std::vec::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[derive(Clone)]
struct HandlerEntry {
    id: RegistrationId,
    handler: Handler,
}

#[derive(Clone)]
struct InterceptorEntry {
    id: RegistrationId,
    interceptor: Interceptor,
}

/// Registries of handlers and interceptors, plus per-frame routing
///
/// Written by the application side, read by the receive loop. Entry lists
/// are cloned out of the lock before callbacks run, so a registration
/// change never contends with an in-flight frame.
#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<HashMap<String, Vec<HandlerEntry>>>,
    global_handlers: RwLock<Vec<HandlerEntry>>,
    interceptors: RwLock<HashMap<String, Vec<InterceptorEntry>>>,
    next_id: AtomicU64,
}

impl Dispatcher {
    fn next_registration_id(&self) -> RegistrationId {
        RegistrationId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a handler for one or more event names
    pub fn register_handler(&self, events: EventNames, handler: Handler) -> RegistrationId {
        let id = self.next_registration_id();
        let mut map = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        for name in events {
            debug!(event = %name, ?id, "registering handler");
            map.entry(name).or_default().push(HandlerEntry {
                id,
                handler: handler.clone(),
            });
        }
        id
    }

    /// Remove a handler registration from the given event names
    ///
    /// Returns `true` if anything was removed.
    pub fn unregister_handler(&self, events: EventNames, id: RegistrationId) -> bool {
        let mut map = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        for name in events {
            if let Some(entries) = map.get_mut(&name) {
                let before = entries.len();
                entries.retain(|e| e.id != id);
                removed |= entries.len() < before;
                if entries.is_empty() {
                    map.remove(&name);
                }
            }
        }
        removed
    }

    /// Register a handler invoked for every event
    pub fn register_global_handler(&self, handler: Handler) -> RegistrationId {
        let id = self.next_registration_id();
        self.global_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(HandlerEntry { id, handler });
        id
    }

    /// Remove a global handler registration
    pub fn unregister_global_handler(&self, id: RegistrationId) -> bool {
        let mut entries = self
            .global_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|e| e.id != id);
        entries.len() < before
    }

    /// Register an interceptor for one or more event names
    pub fn register_interceptor(
        &self,
        events: EventNames,
        interceptor: Interceptor,
    ) -> RegistrationId {
        let id = self.next_registration_id();
        let mut map = self
            .interceptors
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for name in events {
            debug!(event = %name, ?id, "registering interceptor");
            map.entry(name).or_default().push(InterceptorEntry {
                id,
                interceptor: interceptor.clone(),
            });
        }
        id
    }

    /// Remove an interceptor registration from the given event names
    pub fn unregister_interceptor(&self, events: EventNames, id: RegistrationId) -> bool {
        let mut map = self
            .interceptors
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        for name in events {
            if let Some(entries) = map.get_mut(&name) {
                let before = entries.len();
                entries.retain(|e| e.id != id);
                removed |= entries.len() < before;
                if entries.is_empty() {
                    map.remove(&name);
                }
            }
        }
        removed
    }

    /// Route one decoded frame
    ///
    /// A prefix frame with interceptors registered runs the interception
    /// chain and yields exactly one result to send back: an empty map when
    /// an interceptor blocked, the final working map otherwise. Any other
    /// frame runs name-specific handlers, then global handlers, and yields
    /// nothing.
    pub fn dispatch(&self, frame: Frame, cancel: &CancelToken) -> Option<InterceptionResult> {
        let Frame {
            event,
            is_prefix,
            extras,
        } = frame;
        let name = event.name;
        let mut params = event.params;

        if is_prefix {
            let chain: Vec<InterceptorEntry> = {
                let map = self
                    .interceptors
                    .read()
                    .unwrap_or_else(PoisonError::into_inner);
                map.get(&name).cloned().unwrap_or_default()
            };
            if !chain.is_empty() {
                for entry in &chain {
                    match catch_unwind(AssertUnwindSafe(|| entry.interceptor.invoke(&name, &params)))
                    {
                        Ok(None) => {
                            debug!(event = %name, "interceptor blocked event");
                            return Some(InterceptionResult::new(&name, &ParamMap::new()));
                        }
                        Ok(Some(modified)) => params = modified,
                        Err(_) => {
                            error!(event = %name, "interceptor panicked, continuing chain");
                        }
                    }
                }
                return Some(InterceptionResult::new(&name, &params));
            }
        }

        for (key, value) in extras {
            params.insert(key, Value::String(value));
        }

        let named: Vec<HandlerEntry> = {
            let map = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
            map.get(&name).cloned().unwrap_or_default()
        };
        for entry in &named {
            invoke_handler(entry, &name, &params, cancel);
        }

        let global: Vec<HandlerEntry> = self
            .global_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for entry in &global {
            invoke_handler(entry, &name, &params, cancel);
        }

        None
    }
}

/// Invoke one handler, isolating the rest of the frame's handlers from a
/// panicking callback
fn invoke_handler(entry: &HandlerEntry, event: &str, params: &ParamMap, cancel: &CancelToken) {
    if catch_unwind(AssertUnwindSafe(|| entry.handler.invoke(event, params, cancel))).is_err() {
        error!(event = %event, "handler panicked, continuing with remaining handlers");
    }
}
