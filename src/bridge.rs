//! Delivery of protocol events to host-side handlers.
//!
//! Engine callbacks run on per-client dispatch threads the host runtime knows nothing about.
//! Every delivery is wrapped in a [`RuntimeScope`]: the calling thread is attached to the
//! host runtime for the duration of the call and detached afterwards, unless it was
//! already attached beforehand, in which case the scope leaves it alone.
//!
//! A failed attach, a missing handler registration, or a panicking handler only drops the
//! event; the client's dispatcher carries on.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use log::{debug, error};

use crate::error::BridgeError;
use crate::vnc::events::{ClientId, ClipboardText, DisconnectHook, EventHooks};

/// Thread binding for the runtime the host handlers live in.
pub trait HostRuntime: Send + Sync + 'static {
    /// Whether the calling thread is currently attached.
    fn is_attached(&self) -> bool;

    fn attach_current_thread(&self) -> Result<(), BridgeError>;

    fn detach_current_thread(&self);
}

/// A host that needs no thread binding, e.g. a plain Rust application.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeRuntime;

impl HostRuntime for NativeRuntime {
    fn is_attached(&self) -> bool {
        true
    }

    fn attach_current_thread(&self) -> Result<(), BridgeError> {
        Ok(())
    }

    fn detach_current_thread(&self) {}
}

/// Keeps the current thread attached to the host runtime while alive.
///
/// Detaches on drop only if this scope performed the attach.
pub struct RuntimeScope<'a> {
    runtime: &'a dyn HostRuntime,
    attached_here: bool,
}

impl<'a> RuntimeScope<'a> {
    pub fn enter(runtime: &'a dyn HostRuntime) -> Result<Self, BridgeError> {
        if runtime.is_attached() {
            return Ok(Self {
                runtime,
                attached_here: false,
            });
        }
        runtime.attach_current_thread()?;
        Ok(Self {
            runtime,
            attached_here: true,
        })
    }

    pub fn attached_here(&self) -> bool {
        self.attached_here
    }
}

impl Drop for RuntimeScope<'_> {
    fn drop(&mut self) {
        if self.attached_here {
            self.runtime.detach_current_thread();
        }
    }
}

/// Host entry points for protocol events. Calls may arrive concurrently from different
/// clients' threads and may block; a slow handler only delays its own client's events.
pub trait HostHandlers: Send + Sync + 'static {
    fn on_pointer_event(&self, button_mask: u8, x: u16, y: u16, client: ClientId);

    fn on_key_event(&self, down: bool, keysym: u32, client: ClientId);

    fn on_cut_text(&self, text: &str, client: ClientId);

    fn on_client_connected(&self, client: ClientId);

    fn on_client_disconnected(&self, client: ClientId);
}

/// Routes engine hooks to host handlers across the runtime boundary.
#[derive(Clone)]
pub struct EventBridge {
    runtime: Arc<dyn HostRuntime>,
    handlers: Option<Arc<dyn HostHandlers>>,
}

impl EventBridge {
    /// `handlers` is `None` when the host entry points could not be resolved; events are
    /// then logged and dropped.
    pub fn new(runtime: Arc<dyn HostRuntime>, handlers: Option<Arc<dyn HostHandlers>>) -> Self {
        if handlers.is_none() {
            error!("No host event handlers registered, protocol events will be dropped");
        }
        Self { runtime, handlers }
    }

    /// A bridge for hosts that need no thread binding.
    pub fn native(handlers: Arc<dyn HostHandlers>) -> Self {
        Self::new(Arc::new(NativeRuntime), Some(handlers))
    }

    pub fn has_handlers(&self) -> bool {
        self.handlers.is_some()
    }

    fn deliver(&self, event: &str, call: impl FnOnce(&dyn HostHandlers)) {
        let Some(handlers) = self.handlers.as_deref() else {
            debug!("Dropping {} event, no handler", event);
            return;
        };

        let _scope = match RuntimeScope::enter(self.runtime.as_ref()) {
            Ok(scope) => scope,
            Err(e) => {
                error!("Dropping {} event: {}", event, e);
                return;
            }
        };

        if panic::catch_unwind(AssertUnwindSafe(|| call(handlers))).is_err() {
            error!("Host handler for {} event panicked", event);
        }
    }
}

impl EventHooks for EventBridge {
    fn client_connected(&self, client: ClientId) -> DisconnectHook {
        self.deliver("client connected", |h| h.on_client_connected(client));

        let bridge = self.clone();
        Box::new(move || {
            bridge.deliver("client disconnected", |h| h.on_client_disconnected(client));
        })
    }

    fn pointer_event(&self, client: ClientId, button_mask: u8, x: u16, y: u16) {
        self.deliver("pointer", |h| h.on_pointer_event(button_mask, x, y, client));
    }

    fn key_event(&self, client: ClientId, down: bool, keysym: u32) {
        self.deliver("key", |h| h.on_key_event(down, keysym, client));
    }

    fn cut_text(&self, client: ClientId, text: ClipboardText) {
        let text = text.into_text();
        self.deliver("cut text", |h| h.on_cut_text(&text, client));
    }
}
