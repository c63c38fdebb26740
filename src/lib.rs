//! DroidVNC-NG session core.
//!
//! Serves a host-owned screen image to VNC viewers and relays their input back to the
//! host. The host drives a single [`Session`]: it starts it with a [`SessionConfig`],
//! pushes full frames with [`Session::update_frame`], resizes with [`Session::resize`],
//! and opens reverse or repeater connections on demand. Protocol events reach the host
//! through an [`EventBridge`] that binds engine threads to the host runtime for the
//! duration of each callback.
//!
//! # Modules
//!
//! - `session`: start/stop/resize/update and status queries.
//! - `establish`: reverse and repeater connections.
//! - `bridge`: delivery of protocol events to host handlers.
//! - `vnc`: the RFB protocol engine and the shared framebuffer.
//! - `vnc_jni`: JNI bindings for the Android `MainService`.

pub mod bridge;
pub mod config;
pub mod error;
mod establish;
pub mod runtime;
pub mod session;
pub mod vnc;
mod vnc_jni;

pub use bridge::{EventBridge, HostHandlers, HostRuntime, NativeRuntime, RuntimeScope};
pub use config::{ListenPort, SessionConfig};
pub use error::{BridgeError, EstablishError, FramebufferError, SessionError};
pub use session::Session;
pub use vnc::client::ClientInfo;
pub use vnc::events::{ClientId, ClipboardText};
