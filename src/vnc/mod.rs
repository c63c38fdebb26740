//! Built-in RFB (Remote Framebuffer) protocol engine.
//!
//! This module serves the session's framebuffer to VNC viewers and reports their input
//! through [`events::EventHooks`]. It covers what the session core needs and nothing more:
//! Raw updates, DesktopSize, legacy and extended clipboard, and VNC password auth.
//!
//! # Architecture
//!
//! - **`protocol`**: RFB constants, pixel format and message framing
//! - **`framebuffer`**: the shared, resizable pixel surface
//! - **`server`**: listener, client registry and the operations the session drives
//! - **`client`**: per-client handshake, reader and writer tasks, and the input dispatcher
//! - **`events`**: hooks raised towards the host and the pointer-owner latch
//! - **`auth`**: VNC authentication against a password list
//! - **`repeater`**: repeater ID framing and registration
//! - **`translate`**: conversion into client-requested pixel formats
//! - **`clipboard`**: ServerCutText framing, legacy and extended
//!
//! # Example Flow
//!
//! ```ignore
//! let framebuffer = Arc::new(Framebuffer::new(1920, 1080)?);
//! let server = VncServer::new(framebuffer.clone(), "My Desktop".into(), None, hooks, wait);
//! server.listen(5900).await?;
//!
//! framebuffer.update_from_slice(&pixel_data)?;
//! ```

pub mod auth;
pub mod client;
pub mod clipboard;
pub mod error;
pub mod events;
pub mod framebuffer;
pub mod protocol;
pub mod repeater;
pub mod server;
pub mod translate;
