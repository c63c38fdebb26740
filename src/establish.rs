//! Outbound connections: reverse connections to listening viewers and repeater
//! registration.
//!
//! Both block on a network dial bounded by the session's max client wait, so hosts should
//! call them from a worker thread. They are safe to run concurrently with each other and
//! with inbound accepts; the resulting clients share the registry and the resize barrier
//! with every other client.

use log::info;

use crate::error::SessionError;
use crate::runtime;
use crate::session::Session;
use crate::vnc::events::ClientId;
use crate::vnc::repeater;

impl Session {
    /// Dials a viewer in listening mode and serves it as a regular client.
    pub fn connect_reverse(&self, host: &str, port: u16) -> Result<ClientId, SessionError> {
        let server = self.server()?;
        info!("Connecting to listening viewer {}:{}", host, port);

        let id = runtime::block_on(async move { server.connect_reverse(host, port).await })
            .map_err(SessionError::Runtime)??;
        info!("Reverse connection to {}:{} is client {}", host, port, id);
        Ok(id)
    }

    /// Registers with a repeater under `identifier` and serves the viewer it pairs us with.
    ///
    /// An identifier that does not fit the 250-byte ID frame is rejected before any
    /// network I/O.
    pub fn connect_via_repeater(
        &self,
        host: &str,
        port: u16,
        identifier: &str,
    ) -> Result<ClientId, SessionError> {
        let server = self.server()?;
        repeater::id_frame(identifier)?;
        info!("Connecting to repeater {}:{}", host, port);

        let id = runtime::block_on(async move {
            repeater::connect_repeater(&server, host, port, identifier).await
        })
        .map_err(SessionError::Runtime)??;
        Ok(id)
    }
}
