//! UltraVNC-style repeater support.
//!
//! The server dials the repeater, writes a fixed 250-byte frame holding `ID:<identifier>`
//! padded with NULs, and then waits on that socket for the repeater to pair it with a
//! viewer. From then on the socket is served like any other client.

use log::info;
use tokio::io::AsyncWriteExt;

use crate::error::EstablishError;

use super::events::ClientId;
use super::server::VncServer;

/// Size of the identifier frame sent to the repeater.
pub const ID_FRAME_LEN: usize = 250;

const ID_PREFIX: &[u8] = b"ID:";

/// Builds the NUL-padded identifier frame. Over-long identifiers are rejected, not cut.
pub fn id_frame(identifier: &str) -> Result<[u8; ID_FRAME_LEN], EstablishError> {
    let max = ID_FRAME_LEN - ID_PREFIX.len();
    if identifier.len() > max {
        return Err(EstablishError::IdentifierTooLong {
            len: identifier.len(),
            max,
        });
    }

    let mut frame = [0u8; ID_FRAME_LEN];
    frame[..ID_PREFIX.len()].copy_from_slice(ID_PREFIX);
    frame[ID_PREFIX.len()..ID_PREFIX.len() + identifier.len()].copy_from_slice(identifier.as_bytes());
    Ok(frame)
}

/// Connects to a repeater, registers `identifier` and hands the socket to the engine.
///
/// The frame is validated before any network I/O happens.
pub async fn connect_repeater(
    server: &VncServer,
    host: &str,
    port: u16,
    identifier: &str,
) -> Result<ClientId, EstablishError> {
    let frame = id_frame(identifier)?;
    let mut stream = server.dial(host, port).await?;

    let wait = server.max_client_wait();
    let sent = match tokio::time::timeout(wait, stream.write(&frame)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(EstablishError::Timeout {
                host: host.to_string(),
                port,
                ms: wait.as_millis(),
            })
        }
    };
    if sent != ID_FRAME_LEN {
        return Err(EstablishError::ShortWrite {
            sent,
            expected: ID_FRAME_LEN,
        });
    }
    info!("Registered with repeater {}:{} as {}", host, port, identifier);

    let held = server.hold(stream, host.to_string(), Some(port), Some(identifier.to_string()))?;
    server.start(held)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_is_prefixed_and_nul_padded() {
        let frame = id_frame("1234").unwrap();
        assert_eq!(frame.len(), ID_FRAME_LEN);
        assert_eq!(&frame[..7], b"ID:1234");
        assert!(frame[7..].iter().all(|&b| b == 0));
    }

    #[test]
    fn identifier_may_fill_the_frame_exactly() {
        let id = "x".repeat(ID_FRAME_LEN - 3);
        let frame = id_frame(&id).unwrap();
        assert_eq!(frame[ID_FRAME_LEN - 1], b'x');
    }

    #[test]
    fn over_long_identifier_is_rejected() {
        let id = "x".repeat(ID_FRAME_LEN - 2);
        match id_frame(&id) {
            Err(EstablishError::IdentifierTooLong { len, max }) => {
                assert_eq!(len, ID_FRAME_LEN - 2);
                assert_eq!(max, ID_FRAME_LEN - 3);
            }
            other => panic!("expected IdentifierTooLong, got {:?}", other.map(|_| ())),
        }
    }
}
