//! ServerCutText framing, legacy and extended.
//!
//! Legacy clipboard text is ISO 8859-1. The extended clipboard pseudo-encoding carries
//! UTF-8 text inside a zlib stream and is signalled by a negative length field.

use std::io::{self, Read, Write};

use bytes::{BufMut, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use super::protocol::{
    EXT_CLIP_ACTION_CAPS, EXT_CLIP_ACTION_NOTIFY, EXT_CLIP_ACTION_PEEK, EXT_CLIP_ACTION_PROVIDE,
    EXT_CLIP_ACTION_REQUEST, EXT_CLIP_FORMAT_TEXT, MAX_CUT_TEXT, SERVER_MSG_SERVER_CUT_TEXT,
};

/// Legacy ServerCutText; characters outside Latin-1 become `?`.
pub fn legacy_cut_text(text: &str) -> BytesMut {
    let latin1: Vec<u8> = text
        .chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect();

    let mut buf = BytesMut::with_capacity(8 + latin1.len());
    buf.put_u8(SERVER_MSG_SERVER_CUT_TEXT);
    buf.put_bytes(0, 3);
    buf.put_u32(latin1.len() as u32);
    buf.put_slice(&latin1);
    buf
}

fn extended_message(flags: u32, payload: &[u8]) -> BytesMut {
    let len = 4 + payload.len();
    let mut buf = BytesMut::with_capacity(8 + len);
    buf.put_u8(SERVER_MSG_SERVER_CUT_TEXT);
    buf.put_bytes(0, 3);
    buf.put_i32(-(len as i32));
    buf.put_u32(flags);
    buf.put_slice(payload);
    buf
}

/// Announces the server's extended clipboard capabilities (text only).
pub fn caps() -> BytesMut {
    let flags = EXT_CLIP_ACTION_CAPS
        | EXT_CLIP_ACTION_REQUEST
        | EXT_CLIP_ACTION_PEEK
        | EXT_CLIP_ACTION_NOTIFY
        | EXT_CLIP_ACTION_PROVIDE
        | EXT_CLIP_FORMAT_TEXT;
    extended_message(flags, &(MAX_CUT_TEXT as u32).to_be_bytes())
}

/// Tells the client that text is available.
pub fn notify() -> BytesMut {
    extended_message(EXT_CLIP_ACTION_NOTIFY | EXT_CLIP_FORMAT_TEXT, &[])
}

/// Asks the client for its text.
pub fn request() -> BytesMut {
    extended_message(EXT_CLIP_ACTION_REQUEST | EXT_CLIP_FORMAT_TEXT, &[])
}

/// Sends `text` as a provide message.
pub fn provide(text: &str) -> io::Result<BytesMut> {
    let mut raw = Vec::with_capacity(text.len() + 5);
    raw.extend_from_slice(&(text.len() as u32 + 1).to_be_bytes());
    raw.extend_from_slice(text.as_bytes());
    raw.push(0);

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&raw)?;
    let compressed = encoder.finish()?;
    Ok(extended_message(
        EXT_CLIP_ACTION_PROVIDE | EXT_CLIP_FORMAT_TEXT,
        &compressed,
    ))
}

/// Extracts the UTF-8 text bytes from a provide payload, without the NUL terminator.
///
/// Returns `None` when the payload carries no text format.
pub fn parse_provide(flags: u32, payload: &[u8]) -> io::Result<Option<Vec<u8>>> {
    if flags & EXT_CLIP_FORMAT_TEXT == 0 {
        return Ok(None);
    }

    let mut decoder = ZlibDecoder::new(payload);
    let mut len = [0u8; 4];
    decoder.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_CUT_TEXT {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("clipboard text of {len} bytes exceeds limit"),
        ));
    }

    let mut text = vec![0u8; len];
    decoder.read_exact(&mut text)?;
    if let Some(end) = text.iter().position(|&b| b == 0) {
        text.truncate(end);
    }
    Ok(Some(text))
}
