//! RFB protocol constants and wire structures (RFC 6143).

use bytes::{Buf, BufMut, BytesMut};

use super::framebuffer::{BITS_PER_SAMPLE, BYTES_PER_PIXEL, SAMPLES_PER_PIXEL};

/// Version string announced by the server.
pub const PROTOCOL_VERSION: &[u8; 12] = b"RFB 003.008\n";

// Security types
pub const SECURITY_TYPE_INVALID: u8 = 0;
pub const SECURITY_TYPE_NONE: u8 = 1;
pub const SECURITY_TYPE_VNC_AUTH: u8 = 2;

pub const SECURITY_RESULT_OK: u32 = 0;
pub const SECURITY_RESULT_FAILED: u32 = 1;

// Client-to-server message types
pub const CLIENT_MSG_SET_PIXEL_FORMAT: u8 = 0;
pub const CLIENT_MSG_SET_ENCODINGS: u8 = 2;
pub const CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST: u8 = 3;
pub const CLIENT_MSG_KEY_EVENT: u8 = 4;
pub const CLIENT_MSG_POINTER_EVENT: u8 = 5;
pub const CLIENT_MSG_CLIENT_CUT_TEXT: u8 = 6;

// Server-to-client message types
pub const SERVER_MSG_FRAMEBUFFER_UPDATE: u8 = 0;
pub const SERVER_MSG_SERVER_CUT_TEXT: u8 = 3;

// Encodings
pub const ENCODING_RAW: i32 = 0;
pub const ENCODING_DESKTOP_SIZE: i32 = -223;
pub const ENCODING_EXTENDED_CLIPBOARD: i32 = 0xC0A1_E5CE_u32 as i32;

// Extended clipboard flags
pub const EXT_CLIP_FORMAT_TEXT: u32 = 1 << 0;
pub const EXT_CLIP_ACTION_CAPS: u32 = 1 << 24;
pub const EXT_CLIP_ACTION_REQUEST: u32 = 1 << 25;
pub const EXT_CLIP_ACTION_PEEK: u32 = 1 << 26;
pub const EXT_CLIP_ACTION_NOTIFY: u32 = 1 << 27;
pub const EXT_CLIP_ACTION_PROVIDE: u32 = 1 << 28;
pub const EXT_CLIP_ACTION_MASK: u32 = 0xff00_0000;

/// Largest clipboard payload accepted from a client.
pub const MAX_CUT_TEXT: usize = 10 * 1024 * 1024;

/// RFB pixel format as sent in ServerInit and SetPixelFormat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormat {
    pub bits_per_pixel: u8,
    pub depth: u8,
    pub big_endian: bool,
    pub true_colour: bool,
    pub red_max: u16,
    pub green_max: u16,
    pub blue_max: u16,
    pub red_shift: u8,
    pub green_shift: u8,
    pub blue_shift: u8,
}

impl PixelFormat {
    /// Wire size of a pixel format record.
    pub const SIZE: usize = 16;

    /// The server's native format: RGBA bytes read as a little-endian `u32`.
    pub fn server_native() -> Self {
        let max = (1u16 << BITS_PER_SAMPLE) - 1;
        Self {
            bits_per_pixel: (BYTES_PER_PIXEL * 8) as u8,
            depth: BITS_PER_SAMPLE * SAMPLES_PER_PIXEL,
            big_endian: false,
            true_colour: true,
            red_max: max,
            green_max: max,
            blue_max: max,
            red_shift: 0,
            green_shift: BITS_PER_SAMPLE,
            blue_shift: BITS_PER_SAMPLE * 2,
        }
    }

    /// Whether pixels can be translated into this format.
    pub fn is_supported(&self) -> bool {
        self.true_colour
            && matches!(self.bits_per_pixel, 8 | 16 | 32)
            && [self.red_shift, self.green_shift, self.blue_shift]
                .iter()
                .all(|&shift| shift < self.bits_per_pixel)
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.bits_per_pixel as usize / 8
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.bits_per_pixel);
        buf.put_u8(self.depth);
        buf.put_u8(self.big_endian as u8);
        buf.put_u8(self.true_colour as u8);
        buf.put_u16(self.red_max);
        buf.put_u16(self.green_max);
        buf.put_u16(self.blue_max);
        buf.put_u8(self.red_shift);
        buf.put_u8(self.green_shift);
        buf.put_u8(self.blue_shift);
        buf.put_bytes(0, 3);
    }

    pub fn from_bytes(mut raw: &[u8]) -> Option<Self> {
        if raw.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            bits_per_pixel: raw.get_u8(),
            depth: raw.get_u8(),
            big_endian: raw.get_u8() != 0,
            true_colour: raw.get_u8() != 0,
            red_max: raw.get_u16(),
            green_max: raw.get_u16(),
            blue_max: raw.get_u16(),
            red_shift: raw.get_u8(),
            green_shift: raw.get_u8(),
            blue_shift: raw.get_u8(),
        })
    }
}

/// Builds the ServerInit message.
pub fn server_init(width: u16, height: u16, name: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(24 + name.len());
    buf.put_u16(width);
    buf.put_u16(height);
    PixelFormat::server_native().write_to(&mut buf);
    buf.put_u32(name.len() as u32);
    buf.put_slice(name.as_bytes());
    buf
}

/// Writes a FramebufferUpdate header announcing `rects` rectangles.
pub fn put_update_header(buf: &mut BytesMut, rects: u16) {
    buf.put_u8(SERVER_MSG_FRAMEBUFFER_UPDATE);
    buf.put_u8(0);
    buf.put_u16(rects);
}

/// Writes a rectangle header.
pub fn put_rect_header(buf: &mut BytesMut, x: u16, y: u16, w: u16, h: u16, encoding: i32) {
    buf.put_u16(x);
    buf.put_u16(y);
    buf.put_u16(w);
    buf.put_u16(h);
    buf.put_i32(encoding);
}

/// Parses the minor version out of a client's `RFB 003.00x\n` reply.
///
/// Unknown minors above 8 are treated as 8, anything below 7 as 3.
pub fn parse_client_version(raw: &[u8; 12]) -> Option<u8> {
    if &raw[..4] != b"RFB " || raw[7] != b'.' || raw[11] != b'\n' {
        return None;
    }
    let major = std::str::from_utf8(&raw[4..7]).ok()?.parse::<u32>().ok()?;
    let minor = std::str::from_utf8(&raw[8..11]).ok()?.parse::<u32>().ok()?;
    if major != 3 {
        return None;
    }
    Some(match minor {
        0..=6 => 3,
        7 => 7,
        _ => 8,
    })
}
