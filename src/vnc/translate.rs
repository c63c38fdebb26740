//! Translation from the native RGBA layout into a client's requested pixel format.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use bytes::{BufMut, BytesMut};

use super::protocol::PixelFormat;

/// Appends `rgba` (tightly packed RGBA pixels) to `out` in `format`.
///
/// The native format is passed through as a plain copy.
pub fn translate_pixels(rgba: &[u8], format: &PixelFormat, out: &mut BytesMut) {
    if *format == PixelFormat::server_native() {
        out.put_slice(rgba);
        return;
    }

    let bpp = format.bytes_per_pixel();
    out.reserve(rgba.len() / 4 * bpp);
    let mut scratch = [0u8; 4];

    for px in rgba.chunks_exact(4) {
        let value = scale(px[0], format.red_max) << format.red_shift
            | scale(px[1], format.green_max) << format.green_shift
            | scale(px[2], format.blue_max) << format.blue_shift;

        match bpp {
            1 => out.put_u8(value as u8),
            2 => {
                if format.big_endian {
                    BigEndian::write_u16(&mut scratch, value as u16);
                } else {
                    LittleEndian::write_u16(&mut scratch, value as u16);
                }
                out.put_slice(&scratch[..2]);
            }
            _ => {
                if format.big_endian {
                    BigEndian::write_u32(&mut scratch, value);
                } else {
                    LittleEndian::write_u32(&mut scratch, value);
                }
                out.put_slice(&scratch);
            }
        }
    }
}

fn scale(sample: u8, max: u16) -> u32 {
    (u32::from(sample) * u32::from(max) + 127) / 255
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_format_is_a_copy() {
        let rgba = [1, 2, 3, 0, 4, 5, 6, 0];
        let mut out = BytesMut::new();
        translate_pixels(&rgba, &PixelFormat::server_native(), &mut out);
        assert_eq!(&out[..], &rgba);
    }

    #[test]
    fn converts_to_rgb565_big_endian() {
        let format = PixelFormat {
            bits_per_pixel: 16,
            depth: 16,
            big_endian: true,
            true_colour: true,
            red_max: 31,
            green_max: 63,
            blue_max: 31,
            red_shift: 11,
            green_shift: 5,
            blue_shift: 0,
        };
        let mut out = BytesMut::new();
        translate_pixels(&[255, 0, 0, 0, 0, 0, 255, 0], &format, &mut out);
        assert_eq!(&out[..], &[0xf8, 0x00, 0x00, 0x1f]);
    }

    #[test]
    fn converts_to_bgr0_32bpp() {
        let format = PixelFormat {
            red_shift: 16,
            green_shift: 8,
            blue_shift: 0,
            ..PixelFormat::server_native()
        };
        let mut out = BytesMut::new();
        translate_pixels(&[0x11, 0x22, 0x33, 0xff], &format, &mut out);
        assert_eq!(&out[..], &[0x33, 0x22, 0x11, 0x00]);
    }
}
