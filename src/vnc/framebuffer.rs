//! Framebuffer storage shared between the host producer and the per-client writers.
//!
//! The pixel format is fixed: 32-bit pixels, 8 bits per sample, 3 samples per pixel,
//! laid out as RGBA in memory. Dimensions and storage live together in a [`Surface`] and
//! are only ever replaced as a unit, so a reader can never see a width/height pair that
//! does not match the bytes it is copying.

use std::sync::{PoisonError, RwLock};

use tokio::sync::watch;

use crate::error::FramebufferError;

/// Bits per colour sample.
pub const BITS_PER_SAMPLE: u8 = 8;
/// Colour samples per pixel, reported as the protocol "depth" of 24.
pub const SAMPLES_PER_PIXEL: u8 = 3;
/// Bytes of storage per pixel.
pub const BYTES_PER_PIXEL: usize = 4;
/// Largest accepted width or height.
pub const MAX_DIMENSION: u16 = 8192;

/// Pixel storage and the dimensions it was allocated for.
#[derive(Debug)]
pub struct Surface {
    width: u16,
    height: u16,
    pixels: Box<[u8]>,
}

impl Surface {
    /// Allocates zero-initialised storage for `width` x `height` pixels.
    pub fn allocate(width: u16, height: u16) -> Result<Self, FramebufferError> {
        validate_dimensions(u32::from(width), u32::from(height))?;

        let len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|n| n.checked_mul(BYTES_PER_PIXEL))
            .ok_or(FramebufferError::SizeOverflow { width, height })?;

        let mut pixels = Vec::new();
        pixels
            .try_reserve_exact(len)
            .map_err(|_| FramebufferError::AllocationFailed { bytes: len })?;
        pixels.resize(len, 0);

        Ok(Self {
            width,
            height,
            pixels: pixels.into_boxed_slice(),
        })
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    /// Size of the storage in bytes, always `width * height * 4`.
    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.pixels
    }

    /// Overwrites the whole surface with `source`.
    ///
    /// The length must match exactly; on mismatch the surface is left untouched.
    pub fn copy_from(&mut self, source: &[u8]) -> Result<(), FramebufferError> {
        if source.len() != self.pixels.len() {
            return Err(FramebufferError::LengthMismatch {
                expected: self.pixels.len(),
                actual: source.len(),
            });
        }
        self.pixels.copy_from_slice(source);
        Ok(())
    }

    /// Returns the row slice `[x, x + w)` of row `y`. Coordinates must be in bounds.
    pub(crate) fn row(&self, x: u16, y: u16, w: u16) -> &[u8] {
        let stride = self.width as usize * BYTES_PER_PIXEL;
        let start = y as usize * stride + x as usize * BYTES_PER_PIXEL;
        &self.pixels[start..start + w as usize * BYTES_PER_PIXEL]
    }
}

/// Checks that both dimensions are within `1..=MAX_DIMENSION` and returns them as the
/// engine stores them.
pub fn validate_dimensions(width: u32, height: u32) -> Result<(u16, u16), FramebufferError> {
    let invalid = || FramebufferError::InvalidDimensions {
        width,
        height,
        max: MAX_DIMENSION,
    };
    let w = u16::try_from(width).map_err(|_| invalid())?;
    let h = u16::try_from(height).map_err(|_| invalid())?;
    if w == 0 || h == 0 || w > MAX_DIMENSION || h > MAX_DIMENSION {
        return Err(invalid());
    }
    Ok((w, h))
}

/// The resizable framebuffer served to clients.
///
/// Modifications bump a generation counter published through a `watch` channel; client
/// writers subscribe to it to learn that fresh pixels are available.
pub struct Framebuffer {
    surface: RwLock<Surface>,
    modified: watch::Sender<u64>,
}

impl Framebuffer {
    pub fn new(width: u16, height: u16) -> Result<Self, FramebufferError> {
        Ok(Self::from_surface(Surface::allocate(width, height)?))
    }

    pub fn from_surface(surface: Surface) -> Self {
        let (modified, _) = watch::channel(0);
        Self {
            surface: RwLock::new(surface),
            modified,
        }
    }

    pub fn width(&self) -> u16 {
        self.read(|s| s.width)
    }

    pub fn height(&self) -> u16 {
        self.read(|s| s.height)
    }

    /// Width and height read together under one lock.
    pub fn dimensions(&self) -> (u16, u16) {
        self.read(|s| (s.width, s.height))
    }

    /// Exact size of the current storage in bytes.
    pub fn byte_len(&self) -> usize {
        self.read(Surface::len)
    }

    /// Runs `f` against the current surface with writers excluded.
    pub fn read<R>(&self, f: impl FnOnce(&Surface) -> R) -> R {
        let guard = self.surface.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    /// Copies a full frame into the buffer and marks the whole surface modified.
    ///
    /// This is a straight memory copy; it never waits on client I/O.
    pub fn update_from_slice(&self, data: &[u8]) -> Result<(), FramebufferError> {
        {
            let mut guard = self.surface.write().unwrap_or_else(PoisonError::into_inner);
            guard.copy_from(data)?;
        }
        self.mark_modified();
        Ok(())
    }

    /// Installs `surface` and hands back the previous one without copying pixels.
    ///
    /// Callers are responsible for holding every client's send lock around this call.
    pub fn replace(&self, surface: Surface) -> Surface {
        let old = {
            let mut guard = self.surface.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *guard, surface)
        };
        self.mark_modified();
        old
    }

    /// Flags the entire visible rectangle as needing delivery.
    pub fn mark_modified(&self) {
        self.modified.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.modified.subscribe()
    }
}
