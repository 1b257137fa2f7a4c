//! Monochrome display buffer.
use crate::constants::*;

/// Screen buffer of 64x32 pixels, packed one bit per pixel.
///
/// Rows are stored top to bottom, each [`DISPLAY_STRIDE`] bytes wide.
/// The most significant bit of a byte is the leftmost pixel.
#[derive(Clone, PartialEq, Eq)]
pub struct DisplayBuffer {
    bits: [u8; DISPLAY_BUFFER_SIZE],
}

impl Default for DisplayBuffer {
    fn default() -> Self {
        Self {
            bits: [0; DISPLAY_BUFFER_SIZE],
        }
    }
}

impl DisplayBuffer {
    pub fn new() -> Self {
        Default::default()
    }

    /// Turn every pixel off.
    pub fn clear(&mut self) {
        self.bits.fill(0);
    }

    /// Byte index and bit mask of a pixel. Coordinates are wrapped onto the screen.
    #[inline(always)]
    fn locate(x: usize, y: usize) -> (usize, u8) {
        let (x, y) = (x & DISPLAY_WIDTH_MASK, y & DISPLAY_HEIGHT_MASK);
        (y * DISPLAY_STRIDE + x / 8, 0x80 >> (x % 8))
    }

    /// Whether the pixel at the coordinate is on.
    #[inline]
    pub fn pixel(&self, x: usize, y: usize) -> bool {
        let (index, mask) = Self::locate(x, y);
        self.bits[index] & mask != 0
    }

    /// XOR a pixel onto the buffer.
    ///
    /// Returns `true` when a pixel that was on has been turned off.
    #[inline]
    pub fn xor_pixel(&mut self, x: usize, y: usize, on: bool) -> bool {
        if !on {
            return false;
        }

        let (index, mask) = Self::locate(x, y);
        let erased = self.bits[index] & mask != 0;
        self.bits[index] ^= mask;
        erased
    }

    /// Packed pixel data, row-major.
    pub fn as_bytes(&self) -> &[u8; DISPLAY_BUFFER_SIZE] {
        &self.bits
    }

    /// Iterate the packed rows from top to bottom.
    pub fn rows(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.bits.chunks_exact(DISPLAY_STRIDE)
    }

    /// Number of pixels that are on.
    pub fn count_lit(&self) -> u32 {
        self.bits.iter().map(|b| b.count_ones()).sum()
    }
}

impl std::fmt::Debug for DisplayBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplayBuffer")
            .field("lit", &self.count_lit())
            .finish()
    }
}
