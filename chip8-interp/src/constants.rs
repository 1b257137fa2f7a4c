//! Constant values of the Chip-8 architecture.

/// Number of general purpose registers.
pub const REGISTER_COUNT: usize = 0x10; // 16

/// Register VF, overwritten as the carry, borrow and collision flag.
pub const FLAG_REGISTER: usize = 0xF;

/// The lower memory space was historically used for the interpreter itself,
/// but is now used for fonts.
pub const MEM_START: usize = 0x200; // 512
pub const MEM_SIZE: usize = 0x1000; // 4096

/// Largest program image that fits above the reserved region.
pub const MAX_PROGRAM_SIZE: usize = MEM_SIZE - MEM_START;

/// Levels of nesting allowed in the call stack by default.
///
/// The COSMAC VIP allowed 12 levels, later interpreters settled on 16.
/// The depth can be raised through [`Chip8Conf`](crate::prelude::Chip8Conf),
/// but a call beyond the configured depth is always rejected.
pub const STACK_SIZE: usize = 0x10;

pub const DISPLAY_WIDTH: usize = 64;
pub const DISPLAY_HEIGHT: usize = 32;
pub const DISPLAY_WIDTH_MASK: usize = DISPLAY_WIDTH - 1;
pub const DISPLAY_HEIGHT_MASK: usize = DISPLAY_HEIGHT - 1;

/// Number of bytes in one packed display row, one bit per pixel.
pub const DISPLAY_STRIDE: usize = DISPLAY_WIDTH / 8;
pub const DISPLAY_BUFFER_SIZE: usize = DISPLAY_STRIDE * DISPLAY_HEIGHT;

/// Font glyphs are stored at the very bottom of memory.
pub const FONTSET_START: Address = 0x000;
/// Each glyph is 5 rows of 4 pixels, padded to bytes.
pub const FONTSET_HEIGHT: usize = 5;
pub const FONTSET_DATA_LENGTH: usize = FONTSET_HEIGHT * KEY_COUNT as usize;

/// Number of clock cycles in a second that delay timers count down.
pub const DELAY_FREQUENCY: u64 = 60;

/// Number of nanoseconds in a second
#[doc(hidden)]
pub const NANOS_IN_SECOND: u64 = 1_000_000_000;

/// Time in nanoseconds a single timer cycle takes, precalculated.
pub const CLOCK_CYCLE_TIME: u64 = NANOS_IN_SECOND / DELAY_FREQUENCY;

/// Number of keys on the keyboard (0x0-0xF)
pub const KEY_COUNT: u8 = 16;

/// Type for storing the 12-bit memory addresses.
pub type Address = u16;

/// Hexadecimal digit glyphs 0-F.
#[rustfmt::skip]
pub const FONTSET: [u8; FONTSET_DATA_LENGTH] = [
    0xF0, 0x90, 0x90, 0x90, 0xF0, // 0
    0x20, 0x60, 0x20, 0x20, 0x70, // 1
    0xF0, 0x10, 0xF0, 0x80, 0xF0, // 2
    0xF0, 0x10, 0xF0, 0x10, 0xF0, // 3
    0x90, 0x90, 0xF0, 0x10, 0x10, // 4
    0xF0, 0x80, 0xF0, 0x10, 0xF0, // 5
    0xF0, 0x80, 0xF0, 0x90, 0xF0, // 6
    0xF0, 0x10, 0x20, 0x40, 0x40, // 7
    0xF0, 0x90, 0xF0, 0x90, 0xF0, // 8
    0xF0, 0x90, 0xF0, 0x10, 0xF0, // 9
    0xF0, 0x90, 0xF0, 0x90, 0x90, // A
    0xE0, 0x90, 0xE0, 0x90, 0xE0, // B
    0xF0, 0x80, 0x80, 0x80, 0xF0, // C
    0xE0, 0x90, 0x90, 0x90, 0xE0, // D
    0xF0, 0x80, 0xF0, 0x80, 0xF0, // E
    0xF0, 0x80, 0xF0, 0x80, 0x80, // F
];
