//! CPU and memory state.
use crate::{
    bytecode::instr_word,
    constants::*,
    display::DisplayBuffer,
    error::FaultKind,
};

/// Core state for a chip8 interpreter.
pub struct Chip8Cpu {
    // ------------------------------------------------------------------------
    // Registers
    /// Program counter holding the absolute memory address of the next instruction.
    pub(crate) pc: Address,
    /// Stack pointer, the number of return addresses on the stack.
    pub(crate) sp: usize,
    /// General purpose registers for temporary values.
    ///
    /// Register 16 (VF) is used for either the carry flag or borrow switch depending on opcode.
    pub(crate) registers: [u8; REGISTER_COUNT],
    /// Pointer register used for temporarily storing an address.
    pub(crate) address: Address,
    /// (DT) Delay timer that counts down to 0.
    pub(crate) delay_timer: u8,
    /// (ST) Sound timer that counts down to 0. When it has a non-zero value, a beep is played.
    pub(crate) sound_timer: u8,
    /// Keyboard input state. Pressed is a 1 bit, released is a 0 bit.
    pub(crate) key_state: u16,

    // ------------------------------------------------------------------------
    // Memory
    /// Main memory storage space.
    pub(crate) ram: Box<[u8; MEM_SIZE]>,
    /// Stack of return pointers used for jumping when a routine call finishes.
    ///
    /// The capacity is fixed at construction.
    pub(crate) stack: Box<[Address]>,
    /// Screen buffer that is drawn to.
    pub(crate) display: Box<DisplayBuffer>,
}

impl Default for Chip8Cpu {
    fn default() -> Self {
        Self::new(STACK_SIZE)
    }
}

impl Chip8Cpu {
    pub fn new(stack_size: usize) -> Self {
        Self {
            pc: MEM_START as Address,
            sp: 0,
            registers: [0; REGISTER_COUNT],
            address: 0,
            delay_timer: 0,
            sound_timer: 0,
            key_state: 0,

            ram: Box::new([0; MEM_SIZE]),
            stack: vec![0; stack_size].into_boxed_slice(),
            display: Box::default(),
        }
    }

    /// Return every register, memory buffer and timer to zero.
    ///
    /// The stack keeps its capacity.
    pub(crate) fn reset(&mut self) {
        self.pc = MEM_START as Address;
        self.sp = 0;
        self.registers.fill(0);
        self.address = 0;
        self.delay_timer = 0;
        self.sound_timer = 0;
        self.key_state = 0;
        self.clear_memory();
    }

    /// Erase the contents of the memory buffers `ram`, `stack` and `display`.
    pub(crate) fn clear_memory(&mut self) {
        self.ram.fill(0);
        self.stack.fill(0);
        self.display.clear();
    }

    pub fn clear_display(&mut self) {
        self.display.clear();
    }

    // ------------------------------------------------------------------------
    // Memory access

    /// Range of memory starting at `start`, checked against the RAM bounds.
    #[inline]
    pub(crate) fn mem_range(
        &self,
        start: usize,
        len: usize,
    ) -> Result<std::ops::Range<usize>, FaultKind> {
        let end = start + len;
        if end > MEM_SIZE {
            return Err(FaultKind::MemoryOutOfBounds { address: end - 1 });
        }
        Ok(start..end)
    }

    /// Read the instruction word at the program counter.
    #[inline]
    pub(crate) fn fetch(&self) -> Result<u16, FaultKind> {
        let range = self.mem_range(self.pc as usize, 2)?;
        let bytes = &self.ram[range];
        Ok(instr_word([bytes[0], bytes[1]]))
    }

    /// Push a return address onto the call stack.
    pub(crate) fn push(&mut self, address: Address) -> Result<(), FaultKind> {
        match self.stack.get_mut(self.sp) {
            Some(slot) => {
                *slot = address;
                self.sp += 1;
                Ok(())
            }
            None => Err(FaultKind::StackOverflow),
        }
    }

    /// Pop a return address off the call stack.
    pub(crate) fn pop(&mut self) -> Result<Address, FaultKind> {
        match self.sp.checked_sub(1) {
            Some(sp) => {
                self.sp = sp;
                Ok(self.stack[sp])
            }
            None => Err(FaultKind::StackUnderflow),
        }
    }

    // ------------------------------------------------------------------------
    // Keyboard

    pub fn set_key_state(&mut self, key_id: u8, state: bool) {
        if key_id < KEY_COUNT {
            if state {
                self.key_state |= 1 << key_id;
            } else {
                self.key_state &= !(1 << key_id);
            }
        }
    }

    pub fn key_state(&self, key_id: u8) -> bool {
        if key_id < KEY_COUNT {
            self.key_state & (1 << key_id) != 0
        } else {
            false
        }
    }

    /// Check whether any key is pressed down.
    #[inline(always)]
    pub fn any_key(&self) -> bool {
        self.key_state != 0
    }

    /// Retrieve the value of the first key that is pressed down.
    #[inline]
    pub fn first_key(&self) -> Option<u8> {
        if self.any_key() {
            Some(self.key_state.trailing_zeros() as u8)
        } else {
            None
        }
    }

    /// Clear the keyboard input state, setting all keys to up.
    #[inline(always)]
    pub fn clear_keys(&mut self) {
        self.key_state = 0;
    }

    // ------------------------------------------------------------------------
    // Timers

    /// Count down the delay timer.
    #[inline]
    pub fn tick_delay(&mut self) {
        self.delay_timer = self.delay_timer.saturating_sub(1);
    }

    #[inline]
    pub fn tick_sound(&mut self) {
        self.sound_timer = self.sound_timer.saturating_sub(1);
    }
}
