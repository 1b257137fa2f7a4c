//! Virtual machine.
use std::{
    fmt::{self, Write},
    time::Duration,
};

use log::{debug, error, warn};
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    bytecode::Op,
    clock::{Clock, Hz},
    constants::*,
    cpu::Chip8Cpu,
    devices::{KeyCode, RandomSource},
    display::DisplayBuffer,
    error::{Chip8Error, Chip8Result, Fault, FaultKind},
};

/// Instruction rate used by [`Chip8Vm::run_for`] when none is configured.
pub const DEFAULT_CLOCK_FREQUENCY: Hz = Hz(700);

pub struct Chip8Vm {
    cpu: Chip8Cpu,
    /// Instruction clock.
    clock: Clock,
    /// Delay and sound timer clock.
    timer: Clock,
    rng: Box<dyn RandomSource>,
    /// Program image, kept so the machine can be restarted.
    program: Vec<u8>,
    state: RunState,
    /// First key pressed down while waiting on `Fx0A`.
    key_press: Option<u8>,
    conf: Chip8Conf,
}

/// Execution state of the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Not executing. Stepping does nothing.
    Stopped,
    Running,
    /// Suspended on `Fx0A (LD Vx, K)` until a key is pressed.
    AwaitingKey { vx: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Ok,
    /// The machine is stopped.
    Interrupt,
    /// Program counter has jumped to a new address.
    ///
    /// This is useful for the caller to avoid being
    /// blocked on infinite or long running loops.
    ///
    /// This is returned when the interpreter encounters:
    ///
    /// - 1nnn (`JP addr`)
    /// - 2nnn (`CALL addr`)
    /// - 00EE (`RET`)
    /// - Bnnn (`JP V0, addr`)
    Jump,
    /// Display buffer changed.
    Draw,
    /// Sound timer was written.
    Sound,
    /// Wait for a keypress.
    ///
    /// This is triggered by the opcode `Fx0A` (`LD Vx, K`), which stops
    /// execution until a key is pressed, and loads the key value into `Vx`.
    KeyWait,
    /// An unknown instruction was skipped in permissive mode.
    Skipped { address: Address, instr: u16 },
}

/// VM Configuration Parameters.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize), serde(default))]
pub struct Chip8Conf {
    /// Instructions executed per second by [`Chip8Vm::run_for`].
    ///
    /// Zero, or a rate faster than one instruction per nanosecond,
    /// falls back to [`DEFAULT_CLOCK_FREQUENCY`].
    pub clock_frequency: Option<Hz>,
    /// Levels of subroutine nesting before a call faults.
    pub stack_size: usize,
    /// Treat unknown opcodes as fatal. When off they are logged and skipped.
    pub strict: bool,
    /// Seed for the random number generator, for reproducible runs.
    pub rng_seed: Option<u64>,
}

impl Default for Chip8Conf {
    fn default() -> Self {
        Self {
            clock_frequency: None,
            stack_size: STACK_SIZE,
            strict: true,
            rng_seed: None,
        }
    }
}

impl Chip8Vm {
    pub fn new(conf: Chip8Conf) -> Self {
        let rng = match conf.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self::with_rng(conf, rng)
    }

    /// Create a machine drawing random numbers from the given source.
    pub fn with_rng(conf: Chip8Conf, rng: impl RandomSource + 'static) -> Self {
        let mut freq = conf.clock_frequency.unwrap_or(DEFAULT_CLOCK_FREQUENCY);
        if Duration::from(freq).is_zero() {
            warn!(
                "clock frequency of {} Hz has no usable period, using {} Hz",
                freq.0, DEFAULT_CLOCK_FREQUENCY.0
            );
            freq = DEFAULT_CLOCK_FREQUENCY;
        }

        let mut vm = Chip8Vm {
            cpu: Chip8Cpu::new(conf.stack_size),
            clock: Clock::new(freq.into()),
            timer: Clock::timer(),
            rng: Box::new(rng),
            program: Vec::new(),
            state: RunState::Stopped,
            key_press: None,
            conf,
        };
        vm.load_builtin_font();
        vm
    }

    /// Configuration that was used to instantiate the VM.
    pub fn config(&self) -> &Chip8Conf {
        &self.conf
    }

    fn load_builtin_font(&mut self) {
        let start = FONTSET_START as usize;
        self.cpu.ram[start..start + FONTSET_DATA_LENGTH].copy_from_slice(&FONTSET);
    }

    /// Load a program image and start executing it from [`MEM_START`].
    pub fn load_bytecode(&mut self, bytecode: &[u8]) -> Chip8Result<()> {
        if !check_program_size(bytecode) {
            return Err(Chip8Error::LargeProgram(bytecode.len()));
        }

        self.program.clear();
        self.program.extend_from_slice(bytecode);
        debug!("loaded program of {} bytes", bytecode.len());

        self.start();

        Ok(())
    }

    /// Reinitialize all machine state and begin fetching at [`MEM_START`].
    pub fn start(&mut self) {
        // Start with clean memory to avoid leaking previous program.
        self.cpu.reset();

        // Reset fonts
        self.load_builtin_font();

        // Load program into virtual RAM
        self.cpu.ram[MEM_START..MEM_START + self.program.len()].copy_from_slice(&self.program);

        self.key_press = None;
        self.clock.reset();
        self.timer.reset();
        self.state = RunState::Running;

        debug!("started at 0x{:03X}", self.cpu.pc);
    }

    /// Halt stepping. Machine state is left intact for inspection.
    pub fn stop(&mut self) {
        if self.state != RunState::Stopped {
            debug!("stopped at 0x{:03X}", self.cpu.pc);
        }
        self.state = RunState::Stopped;
    }
}

#[inline]
fn check_program_size(bytecode: &[u8]) -> bool {
    bytecode.len() <= MAX_PROGRAM_SIZE
}

/// Machine state
impl Chip8Vm {
    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state != RunState::Stopped
    }

    pub fn display_buffer(&self) -> &DisplayBuffer {
        &self.cpu.display
    }

    pub fn registers(&self) -> &[u8; REGISTER_COUNT] {
        &self.cpu.registers
    }

    pub fn memory(&self) -> &[u8; MEM_SIZE] {
        &self.cpu.ram
    }

    pub fn pc(&self) -> Address {
        self.cpu.pc
    }

    /// Index register `I`.
    pub fn index(&self) -> Address {
        self.cpu.address
    }

    /// Current depth of the call stack.
    pub fn stack_depth(&self) -> usize {
        self.cpu.sp
    }

    pub fn delay_timer(&self) -> u8 {
        self.cpu.delay_timer
    }

    pub fn sound_timer(&self) -> u8 {
        self.cpu.sound_timer
    }

    /// The buzzer sounds while the sound timer is counting down.
    pub fn is_buzzing(&self) -> bool {
        self.cpu.sound_timer > 0
    }

    /// Decode the instruction at the program counter without executing it.
    pub fn current_op(&self) -> Option<Op> {
        self.cpu.fetch().ok().map(Op::decode)
    }
}

/// Input
impl Chip8Vm {
    /// Sets the keyboard key input state.
    ///
    /// A key going down while the VM is waiting for keyboard input
    /// resumes it on the next step.
    pub fn set_key(&mut self, key: KeyCode, pressed: bool) {
        let key_id = key.as_u8();
        let was_pressed = self.cpu.key_state(key_id);
        self.cpu.set_key_state(key_id, pressed);

        if pressed && !was_pressed && self.key_press.is_none() {
            if let RunState::AwaitingKey { .. } = self.state {
                self.key_press = Some(key_id);
            }
        }
    }

    /// Replace the whole keypad state.
    pub fn set_keys(&mut self, keys: &[bool; KEY_COUNT as usize]) {
        for (key, pressed) in KeyCode::ALL.iter().zip(keys) {
            self.set_key(*key, *pressed);
        }
    }

    /// Clear the keyboard input state, setting all keys to up.
    pub fn clear_keys(&mut self) {
        self.cpu.clear_keys()
    }
}

/// Timers
impl Chip8Vm {
    /// Count both timers down by one cycle.
    ///
    /// Timers keep running while waiting for a key, but not while stopped.
    pub fn tick_timers(&mut self) {
        if self.state == RunState::Stopped {
            return;
        }

        self.cpu.tick_delay();
        self.cpu.tick_sound();
    }

    /// Advance the timer clock by elapsed real time, returning the number of timer cycles.
    pub fn advance_timers(&mut self, elapsed: Duration) -> u64 {
        if self.state == RunState::Stopped {
            return 0;
        }

        let cycles = self.timer.advance(elapsed);

        // Timers are 8 bits wide, so any ticks past that reach zero anyway.
        for _ in 0..cycles.min(u8::MAX as u64) {
            self.tick_timers();
        }
        cycles
    }
}

/// Interpreter
impl Chip8Vm {
    /// Execute up to `step_count` instructions.
    ///
    /// Returns early when the machine suspends on a key wait or is stopped.
    pub fn run_steps(&mut self, step_count: usize) -> Chip8Result<Flow> {
        let mut flow = Flow::Ok;

        for _ in 0..step_count {
            flow = self.step()?;
            if matches!(flow, Flow::KeyWait | Flow::Interrupt) {
                break;
            }
        }

        Ok(flow)
    }

    /// A single frame of the driving loop.
    ///
    /// Executes up to `step_count` instructions, then advances the timers.
    pub fn run_frame(&mut self, step_count: usize, elapsed: Duration) -> Chip8Result<Flow> {
        let flow = self.run_steps(step_count)?;
        self.advance_timers(elapsed);
        Ok(flow)
    }

    /// Run as many instructions as the configured clock frequency allows
    /// in the elapsed time, then advance the timers.
    pub fn run_for(&mut self, elapsed: Duration) -> Chip8Result<Flow> {
        let step_count = usize::try_from(self.clock.advance(elapsed)).unwrap_or(usize::MAX);
        self.run_frame(step_count, elapsed)
    }

    /// Fetch, decode and execute a single instruction.
    ///
    /// A fault stops the machine and leaves the program counter
    /// on the faulting instruction.
    pub fn step(&mut self) -> Chip8Result<Flow> {
        match self.state {
            RunState::Stopped => return Ok(Flow::Interrupt),
            RunState::AwaitingKey { vx } => {
                return match self.key_press.take() {
                    Some(key) => {
                        self.cpu.registers[vx as usize] = key;
                        self.state = RunState::Running;
                        Ok(Flow::Ok)
                    }
                    None => Ok(Flow::KeyWait),
                };
            }
            RunState::Running => {}
        }

        let address = self.cpu.pc;

        let instr = match self.cpu.fetch() {
            Ok(instr) => instr,
            Err(kind) => return Err(self.fault(address, 0, kind)),
        };

        // Each instruction is two bytes, so the counter points past it
        // before execution. Jumps simply overwrite it.
        self.cpu.pc += 2;

        let op = Op::decode(instr);
        op_trace(address, instr, &op);

        match self.exec(op) {
            Ok(flow) => Ok(flow),
            Err(kind) => Err(self.fault(address, instr, kind)),
        }
    }

    fn fault(&mut self, address: Address, instr: u16, kind: FaultKind) -> Chip8Error {
        let fault = Fault {
            address,
            instr,
            kind,
        };
        error!("{fault}");

        self.cpu.pc = address;
        self.state = RunState::Stopped;

        Chip8Error::Runtime(fault)
    }

    /// Execute a decoded instruction.
    ///
    /// Handlers check every fallible condition before mutating state.
    /// Where an instruction sets VF, the flag is written last,
    /// so it wins over the result when `Vx` is VF itself.
    fn exec(&mut self, op: Op) -> Result<Flow, FaultKind> {
        let mut control_flow = Flow::Ok;
        let regs = &mut self.cpu.registers;

        match op {
            // 00E0 (CLS)
            //
            // Clear display
            Op::ClearScreen => {
                self.cpu.clear_display();
                control_flow = Flow::Draw;
            }
            // 00EE (RET)
            //
            // Return from a subroutine.
            // Set the program counter to the value at the top of the stack.
            Op::Return => {
                self.cpu.pc = self.cpu.pop()?;
                control_flow = Flow::Jump;
            }
            // 1nnn (JP addr)
            //
            // Jump to address.
            Op::JumpAddress { address } => {
                self.cpu.pc = address;
                control_flow = Flow::Jump;
            }
            // 2nnn (CALL addr)
            //
            // Call subroutine at nnn. The return address is the instruction after the call.
            Op::Call { address } => {
                self.cpu.push(self.cpu.pc)?;
                self.cpu.pc = address;
                control_flow = Flow::Jump;
            }
            // 3xnn (SE Vx, byte)
            //
            // Skip the next instruction if register Vx equals value nn.
            Op::Skip_Eq_Byte { vx, nn } => {
                if regs[vx as usize] == nn {
                    self.cpu.pc += 2;
                }
            }
            // 4xnn (SNE Vx, byte)
            //
            // Skip the next instruction if register Vx does not equal value nn.
            Op::Skip_NotEq_Byte { vx, nn } => {
                if regs[vx as usize] != nn {
                    self.cpu.pc += 2;
                }
            }
            // 5xy0 (SE Vx, Vy)
            Op::Skip_Eq { vx, vy } => {
                if regs[vx as usize] == regs[vy as usize] {
                    self.cpu.pc += 2;
                }
            }
            // 6xnn (LD Vx, byte)
            Op::Load_Byte { vx, nn } => {
                regs[vx as usize] = nn;
            }
            // 7xnn (ADD Vx, byte)
            //
            // Add value nn to register Vx. Carry flag is not set.
            Op::Add_Byte { vx, nn } => {
                regs[vx as usize] = regs[vx as usize].wrapping_add(nn);
            }
            // 8xy0 (LD Vx, Vy)
            //
            // Store the value of register Vy in register Vx.
            Op::Load_Vx_Vy { vx, vy } => {
                regs[vx as usize] = regs[vy as usize];
            }
            // 8xy1 (OR Vx, Vy)
            Op::Or_Vx_Vy { vx, vy } => {
                regs[vx as usize] |= regs[vy as usize];
            }
            // 8xy2 (AND Vx, Vy)
            Op::And_Vx_Vy { vx, vy } => {
                regs[vx as usize] &= regs[vy as usize];
            }
            // 8xy3 (XOR Vx, Vy)
            Op::Xor_Vx_Vy { vx, vy } => {
                regs[vx as usize] ^= regs[vy as usize];
            }
            // 8xy4 (ADD Vx, Vy)
            //
            // Overflow is wrapped.
            // If overflow, set VF to 1, else 0.
            Op::Add_Vx_Vy { vx, vy } => {
                let (result, carry) = regs[vx as usize].overflowing_add(regs[vy as usize]);
                regs[vx as usize] = result;
                regs[FLAG_REGISTER] = carry as u8;
            }
            // 8xy5 (SUB Vx, Vy)
            //
            // Subtracts Vy from Vx, and stores the result in Vx.
            // VF is set to 0 when there is a borrow, set to 1 when there isn't.
            Op::Sub_Vx_Vy { vx, vy } => {
                let (result, borrow) = regs[vx as usize].overflowing_sub(regs[vy as usize]);
                regs[vx as usize] = result;
                regs[FLAG_REGISTER] = !borrow as u8;
            }
            // 8xy6 (SHR Vx)
            //
            // Shift Vx right by 1. VF is set to the bit shifted out.
            // Vy is unused.
            Op::ShiftRight { vx, .. } => {
                let x = regs[vx as usize];
                regs[vx as usize] = x >> 1;
                regs[FLAG_REGISTER] = x & 1;
            }
            // 8xy7 (SUBN Vx, Vy)
            //
            // Subtracts Vx from Vy, and stores the result in Vx.
            // VF is set to 0 when there is a borrow, set to 1 when there isn't.
            Op::SubReverse_Vx_Vy { vx, vy } => {
                let (result, borrow) = regs[vy as usize].overflowing_sub(regs[vx as usize]);
                regs[vx as usize] = result;
                regs[FLAG_REGISTER] = !borrow as u8;
            }
            // 8xyE (SHL Vx)
            //
            // Shift Vx left by 1. VF is set to the most significant bit before the shift.
            // Vy is unused.
            Op::ShiftLeft { vx, .. } => {
                let x = regs[vx as usize];
                regs[vx as usize] = x << 1;
                regs[FLAG_REGISTER] = (x >> 7) & 1;
            }
            // 9xy0 (SNE Vx, Vy)
            Op::Skip_NotEq { vx, vy } => {
                if regs[vx as usize] != regs[vy as usize] {
                    self.cpu.pc += 2;
                }
            }
            // Annn (LD I, addr)
            //
            // Set address register I to value nnn.
            Op::Load_Address { address } => {
                self.cpu.address = address;
            }
            // Bnnn (JP V0, addr)
            //
            // Jump to location nnn + V0. The target is checked on the next fetch.
            Op::Jump_V0 { address } => {
                self.cpu.pc = address + regs[0] as Address;
                control_flow = Flow::Jump;
            }
            // Cxnn (RND Vx, byte)
            //
            // Set register Vx to the result of bitwise AND between a random number and nn.
            Op::Random { vx, nn } => {
                regs[vx as usize] = self.rng.next_byte() & nn;
            }
            // Dxyn (DRW Vx, Vy, nibble)
            Op::Draw { vx, vy, n } => {
                self.exec_draw(vx, vy, n)?;
                control_flow = Flow::Draw;
            }
            // Ex9E (SKP Vx)
            //
            // Skip the next instruction if the key in the low nibble of Vx is down.
            Op::Skip_Key { vx } => {
                let key_id = regs[vx as usize] & 0xF;
                if self.cpu.key_state(key_id) {
                    self.cpu.pc += 2;
                }
            }
            // ExA1 (SKNP Vx)
            Op::Skip_NotKey { vx } => {
                let key_id = regs[vx as usize] & 0xF;
                if !self.cpu.key_state(key_id) {
                    self.cpu.pc += 2;
                }
            }
            // Fx07 (LD Vx, DT)
            //
            // Set Vx = delay timer value.
            Op::Load_Vx_Delay { vx } => {
                regs[vx as usize] = self.cpu.delay_timer;
            }
            // Fx0A (LD Vx, K)
            //
            // Wait for a key press, store the value of the key in Vx.
            // No instruction executes until a key goes down, but timers keep counting.
            Op::Wait_Key { vx } => {
                self.key_press = None;
                self.state = RunState::AwaitingKey { vx };
                control_flow = Flow::KeyWait;
            }
            // Fx15 (LD DT, Vx)
            Op::Load_Delay_Vx { vx } => {
                self.cpu.delay_timer = regs[vx as usize];
            }
            // Fx18 (LD ST, Vx)
            Op::Load_Sound_Vx { vx } => {
                self.cpu.sound_timer = regs[vx as usize];
                control_flow = Flow::Sound;
            }
            // Fx1E (ADD I, Vx)
            //
            // Add Vx to I. VF is not affected.
            Op::Add_Address { vx } => {
                self.cpu.address = self.cpu.address.wrapping_add(regs[vx as usize] as Address);
            }
            // Fx29 (LD F, Vx)
            //
            // Set I = location of sprite for the digit in the low nibble of Vx.
            Op::Load_Font { vx } => {
                let digit = (regs[vx as usize] & 0xF) as Address;
                self.cpu.address = FONTSET_START + digit * FONTSET_HEIGHT as Address;
            }
            // Fx33 (LD B, Vx)
            //
            // Store the binary-coded decimal representation of Vx
            // in the memory locations I, I+1, and I+2.
            #[rustfmt::skip]
            Op::Store_Bcd { vx } => {
                let range = self.cpu.mem_range(self.cpu.address as usize, 3)?;
                let x = self.cpu.registers[vx as usize];
                let bcd = &mut self.cpu.ram[range];
                bcd[0] = x / 100;
                bcd[1] = x / 10  % 10;
                bcd[2] = x       % 10;
            }
            // Fx55 (LD [I], Vx)
            //
            // Store registers V0 through Vx in memory starting at location I.
            // I itself is left unmodified.
            Op::Store_Registers { vx } => {
                let count = vx as usize + 1;
                let range = self.cpu.mem_range(self.cpu.address as usize, count)?;
                self.cpu.ram[range].copy_from_slice(&self.cpu.registers[..count]);
            }
            // Fx65 (LD Vx, [I])
            //
            // Read registers V0 through Vx from memory starting at location I.
            // I itself is left unmodified.
            Op::Load_Registers { vx } => {
                let count = vx as usize + 1;
                let range = self.cpu.mem_range(self.cpu.address as usize, count)?;
                self.cpu.registers[..count].copy_from_slice(&self.cpu.ram[range]);
            }
            Op::Unknown(instr) => {
                if self.conf.strict {
                    return Err(FaultKind::UnknownOpcode);
                }

                let address = self.cpu.pc - 2;
                warn!("skipping unsupported opcode 0x{instr:04X} at 0x{address:03X}");
                control_flow = Flow::Skipped { address, instr };
            }
        }

        Ok(control_flow)
    }

    /// Draw sprite to the display buffer, at coordinate as per registers Vx and Vy.
    /// Sprite is encoded as 8 pixels wide, `n` pixels high, stored in bits located in
    /// memory pointed to by address register I.
    ///
    /// If the sprite is drawn outside of the display area, it is wrapped around to the other side.
    ///
    /// If the drawing operation erases existing pixels in the display buffer, register VF is set to
    /// 1, and set to 0 if no display bits are unset. This is used for collision detection.
    fn exec_draw(&mut self, vx: u8, vy: u8, n: u8) -> Result<(), FaultKind> {
        let range = self.cpu.mem_range(self.cpu.address as usize, n as usize)?;
        let (x, y) = (
            self.cpu.registers[vx as usize] as usize,
            self.cpu.registers[vy as usize] as usize,
        );
        let mut is_erased = false;

        for (r, row) in self.cpu.ram[range].iter().enumerate() {
            // Each row is 8 bits representing the 8 pixels of the sprite.
            for c in 0..8 {
                let px = (row >> (7 - c)) & 1 != 0;
                is_erased |= self.cpu.display.xor_pixel(x + c, y + r, px);
            }
        }

        // If a pixel was erased, then a collision occurred.
        self.cpu.registers[FLAG_REGISTER] = is_erased as u8;

        Ok(())
    }
}

/// Troubleshooting
impl Chip8Vm {
    /// Returns the contents of the program memory as a human readable string.
    pub fn dump_ram(&self, count: usize) -> Result<String, fmt::Error> {
        let end = (MEM_START + count).min(MEM_SIZE - 1);
        let mut buf = String::new();

        for i in (MEM_START..end).step_by(2) {
            writeln!(buf, "{:04X}: {:02X}{:02X}", i, self.cpu.ram[i], self.cpu.ram[i + 1])?;
        }

        Ok(buf)
    }

    pub fn dump_display(&self) -> Result<String, fmt::Error> {
        let mut buf = String::new();

        for y in 0..DISPLAY_HEIGHT {
            for x in 0..DISPLAY_WIDTH {
                if self.cpu.display.pixel(x, y) {
                    write!(buf, "#")?;
                } else {
                    write!(buf, ".")?;
                }
            }
            writeln!(buf)?;
        }

        Ok(buf)
    }

    pub fn dump_keys(&self) -> Result<String, fmt::Error> {
        let mut buf = String::new();

        if self.cpu.any_key() {
            write!(buf, "keys:")?;
            for key in KeyCode::ALL {
                if self.cpu.key_state(key.as_u8()) {
                    write!(buf, " {key}")?;
                }
            }
        }

        Ok(buf)
    }
}

#[cfg(feature = "op_trace")]
#[inline]
fn op_trace(address: Address, instr: u16, op: &Op) {
    log::trace!("{address:04X}: {instr:04X} {op}");
}

#[cfg(not(feature = "op_trace"))]
#[inline]
fn op_trace(_: Address, _: u16, _: &Op) {}
