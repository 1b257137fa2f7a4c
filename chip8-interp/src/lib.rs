mod bytecode;
mod clock;
pub mod constants;
mod cpu;
mod devices;
mod disasm;
mod display;
mod error;
mod vm;

pub use self::{
    bytecode::Op,
    clock::Hz,
    devices::{InvalidKeyCode, KeyCode, RandomSource},
    display::DisplayBuffer,
    error::{Fault, FaultKind},
    vm::{Flow, RunState, DEFAULT_CLOCK_FREQUENCY},
};

/// Version of this implementation.
pub const IMPL_VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod prelude {
    pub use super::{
        cpu::Chip8Cpu,
        disasm::Disassembler,
        error::{Chip8Error, Chip8Result},
        vm::{Chip8Conf, Chip8Vm},
    };
}
