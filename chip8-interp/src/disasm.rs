//! Disassembler.
use std::fmt::{self, Write as FmtWrite};

use crate::{
    bytecode::{instr_word, Op},
    constants::MEM_START,
};

pub struct Disassembler<'a> {
    bytecode: &'a [u8],
}

impl<'a> Disassembler<'a> {
    pub fn new(bytecode: &'a [u8]) -> Self {
        Self { bytecode }
    }

    /// Write the whole program, one instruction per line.
    ///
    /// Addresses are where the program is loaded in the virtual machine.
    /// A trailing odd byte is written as data.
    pub fn disassemble<W: FmtWrite>(&self, w: &mut W) -> fmt::Result {
        for (i, chunk) in self.bytecode.chunks(2).enumerate() {
            let address = MEM_START + i * 2;

            match *chunk {
                [a, b] => {
                    let instr = instr_word([a, b]);
                    writeln!(w, "0x{address:03X}  {instr:04X}  {}", Op::decode(instr))?;
                }
                [a] => writeln!(w, "0x{address:03X}  {a:02X}    0b{a:08b}")?,
                _ => {}
            }
        }

        Ok(())
    }

    pub fn to_text(&self) -> Result<String, fmt::Error> {
        let mut buf = String::new();
        self.disassemble(&mut buf)?;
        Ok(buf)
    }
}
