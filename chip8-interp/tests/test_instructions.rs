use std::time::Duration;

use chip8_interp::{constants::*, prelude::*, Fault, FaultKind, Flow, KeyCode, RunState};

const START: Address = MEM_START as Address;

fn load(program: &[u8]) -> Chip8Vm {
    let mut vm = Chip8Vm::new(Chip8Conf {
        rng_seed: Some(0),
        ..Default::default()
    });
    vm.load_bytecode(program).unwrap();
    vm
}

/// Load `x` into `Va`, `y` into `Vb`, then apply the 8xy_ instruction `op`.
fn math(x: u8, y: u8, op: u8) -> Chip8Vm {
    let mut vm = load(&[0x6A, x, 0x6B, y, 0x8A, 0xB0 | op]);
    vm.run_steps(3).unwrap();
    vm
}

/// Operand values that sit on the carry and borrow edges, plus a spread of others.
fn operands() -> Vec<u8> {
    let mut values: Vec<u8> = (0..=255).step_by(13).collect();
    values.extend([1, 2, 0x7F, 0x80, 0xFE, 0xFF]);
    values
}

#[test]
fn test_add_carry_flag() {
    for x in operands() {
        for y in operands() {
            let vm = math(x, y, 0x4);
            let expected = x as u16 + y as u16 > 0xFF;
            assert_eq!(vm.registers()[0xA], x.wrapping_add(y), "{x} + {y}");
            assert_eq!(vm.registers()[0xF], expected as u8, "{x} + {y}");
        }
    }

    assert_eq!(math(0xFF, 0x01, 0x4).registers()[0xF], 1);
    assert_eq!(math(0xFF, 0x00, 0x4).registers()[0xF], 0);
}

#[test]
fn test_sub_borrow_flag() {
    for x in operands() {
        for y in operands() {
            let vm = math(x, y, 0x5);
            assert_eq!(vm.registers()[0xA], x.wrapping_sub(y), "{x} - {y}");
            assert_eq!(vm.registers()[0xF], (x >= y) as u8, "{x} - {y}");

            let vm = math(x, y, 0x7);
            assert_eq!(vm.registers()[0xA], y.wrapping_sub(x), "{y} - {x}");
            assert_eq!(vm.registers()[0xF], (y >= x) as u8, "{y} - {x}");
        }
    }

    assert_eq!(math(0x01, 0x02, 0x5).registers()[0xF], 0);
    assert_eq!(math(0x02, 0x02, 0x5).registers()[0xF], 1);
}

#[test]
fn test_bitwise_ops() {
    let vm = math(0b1100, 0b1010, 0x1);
    assert_eq!(vm.registers()[0xA], 0b1110);
    let vm = math(0b1100, 0b1010, 0x2);
    assert_eq!(vm.registers()[0xA], 0b1000);
    let vm = math(0b1100, 0b1010, 0x3);
    assert_eq!(vm.registers()[0xA], 0b0110);
    let vm = math(0b1100, 0b1010, 0x0);
    assert_eq!(vm.registers()[0xA], 0b1010);
}

#[test]
fn test_shifts() {
    let vm = math(0b1000_0011, 0, 0x6);
    assert_eq!(vm.registers()[0xA], 0b0100_0001);
    assert_eq!(vm.registers()[0xF], 1);

    let vm = math(0b1000_0010, 0, 0x6);
    assert_eq!(vm.registers()[0xF], 0);

    let vm = math(0b1000_0011, 0, 0xE);
    assert_eq!(vm.registers()[0xA], 0b0000_0110);
    assert_eq!(vm.registers()[0xF], 1);

    let vm = math(0b0100_0011, 0, 0xE);
    assert_eq!(vm.registers()[0xF], 0);
}

/// The flag is written after the result, so it wins when Vx is VF.
#[test]
#[rustfmt::skip]
fn test_flag_register_as_operand() {
    // SHR vF
    let mut vm = load(&[0x6F, 0b0000_0011, 0x8F, 0x06]);
    vm.run_steps(2).unwrap();
    assert_eq!(vm.registers()[0xF], 1);

    // SHL vF
    let mut vm = load(&[0x6F, 0b0100_0000, 0x8F, 0x0E]);
    vm.run_steps(2).unwrap();
    assert_eq!(vm.registers()[0xF], 0);

    // ADD vF, v1
    let mut vm = load(&[
        0x6F, 0xFF, // LD vF, 0xFF
        0x61, 0x02, // LD v1, 2
        0x8F, 0x14, // ADD vF, v1
    ]);
    vm.run_steps(3).unwrap();
    assert_eq!(vm.registers()[0xF], 1);

    // SUB vF, v1 without a borrow
    let mut vm = load(&[0x6F, 0x05, 0x61, 0x02, 0x8F, 0x15]);
    vm.run_steps(3).unwrap();
    assert_eq!(vm.registers()[0xF], 1);
}

#[test]
#[rustfmt::skip]
fn test_add_byte_leaves_flag() {
    let mut vm = load(&[
        0x6F, 0x07, // LD vF, 7
        0x60, 0xFF, // LD v0, 0xFF
        0x70, 0x02, // ADD v0, 2
    ]);
    vm.run_steps(3).unwrap();
    assert_eq!(vm.registers()[0], 1);
    assert_eq!(vm.registers()[0xF], 7);
}

#[test]
#[rustfmt::skip]
fn test_conditional_skips() {
    // (program, skipped)
    let cases: [([u8; 4], bool); 8] = [
        ([0x30, 0x00, 0x00, 0x00], true),  // SE v0, 0
        ([0x30, 0x01, 0x00, 0x00], false), // SE v0, 1
        ([0x40, 0x01, 0x00, 0x00], true),  // SNE v0, 1
        ([0x40, 0x00, 0x00, 0x00], false), // SNE v0, 0
        ([0x61, 0x00, 0x50, 0x10], true),  // LD v1, 0 ; SE v0, v1
        ([0x61, 0x01, 0x50, 0x10], false), // LD v1, 1 ; SE v0, v1
        ([0x61, 0x01, 0x90, 0x10], true),  // LD v1, 1 ; SNE v0, v1
        ([0x61, 0x00, 0x90, 0x10], false), // LD v1, 0 ; SNE v0, v1
    ];

    for (program, skipped) in cases {
        let mut vm = load(&program);
        // Single instruction cases are padded with a zero word.
        let steps = if program[2] == 0 { 1 } else { 2 };
        vm.run_steps(steps).unwrap();

        let instr_addr = START + (steps as Address - 1) * 2;
        let expected = if skipped { instr_addr + 4 } else { instr_addr + 2 };
        assert_eq!(vm.pc(), expected, "{program:02X?}");
    }
}

#[test]
#[rustfmt::skip]
fn test_key_skips() {
    let program = [
        0x60, 0x17, // LD v0, 0x17  ; low nibble selects key 7
        0xE0, 0x9E, // SKP v0
        0x00, 0x00,
        0xE0, 0xA1, // SKNP v0
    ];

    let mut vm = load(&program);
    vm.set_key(KeyCode::Key7, true);
    vm.run_steps(2).unwrap();
    assert_eq!(vm.pc(), START + 6);
    vm.step().unwrap();
    assert_eq!(vm.pc(), START + 8);

    let mut vm = load(&program);
    vm.run_steps(2).unwrap();
    assert_eq!(vm.pc(), START + 4);
}

#[test]
fn test_call_return_round_trip() {
    for depth in 1..=STACK_SIZE {
        // Nested calls, each subroutine calling the next one
        // down until the deepest returns.
        let mut program = Vec::new();
        for level in 0..depth {
            let target = START + (level as Address + 1) * 4;
            program.extend([0x20 | (target >> 8) as u8, target as u8]);
            program.extend([0x00, 0xEE]);
        }
        // Deepest subroutine returns immediately.
        program.extend([0x00, 0xEE]);

        let mut vm = load(&program);
        vm.run_steps(depth).unwrap();
        assert_eq!(vm.stack_depth(), depth);

        // Each return lands on the RET following its call.
        vm.run_steps(depth).unwrap();
        assert_eq!(vm.stack_depth(), 0);
        assert_eq!(vm.pc(), START + 2, "depth {depth}");
    }
}

#[test]
fn test_stack_overflow() {
    // CALL 0x200, forever
    let mut vm = load(&[0x22, 0x00]);

    vm.run_steps(STACK_SIZE).unwrap();
    assert_eq!(vm.stack_depth(), STACK_SIZE);

    match vm.step() {
        Err(Chip8Error::Runtime(fault)) => {
            assert_eq!(fault.kind, FaultKind::StackOverflow);
            assert_eq!(fault.address, START);
            assert_eq!(fault.instr, 0x2200);
        }
        other => panic!("expected stack overflow, got {other:?}"),
    }
    assert_eq!(vm.state(), RunState::Stopped);
    assert_eq!(vm.stack_depth(), STACK_SIZE);
}

#[test]
fn test_configured_stack_depth() {
    let mut vm = Chip8Vm::new(Chip8Conf {
        stack_size: 64,
        ..Default::default()
    });
    vm.load_bytecode(&[0x22, 0x00]).unwrap();

    vm.run_steps(64).unwrap();
    assert_eq!(vm.stack_depth(), 64);
    assert!(vm.step().is_err());
}

#[test]
fn test_stack_underflow() {
    let mut vm = load(&[0x00, 0xEE]);

    match vm.step() {
        Err(Chip8Error::Runtime(fault)) => {
            assert_eq!(fault.kind, FaultKind::StackUnderflow);
            assert_eq!(fault.address, START);
            assert_eq!(fault.instr, 0x00EE);
        }
        other => panic!("expected stack underflow, got {other:?}"),
    }
    assert_eq!(vm.step().unwrap(), Flow::Interrupt);
}

#[test]
fn test_register_dump_round_trip() {
    let mut program = Vec::new();
    for v in 0..=0xE_u8 {
        // LD vN, value
        program.extend([0x60 | v, v * 11 + 3]);
    }
    program.extend([
        0xA3, 0x00, // LD I, 0x300
        0xFE, 0x55, // LD [I], vE
    ]);
    for v in 0..=0xE_u8 {
        program.extend([0x60 | v, 0x00]);
    }
    program.extend([0xFE, 0x65]); // LD vE, [I]

    let mut vm = load(&program);

    vm.run_steps(17).unwrap();
    let saved = *vm.registers();
    assert_eq!(vm.index(), 0x300);
    for v in 0..=0xE {
        assert_eq!(vm.memory()[0x300 + v], saved[v]);
    }
    // Only V0 to VE were stored.
    assert_eq!(vm.memory()[0x30F], 0);

    vm.run_steps(16).unwrap();
    assert_eq!(vm.registers(), &saved);
    assert_eq!(vm.index(), 0x300);
}

#[test]
#[rustfmt::skip]
fn test_bcd() {
    let mut vm = load(&[
        0x60, 157,  // LD v0, 157
        0xA3, 0x00, // LD I, 0x300
        0xF0, 0x33, // LD B, v0
        0x61, 0,    // LD v1, 0
        0xA3, 0x10, // LD I, 0x310
        0xF1, 0x33, // LD B, v1
        0x62, 255,  // LD v2, 255
        0xA3, 0x20, // LD I, 0x320
        0xF2, 0x33, // LD B, v2
    ]);
    vm.run_steps(9).unwrap();

    assert_eq!(vm.memory()[0x300..0x303], [1, 5, 7]);
    assert_eq!(vm.memory()[0x310..0x313], [0, 0, 0]);
    assert_eq!(vm.memory()[0x320..0x323], [2, 5, 5]);
    assert_eq!(vm.index(), 0x320);
}

#[test]
#[rustfmt::skip]
fn test_add_index() {
    let mut vm = load(&[
        0xA0, 0xFF, // LD I, 0x0FF
        0x6F, 0x00, // LD vF, 0
        0x60, 0x02, // LD v0, 2
        0xF0, 0x1E, // ADD I, v0
    ]);
    vm.run_steps(4).unwrap();
    assert_eq!(vm.index(), 0x101);
    assert_eq!(vm.registers()[0xF], 0);
}

#[test]
#[rustfmt::skip]
fn test_draw_twice_restores_display() {
    let mut vm = load(&[
        0x60, 0x3C, // LD v0, 60
        0x61, 0x1E, // LD v1, 30
        0x62, 0x0B, // LD v2, 0xB
        0xF2, 0x29, // LD F, v2
        0xD0, 0x15, // DRW v0, v1, 5
        0xD0, 0x15, // DRW v0, v1, 5
    ]);

    vm.run_steps(4).unwrap();
    let before = vm.display_buffer().clone();

    assert_eq!(vm.step().unwrap(), Flow::Draw);
    assert_eq!(vm.registers()[0xF], 0);
    assert_ne!(vm.display_buffer(), &before);

    assert_eq!(vm.step().unwrap(), Flow::Draw);
    assert_eq!(vm.registers()[0xF], 1);
    assert_eq!(vm.display_buffer(), &before);
}

#[test]
#[rustfmt::skip]
fn test_clear_screen() {
    let mut vm = load(&[
        0xF0, 0x29, // LD F, v0
        0xD0, 0x05, // DRW v0, v0, 5
        0x00, 0xE0, // CLS
    ]);
    vm.run_steps(2).unwrap();
    assert!(vm.display_buffer().count_lit() > 0);

    vm.step().unwrap();
    assert_eq!(vm.display_buffer().count_lit(), 0);
}

#[test]
#[rustfmt::skip]
fn test_timer_decay() {
    let mut vm = load(&[
        0x60, 0x0A, // LD v0, 10
        0xF0, 0x15, // LD DT, v0
        0xF0, 0x18, // LD ST, v0
        0xF1, 0x07, // LD v1, DT
    ]);
    assert_eq!(vm.run_steps(3).unwrap(), Flow::Sound);

    let tick = Duration::from_nanos(CLOCK_CYCLE_TIME);
    for remaining in (0..10).rev() {
        assert_eq!(vm.advance_timers(tick), 1);
        assert_eq!(vm.delay_timer(), remaining);
        assert_eq!(vm.sound_timer(), remaining);
    }

    vm.tick_timers();
    assert_eq!(vm.delay_timer(), 0);

    vm.step().unwrap();
    assert_eq!(vm.registers()[1], 0);
}

#[test]
#[rustfmt::skip]
fn test_await_key_blocks_stepping() {
    let mut vm = load(&[
        0x60, 0x03, // LD v0, 3
        0xF0, 0x15, // LD DT, v0
        0xF5, 0x0A, // LD v5, K
        0x66, 0x01, // LD v6, 1
    ]);

    assert_eq!(vm.run_steps(100).unwrap(), Flow::KeyWait);
    assert_eq!(vm.pc(), START + 6);

    let tick = Duration::from_nanos(CLOCK_CYCLE_TIME);
    for _ in 0..3 {
        assert_eq!(vm.run_frame(10, tick).unwrap(), Flow::KeyWait);
        assert_eq!(vm.pc(), START + 6);
    }
    assert_eq!(vm.delay_timer(), 0);
    assert_eq!(vm.registers()[6], 0);

    vm.set_keys(&[
        false, false, false, false,
        false, false, false, false,
        false, true,  false, false,
        false, false, false, true,
    ]);
    vm.run_steps(2).unwrap();

    assert_eq!(vm.registers()[5], 0x9);
    assert_eq!(vm.registers()[6], 1);
    assert_eq!(vm.pc(), START + 8);
}

#[test]
#[rustfmt::skip]
fn test_read_delay_timer_mid_countdown() {
    let mut vm = load(&[
        0x60, 0x0A, // LD v0, 10
        0xF0, 0x15, // LD DT, v0
        0xF1, 0x07, // LD v1, DT
    ]);
    vm.run_steps(2).unwrap();

    let tick = Duration::from_nanos(CLOCK_CYCLE_TIME);
    assert_eq!(vm.advance_timers(tick * 3), 3);

    vm.step().unwrap();
    assert_eq!(vm.registers()[1], 7);
}

/// Run until the machine faults, returning the fault.
fn run_to_fault(vm: &mut Chip8Vm) -> Fault {
    for _ in 0..100 {
        match vm.step() {
            Ok(_) => continue,
            Err(Chip8Error::Runtime(fault)) => {
                assert_eq!(vm.state(), RunState::Stopped);
                assert_eq!(vm.pc(), fault.address);
                return fault;
            }
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
    panic!("program did not fault");
}

#[test]
#[rustfmt::skip]
fn test_draw_past_end_of_memory() {
    let mut vm = load(&[
        0x60, 0x00, // LD v0, 0
        0xF0, 0x29, // LD F, v0
        0xD0, 0x05, // DRW v0, v0, 5
        0x6F, 0x07, // LD vF, 7
        0xAF, 0xFE, // LD I, 0xFFE
        0xD0, 0x05, // DRW v0, v0, 5
    ]);
    vm.run_steps(5).unwrap();
    let before = vm.display_buffer().clone();

    let fault = run_to_fault(&mut vm);
    assert_eq!(fault.kind, FaultKind::MemoryOutOfBounds { address: 0x1002 });
    assert_eq!(fault.address, START + 10);
    assert_eq!(fault.instr, 0xD005);

    // Neither the display nor the flag were touched.
    assert_eq!(vm.display_buffer(), &before);
    assert_eq!(vm.registers()[0xF], 7);
}

#[test]
#[rustfmt::skip]
fn test_bcd_past_end_of_memory() {
    let mut vm = load(&[
        0x60, 157,  // LD v0, 157
        0xAF, 0xFE, // LD I, 0xFFE
        0xF0, 0x33, // LD B, v0
    ]);

    let fault = run_to_fault(&mut vm);
    assert_eq!(fault.kind, FaultKind::MemoryOutOfBounds { address: 0x1000 });
    assert_eq!(fault.instr, 0xF033);
    assert_eq!(vm.memory()[0xFFE..], [0, 0]);
}

#[test]
#[rustfmt::skip]
fn test_load_registers_past_end_of_memory() {
    let mut vm = load(&[
        0x60, 0x09, // LD v0, 9
        0xAF, 0xF8, // LD I, 0xFF8
        0xFF, 0x65, // LD vF, [I]
    ]);

    let fault = run_to_fault(&mut vm);
    assert_eq!(fault.kind, FaultKind::MemoryOutOfBounds { address: 0x1007 });
    assert_eq!(fault.address, START + 4);
    assert_eq!(vm.registers()[0], 9);
    assert_eq!(vm.index(), 0xFF8);
}

#[test]
#[rustfmt::skip]
fn test_jump_v0_outside_memory() {
    let mut vm = load(&[
        0x60, 0xFF, // LD v0, 0xFF
        0xBF, 0xFF, // JP v0, 0xFFF
    ]);
    assert_eq!(vm.run_steps(2).unwrap(), Flow::Jump);
    assert_eq!(vm.pc(), 0x10FE);

    let fault = run_to_fault(&mut vm);
    assert_eq!(fault.kind, FaultKind::MemoryOutOfBounds { address: 0x10FF });
    assert_eq!(fault.address, 0x10FE);
    assert_eq!(fault.instr, 0);
}
