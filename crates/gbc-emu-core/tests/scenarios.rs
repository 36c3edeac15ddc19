//! End-to-end checks that drive a whole machine through short programs.

mod common;

use common::{RomBuilder, Timeline, dmg_machine, machine_with, run_to};
use gbc_emu_core::hardware::EmulationMode;

#[test]
fn bank_select_maps_bank_one() {
    let cart = RomBuilder::new(0x01, 0x00, 0x00).build();
    let mut gb = machine_with(cart, EmulationMode::Auto);
    assert_eq!(gb.read(0x4000), 1);

    gb.write(0x2000, 0x00);
    // Bank 0 in the switchable window is promoted to bank 1.
    assert_eq!(gb.read(0x4000), 1);
    gb.write(0x2000, 0x01);
    assert_eq!(gb.read(0x4000), 1);
    assert_eq!(gb.read(0x3FFF), 0);
}

#[test]
fn timer_interrupt_is_raised_one_cycle_after_overflow() {
    let mut t = Timeline::new(0);
    t.write_timer(0xFF07, 0x05);
    t.write_timer(0xFF05, 0xFF);
    t.write_timer(0xFF06, 0x42);

    t.advance(4);
    assert_eq!(t.read_timer(0xFF05), 0x00);
    assert_eq!(t.if_reg & 0x04, 0);

    t.advance(1);
    assert_eq!(t.if_reg & 0x04, 0x04);
    assert_eq!(t.read_timer(0xFF05), 0x42);
}

#[test]
fn timer_interrupt_dispatches_to_its_vector() {
    let mut gb = dmg_machine(&[
        0x3E, 0x04, 0xE0, 0xFF, // IE = timer only
        0xAF, 0xE0, 0x0F, // IF = 0
        0x3E, 0xF0, 0xE0, 0x05, // TIMA = $F0
        0x3E, 0x05, 0xE0, 0x07, // TAC = 5
        0xFB, // EI
    ]);
    run_to(&mut gb, 0x0160);
    // IME turns on after the instruction following EI.
    assert!(!gb.cpu.ime);
    gb.step();
    assert!(gb.cpu.ime);

    let mut steps = 0;
    while gb.read(0xFF0F) & 0x04 == 0 {
        assert_eq!(gb.cpu.pc, 0x0160);
        gb.step();
        steps += 1;
        assert!(steps < 1_000, "timer never overflowed");
    }

    let sp = gb.cpu.sp;
    gb.step();
    assert_eq!(gb.cpu.pc, 0x0050);
    assert!(!gb.cpu.ime);
    assert_eq!(gb.read(0xFF0F) & 0x04, 0);
    assert_eq!(gb.cpu.sp, sp.wrapping_sub(2));
    let ret = u16::from_le_bytes([gb.read(gb.cpu.sp), gb.read(gb.cpu.sp.wrapping_add(1))]);
    assert_eq!(ret, 0x0160);
}
