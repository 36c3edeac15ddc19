mod common;

use std::thread;

use common::{RomBuilder, cgb_machine, dmg_machine, machine_with};
use gbc_emu_core::error::StateError;
use gbc_emu_core::gameboy::{GameBoy, SharedGameBoy};
use gbc_emu_core::hardware::EmulationMode;

/// Timer on, channel 1 playing, and a WRAM counter bumped in a loop.
const BUSY_LOOP: &[u8] = &[
    0x3E, 0x05, 0xE0, 0x07, // TAC = 5
    0x3E, 0xF0, 0xE0, 0x12, // NR12
    0x3E, 0x87, 0xE0, 0x14, // NR14 trigger
    0x21, 0x00, 0xC0, // LD HL,$C000
    0x34, // INC (HL)
    0x18, 0xFD, // JR back to INC
];

fn busy_machine() -> GameBoy {
    let mut gb = cgb_machine(BUSY_LOOP);
    gb.run_cycles(10_000);
    gb
}

/// Drop one tagged section from a snapshot stream.
fn without_section(data: &[u8], tag: &[u8; 4]) -> Vec<u8> {
    let mut out = data[..6].to_vec();
    let mut pos = 6;
    while pos < data.len() {
        let len = u32::from_le_bytes(data[pos + 4..pos + 8].try_into().unwrap()) as usize;
        let end = pos + 8 + len;
        if &data[pos..pos + 4] != tag {
            out.extend_from_slice(&data[pos..end]);
        }
        pos = end;
    }
    out
}

#[test]
fn round_trip_mid_execution() {
    let mut a = busy_machine();
    let snap = a.save_state();
    assert_eq!(&snap[..4], b"GBCS");

    let mut b = cgb_machine(BUSY_LOOP);
    b.load_state(&snap).unwrap();
    assert_eq!(b.save_state(), snap);
    assert_eq!(b.cycles(), a.cycles());
    assert_eq!(b.cpu.pc, a.cpu.pc);

    a.run_cycles(50_000);
    b.run_cycles(50_000);
    assert_eq!(a.cycles(), b.cycles());
    assert_eq!(a.read(0xC000), b.read(0xC000));
    assert_eq!(a.read(0xFF05), b.read(0xFF05));
    assert!(a.ppu.framebuffer() == b.ppu.framebuffer());
    assert!(a.save_state() == b.save_state());
}

#[test]
fn round_trip_on_monochrome_hardware() {
    let mut a = dmg_machine(BUSY_LOOP);
    a.run_cycles(30_000);
    let snap = a.save_state();
    let mut b = dmg_machine(BUSY_LOOP);
    b.load_state(&snap).unwrap();
    a.run_frame();
    b.run_frame();
    assert!(a.save_state() == b.save_state());
}

#[test]
fn bad_magic_is_rejected() {
    let mut gb = busy_machine();
    let mut snap = gb.save_state();
    snap[0] = b'X';
    assert_eq!(gb.load_state(&snap), Err(StateError::BadMagic));
    assert_eq!(gb.load_state(&[0x47, 0x42]), Err(StateError::BadMagic));
}

#[test]
fn unknown_version_is_rejected() {
    let mut gb = busy_machine();
    let mut snap = gb.save_state();
    snap[4..6].copy_from_slice(&2u16.to_le_bytes());
    assert_eq!(gb.load_state(&snap), Err(StateError::BadVersion(2)));
}

#[test]
fn missing_section_is_rejected() {
    let mut gb = busy_machine();
    let snap = without_section(&gb.save_state(), b"KEYP");
    assert_eq!(
        gb.load_state(&snap),
        Err(StateError::MissingSection("KEYP"))
    );
}

#[test]
fn unknown_section_is_rejected() {
    let mut gb = busy_machine();
    let mut snap = gb.save_state();
    // The first section follows the 6-byte header.
    snap[6..10].copy_from_slice(b"ZZZZ");
    assert!(matches!(
        gb.load_state(&snap),
        Err(StateError::UnknownTag(_))
    ));
}

#[test]
fn truncated_stream_is_rejected() {
    let mut gb = busy_machine();
    let mut snap = gb.save_state();
    snap.truncate(snap.len() - 20);
    assert!(matches!(
        gb.load_state(&snap),
        Err(StateError::Truncated(_))
    ));
}

#[test]
fn colour_mode_mismatch_is_rejected() {
    let dmg = dmg_machine(BUSY_LOOP);
    let snap = dmg.save_state();
    let mut gb = busy_machine();
    let before = gb.save_state();
    assert!(matches!(
        gb.load_state(&snap),
        Err(StateError::Mismatch { .. })
    ));
    assert!(gb.save_state() == before);
}

#[test]
fn ram_size_mismatch_leaves_machine_untouched() {
    let small = RomBuilder::new(0x03, 0x01, 0x02).program(BUSY_LOOP).build();
    let big = RomBuilder::new(0x03, 0x01, 0x03).program(BUSY_LOOP).build();
    let mut src = machine_with(small, EmulationMode::Auto);
    src.run_cycles(5_000);
    let snap = src.save_state();

    let mut gb = machine_with(big, EmulationMode::Auto);
    gb.run_cycles(1_000);
    let before = gb.save_state();
    let err = gb.load_state(&snap).unwrap_err();
    assert_eq!(
        err,
        StateError::Mismatch {
            what: "external RAM size",
            expected: 0x8000,
            found: 0x2000,
        }
    );
    assert!(gb.save_state() == before);
}

#[test]
fn shared_machine_runs_on_another_thread() {
    let shared = SharedGameBoy::new(busy_machine());
    let snap = shared.save_state();

    let worker = shared.clone();
    let cycles = thread::spawn(move || worker.run_frame()).join().unwrap();
    assert!(cycles > 0);
    assert!(shared.save_state() != snap);

    shared.load_state(&snap).unwrap();
    assert!(shared.save_state() == snap);
    assert_eq!(shared.lock().cycles(), {
        let mut fresh = cgb_machine(BUSY_LOOP);
        fresh.load_state(&snap).unwrap();
        fresh.cycles()
    });
}
