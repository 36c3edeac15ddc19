mod common;

use common::{RomBuilder, Timeline, machine_with};
use gbc_emu_core::{
    audio_queue::audio_queue,
    gameboy::{CYCLES_PER_FRAME, Config, GameBoy},
    hardware::EmulationMode,
};

const FRAME_TICK: u64 = 2048;

fn synced(t: &mut Timeline) -> &mut Timeline {
    let now = t.sched.now();
    t.apu.sync(now);
    t
}

fn trigger_ch1(t: &mut Timeline, freq: u16, nr14_extra: u8) {
    t.write_apu(0xFF12, 0xF0);
    t.write_apu(0xFF13, freq as u8);
    t.write_apu(0xFF14, 0x80 | nr14_extra | (freq >> 8) as u8);
}

#[test]
fn duty_step_advances_once_per_period() {
    for freq in [0u16, 0x400, 0x700, 0x7F0, 0x7FF] {
        let mut t = Timeline::new(0);
        trigger_ch1(&mut t, freq, 0);
        let start = t.apu.channel_duty_step(1);
        let period = 2048 - freq as u64;

        t.advance(period - 1);
        assert_eq!(synced(&mut t).apu.channel_duty_step(1), start, "freq {freq:03X}");
        t.advance(1);
        assert_eq!(
            synced(&mut t).apu.channel_duty_step(1),
            (start + 1) & 7,
            "freq {freq:03X}"
        );
    }
}

#[test]
fn catch_up_in_one_step_matches_many_small_ones() {
    let mut a = Timeline::new(0);
    let mut b = Timeline::new(0);
    trigger_ch1(&mut a, 0x6A5, 0);
    trigger_ch1(&mut b, 0x6A5, 0);
    for _ in 0..1000 {
        a.advance(7);
        synced(&mut a);
    }
    b.advance(7000);
    synced(&mut b);
    assert_eq!(a.apu.channel_duty_step(1), b.apu.channel_duty_step(1));
}

#[test]
fn length_counter_silences_channel() {
    let mut t = Timeline::new(0);
    t.write_apu(0xFF11, 0x3E); // length 2
    trigger_ch1(&mut t, 0x100, 0x40);
    assert!(t.apu.channel_enabled(1));
    assert_eq!(t.apu.channel_length(1), 2);

    t.advance(FRAME_TICK);
    assert_eq!(t.apu.channel_length(1), 1);
    assert!(t.apu.channel_enabled(1));

    // Odd steps do not clock length.
    t.advance(FRAME_TICK);
    assert_eq!(t.apu.channel_length(1), 1);

    t.advance(FRAME_TICK);
    assert!(!t.apu.channel_enabled(1));
    assert_eq!(t.read_apu(0xFF26) & 0x01, 0);
}

#[test]
fn zero_length_reloads_full_on_trigger() {
    let mut t = Timeline::new(0);
    t.write_apu(0xFF1A, 0x80);
    t.write_apu(0xFF1B, 0x00);
    t.write_apu(0xFF1E, 0x80);
    assert_eq!(t.apu.channel_length(3), 256);
    assert!(t.apu.channel_enabled(3));

    t.write_apu(0xFF21, 0xF0);
    t.write_apu(0xFF23, 0x80);
    assert_eq!(t.apu.channel_length(4), 64);
}

#[test]
fn envelope_steps_on_the_eighth_tick() {
    let mut t = Timeline::new(0);
    t.write_apu(0xFF17, 0xF1); // volume 15, decreasing, pace 1
    t.write_apu(0xFF19, 0x80);
    assert_eq!(t.apu.channel_volume(2), 15);

    t.advance(7 * FRAME_TICK);
    assert_eq!(t.apu.channel_volume(2), 15);
    t.advance(FRAME_TICK);
    assert_eq!(t.apu.channel_volume(2), 14);
    t.advance(8 * FRAME_TICK);
    assert_eq!(t.apu.channel_volume(2), 13);
}

#[test]
fn envelope_at_zero_keeps_channel_running() {
    let mut t = Timeline::new(0);
    t.write_apu(0xFF17, 0x11);
    t.write_apu(0xFF19, 0x80);
    t.advance(8 * FRAME_TICK);
    assert_eq!(t.apu.channel_volume(2), 0);
    assert!(t.apu.channel_enabled(2));
    assert_eq!(t.read_apu(0xFF26) & 0x02, 0x02);
}

#[test]
fn sweep_overflow_disables_channel_1() {
    let mut t = Timeline::new(0);
    t.write_apu(0xFF10, 0x11); // pace 1, add, shift 1
    trigger_ch1(&mut t, 0x500, 0);
    assert!(t.apu.channel_enabled(1));
    // Steps 0 and 1, then the sweep runs on step 2: 0x500 -> 0x780, and the
    // follow-up check overflows.
    t.advance(3 * FRAME_TICK);
    assert!(!t.apu.channel_enabled(1));
}

#[test]
fn sweep_updates_frequency_registers() {
    let mut t = Timeline::new(0);
    t.write_apu(0xFF10, 0x12); // pace 1, add, shift 2
    trigger_ch1(&mut t, 0x100, 0);
    t.advance(3 * FRAME_TICK);
    assert_eq!(t.apu.ch1_frequency(), 0x140);
    assert!(t.apu.channel_enabled(1));
}

#[test]
fn dac_off_disables_channel() {
    let mut t = Timeline::new(0);
    trigger_ch1(&mut t, 0x100, 0);
    assert!(t.apu.channel_enabled(1));
    t.write_apu(0xFF12, 0x07);
    assert!(!t.apu.channel_enabled(1));
    // Trigger with the DAC off does not start it.
    t.write_apu(0xFF14, 0x80);
    assert!(!t.apu.channel_enabled(1));
}

#[test]
fn read_masks_unused_bits() {
    let mut t = Timeline::new(0);
    t.write_apu(0xFF10, 0x00);
    assert_eq!(t.read_apu(0xFF10), 0x80);
    t.write_apu(0xFF11, 0xC5);
    assert_eq!(t.read_apu(0xFF11), 0xFF);
    t.write_apu(0xFF13, 0x12);
    assert_eq!(t.read_apu(0xFF13), 0xFF);
    t.write_apu(0xFF25, 0x5A);
    assert_eq!(t.read_apu(0xFF25), 0x5A);
    assert_eq!(t.read_apu(0xFF15), 0xFF);
    assert_eq!(t.read_apu(0xFF1F), 0xFF);
}

#[test]
fn power_off_clears_and_locks_registers() {
    let mut t = Timeline::new(0);
    t.write_apu(0xFF30, 0x12);
    t.write_apu(0xFF25, 0xFF);
    trigger_ch1(&mut t, 0x100, 0);

    t.write_apu(0xFF26, 0x00);
    assert!(!t.apu.powered());
    assert_eq!(t.read_apu(0xFF26), 0x70);
    assert_eq!(t.read_apu(0xFF25), 0x00);
    assert_eq!(t.read_apu(0xFF12), 0x00);

    t.write_apu(0xFF12, 0xF0);
    assert_eq!(t.read_apu(0xFF12), 0x00);

    // Wave RAM survives and stays writable.
    assert_eq!(t.read_apu(0xFF30), 0x12);
    t.write_apu(0xFF31, 0x34);
    assert_eq!(t.read_apu(0xFF31), 0x34);

    t.write_apu(0xFF26, 0x80);
    assert!(t.apu.powered());
    assert_eq!(t.apu.sequencer_step(), 0);
    assert_eq!(t.read_apu(0xFF26), 0xF0);
}

#[test]
fn wave_ram_hidden_while_playing_on_monochrome() {
    let mut t = Timeline::new(0);
    t.write_apu(0xFF30, 0xAB);
    t.write_apu(0xFF1A, 0x80);
    t.write_apu(0xFF1E, 0x80);
    assert_eq!(t.read_apu(0xFF30), 0xFF);
    t.write_apu(0xFF1A, 0x00);
    assert_eq!(t.read_apu(0xFF30), 0xAB);
}

#[test]
fn noise_lfsr_advances() {
    let mut t = Timeline::new(0);
    t.write_apu(0xFF21, 0xF0);
    t.write_apu(0xFF22, 0x00);
    t.write_apu(0xFF23, 0x80);
    let start = t.apu.ch4_lfsr();
    t.advance(100);
    synced(&mut t);
    assert_ne!(t.apu.ch4_lfsr(), start);
}

#[test]
fn pcm_registers_only_on_colour_hardware() {
    let dmg = RomBuilder::rom_only().build();
    let mut gb = machine_with(dmg, EmulationMode::Auto);
    assert_eq!(gb.read(0xFF76), 0xFF);
    assert_eq!(gb.read(0xFF77), 0xFF);

    let cgb = RomBuilder::rom_only().cgb_flag(0x80).build();
    let mut gb = machine_with(cgb, EmulationMode::Auto);
    gb.write(0xFF26, 0x00);
    assert_eq!(gb.read(0xFF76), 0x00);
    assert_eq!(gb.read(0xFF77), 0x00);
}

#[test]
fn samples_flow_to_the_sink_at_the_output_rate() {
    let cart = RomBuilder::rom_only().program(&[]).build();
    let mut gb = GameBoy::new(
        cart,
        Config {
            sample_rate: 32_768,
            buffer_frames: 64,
            ..Config::default()
        },
    );
    let (producer, consumer) = audio_queue(4096);
    gb.set_sample_sink(Box::new(producer));
    gb.run_cycles(4 * CYCLES_PER_FRAME as u64);

    // 32768 Hz is one frame every 32 machine cycles.
    let expected = 4 * CYCLES_PER_FRAME as usize / 32;
    let got = consumer.len() + gb.apu.buffered_frames();
    assert!(got.abs_diff(expected) <= 1, "got {got}, expected {expected}");
    assert_eq!(consumer.len() % 64, 0);
}
