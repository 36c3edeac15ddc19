mod common;

use common::Timeline;
use rand::{Rng, SeedableRng, rngs::StdRng};

/// Divider ticks between falling edges for each TAC rate.
fn period(tac: u8) -> u64 {
    match tac & 0x03 {
        0 => 1024,
        1 => 16,
        2 => 64,
        _ => 256,
    }
}

#[test]
fn div_counts_at_cpu_speed() {
    let mut t = Timeline::new(0xABCC);
    assert_eq!(t.read_timer(0xFF04), 0xAB);
    // 64 machine cycles = 256 divider ticks.
    t.advance(64);
    assert_eq!(t.read_timer(0xFF04), 0xAC);
    t.write_timer(0xFF04, 0x55);
    assert_eq!(t.read_timer(0xFF04), 0x00);
    assert_eq!(t.timer.divider(t.sched.now()), 0);
}

#[test]
fn tima_counts_falling_edges() {
    let mut rng = StdRng::seed_from_u64(0x71A);
    for _ in 0..200 {
        let tac = 0x04 | rng.gen_range(0..4u8);
        let div: u16 = rng.r#gen();
        let per = period(tac);
        // Stay below one overflow.
        let max_cycles = (per * 250 / 4).max(1);
        let cycles = rng.gen_range(0..max_cycles);

        let mut t = Timeline::new(div);
        t.write_timer(0xFF07, tac);
        t.advance(cycles);

        let start = div as u64;
        let end = start + cycles * 4;
        let edges = end / per - start / per;
        assert_eq!(
            t.read_timer(0xFF05) as u64,
            edges,
            "tac={tac:02X} div={div:04X} cycles={cycles}"
        );
    }
}

#[test]
fn disabled_timer_does_not_count() {
    let mut t = Timeline::new(0);
    t.write_timer(0xFF07, 0x01);
    t.advance(10_000);
    assert_eq!(t.read_timer(0xFF05), 0);
    assert!(!t.sched.is_scheduled(t.timer.overflow_task()));
}

#[test]
fn overflow_reloads_and_interrupts_one_cycle_later() {
    let mut t = Timeline::new(0);
    t.write_timer(0xFF06, 0x80);
    t.write_timer(0xFF05, 0xFE);
    t.write_timer(0xFF07, 0x05); // 16 ticks per increment
    assert_eq!(t.sched.target(t.timer.overflow_task()), Some(8));

    t.advance(8);
    assert_eq!(t.read_timer(0xFF05), 0x00, "TIMA reads 0 on the overflow cycle");
    assert_eq!(t.if_reg & 0x04, 0, "no interrupt on the overflow cycle");

    t.advance(1);
    assert_eq!(t.read_timer(0xFF05), 0x80);
    assert_eq!(t.if_reg & 0x04, 0x04);
}

#[test]
fn tima_write_in_overflow_window_cancels_reload() {
    let mut t = Timeline::new(0);
    t.write_timer(0xFF06, 0x80);
    t.write_timer(0xFF05, 0xFF);
    t.write_timer(0xFF07, 0x05);
    t.advance(4);
    assert!(t.sched.is_scheduled(t.timer.reload_task()));

    t.write_timer(0xFF05, 0x42);
    assert!(!t.sched.is_scheduled(t.timer.reload_task()));
    t.advance(2);
    assert_eq!(t.if_reg & 0x04, 0);
    assert_eq!(t.read_timer(0xFF05), 0x42);
}

#[test]
fn div_reset_on_high_bit_is_a_falling_edge() {
    // Bit 3 (TAC rate 1) is set in the starting divider.
    let mut t = Timeline::new(0x0008);
    t.write_timer(0xFF07, 0x05);
    assert_eq!(t.read_timer(0xFF05), 0);
    t.write_timer(0xFF04, 0);
    assert_eq!(t.read_timer(0xFF05), 1);

    // Bit clear: no extra increment.
    let mut t = Timeline::new(0x0000);
    t.write_timer(0xFF07, 0x05);
    t.write_timer(0xFF04, 0);
    assert_eq!(t.read_timer(0xFF05), 0);
}

#[test]
fn disabling_timer_while_bit_high_increments() {
    let mut t = Timeline::new(0x0008);
    t.write_timer(0xFF07, 0x05);
    t.write_timer(0xFF07, 0x01);
    assert_eq!(t.read_timer(0xFF05), 1);
}

#[test]
fn rewriting_tac_moves_the_overflow() {
    let mut t = Timeline::new(0);
    t.write_timer(0xFF05, 0xF0);
    t.write_timer(0xFF07, 0x04); // 1024 ticks per increment
    let slow = t.sched.target(t.timer.overflow_task()).unwrap();
    t.write_timer(0xFF07, 0x05);
    let fast = t.sched.target(t.timer.overflow_task()).unwrap();
    assert!(fast < slow);
    assert_eq!(fast, 16 * 16 / 4);
}
