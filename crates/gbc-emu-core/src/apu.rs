use log::trace;

use crate::error::StateError;
use crate::scheduler::{Scheduler, TaskId, TaskKind};
use crate::sink::SampleSink;
use crate::state::{Snapshot, StateReader, StateWriter, expect_eq};

/// Machine cycles per second at normal speed.
const MACHINE_CLOCK_HZ: u64 = 1_048_576;
// 512 Hz frame sequencer tick, in normal-speed machine cycles
const FRAME_SEQUENCER_PERIOD: u64 = 2048;
const VOLUME_FACTOR: i16 = 64;
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;
pub const DEFAULT_BUFFER_FRAMES: usize = 1024;

// Readback values of NR10-NR52 right after power on.
const POWER_ON_REGS: [u8; 0x17] = [
    0x80, 0xBF, 0xF3, 0xFF, 0xBF, 0xFF, 0x3F, 0x00, 0xFF, 0xBF, 0x7F, 0xFF, 0x9F, 0xFF, 0xBF, 0xFF,
    0xFF, 0x00, 0x00, 0xBF, 0x77, 0xF3, 0xF1,
];

// Duty table for pulse channels (CH1, CH2). Each entry is an 8-step
// waveform. Index (0..3) corresponds to duty selector in NRx1:
// 0 -> 00000001 (12.5%)
// 1 -> 10000001 (25%)
// 2 -> 10000111 (50%)
// 3 -> 01111110 (75%)
const DUTY_TABLE: [[u8; 8]; 4] = [
    [0, 0, 0, 0, 0, 0, 0, 1],
    [1, 0, 0, 0, 0, 0, 0, 1],
    [1, 0, 0, 0, 0, 1, 1, 1],
    [0, 1, 1, 1, 1, 1, 1, 0],
];

/// Advance a free-running period counter by `t` T-cycles. Returns how many
/// times it expired; `timer` ends up holding the cycles left until the next
/// expiry.
fn run_counter(timer: &mut u32, period: u32, t: u64) -> u64 {
    let timer_now = *timer as u64;
    if t < timer_now {
        *timer -= t as u32;
        return 0;
    }
    let over = t - timer_now;
    let period = period.max(1) as u64;
    *timer = (period - over % period) as u32;
    1 + over / period
}

#[derive(Default, Clone, Copy)]
struct Envelope {
    initial: u8,
    period: u8,
    add: bool,
    volume: u8,
    timer: u8,
}

impl Envelope {
    fn clock(&mut self) {
        if self.period == 0 {
            return;
        }
        if self.timer > 0 {
            self.timer -= 1;
        }
        if self.timer == 0 {
            self.timer = self.period;
            if self.add && self.volume < 15 {
                self.volume += 1;
            } else if !self.add && self.volume > 0 {
                self.volume -= 1;
            }
        }
    }

    fn write(&mut self, val: u8) {
        self.initial = val >> 4;
        self.period = val & 0x07;
        self.add = val & 0x08 != 0;
    }

    fn trigger(&mut self) {
        self.volume = self.initial;
        self.timer = self.period;
    }

    fn save(&self, w: &mut StateWriter) {
        w.u8(self.initial);
        w.u8(self.period);
        w.bool(self.add);
        w.u8(self.volume);
        w.u8(self.timer);
    }

    fn load(&mut self, r: &mut StateReader<'_>) -> Result<(), StateError> {
        self.initial = r.u8()? & 0x0F;
        self.period = r.u8()? & 0x07;
        self.add = r.bool()?;
        self.volume = r.u8()? & 0x0F;
        self.timer = r.u8()? & 0x07;
        Ok(())
    }
}

#[derive(Default, Clone, Copy)]
// Channel 1 frequency sweep.
struct Sweep {
    period: u8,
    negate: bool,
    shift: u8,
    timer: u8,
    shadow: u16,
    enabled: bool,
    /// True if a subtraction sweep calculation has occurred since the last
    /// trigger.
    neg_used: bool,
}

impl Sweep {
    fn calculate(&self) -> u16 {
        let delta = self.shadow >> self.shift;
        if self.negate {
            self.shadow.wrapping_sub(delta)
        } else {
            self.shadow.wrapping_add(delta)
        }
    }

    /// Apply an NR10 write. Returns true if the channel must be disabled.
    fn set_params(&mut self, val: u8) -> bool {
        let new_period = (val >> 4) & 0x07;
        let old_negate = self.negate;
        self.negate = val & 0x08 != 0;
        self.shift = val & 0x07;

        // A pace of 0 stops further iterations; going from 0 to non-zero
        // reloads the timer so they resume without a retrigger.
        if new_period == 0 {
            self.enabled = false;
        } else if self.period == 0 {
            self.timer = new_period;
            self.enabled = true;
        }

        self.period = new_period;
        if old_negate && !self.negate && self.neg_used {
            self.enabled = false;
            return true;
        }
        false
    }

    fn reload(&mut self, freq: u16) {
        self.shadow = freq;
        self.timer = if self.period == 0 { 8 } else { self.period };
        self.enabled = self.period != 0 || self.shift != 0;
        self.neg_used = false;
    }
}

#[derive(Default, Clone)]
struct SquareChannel {
    enabled: bool,
    dac_enabled: bool,
    length: u8,
    length_enable: bool,
    duty: u8,
    duty_pos: u8,
    frequency: u16,
    /// T-cycles until the next duty step.
    timer: u32,
    envelope: Envelope,
    sweep: Option<Sweep>,
}

impl SquareChannel {
    fn new(with_sweep: bool) -> Self {
        Self {
            sweep: with_sweep.then(Sweep::default),
            ..Default::default()
        }
    }

    fn period(&self) -> u32 {
        (2048 - self.frequency as u32) * 4
    }

    fn advance(&mut self, t: u64) {
        if !self.enabled {
            return;
        }
        let period = self.period();
        let steps = run_counter(&mut self.timer, period, t);
        self.duty_pos = ((self.duty_pos as u64 + steps) & 7) as u8;
    }

    fn output(&self) -> u8 {
        if !self.enabled {
            return 0;
        }
        DUTY_TABLE[self.duty as usize][self.duty_pos as usize] * self.envelope.volume
    }

    fn trigger(&mut self) {
        self.enabled = self.dac_enabled;
        self.timer = self.period();
        self.envelope.trigger();
        if self.length == 0 {
            self.length = 64;
        }
        if let Some(s) = self.sweep.as_mut() {
            s.reload(self.frequency);
            if s.shift != 0 && s.calculate() > 2047 {
                self.enabled = false;
                s.enabled = false;
            } else if s.shift != 0 && s.negate {
                s.neg_used = true;
            }
        }
    }

    fn clock_length(&mut self) {
        if self.length_enable && self.length > 0 {
            self.length -= 1;
            if self.length == 0 {
                self.enabled = false;
            }
        }
    }

    /// Returns true if the sweep changed the frequency.
    fn clock_sweep(&mut self) -> bool {
        let Some(sweep) = self.sweep.as_mut() else {
            return false;
        };
        if !sweep.enabled {
            return false;
        }
        if sweep.timer > 0 {
            sweep.timer -= 1;
        }
        if sweep.timer != 0 {
            return false;
        }
        sweep.timer = if sweep.period == 0 { 8 } else { sweep.period };
        if sweep.period == 0 {
            return false;
        }
        let new_freq = sweep.calculate();
        if new_freq > 2047 {
            self.enabled = false;
            sweep.enabled = false;
            return false;
        }
        if sweep.shift == 0 {
            return false;
        }
        if sweep.negate {
            sweep.neg_used = true;
        }
        sweep.shadow = new_freq;
        self.frequency = new_freq;
        // Second overflow check with the new shadow value.
        if sweep.calculate() > 2047 {
            self.enabled = false;
            sweep.enabled = false;
        }
        true
    }

    fn save(&self, w: &mut StateWriter) {
        w.bool(self.enabled);
        w.bool(self.dac_enabled);
        w.u8(self.length);
        w.bool(self.length_enable);
        w.u8(self.duty);
        w.u8(self.duty_pos);
        w.u16(self.frequency);
        w.u32(self.timer);
        self.envelope.save(w);
        if let Some(s) = &self.sweep {
            w.u8(s.period);
            w.bool(s.negate);
            w.u8(s.shift);
            w.u8(s.timer);
            w.u16(s.shadow);
            w.bool(s.enabled);
            w.bool(s.neg_used);
        }
    }

    fn load(&mut self, r: &mut StateReader<'_>) -> Result<(), StateError> {
        self.enabled = r.bool()?;
        self.dac_enabled = r.bool()?;
        self.length = r.u8()?.min(64);
        self.length_enable = r.bool()?;
        self.duty = r.u8()? & 0x03;
        self.duty_pos = r.u8()? & 0x07;
        self.frequency = r.u16()? & 0x07FF;
        self.timer = r.u32()?;
        self.envelope.load(r)?;
        if let Some(s) = self.sweep.as_mut() {
            s.period = r.u8()? & 0x07;
            s.negate = r.bool()?;
            s.shift = r.u8()? & 0x07;
            s.timer = r.u8()? & 0x0F;
            s.shadow = r.u16()? & 0x07FF;
            s.enabled = r.bool()?;
            s.neg_used = r.bool()?;
        }
        Ok(())
    }
}

#[derive(Default, Clone)]
struct WaveChannel {
    enabled: bool,
    dac_enabled: bool,
    length: u16,
    length_enable: bool,
    volume: u8,
    position: u8,
    last_sample: u8,
    frequency: u16,
    timer: u32,
}

impl WaveChannel {
    fn period(&self) -> u32 {
        (2048 - self.frequency as u32) * 2
    }

    fn advance(&mut self, t: u64, wave_ram: &[u8; 0x10]) {
        if !self.enabled {
            return;
        }
        let period = self.period();
        let steps = run_counter(&mut self.timer, period, t);
        if steps == 0 {
            return;
        }
        self.position = ((self.position as u64 + steps) & 0x1F) as u8;
        let byte = wave_ram[(self.position / 2) as usize];
        self.last_sample = if self.position & 1 == 0 {
            byte >> 4
        } else {
            byte & 0x0F
        };
    }

    fn trigger(&mut self) {
        self.enabled = self.dac_enabled;
        self.position = 0;
        // The first sample is picked up after one extra wave step.
        self.timer = self.period() + 6;
        if self.length == 0 {
            self.length = 256;
        }
    }

    fn clock_length(&mut self) {
        if self.length_enable && self.length > 0 {
            self.length -= 1;
            if self.length == 0 {
                self.enabled = false;
            }
        }
    }

    fn output(&self) -> u8 {
        if !self.enabled {
            return 0;
        }
        match self.volume {
            1 => self.last_sample,
            2 => self.last_sample >> 1,
            3 => self.last_sample >> 2,
            _ => 0,
        }
    }

    fn save(&self, w: &mut StateWriter) {
        w.bool(self.enabled);
        w.bool(self.dac_enabled);
        w.u16(self.length);
        w.bool(self.length_enable);
        w.u8(self.volume);
        w.u8(self.position);
        w.u8(self.last_sample);
        w.u16(self.frequency);
        w.u32(self.timer);
    }

    fn load(&mut self, r: &mut StateReader<'_>) -> Result<(), StateError> {
        self.enabled = r.bool()?;
        self.dac_enabled = r.bool()?;
        self.length = r.u16()?.min(256);
        self.length_enable = r.bool()?;
        self.volume = r.u8()? & 0x03;
        self.position = r.u8()? & 0x1F;
        self.last_sample = r.u8()? & 0x0F;
        self.frequency = r.u16()? & 0x07FF;
        self.timer = r.u32()?;
        Ok(())
    }
}

#[derive(Default, Clone)]
struct NoiseChannel {
    enabled: bool,
    dac_enabled: bool,
    length: u8,
    length_enable: bool,
    envelope: Envelope,
    clock_shift: u8,
    divisor: u8,
    width7: bool,
    lfsr: u16,
    timer: u32,
}

impl NoiseChannel {
    fn period(&self) -> u32 {
        let r = match self.divisor {
            0 => 8,
            d => d as u32 * 16,
        };
        r << self.clock_shift
    }

    fn advance(&mut self, t: u64) {
        if !self.enabled || self.clock_shift >= 14 {
            return;
        }
        let period = self.period();
        let steps = run_counter(&mut self.timer, period, t);
        for _ in 0..steps {
            // Feedback is the XNOR of bits 0 and 1.
            let bit = !(self.lfsr ^ (self.lfsr >> 1)) & 1;
            self.lfsr = (self.lfsr >> 1) | (bit << 14);
            if self.width7 {
                self.lfsr = (self.lfsr & !0x40) | (bit << 6);
            }
        }
    }

    fn trigger(&mut self) {
        self.enabled = self.dac_enabled;
        self.lfsr = 0;
        self.timer = self.period();
        self.envelope.trigger();
        if self.length == 0 {
            self.length = 64;
        }
    }

    fn output(&self) -> u8 {
        if !self.enabled || self.lfsr & 1 != 0 {
            return 0;
        }
        self.envelope.volume
    }

    fn clock_length(&mut self) {
        if self.length_enable && self.length > 0 {
            self.length -= 1;
            if self.length == 0 {
                self.enabled = false;
            }
        }
    }

    fn save(&self, w: &mut StateWriter) {
        w.bool(self.enabled);
        w.bool(self.dac_enabled);
        w.u8(self.length);
        w.bool(self.length_enable);
        self.envelope.save(w);
        w.u8(self.clock_shift);
        w.u8(self.divisor);
        w.bool(self.width7);
        w.u16(self.lfsr);
        w.u32(self.timer);
    }

    fn load(&mut self, r: &mut StateReader<'_>) -> Result<(), StateError> {
        self.enabled = r.bool()?;
        self.dac_enabled = r.bool()?;
        self.length = r.u8()?.min(64);
        self.length_enable = r.bool()?;
        self.envelope.load(r)?;
        self.clock_shift = r.u8()? & 0x0F;
        self.divisor = r.u8()? & 0x07;
        self.width7 = r.bool()?;
        self.lfsr = r.u16()? & 0x7FFF;
        self.timer = r.u32()?;
        Ok(())
    }
}

/// Audio processing unit.
///
/// Channel counters are advanced lazily: every register access and every
/// scheduled tick first calls [`Apu::sync`], which converts the machine
/// cycles elapsed since the previous sync into T-cycles and catches each
/// channel up in one step.
#[derive(Clone)]
pub struct Apu {
    ch1: SquareChannel,
    ch2: SquareChannel,
    ch3: WaveChannel,
    ch4: NoiseChannel,
    wave_ram: [u8; 0x10],
    regs: [u8; 0x17],
    nr50: u8,
    nr51: u8,
    powered: bool,
    /// Next frame sequencer step to run.
    sequencer_step: u8,
    cgb: bool,

    synced_at: u64,
    /// 1 in double speed, where machine cycles are half as long.
    speed_shift: u32,
    frame_task: TaskId,
    sample_task: TaskId,

    sample_rate: u32,
    sample_acc: u64,
    buffer_frames: usize,
    left: Vec<u8>,
    right: Vec<u8>,

    hp_coef: f32,
    hp_prev_input_left: f32,
    hp_prev_output_left: f32,
    hp_prev_input_right: f32,
    hp_prev_output_right: f32,
}

impl Apu {
    fn calc_hp_coef(rate: u32) -> f32 {
        0.999_958_f32.powf(4_194_304.0 / rate as f32)
    }

    /// Create the unit and put its two periodic tasks on the timeline.
    pub fn new(sched: &mut Scheduler, cgb: bool, sample_rate: u32, buffer_frames: usize) -> Self {
        let sample_rate = sample_rate.max(1);
        let buffer_frames = buffer_frames.max(1);
        let frame_task = sched.register(TaskKind::AudioFrameTick, 0);
        let sample_task = sched.register(TaskKind::AudioSampleTick, 0);
        let mut apu = Self {
            ch1: SquareChannel::new(true),
            ch2: SquareChannel::new(false),
            ch3: WaveChannel::default(),
            ch4: NoiseChannel::default(),
            wave_ram: [0; 0x10],
            regs: POWER_ON_REGS,
            nr50: 0x77,
            nr51: 0xF3,
            powered: true,
            sequencer_step: 0,
            cgb,
            synced_at: sched.now(),
            speed_shift: 0,
            frame_task,
            sample_task,
            sample_rate,
            sample_acc: 0,
            buffer_frames,
            left: Vec::with_capacity(buffer_frames),
            right: Vec::with_capacity(buffer_frames),
            hp_coef: Self::calc_hp_coef(sample_rate),
            hp_prev_input_left: 0.0,
            hp_prev_output_left: 0.0,
            hp_prev_input_right: 0.0,
            hp_prev_output_right: 0.0,
        };

        // Channel state matching the post-boot register values.
        apu.ch1.duty = 2;
        apu.ch1.envelope.write(0xF3);
        apu.ch1.frequency = 0x03FF;
        apu.ch1.dac_enabled = true;
        apu.ch1.enabled = true;
        apu.ch1.timer = apu.ch1.period();
        apu.ch2.frequency = 0x03FF;
        apu.ch3.frequency = 0x03FF;

        sched.schedule_in(frame_task, FRAME_SEQUENCER_PERIOD);
        let delay = apu.next_sample_delay();
        sched.schedule_in(sample_task, delay);
        apu
    }

    pub fn frame_task(&self) -> TaskId {
        self.frame_task
    }

    pub fn sample_task(&self) -> TaskId {
        self.sample_task
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Catch every channel up to the machine cycle `now`.
    pub fn sync(&mut self, now: u64) {
        let elapsed = now.saturating_sub(self.synced_at);
        self.synced_at = now;
        if elapsed == 0 || !self.powered {
            return;
        }
        let t = (elapsed * 4) >> self.speed_shift;
        self.ch1.advance(t);
        self.ch2.advance(t);
        self.ch3.advance(t, &self.wave_ram);
        self.ch4.advance(t);
    }

    fn next_sample_delay(&mut self) -> u64 {
        self.sample_acc += MACHINE_CLOCK_HZ << self.speed_shift;
        let delay = self.sample_acc / self.sample_rate as u64;
        self.sample_acc %= self.sample_rate as u64;
        delay.max(1)
    }

    /// Switch between normal and double speed. Both periodic tasks keep
    /// their position in real time.
    pub fn set_double_speed(&mut self, sched: &mut Scheduler, double: bool) {
        let now = sched.now();
        self.sync(now);
        let new_shift = double as u32;
        if new_shift == self.speed_shift {
            return;
        }
        for id in [self.frame_task, self.sample_task] {
            if let Some(target) = sched.target(id) {
                let left = target.saturating_sub(now);
                let left = if double { left << 1 } else { (left >> 1).max(1) };
                sched.schedule(id, now + left);
            }
        }
        self.speed_shift = new_shift;
    }

    pub fn on_frame_tick(&mut self, sched: &mut Scheduler) {
        self.sync(sched.now());
        if self.powered {
            let step = self.sequencer_step;
            self.sequencer_step = (step + 1) & 7;
            self.clock_frame_sequencer(step);
        }
        sched.schedule_in(self.frame_task, FRAME_SEQUENCER_PERIOD << self.speed_shift);
    }

    /// Mix one output frame. Returns true when the buffer is full and should
    /// be flushed to the sample sink.
    pub fn on_sample_tick(&mut self, sched: &mut Scheduler) -> bool {
        self.sync(sched.now());
        let (left, right) = self.mix_output();
        self.left.push(to_u8(left));
        self.right.push(to_u8(right));
        let delay = self.next_sample_delay();
        sched.schedule_in(self.sample_task, delay);
        self.buffer_full()
    }

    pub fn buffer_full(&self) -> bool {
        self.left.len() >= self.buffer_frames
    }

    pub fn buffered_frames(&self) -> usize {
        self.left.len()
    }

    /// Hand buffered frames to `sink` and empty the buffer.
    pub fn flush(&mut self, sink: &mut dyn SampleSink) {
        if self.left.is_empty() {
            return;
        }
        sink.consume(&self.left, &self.right);
        trace!("flushed {} audio frames", self.left.len());
        self.left.clear();
        self.right.clear();
    }

    /// Drop buffered frames when no sink is attached.
    pub fn discard_buffer(&mut self) {
        self.left.clear();
        self.right.clear();
    }

    fn read_mask(addr: u16) -> u8 {
        match addr {
            0xFF10 => 0x80,
            0xFF11 | 0xFF16 => 0x3F,
            0xFF14 | 0xFF19 | 0xFF1E | 0xFF23 => 0xBF,
            0xFF1A => 0x7F,
            0xFF1C => 0x9F,
            0xFF12 | 0xFF17 | 0xFF21 | 0xFF22 | 0xFF24 | 0xFF25 => 0x00,
            0xFF26 => 0x70,
            _ => 0xFF,
        }
    }

    fn power_off(&mut self) {
        self.ch1 = SquareChannel::new(true);
        self.ch2 = SquareChannel::new(false);
        self.ch3 = WaveChannel::default();
        self.ch4 = NoiseChannel::default();
        self.regs.fill(0);
        self.nr50 = 0;
        self.nr51 = 0;
        self.powered = false;
    }

    fn next_step_clocks_length(&self) -> bool {
        self.sequencer_step & 1 == 0
    }

    pub fn read_reg(&mut self, addr: u16, now: u64) -> u8 {
        self.sync(now);
        match addr {
            0xFF26 => {
                let mut val = 0x70 | if self.powered { 0x80 } else { 0 };
                for (bit, on) in [
                    self.ch1.enabled,
                    self.ch2.enabled,
                    self.ch3.enabled,
                    self.ch4.enabled,
                ]
                .into_iter()
                .enumerate()
                {
                    if on {
                        val |= 1 << bit;
                    }
                }
                val
            }
            0xFF30..=0xFF3F => {
                if self.ch3.enabled {
                    // Only the byte being played is reachable, and only on colour hardware.
                    if self.cgb {
                        self.wave_ram[(self.ch3.position / 2) as usize]
                    } else {
                        0xFF
                    }
                } else {
                    self.wave_ram[(addr - 0xFF30) as usize]
                }
            }
            0xFF10..=0xFF25 => self.regs[(addr - 0xFF10) as usize] | Self::read_mask(addr),
            _ => 0xFF,
        }
    }

    /// PCM12/PCM34: current digital output of each channel.
    pub fn read_pcm(&mut self, addr: u16, now: u64) -> u8 {
        if !self.cgb {
            return 0xFF;
        }
        self.sync(now);
        match addr {
            0xFF76 => (self.ch2.output() << 4) | self.ch1.output(),
            0xFF77 => (self.ch4.output() << 4) | self.ch3.output(),
            _ => 0xFF,
        }
    }

    pub fn write_reg(&mut self, addr: u16, val: u8, now: u64) {
        self.sync(now);
        if (0xFF30..=0xFF3F).contains(&addr) {
            if !self.ch3.enabled {
                self.wave_ram[(addr - 0xFF30) as usize] = val;
            } else if self.cgb {
                self.wave_ram[(self.ch3.position / 2) as usize] = val;
            }
            return;
        }
        if !self.powered && addr != 0xFF26 {
            return;
        }
        if (0xFF10..0xFF26).contains(&addr) {
            self.regs[(addr - 0xFF10) as usize] = val;
        }

        match addr {
            0xFF10 => {
                if let Some(s) = self.ch1.sweep.as_mut()
                    && s.set_params(val)
                {
                    self.ch1.enabled = false;
                }
            }
            0xFF11 => {
                self.ch1.duty = val >> 6;
                self.ch1.length = 64 - (val & 0x3F);
            }
            0xFF16 => {
                self.ch2.duty = val >> 6;
                self.ch2.length = 64 - (val & 0x3F);
            }
            0xFF12 | 0xFF17 => {
                let ch = if addr == 0xFF12 { &mut self.ch1 } else { &mut self.ch2 };
                ch.envelope.write(val);
                ch.dac_enabled = val & 0xF8 != 0;
                if !ch.dac_enabled {
                    ch.enabled = false;
                }
            }
            0xFF13 => self.ch1.frequency = (self.ch1.frequency & 0x700) | val as u16,
            0xFF18 => self.ch2.frequency = (self.ch2.frequency & 0x700) | val as u16,
            0xFF14 | 0xFF19 => {
                let extra_clock = !self.next_step_clocks_length();
                let ch = if addr == 0xFF14 { &mut self.ch1 } else { &mut self.ch2 };
                let was_enabled = ch.length_enable;
                ch.length_enable = val & 0x40 != 0;
                ch.frequency = (ch.frequency & 0xFF) | (((val & 0x07) as u16) << 8);
                // Enabling the length counter right after a length step
                // clocks it once more.
                if extra_clock && !was_enabled && ch.length_enable {
                    ch.clock_length();
                }
                if val & 0x80 != 0 {
                    let reload_full = ch.length == 0;
                    ch.trigger();
                    if reload_full && extra_clock && ch.length_enable {
                        ch.length -= 1;
                    }
                }
            }
            0xFF1A => {
                self.ch3.dac_enabled = val & 0x80 != 0;
                if !self.ch3.dac_enabled {
                    self.ch3.enabled = false;
                }
            }
            0xFF1B => self.ch3.length = 256 - val as u16,
            0xFF1C => self.ch3.volume = (val >> 5) & 0x03,
            0xFF1D => self.ch3.frequency = (self.ch3.frequency & 0x700) | val as u16,
            0xFF1E => {
                let extra_clock = !self.next_step_clocks_length();
                let was_enabled = self.ch3.length_enable;
                self.ch3.length_enable = val & 0x40 != 0;
                self.ch3.frequency = (self.ch3.frequency & 0xFF) | (((val & 0x07) as u16) << 8);
                if extra_clock && !was_enabled && self.ch3.length_enable {
                    self.ch3.clock_length();
                }
                if val & 0x80 != 0 {
                    let reload_full = self.ch3.length == 0;
                    self.ch3.trigger();
                    if reload_full && extra_clock && self.ch3.length_enable {
                        self.ch3.length -= 1;
                    }
                }
            }
            0xFF20 => self.ch4.length = 64 - (val & 0x3F),
            0xFF21 => {
                self.ch4.envelope.write(val);
                self.ch4.dac_enabled = val & 0xF8 != 0;
                if !self.ch4.dac_enabled {
                    self.ch4.enabled = false;
                }
            }
            0xFF22 => {
                self.ch4.clock_shift = val >> 4;
                self.ch4.width7 = val & 0x08 != 0;
                self.ch4.divisor = val & 0x07;
            }
            0xFF23 => {
                let extra_clock = !self.next_step_clocks_length();
                let was_enabled = self.ch4.length_enable;
                self.ch4.length_enable = val & 0x40 != 0;
                if extra_clock && !was_enabled && self.ch4.length_enable {
                    self.ch4.clock_length();
                }
                if val & 0x80 != 0 {
                    let reload_full = self.ch4.length == 0;
                    self.ch4.trigger();
                    if reload_full && extra_clock && self.ch4.length_enable {
                        self.ch4.length -= 1;
                    }
                }
            }
            0xFF24 => self.nr50 = val,
            0xFF25 => self.nr51 = val,
            0xFF26 => {
                if val & 0x80 == 0 {
                    if self.powered {
                        self.power_off();
                    }
                } else if !self.powered {
                    self.powered = true;
                    self.sequencer_step = 0;
                }
            }
            _ => {}
        }
    }

    fn clock_frame_sequencer(&mut self, step: u8) {
        if step & 1 == 0 {
            self.ch1.clock_length();
            self.ch2.clock_length();
            self.ch3.clock_length();
            self.ch4.clock_length();
        }
        if (step == 2 || step == 6) && self.ch1.clock_sweep() {
            self.update_ch1_freq_regs();
        }
        if step == 7 {
            self.ch1.envelope.clock();
            self.ch2.envelope.clock();
            self.ch4.envelope.clock();
        }
    }

    /// Mirror the current channel 1 frequency into NR13/NR14.
    fn update_ch1_freq_regs(&mut self) {
        let freq = self.ch1.frequency;
        self.regs[0x03] = (freq & 0xFF) as u8;
        self.regs[0x04] = (self.regs[0x04] & !0x07) | ((freq >> 8) as u8 & 0x07);
    }

    fn mix_output(&mut self) -> (i16, i16) {
        let dacs_on = self.ch1.dac_enabled
            || self.ch2.dac_enabled
            || self.ch3.dac_enabled
            || self.ch4.dac_enabled;
        if !dacs_on {
            self.hp_prev_input_left = 0.0;
            self.hp_prev_output_left = 0.0;
            self.hp_prev_input_right = 0.0;
            self.hp_prev_output_right = 0.0;
            return (0, 0);
        }

        let outputs = [
            (self.ch1.enabled, self.ch1.output()),
            (self.ch2.enabled, self.ch2.output()),
            (self.ch3.enabled, self.ch3.output()),
            (self.ch4.enabled, self.ch4.output()),
        ];
        let mut left = 0i16;
        let mut right = 0i16;
        for (i, (enabled, out)) in outputs.into_iter().enumerate() {
            if !enabled {
                continue;
            }
            let level = 8 - out as i16;
            if self.nr51 & (0x10 << i) != 0 {
                left += level;
            }
            if self.nr51 & (0x01 << i) != 0 {
                right += level;
            }
        }

        let left_vol = ((self.nr50 >> 4) & 0x07) + 1;
        let right_vol = (self.nr50 & 0x07) + 1;

        let left_sample = left * left_vol as i16 * VOLUME_FACTOR;
        let right_sample = right * right_vol as i16 * VOLUME_FACTOR;
        self.dc_block(left_sample, right_sample)
    }

    fn dc_block(&mut self, left: i16, right: i16) -> (i16, i16) {
        let r = self.hp_coef;
        let left_in = left as f32;
        let right_in = right as f32;
        let left_out = left_in - self.hp_prev_input_left + r * self.hp_prev_output_left;
        let right_out = right_in - self.hp_prev_input_right + r * self.hp_prev_output_right;
        self.hp_prev_input_left = left_in;
        self.hp_prev_output_left = left_out;
        self.hp_prev_input_right = right_in;
        self.hp_prev_output_right = right_out;
        (left_out.round() as i16, right_out.round() as i16)
    }

    pub fn powered(&self) -> bool {
        self.powered
    }

    /// Duty step of a pulse channel (1 or 2).
    pub fn channel_duty_step(&self, channel: u8) -> u8 {
        match channel {
            1 => self.ch1.duty_pos,
            _ => self.ch2.duty_pos,
        }
    }

    pub fn channel_enabled(&self, channel: u8) -> bool {
        match channel {
            1 => self.ch1.enabled,
            2 => self.ch2.enabled,
            3 => self.ch3.enabled,
            _ => self.ch4.enabled,
        }
    }

    /// Current envelope volume of channel 1, 2 or 4.
    pub fn channel_volume(&self, channel: u8) -> u8 {
        match channel {
            1 => self.ch1.envelope.volume,
            2 => self.ch2.envelope.volume,
            _ => self.ch4.envelope.volume,
        }
    }

    pub fn channel_length(&self, channel: u8) -> u16 {
        match channel {
            1 => self.ch1.length as u16,
            2 => self.ch2.length as u16,
            3 => self.ch3.length,
            _ => self.ch4.length as u16,
        }
    }

    pub fn ch1_frequency(&self) -> u16 {
        self.ch1.frequency
    }

    pub fn ch3_position(&self) -> u8 {
        self.ch3.position
    }

    pub fn ch4_lfsr(&self) -> u16 {
        self.ch4.lfsr
    }

    pub fn sequencer_step(&self) -> u8 {
        self.sequencer_step
    }
}

fn to_u8(sample: i16) -> u8 {
    ((sample >> 7) + 128).clamp(0, 255) as u8
}

impl Snapshot for Apu {
    fn save_state(&self, w: &mut StateWriter) {
        w.bool(self.cgb);
        self.ch1.save(w);
        self.ch2.save(w);
        self.ch3.save(w);
        self.ch4.save(w);
        w.bytes(&self.wave_ram);
        w.bytes(&self.regs);
        w.u8(self.nr50);
        w.u8(self.nr51);
        w.bool(self.powered);
        w.u8(self.sequencer_step);
        w.u64(self.synced_at);
        w.u8(self.speed_shift as u8);
        w.u64(self.sample_acc);
        w.blob(&self.left);
        w.blob(&self.right);
        w.f32(self.hp_prev_input_left);
        w.f32(self.hp_prev_output_left);
        w.f32(self.hp_prev_input_right);
        w.f32(self.hp_prev_output_right);
    }

    fn load_state(&mut self, r: &mut StateReader<'_>) -> Result<(), StateError> {
        expect_eq("APU colour mode", self.cgb as u64, r.bool()? as u64)?;
        self.ch1.load(r)?;
        self.ch2.load(r)?;
        self.ch3.load(r)?;
        self.ch4.load(r)?;
        r.bytes_into(&mut self.wave_ram)?;
        r.bytes_into(&mut self.regs)?;
        self.nr50 = r.u8()?;
        self.nr51 = r.u8()?;
        self.powered = r.bool()?;
        self.sequencer_step = r.u8()? & 7;
        self.synced_at = r.u64()?;
        self.speed_shift = (r.u8()? & 1) as u32;
        self.sample_acc = r.u64()? % self.sample_rate as u64;
        self.left = r.blob()?;
        self.right = r.blob()?;
        if self.left.len() != self.right.len() {
            return Err(StateError::Mismatch {
                what: "audio buffer channels",
                expected: self.left.len() as u64,
                found: self.right.len() as u64,
            });
        }
        self.left.truncate(self.buffer_frames);
        self.right.truncate(self.buffer_frames);
        self.hp_prev_input_left = r.f32()?;
        self.hp_prev_output_left = r.f32()?;
        self.hp_prev_input_right = r.f32()?;
        self.hp_prev_output_right = r.f32()?;
        r.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apu() -> (Scheduler, Apu) {
        let mut sched = Scheduler::new();
        let apu = Apu::new(&mut sched, false, DEFAULT_SAMPLE_RATE, DEFAULT_BUFFER_FRAMES);
        (sched, apu)
    }

    #[test]
    fn counter_catch_up_matches_stepping() {
        let mut a = 10;
        let mut b = 10;
        let mut steps = 0;
        for _ in 0..1000 {
            steps += run_counter(&mut a, 24, 1);
        }
        assert_eq!(run_counter(&mut b, 24, 1000), steps);
        assert_eq!(a, b);
    }

    #[test]
    fn dc_filter_reduces_constant_input() {
        let (_, mut apu) = apu();
        let first = apu.dc_block(1000, 1000);
        let second = apu.dc_block(1000, 1000);
        assert!(second.0 < first.0);
        assert!(second.1 < first.1);
    }

    #[test]
    fn dc_filter_converges_to_zero() {
        let (_, mut apu) = apu();
        let mut out = (0i16, 0i16);
        for _ in 0..8192 {
            out = apu.dc_block(1000, 1000);
        }
        assert!(out.0.abs() < 10);
        assert!(out.1.abs() < 10);
    }

    #[test]
    fn dc_filter_reset_when_all_dacs_off() {
        let (_, mut apu) = apu();
        let _ = apu.mix_output();
        apu.ch1.dac_enabled = false;
        apu.ch2.dac_enabled = false;
        apu.ch3.dac_enabled = false;
        apu.ch4.dac_enabled = false;
        assert_eq!(apu.mix_output(), (0, 0));
    }

    #[test]
    fn envelope_with_zero_period_holds_volume() {
        let mut env = Envelope::default();
        env.write(0xA0);
        env.trigger();
        for _ in 0..32 {
            env.clock();
        }
        assert_eq!(env.volume, 0x0A);
    }

    #[test]
    fn noise_lfsr_xnor_feedback() {
        let mut ch = NoiseChannel {
            enabled: true,
            dac_enabled: true,
            ..Default::default()
        };
        ch.timer = ch.period();
        ch.advance(8);
        // 0 XNOR 0 = 1 shifted into bit 14.
        assert_eq!(ch.lfsr, 0x4000);
    }
}
