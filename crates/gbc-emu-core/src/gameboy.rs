use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info};

use crate::{
    apu::{Apu, DEFAULT_BUFFER_FRAMES, DEFAULT_SAMPLE_RATE},
    cartridge::Cartridge,
    cpu::Cpu,
    error::StateError,
    hardware::{EmulationMode, Hardware},
    keypad::{Button, Keypad},
    mmu::{Bus, Mmu, Peripherals},
    pacing::{Pacer, StopHandle},
    ppu::Ppu,
    scheduler::{Scheduler, TaskKind},
    sink::{PixelSink, SCREEN_WIDTH, SampleSink},
    state::{Sections, Snapshot, StateReader, StateWriter, expect_eq},
    timer::Timer,
};

/// Machine cycles in one video frame at normal speed.
pub const CYCLES_PER_FRAME: u32 = 17_556;

const STATE_MAGIC: &[u8; 4] = b"GBCS";
const STATE_VERSION: u16 = 1;
const STATE_SECTIONS: &[&str] = &[
    "GLOB", "CPU ", "MMU ", "GPU ", "TIMR", "APU ", "KEYP", "SCHD",
];

/// Divider value left behind by each boot ROM.
const DMG_BOOT_DIV: u16 = 0xABCC;
const CGB_BOOT_DIV: u16 = 0x1EA0;

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: EmulationMode,
    pub sample_rate: u32,
    /// Stereo frames buffered before the sample sink is called.
    pub buffer_frames: usize,
    /// Pacing speed multiplier, 1.0 = real time.
    pub speed: f64,
    /// Sleep after each frame to hold the display refresh rate.
    pub pacing: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: EmulationMode::Auto,
            sample_rate: DEFAULT_SAMPLE_RATE,
            buffer_frames: DEFAULT_BUFFER_FRAMES,
            speed: 1.0,
            pacing: false,
        }
    }
}

/// The whole console. Owns every component and lends them to each other for
/// the duration of a call.
pub struct GameBoy {
    pub cpu: Cpu,
    pub mmu: Mmu,
    pub ppu: Ppu,
    pub apu: Apu,
    pub timer: Timer,
    pub keypad: Keypad,
    pub sched: Scheduler,
    hardware: Hardware,
    /// Odd machine cycle not yet handed to the PPU in double speed.
    ppu_residual: u32,
    pixel_sink: Option<Box<dyn PixelSink>>,
    sample_sink: Option<Box<dyn SampleSink>>,
    pacer: Option<Pacer>,
    stop: Option<StopHandle>,
}

impl GameBoy {
    /// Build a machine in the state the boot ROM leaves behind.
    pub fn new(cart: Cartridge, config: Config) -> Self {
        let hardware = config.mode.resolve(&cart.header);
        let cgb = hardware.is_cgb();
        let div = if cgb { CGB_BOOT_DIV } else { DMG_BOOT_DIV };
        let mut gb = Self::assemble(cart, hardware, &config, Cpu::new(cgb), div);
        gb.ppu.apply_boot_state();
        if hardware.compat {
            gb.ppu.apply_dmg_compatibility_palettes();
        }
        gb
    }

    /// Build a machine at power-on that runs `boot_rom` from address 0.
    pub fn with_boot_rom(cart: Cartridge, boot_rom: Vec<u8>, config: Config) -> Self {
        let hardware = config.mode.resolve(&cart.header);
        let mut gb = Self::assemble(cart, hardware, &config, Cpu::new_power_on(), 0);
        gb.mmu.load_boot_rom(boot_rom);
        gb
    }

    fn assemble(cart: Cartridge, hardware: Hardware, config: &Config, cpu: Cpu, div: u16) -> Self {
        let cgb = hardware.is_cgb();
        info!(
            "'{}': {:?}, {} ROM banks, {} RAM banks, {}{}",
            cart.header.title,
            cart.mbc,
            cart.rom_bank_count(),
            cart.ram_bank_count(),
            if cgb { "CGB" } else { "DMG" },
            if hardware.compat { " (compatibility)" } else { "" },
        );
        // Registration order fixes the task ids a snapshot refers to.
        let mut sched = Scheduler::new();
        let timer = Timer::new(&mut sched, div);
        let apu = Apu::new(&mut sched, cgb, config.sample_rate, config.buffer_frames);
        let (pacer, stop) = if config.pacing {
            let (pacer, stop) = Pacer::new(config.speed);
            (Some(pacer), Some(stop))
        } else {
            (None, None)
        };
        Self {
            cpu,
            mmu: Mmu::new(cart, cgb),
            ppu: Ppu::new(cgb),
            apu,
            timer,
            keypad: Keypad::new(),
            sched,
            hardware,
            ppu_residual: 0,
            pixel_sink: None,
            sample_sink: None,
            pacer,
            stop,
        }
    }

    pub fn hardware(&self) -> Hardware {
        self.hardware
    }

    pub fn is_cgb(&self) -> bool {
        self.hardware.is_cgb()
    }

    pub fn double_speed(&self) -> bool {
        self.mmu.double_speed()
    }

    pub fn cycles(&self) -> u64 {
        self.sched.now()
    }

    pub fn cartridge(&self) -> &Cartridge {
        &self.mmu.cart
    }

    pub fn cartridge_mut(&mut self) -> &mut Cartridge {
        &mut self.mmu.cart
    }

    pub fn set_pixel_sink(&mut self, sink: Box<dyn PixelSink>) {
        self.pixel_sink = Some(sink);
    }

    pub fn take_pixel_sink(&mut self) -> Option<Box<dyn PixelSink>> {
        self.pixel_sink.take()
    }

    /// Attaching a sample sink turns off the halt fast path so audio is
    /// produced at a steady cadence.
    pub fn set_sample_sink(&mut self, sink: Box<dyn SampleSink>) {
        self.sample_sink = Some(sink);
    }

    pub fn take_sample_sink(&mut self) -> Option<Box<dyn SampleSink>> {
        self.sample_sink.take()
    }

    /// Handle that interrupts frame pacing, if pacing is on.
    pub fn stop_handle(&self) -> Option<StopHandle> {
        self.stop.clone()
    }

    pub fn pacer_mut(&mut self) -> Option<&mut Pacer> {
        self.pacer.as_mut()
    }

    /// Skip pacing sleeps while fast-forwarding or when audio sets the pace.
    pub fn set_fast_forward(&mut self, on: bool) {
        if let Some(pacer) = self.pacer.as_mut() {
            pacer.bypass = on;
        }
    }

    /// True once the host asked the pacer to stop.
    pub fn stop_requested(&self) -> bool {
        self.pacer.as_ref().is_some_and(Pacer::is_stopped)
    }

    pub fn set_button(&mut self, button: Button, pressed: bool) {
        if self.keypad.set_button(button, pressed) {
            self.mmu.if_reg |= 0x10;
            self.cpu.stopped = false;
        }
    }

    pub fn press(&mut self, button: Button) {
        self.set_button(button, true);
    }

    pub fn release(&mut self, button: Button) {
        self.set_button(button, false);
    }

    /// Bytes sent over the serial port since the last call.
    pub fn take_serial(&mut self) -> Vec<u8> {
        self.mmu.take_serial()
    }

    /// Bring the audio channels up to the current cycle.
    pub fn sync_audio(&mut self) {
        self.apu.sync(self.sched.now());
    }

    /// Read a byte the way the CPU would see it.
    pub fn read(&mut self, addr: u16) -> u8 {
        let mut io = Peripherals {
            ppu: &mut self.ppu,
            apu: &mut self.apu,
            timer: &mut self.timer,
            keypad: &mut self.keypad,
            sched: &mut self.sched,
        };
        self.mmu.read(addr, &mut io)
    }

    /// Write a byte the way the CPU would.
    pub fn write(&mut self, addr: u16, val: u8) {
        let mut io = Peripherals {
            ppu: &mut self.ppu,
            apu: &mut self.apu,
            timer: &mut self.timer,
            keypad: &mut self.keypad,
            sched: &mut self.sched,
        };
        self.mmu.write(addr, val, &mut io);
    }

    /// Execute one instruction (or interrupt dispatch, or halted stretch) and
    /// advance every other component by the cycles it took.
    pub fn step(&mut self) -> u32 {
        // HBlank DMA blocks from the previous step stall the CPU now.
        let mut cycles = self.mmu.take_dma_stall();
        cycles += match self.halt_skip() {
            Some(skip) => skip,
            None => {
                let mut bus = Bus {
                    mmu: &mut self.mmu,
                    io: Peripherals {
                        ppu: &mut self.ppu,
                        apu: &mut self.apu,
                        timer: &mut self.timer,
                        keypad: &mut self.keypad,
                        sched: &mut self.sched,
                    },
                };
                self.cpu.step(&mut bus)
            }
        };
        cycles += self.mmu.take_dma_stall();
        self.advance(cycles);
        cycles
    }

    /// While halted with nothing pending, jump straight to the next cycle at
    /// which anything can change.
    fn halt_skip(&self) -> Option<u32> {
        if !self.cpu.halted
            || self.sample_sink.is_some()
            || self.mmu.ie_reg & self.mmu.if_reg & 0x1F != 0
        {
            return None;
        }
        let now = self.sched.now();
        let mut skip = self
            .sched
            .next_target()
            .map_or(CYCLES_PER_FRAME as u64, |t| t.saturating_sub(now));
        if let Some(ppu) = self.ppu.cycles_to_next_event() {
            let ppu = if self.double_speed() {
                (ppu as u64 * 2).saturating_sub(self.ppu_residual as u64)
            } else {
                ppu as u64
            };
            skip = skip.min(ppu);
        }
        Some(skip.clamp(1, CYCLES_PER_FRAME as u64) as u32)
    }

    fn advance(&mut self, cycles: u32) {
        let ppu_cycles = if self.double_speed() {
            let total = cycles + self.ppu_residual;
            self.ppu_residual = total & 1;
            total >> 1
        } else {
            self.ppu_residual = 0;
            cycles
        };
        let hblanks = self.ppu.step(ppu_cycles, &mut self.mmu.if_reg);
        for _ in 0..hblanks {
            self.mmu.hdma_hblank_transfer(&mut self.ppu);
        }
        if self.ppu.frame_ready() {
            self.present_frame();
        }

        let timer = &mut self.timer;
        let apu = &mut self.apu;
        let if_reg = &mut self.mmu.if_reg;
        self.sched.advance(cycles as u64, |sched, id| match sched.kind(id) {
            TaskKind::TimerOverflow => timer.on_overflow(sched),
            TaskKind::TimerReload => timer.on_reload(sched, if_reg),
            TaskKind::AudioFrameTick => apu.on_frame_tick(sched),
            TaskKind::AudioSampleTick => {
                apu.on_sample_tick(sched);
            }
        });

        if self.apu.buffer_full() {
            match self.sample_sink.as_mut() {
                Some(sink) => self.apu.flush(sink.as_mut()),
                None => self.apu.discard_buffer(),
            }
        }
    }

    fn present_frame(&mut self) {
        self.ppu.clear_frame_flag();
        if let Some(sink) = self.pixel_sink.as_mut() {
            for (i, &rgb) in self.ppu.framebuffer.iter().enumerate() {
                sink.put_pixel(i % SCREEN_WIDTH, i / SCREEN_WIDTH, rgb);
            }
            sink.present();
        }
        if let Some(pacer) = self.pacer.as_mut() {
            pacer.wait_frame();
        }
    }

    /// Run until the next frame has been presented, or for one frame's worth
    /// of cycles while the LCD is off. Returns the cycles executed.
    pub fn run_frame(&mut self) -> u32 {
        let start = self.ppu.frames();
        let budget = CYCLES_PER_FRAME << self.double_speed() as u32;
        let mut cycles = 0;
        while self.ppu.frames() == start && cycles < budget {
            if self.stop_requested() {
                break;
            }
            cycles += self.step();
        }
        cycles
    }

    /// Run for at least `cycles` machine cycles.
    pub fn run_cycles(&mut self, cycles: u64) -> u64 {
        let mut done = 0;
        while done < cycles {
            done += self.step() as u64;
        }
        done
    }

    /// Serialise the whole machine.
    pub fn save_state(&self) -> Vec<u8> {
        let mut w = StateWriter::new();
        w.bytes(STATE_MAGIC);
        w.u16(STATE_VERSION);
        w.section(b"GLOB", |w| {
            w.bool(self.hardware.is_cgb());
            w.bool(self.hardware.compat);
            w.bool(self.cpu.halted);
            w.bool(self.cpu.stopped);
            w.u8(self.mmu.ie_reg);
            w.u8(self.mmu.if_reg);
            w.bool(self.double_speed());
            w.u32(self.ppu_residual);
        });
        w.section(b"CPU ", |w| self.cpu.save_state(w));
        w.section(b"MMU ", |w| self.mmu.save_state(w));
        w.section(b"GPU ", |w| self.ppu.save_state(w));
        w.section(b"TIMR", |w| self.timer.save_state(w));
        w.section(b"APU ", |w| self.apu.save_state(w));
        w.section(b"KEYP", |w| self.keypad.save_state(w));
        w.section(b"SCHD", |w| {
            w.u64(self.sched.now());
            w.u32(self.sched.len() as u32);
            for (id, target) in self.sched.pending() {
                w.u8(self.sched.kind(id).to_u8());
                w.u32(self.sched.arg(id));
                w.u64(target);
            }
        });
        w.end();
        debug!("saved state at cycle {}", self.sched.now());
        w.into_bytes()
    }

    /// Restore a stream produced by [`GameBoy::save_state`] for the same
    /// cartridge and hardware. The machine is untouched on error.
    pub fn load_state(&mut self, data: &[u8]) -> Result<(), StateError> {
        let mut header = StateReader::new(data, "header");
        let mut magic = [0u8; 4];
        header
            .bytes_into(&mut magic)
            .map_err(|_| StateError::BadMagic)?;
        if &magic != STATE_MAGIC {
            return Err(StateError::BadMagic);
        }
        let version = header.u16()?;
        if version != STATE_VERSION {
            return Err(StateError::BadVersion(version));
        }
        let sections = Sections::parse(&data[6..], STATE_SECTIONS)?;

        let mut cpu = self.cpu.clone();
        let mut mmu = self.mmu.clone();
        let mut ppu = self.ppu.clone();
        let mut apu = self.apu.clone();
        let mut timer = self.timer.clone();
        let mut keypad = self.keypad.clone();
        let mut sched = self.sched.clone();

        cpu.load_state(&mut sections.require("CPU ")?)?;
        mmu.load_state(&mut sections.require("MMU ")?)?;
        ppu.load_state(&mut sections.require("GPU ")?)?;
        timer.load_state(&mut sections.require("TIMR")?)?;
        apu.load_state(&mut sections.require("APU ")?)?;
        keypad.load_state(&mut sections.require("KEYP")?)?;
        load_schedule(&mut sched, &mut sections.require("SCHD")?)?;

        let mut glob = sections.require("GLOB")?;
        expect_eq("colour mode", self.hardware.is_cgb() as u64, glob.bool()? as u64)?;
        expect_eq("compatibility mode", self.hardware.compat as u64, glob.bool()? as u64)?;
        cpu.halted = glob.bool()?;
        cpu.stopped = glob.bool()?;
        mmu.ie_reg = glob.u8()?;
        mmu.if_reg = glob.u8()? | 0xE0;
        expect_eq("double speed", mmu.double_speed() as u64, glob.bool()? as u64)?;
        let ppu_residual = glob.u32()? & 1;
        glob.finish()?;

        self.cpu = cpu;
        self.mmu = mmu;
        self.ppu = ppu;
        self.apu = apu;
        self.timer = timer;
        self.keypad = keypad;
        self.sched = sched;
        self.ppu_residual = ppu_residual;
        debug!("loaded state at cycle {}", self.sched.now());
        Ok(())
    }
}

/// Rebuild the timeline from (kind, argument, target) records.
fn load_schedule(sched: &mut Scheduler, r: &mut StateReader<'_>) -> Result<(), StateError> {
    let now = r.u64()?;
    let count = r.u32()?;
    sched.clear();
    sched.set_now(now);
    for _ in 0..count {
        let code = r.u8()?;
        let kind = TaskKind::from_u8(code).ok_or(StateError::InvalidValue {
            what: "task kind",
            value: code as u64,
        })?;
        let arg = r.u32()?;
        let target = r.u64()?;
        let id = sched.find(kind, arg).ok_or(StateError::InvalidValue {
            what: "task argument",
            value: arg as u64,
        })?;
        if sched.is_scheduled(id) {
            return Err(StateError::InvalidValue {
                what: "duplicate task",
                value: code as u64,
            });
        }
        sched.schedule(id, target);
    }
    r.finish()
}

/// A machine behind the single lock that hosts take before driving it from
/// more than one thread.
#[derive(Clone)]
pub struct SharedGameBoy(Arc<Mutex<GameBoy>>);

impl SharedGameBoy {
    pub fn new(gb: GameBoy) -> Self {
        Self(Arc::new(Mutex::new(gb)))
    }

    pub fn lock(&self) -> MutexGuard<'_, GameBoy> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn run_frame(&self) -> u32 {
        self.lock().run_frame()
    }

    pub fn save_state(&self) -> Vec<u8> {
        self.lock().save_state()
    }

    pub fn load_state(&self, data: &[u8]) -> Result<(), StateError> {
        self.lock().load_state(data)
    }
}
