#![allow(dead_code)]

use gbc_emu_core::{
    apu::Apu,
    cartridge::Cartridge,
    gameboy::{Config, GameBoy},
    hardware::EmulationMode,
    scheduler::{Scheduler, TaskKind},
    timer::Timer,
};

pub const ROM_BANK_SIZE: usize = 0x4000;
pub const PROGRAM_START: u16 = 0x0150;

/// Cartridge image under construction. Every byte of bank `n` (outside the
/// header and any placed code) holds `n`, so reads identify the mapped bank.
pub struct RomBuilder {
    rom: Vec<u8>,
}

impl RomBuilder {
    pub fn new(cart_type: u8, rom_size_code: u8, ram_size_code: u8) -> Self {
        let banks = match rom_size_code {
            0x52 => 72,
            0x53 => 80,
            0x54 => 96,
            code => 2usize << code,
        };
        let mut rom = vec![0u8; banks * ROM_BANK_SIZE];
        for (bank, chunk) in rom.chunks_mut(ROM_BANK_SIZE).enumerate() {
            chunk.fill(bank as u8);
        }
        rom[0x0100..0x0150].fill(0);
        rom[0x0134..0x0138].copy_from_slice(b"TEST");
        rom[0x0147] = cart_type;
        rom[0x0148] = rom_size_code;
        rom[0x0149] = ram_size_code;
        // NOP; JP $0150
        rom[0x0100..0x0104].copy_from_slice(&[0x00, 0xC3, 0x50, 0x01]);
        Self { rom }
    }

    /// 32 KiB ROM-only image.
    pub fn rom_only() -> Self {
        Self::new(0x00, 0x00, 0x00)
    }

    pub fn cgb_flag(mut self, flag: u8) -> Self {
        self.rom[0x0143] = flag;
        self
    }

    /// Place code at 0x0150, followed by `JR -2` so execution parks there.
    pub fn program(mut self, code: &[u8]) -> Self {
        let start = PROGRAM_START as usize;
        self.rom[start..start + code.len()].copy_from_slice(code);
        self.rom[start + code.len()..start + code.len() + 2].copy_from_slice(&[0x18, 0xFE]);
        self
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.rom.clone()
    }

    pub fn build(self) -> Cartridge {
        Cartridge::from_bytes(self.rom).unwrap()
    }
}

pub fn machine_with(cart: Cartridge, mode: EmulationMode) -> GameBoy {
    GameBoy::new(
        cart,
        Config {
            mode,
            ..Config::default()
        },
    )
}

/// DMG machine running `code` from 0x0150.
pub fn dmg_machine(code: &[u8]) -> GameBoy {
    machine_with(RomBuilder::rom_only().program(code).build(), EmulationMode::Auto)
}

/// CGB machine running `code` from 0x0150.
pub fn cgb_machine(code: &[u8]) -> GameBoy {
    machine_with(
        RomBuilder::rom_only().cgb_flag(0x80).program(code).build(),
        EmulationMode::Auto,
    )
}

/// Step until the CPU reaches `pc`, with a generous step limit.
pub fn run_to(gb: &mut GameBoy, pc: u16) {
    for _ in 0..1_000_000 {
        if gb.cpu.pc == pc {
            return;
        }
        gb.step();
    }
    panic!("PC never reached {pc:04X}, stuck at {:04X}", gb.cpu.pc);
}

/// Timer plus APU on one timeline, registered the way the machine does it.
pub struct Timeline {
    pub sched: Scheduler,
    pub timer: Timer,
    pub apu: Apu,
    pub if_reg: u8,
}

impl Timeline {
    pub fn new(div: u16) -> Self {
        let mut sched = Scheduler::new();
        let timer = Timer::new(&mut sched, div);
        let apu = Apu::new(&mut sched, false, 44_100, 1024);
        Self {
            sched,
            timer,
            apu,
            if_reg: 0,
        }
    }

    pub fn advance(&mut self, cycles: u64) {
        let timer = &mut self.timer;
        let apu = &mut self.apu;
        let if_reg = &mut self.if_reg;
        self.sched.advance(cycles, |sched, id| match sched.kind(id) {
            TaskKind::TimerOverflow => timer.on_overflow(sched),
            TaskKind::TimerReload => timer.on_reload(sched, if_reg),
            TaskKind::AudioFrameTick => apu.on_frame_tick(sched),
            TaskKind::AudioSampleTick => {
                if apu.on_sample_tick(sched) {
                    apu.discard_buffer();
                }
            }
        });
    }

    pub fn write_timer(&mut self, addr: u16, val: u8) {
        self.timer.write(addr, val, &mut self.sched);
    }

    pub fn read_timer(&mut self, addr: u16) -> u8 {
        self.timer.read(addr, self.sched.now())
    }

    pub fn write_apu(&mut self, addr: u16, val: u8) {
        self.apu.write_reg(addr, val, self.sched.now());
    }

    pub fn read_apu(&mut self, addr: u16) -> u8 {
        self.apu.read_reg(addr, self.sched.now())
    }
}
