use std::{
    fs,
    path::Path,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use log::{info, warn};

use crate::error::{CartridgeError, StateError};
use crate::state::{Sections, StateReader, StateWriter, expect_eq};

pub const ROM_BANK_SIZE: usize = 0x4000;
pub const RAM_BANK_SIZE: usize = 0x2000;
const HEADER_END: usize = 0x150;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbcType {
    NoMbc,
    Mbc1,
    Mbc2,
    Mbc3,
    Mbc5,
}

impl MbcType {
    fn code(self) -> u8 {
        match self {
            MbcType::NoMbc => 0,
            MbcType::Mbc1 => 1,
            MbcType::Mbc2 => 2,
            MbcType::Mbc3 => 3,
            MbcType::Mbc5 => 5,
        }
    }
}

/// Fields of the cartridge header the emulator cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub title: String,
    pub cart_type: u8,
    pub cgb_flag: u8,
    pub rom_banks: usize,
    pub ram_size: usize,
}

impl Header {
    pub fn parse(data: &[u8]) -> Result<Self, CartridgeError> {
        if data.len() < HEADER_END {
            return Err(CartridgeError::TooShort(data.len()));
        }
        let cart_type = data[0x0147];
        let rom_banks = match data[0x0148] {
            code @ 0x00..=0x08 => 2usize << code,
            0x52 => 72,
            0x53 => 80,
            0x54 => 96,
            code => return Err(CartridgeError::BadRomSize(code)),
        };
        let ram_size = if matches!(cart_type, 0x05 | 0x06) {
            // MBC2 has 512x4-bit internal RAM regardless of the header.
            0x200
        } else {
            match data[0x0149] {
                0x00 => 0,
                0x01 => 0x800,
                0x02 => 0x2000,
                0x03 => 0x8000,
                0x04 => 0x20000,
                0x05 => 0x10000,
                code => return Err(CartridgeError::BadRamSize(code)),
            }
        };

        let mut title = &data[0x0134..0x0143];
        if let Some(pos) = title.iter().position(|&b| b == 0) {
            title = &title[..pos];
        }

        Ok(Self {
            title: String::from_utf8_lossy(title).trim().to_string(),
            cart_type,
            cgb_flag: data[0x0143],
            rom_banks,
            ram_size,
        })
    }

    pub fn mbc_type(&self) -> Result<MbcType, CartridgeError> {
        match self.cart_type {
            0x00 | 0x08 | 0x09 => Ok(MbcType::NoMbc),
            0x01..=0x03 => Ok(MbcType::Mbc1),
            0x05 | 0x06 => Ok(MbcType::Mbc2),
            0x0F..=0x13 => Ok(MbcType::Mbc3),
            0x19..=0x1E => Ok(MbcType::Mbc5),
            other => Err(CartridgeError::UnsupportedType(other)),
        }
    }

    /// Bit 7 of 0x143: the game can use colour hardware.
    pub fn cgb_supported(&self) -> bool {
        self.cgb_flag & 0x80 != 0
    }

    pub fn cgb_only(&self) -> bool {
        self.cgb_flag == 0xC0
    }

    pub fn has_battery(&self) -> bool {
        matches!(
            self.cart_type,
            0x03 | 0x06 | 0x09 | 0x0F | 0x10 | 0x13 | 0x1B | 0x1E
        )
    }

    pub fn has_rtc(&self) -> bool {
        matches!(self.cart_type, 0x0F | 0x10)
    }
}

#[derive(Debug, Clone)]
enum MbcState {
    NoMbc,
    Mbc1 {
        rom_bank: u8,
        upper: u8,
        mode: u8,
    },
    Mbc2 {
        rom_bank: u8,
    },
    Mbc3 {
        rom_bank: u8,
        /// 0x00-0x03 selects RAM, 0x08-0x0C an RTC register.
        select: u8,
        rtc: Option<Mbc3Rtc>,
        latch_pending: bool,
    },
    Mbc5 {
        rom_bank: u16,
        ram_bank: u8,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct RtcRegisters {
    seconds: u8,
    minutes: u8,
    hours: u8,
    days: u16,
    halt: bool,
    carry: bool,
}

/// MBC3 real-time clock. It follows the host's wall clock, independent of
/// how fast the machine is being run.
#[derive(Debug, Clone)]
struct Mbc3Rtc {
    regs: RtcRegisters,
    latched: RtcRegisters,
    last_update: SystemTime,
    subsecond_cycles: u32,
}

const RTC_CYCLES_PER_SECOND: u32 = 4_194_304;

impl RtcRegisters {
    fn control_byte(&self) -> u8 {
        let mut out = ((self.days >> 8) as u8) & 0x01;
        if self.halt {
            out |= 0x40;
        }
        if self.carry {
            out |= 0x80;
        }
        out
    }

    fn save(&self, w: &mut StateWriter) {
        w.u8(self.seconds);
        w.u8(self.minutes);
        w.u8(self.hours);
        w.u16(self.days);
        w.u8(((self.halt as u8) << 6) | ((self.carry as u8) << 7));
    }

    fn load(r: &mut StateReader<'_>) -> Result<Self, StateError> {
        let seconds = r.u8()? & 0x3F;
        let minutes = r.u8()? & 0x3F;
        let hours = r.u8()? & 0x1F;
        let days = r.u16()? & 0x01FF;
        let flags = r.u8()?;
        Ok(Self {
            seconds,
            minutes,
            hours,
            days,
            halt: flags & 0x40 != 0,
            carry: flags & 0x80 != 0,
        })
    }
}

impl Mbc3Rtc {
    fn new(now: SystemTime) -> Self {
        let regs = RtcRegisters::default();
        Self {
            regs,
            latched: regs,
            last_update: now,
            subsecond_cycles: 0,
        }
    }

    fn latch(&mut self, now: SystemTime) {
        self.sync_wall(now);
        self.latched = self.regs;
    }

    fn read_latched(&self, reg: u8) -> u8 {
        match reg {
            0x08 => self.latched.seconds & 0x3F,
            0x09 => self.latched.minutes & 0x3F,
            0x0A => self.latched.hours & 0x1F,
            0x0B => (self.latched.days & 0x00FF) as u8,
            0x0C => self.latched.control_byte(),
            _ => 0xFF,
        }
    }

    fn write_register(&mut self, reg: u8, value: u8, now: SystemTime) {
        self.sync_wall(now);
        match reg {
            0x08 => {
                self.regs.seconds = value & 0x3F;
                self.subsecond_cycles = 0;
            }
            0x09 => self.regs.minutes = value & 0x3F,
            0x0A => self.regs.hours = value & 0x1F,
            0x0B => self.regs.days = (self.regs.days & 0x0100) | value as u16,
            0x0C => {
                self.regs.days = (self.regs.days & 0x00FF) | (((value & 0x01) as u16) << 8);
                self.regs.halt = value & 0x40 != 0;
                self.regs.carry = value & 0x80 != 0;
            }
            _ => {}
        }
        self.latched = self.regs;
    }

    fn sync_wall(&mut self, now: SystemTime) {
        let elapsed = now.duration_since(self.last_update).unwrap_or_default();
        self.last_update = now;
        if self.regs.halt {
            return;
        }

        let elapsed_cycles = (elapsed.as_secs() as u128)
            .saturating_mul(RTC_CYCLES_PER_SECOND as u128)
            .saturating_add(
                (elapsed.subsec_nanos() as u128).saturating_mul(RTC_CYCLES_PER_SECOND as u128)
                    / 1_000_000_000u128,
            );
        self.add_cycles(elapsed_cycles.min(u64::MAX as u128) as u64);
    }

    fn add_cycles(&mut self, cycles: u64) {
        let mut seconds = cycles / RTC_CYCLES_PER_SECOND as u64;
        let rem = (cycles % RTC_CYCLES_PER_SECOND as u64) as u32;

        let mut sub = self.subsecond_cycles + rem;
        if sub >= RTC_CYCLES_PER_SECOND {
            sub -= RTC_CYCLES_PER_SECOND;
            seconds += 1;
        }
        self.subsecond_cycles = sub;

        if seconds > 0 {
            self.advance_seconds(seconds);
        }
    }

    fn advance_seconds(&mut self, mut seconds: u64) {
        // Whole days in one step so long absences stay cheap.
        let day = 86_400;
        if seconds >= day && self.regs_are_valid() {
            let days = seconds / day;
            seconds %= day;
            for _ in 0..days.min(0x400) {
                self.day_tick();
            }
        }
        while seconds > 0 {
            let until_minute_tick = self.seconds_until_minute_tick();
            if seconds < until_minute_tick {
                self.regs.seconds = ((self.regs.seconds as u64 + seconds) & 0x3F) as u8;
                return;
            }

            seconds -= until_minute_tick;
            self.regs.seconds = 0;
            self.minute_tick();
        }
    }

    fn regs_are_valid(&self) -> bool {
        self.regs.seconds < 60 && self.regs.minutes < 60 && self.regs.hours < 24
    }

    fn seconds_until_minute_tick(&self) -> u64 {
        let sec = self.regs.seconds as u64;
        if sec <= 59 { 60 - sec } else { (63 - sec + 1) + 60 }
    }

    fn minute_tick(&mut self) {
        let overflow = self.regs.minutes == 59;
        self.regs.minutes = ((self.regs.minutes as u16 + 1) & 0x3F) as u8;
        if overflow {
            self.regs.minutes = 0;
            self.hour_tick();
        }
    }

    fn hour_tick(&mut self) {
        let overflow = self.regs.hours == 23;
        self.regs.hours = ((self.regs.hours as u16 + 1) & 0x1F) as u8;
        if overflow {
            self.regs.hours = 0;
            self.day_tick();
        }
    }

    fn day_tick(&mut self) {
        if self.regs.days >= 0x01FF {
            self.regs.days = 0;
            self.regs.carry = true;
        } else {
            self.regs.days += 1;
        }
    }

    fn save(&self, w: &mut StateWriter) {
        self.regs.save(w);
        self.latched.save(w);
        w.u32(self.subsecond_cycles);
        let stamp = self
            .last_update
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        w.u64(stamp.as_secs());
        w.u32(stamp.subsec_nanos());
    }

    fn load(r: &mut StateReader<'_>) -> Result<Self, StateError> {
        let regs = RtcRegisters::load(r)?;
        let latched = RtcRegisters::load(r)?;
        let subsecond_cycles = r.u32()?.min(RTC_CYCLES_PER_SECOND - 1);
        let secs = r.u64()?;
        let nanos = r.u32()?.min(999_999_999);
        Ok(Self {
            regs,
            latched,
            last_update: UNIX_EPOCH + Duration::new(secs, nanos),
            subsecond_cycles,
        })
    }
}

/// A loaded cartridge: ROM image, external RAM and bank controller state.
#[derive(Debug, Clone)]
pub struct Cartridge {
    pub rom: Vec<u8>,
    pub ram: Vec<u8>,
    pub mbc: MbcType,
    pub header: Header,
    rom_banks: usize,
    ram_banks: usize,
    ram_enable: bool,
    mbc_state: MbcState,
    /// Effective banks, reduced modulo the bank counts after every write.
    rom0_bank: usize,
    romx_bank: usize,
    ram_bank: usize,
    clock: fn() -> SystemTime,
}

impl Cartridge {
    pub fn from_bytes(mut data: Vec<u8>) -> Result<Self, CartridgeError> {
        let header = Header::parse(&data)?;
        let mbc = header.mbc_type()?;
        let rom_banks = header.rom_banks;
        let declared = rom_banks * ROM_BANK_SIZE;
        if data.len() > declared {
            warn!(
                "ROM image is {} bytes but the header declares {declared}; ignoring the excess",
                data.len()
            );
        }
        // Pad short dumps so every reduced bank index is addressable.
        data.resize(declared, 0xFF);

        let ram_size = header.ram_size;
        let ram_banks = ram_size.div_ceil(RAM_BANK_SIZE);
        let now = SystemTime::now();

        let mbc_state = match mbc {
            MbcType::NoMbc => MbcState::NoMbc,
            MbcType::Mbc1 => MbcState::Mbc1 {
                rom_bank: 1,
                upper: 0,
                mode: 0,
            },
            MbcType::Mbc2 => MbcState::Mbc2 { rom_bank: 1 },
            MbcType::Mbc3 => MbcState::Mbc3 {
                rom_bank: 1,
                select: 0,
                rtc: header.has_rtc().then(|| Mbc3Rtc::new(now)),
                latch_pending: false,
            },
            MbcType::Mbc5 => MbcState::Mbc5 {
                rom_bank: 1,
                ram_bank: 0,
            },
        };

        let mut cart = Self {
            rom: data,
            ram: vec![0; ram_size],
            mbc,
            header,
            rom_banks,
            ram_banks,
            ram_enable: false,
            mbc_state,
            rom0_bank: 0,
            romx_bank: 1,
            ram_bank: 0,
            clock: SystemTime::now,
        };
        cart.update_banks();

        info!(
            "Loaded ROM: {} (MBC: {:?}, {} ROM banks, {} bytes RAM, CGB: {})",
            cart.header.title,
            cart.mbc,
            cart.rom_banks,
            cart.ram.len(),
            if cart.header.cgb_supported() { "yes" } else { "no" }
        );
        Ok(cart)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let data = fs::read(path)?;
        Ok(Self::from_bytes(data)?)
    }

    /// Replace the wall-clock source used by the real-time clock.
    pub fn set_clock(&mut self, clock: fn() -> SystemTime) {
        self.clock = clock;
    }

    pub fn rom_bank_count(&self) -> usize {
        self.rom_banks
    }

    pub fn ram_bank_count(&self) -> usize {
        self.ram_banks
    }

    /// Bank visible at 0x4000-0x7FFF.
    pub fn rom_bank(&self) -> usize {
        self.romx_bank
    }

    /// Bank visible at 0x0000-0x3FFF.
    pub fn rom0_bank(&self) -> usize {
        self.rom0_bank
    }

    /// External RAM bank visible at 0xA000-0xBFFF.
    pub fn ram_bank(&self) -> usize {
        self.ram_bank
    }

    pub fn has_battery(&self) -> bool {
        self.header.has_battery()
    }

    pub fn has_rtc(&self) -> bool {
        matches!(self.mbc_state, MbcState::Mbc3 { rtc: Some(_), .. })
    }

    fn update_banks(&mut self) {
        let rom_banks = self.rom_banks;
        let ram_banks = self.ram_banks.max(1);
        let (rom0, romx, ram) = match &self.mbc_state {
            MbcState::NoMbc => (0, 1, 0),
            MbcState::Mbc1 {
                rom_bank,
                upper,
                mode,
            } => {
                let high = (*upper as usize & 0x03) << 5;
                let rom0 = if *mode == 0 { 0 } else { high };
                let ram = if *mode == 0 { 0 } else { *upper as usize };
                (rom0, high | *rom_bank as usize, ram)
            }
            MbcState::Mbc2 { rom_bank } => (0, *rom_bank as usize, 0),
            MbcState::Mbc3 {
                rom_bank, select, ..
            } => (0, *rom_bank as usize, (*select & 0x03) as usize),
            MbcState::Mbc5 { rom_bank, ram_bank } => (0, *rom_bank as usize, *ram_bank as usize),
        };
        self.rom0_bank = rom0 % rom_banks;
        self.romx_bank = romx % rom_banks;
        self.ram_bank = ram % ram_banks;
    }

    pub fn read(&mut self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x3FFF => self.rom[self.rom0_bank * ROM_BANK_SIZE + addr as usize],
            0x4000..=0x7FFF => {
                self.rom[self.romx_bank * ROM_BANK_SIZE + (addr as usize - 0x4000)]
            }
            0xA000..=0xBFFF => self.read_ram(addr),
            _ => 0xFF,
        }
    }

    fn read_ram(&mut self, addr: u16) -> u8 {
        if !self.ram_enable && !matches!(self.mbc_state, MbcState::NoMbc) {
            return 0xFF;
        }
        match &self.mbc_state {
            MbcState::Mbc3 {
                select: reg @ 0x08..=0x0C,
                rtc,
                ..
            } => rtc.as_ref().map(|r| r.read_latched(*reg)).unwrap_or(0xFF),
            MbcState::Mbc3 {
                select: 0x04..=0xFF,
                ..
            } => 0xFF,
            _ if self.ram.is_empty() => 0xFF,
            MbcState::Mbc2 { .. } => {
                // 512 nibbles mirrored across the window.
                let idx = (addr as usize - 0xA000) & 0x01FF;
                0xF0 | (self.ram[idx] & 0x0F)
            }
            _ => self.ram[ram_index(self.ram_bank, self.ram.len(), addr)],
        }
    }

    pub fn write(&mut self, addr: u16, val: u8) {
        let now = self.clock;
        match (&mut self.mbc_state, addr) {
            (MbcState::NoMbc, 0xA000..=0xBFFF) => {
                if !self.ram.is_empty() {
                    let i = ram_index(self.ram_bank, self.ram.len(), addr);
                    self.ram[i] = val;
                }
                return;
            }
            (MbcState::NoMbc, _) => return,
            (MbcState::Mbc2 { rom_bank }, 0x0000..=0x3FFF) => {
                // Address bit 8 selects RAM enable (clear) or ROM bank (set).
                if addr & 0x0100 == 0 {
                    self.ram_enable = val & 0x0F == 0x0A;
                } else {
                    *rom_bank = (val & 0x0F).max(1);
                }
            }
            (MbcState::Mbc2 { .. }, 0xA000..=0xBFFF) => {
                if self.ram_enable {
                    let idx = (addr as usize - 0xA000) & 0x01FF;
                    self.ram[idx] = val & 0x0F;
                }
                return;
            }
            (_, 0x0000..=0x1FFF) => {
                self.ram_enable = val & 0x0F == 0x0A;
            }
            (MbcState::Mbc1 { rom_bank, .. }, 0x2000..=0x3FFF) => {
                *rom_bank = (val & 0x1F).max(1);
            }
            (MbcState::Mbc1 { upper, .. }, 0x4000..=0x5FFF) => {
                *upper = val & 0x03;
            }
            (MbcState::Mbc1 { mode, .. }, 0x6000..=0x7FFF) => {
                *mode = val & 0x01;
            }
            (MbcState::Mbc3 { rom_bank, .. }, 0x2000..=0x3FFF) => {
                *rom_bank = (val & 0x7F).max(1);
            }
            (MbcState::Mbc3 { select, .. }, 0x4000..=0x5FFF) => {
                *select = val;
            }
            (
                MbcState::Mbc3 {
                    latch_pending, rtc, ..
                },
                0x6000..=0x7FFF,
            ) => {
                if val == 0 {
                    *latch_pending = true;
                } else {
                    if val == 1
                        && *latch_pending
                        && let Some(rtc) = rtc
                    {
                        rtc.latch(now());
                    }
                    *latch_pending = false;
                }
            }
            (MbcState::Mbc3 { select, rtc, .. }, 0xA000..=0xBFFF) => {
                if !self.ram_enable {
                    return;
                }
                match *select {
                    0x00..=0x03 => {
                        if !self.ram.is_empty() {
                            let i = ram_index(self.ram_bank, self.ram.len(), addr);
                            self.ram[i] = val;
                        }
                    }
                    reg @ 0x08..=0x0C => {
                        if let Some(rtc) = rtc {
                            rtc.write_register(reg, val, now());
                        }
                    }
                    _ => {}
                }
                return;
            }
            (MbcState::Mbc5 { rom_bank, .. }, 0x2000..=0x2FFF) => {
                *rom_bank = (*rom_bank & 0x100) | val as u16;
            }
            (MbcState::Mbc5 { rom_bank, .. }, 0x3000..=0x3FFF) => {
                *rom_bank = (*rom_bank & 0xFF) | (((val & 0x01) as u16) << 8);
            }
            (MbcState::Mbc5 { ram_bank, .. }, 0x4000..=0x5FFF) => {
                *ram_bank = val & 0x0F;
            }
            (_, 0xA000..=0xBFFF) => {
                if self.ram_enable && !self.ram.is_empty() {
                    let i = ram_index(self.ram_bank, self.ram.len(), addr);
                    self.ram[i] = val;
                }
                return;
            }
            _ => {
                warn!("Ignored write {val:02X} to {addr:04X} on {:?}", self.mbc);
                return;
            }
        }
        self.update_banks();
    }

    /// Encode external RAM and the RTC as a battery stream.
    pub fn save_battery(&mut self) -> Vec<u8> {
        let now = (self.clock)();
        let mut w = StateWriter::new();
        if !self.ram.is_empty() {
            w.section(b"ERAM", |w| w.bytes(&self.ram));
        }
        if let MbcState::Mbc3 { rtc: Some(rtc), .. } = &mut self.mbc_state {
            rtc.sync_wall(now);
            w.section(b"RTC ", |w| rtc.save(w));
        }
        w.end();
        w.into_bytes()
    }

    /// Restore a battery stream. Nothing changes unless the whole stream is
    /// valid for this cartridge.
    pub fn load_battery(&mut self, data: &[u8]) -> Result<(), StateError> {
        let sections = Sections::parse(data, &["ERAM", "RTC "])?;

        let ram = match sections.get("ERAM") {
            Some(mut r) => {
                expect_eq("external RAM size", self.ram.len() as u64, r.remaining() as u64)?;
                let mut ram = vec![0; self.ram.len()];
                r.bytes_into(&mut ram)?;
                Some(ram)
            }
            None => None,
        };

        let rtc = match sections.get("RTC ") {
            Some(mut r) => {
                if !self.has_rtc() {
                    return Err(StateError::UnknownTag("RTC ".into()));
                }
                let rtc = Mbc3Rtc::load(&mut r)?;
                r.finish()?;
                Some(rtc)
            }
            None => None,
        };

        if let Some(ram) = ram {
            self.ram = ram;
        }
        if let (Some(mut loaded), MbcState::Mbc3 { rtc: Some(live), .. }) =
            (rtc, &mut self.mbc_state)
        {
            // Catch up on the time that passed while the game was not running.
            loaded.sync_wall((self.clock)());
            *live = loaded;
        }
        Ok(())
    }

    pub fn save_battery_file<P: AsRef<Path>>(&mut self, path: P) -> crate::Result<()> {
        if !self.has_battery() {
            return Ok(());
        }
        fs::write(path, self.save_battery())?;
        Ok(())
    }

    pub fn load_battery_file<P: AsRef<Path>>(&mut self, path: P) -> crate::Result<()> {
        let data = fs::read(path)?;
        self.load_battery(&data)?;
        Ok(())
    }

    pub(crate) fn save_state(&self, w: &mut StateWriter) {
        w.u8(self.mbc.code());
        w.u32(self.rom_banks as u32);
        w.blob(&self.ram);
        w.bool(self.ram_enable);
        match &self.mbc_state {
            MbcState::NoMbc => {}
            MbcState::Mbc1 {
                rom_bank,
                upper,
                mode,
            } => {
                w.u8(*rom_bank);
                w.u8(*upper);
                w.u8(*mode);
            }
            MbcState::Mbc2 { rom_bank } => w.u8(*rom_bank),
            MbcState::Mbc3 {
                rom_bank,
                select,
                rtc,
                latch_pending,
            } => {
                w.u8(*rom_bank);
                w.u8(*select);
                w.bool(*latch_pending);
                w.bool(rtc.is_some());
                if let Some(rtc) = rtc {
                    rtc.save(w);
                }
            }
            MbcState::Mbc5 { rom_bank, ram_bank } => {
                w.u16(*rom_bank);
                w.u8(*ram_bank);
            }
        }
    }

    pub(crate) fn load_state(&mut self, r: &mut StateReader<'_>) -> Result<(), StateError> {
        expect_eq("bank controller", self.mbc.code() as u64, r.u8()? as u64)?;
        expect_eq("ROM bank count", self.rom_banks as u64, r.u32()? as u64)?;
        r.blob_exact("external RAM size", &mut self.ram)?;
        self.ram_enable = r.bool()?;
        match &mut self.mbc_state {
            MbcState::NoMbc => {}
            MbcState::Mbc1 {
                rom_bank,
                upper,
                mode,
            } => {
                *rom_bank = r.u8()?;
                *upper = r.u8()?;
                *mode = r.u8()?;
            }
            MbcState::Mbc2 { rom_bank } => *rom_bank = r.u8()?,
            MbcState::Mbc3 {
                rom_bank,
                select,
                rtc,
                latch_pending,
            } => {
                *rom_bank = r.u8()?;
                *select = r.u8()?;
                *latch_pending = r.bool()?;
                let has_rtc = r.bool()?;
                expect_eq("RTC presence", rtc.is_some() as u64, has_rtc as u64)?;
                if let Some(rtc) = rtc {
                    *rtc = Mbc3Rtc::load(r)?;
                }
            }
            MbcState::Mbc5 { rom_bank, ram_bank } => {
                *rom_bank = r.u16()? & 0x1FF;
                *ram_bank = r.u8()? & 0x0F;
            }
        }
        self.update_banks();
        Ok(())
    }
}

fn ram_index(bank: usize, len: usize, addr: u16) -> usize {
    (bank * RAM_BANK_SIZE + (addr as usize - 0xA000)) % len
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms_to_cycles(ms: u64) -> u64 {
        ((ms as u128).saturating_mul(RTC_CYCLES_PER_SECOND as u128) / 1000u128) as u64
    }

    #[test]
    fn rtc_ticks_through_invalid_values() {
        let mut rtc = Mbc3Rtc::new(UNIX_EPOCH);

        rtc.regs.seconds = 59;
        rtc.regs.minutes = 60;
        rtc.advance_seconds(1);
        assert_eq!(rtc.regs.seconds, 0);
        assert_eq!(rtc.regs.minutes, 61);

        rtc.regs.seconds = 63;
        rtc.regs.minutes = 5;
        rtc.advance_seconds(1);
        assert_eq!(rtc.regs.seconds, 0);
        assert_eq!(rtc.regs.minutes, 5);

        rtc.regs.seconds = 59;
        rtc.regs.minutes = 59;
        rtc.regs.hours = 24;
        rtc.advance_seconds(1);
        assert_eq!(rtc.regs.seconds, 0);
        assert_eq!(rtc.regs.minutes, 0);
        assert_eq!(rtc.regs.hours, 25);
    }

    #[test]
    fn rtc_follows_wall_clock() {
        let start = UNIX_EPOCH + Duration::from_secs(1_000);
        let mut rtc = Mbc3Rtc::new(start);
        rtc.sync_wall(start + Duration::from_millis(2_500));
        assert_eq!(rtc.regs.seconds, 2);
        assert_eq!(rtc.subsecond_cycles as u64, ms_to_cycles(500));

        rtc.sync_wall(start + Duration::from_secs(3 * 3600 + 61));
        assert_eq!(rtc.regs.hours, 3);
        assert_eq!(rtc.regs.minutes, 1);
        assert_eq!(rtc.regs.seconds, 1);
    }

    #[test]
    fn rtc_halt_stops_the_clock() {
        let start = UNIX_EPOCH;
        let mut rtc = Mbc3Rtc::new(start);
        rtc.write_register(0x0C, 0x40, start);
        rtc.sync_wall(start + Duration::from_secs(30));
        assert_eq!(rtc.regs.seconds, 0);

        rtc.write_register(0x0C, 0x00, start + Duration::from_secs(30));
        rtc.sync_wall(start + Duration::from_secs(35));
        assert_eq!(rtc.regs.seconds, 5);
    }

    #[test]
    fn rtc_seconds_write_resets_phase() {
        let now = UNIX_EPOCH + Duration::from_secs(10);
        let mut rtc = Mbc3Rtc::new(now);
        rtc.subsecond_cycles = ms_to_cycles(750) as u32;
        rtc.write_register(0x09, 0x01, now);
        assert_eq!(rtc.subsecond_cycles as u64, ms_to_cycles(750));

        rtc.write_register(0x08, 0x02, now);
        assert_eq!(rtc.subsecond_cycles, 0);
    }

    #[test]
    fn rtc_day_overflow_sets_carry() {
        let mut rtc = Mbc3Rtc::new(UNIX_EPOCH);
        rtc.regs.seconds = 59;
        rtc.regs.minutes = 59;
        rtc.regs.hours = 23;
        rtc.regs.days = 0x01FF;

        rtc.advance_seconds(1);
        assert_eq!(rtc.regs.days, 0);
        assert!(rtc.regs.carry);
    }

    #[test]
    fn rtc_skips_whole_days() {
        let mut rtc = Mbc3Rtc::new(UNIX_EPOCH);
        rtc.advance_seconds(3 * 86_400 + 7);
        assert_eq!(rtc.regs.days, 3);
        assert_eq!(rtc.regs.seconds, 7);
    }
}
