use log::{debug, trace};

use crate::{
    apu::Apu,
    cartridge::Cartridge,
    cpu::MemoryBus,
    error::StateError,
    keypad::Keypad,
    ppu::Ppu,
    scheduler::Scheduler,
    state::{Snapshot, StateReader, StateWriter, expect_eq},
    timer::Timer,
};

const WRAM_BANK_SIZE: usize = 0x1000;
const OAM_DMA_LEN: u16 = 0xA0;
const HDMA_BLOCK_LEN: u16 = 0x10;

/// Transfer mode for CGB VRAM DMA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DmaMode {
    /// General DMA (immediate)
    Gdma,
    /// HBlank DMA
    Hdma,
}

#[derive(Debug, Clone)]
struct HdmaState {
    /// Source pointer, low four bits ignored.
    src: u16,
    /// Destination in VRAM (0x8000 | (dst & 0x1FF0))
    dst: u16,
    /// Remaining 0x10-byte blocks.
    blocks: u8,
    mode: DmaMode,
    active: bool,
    /// The previous HBlank transfer was stopped by writing FF55 bit 7 = 0.
    cancelled: bool,
}

impl HdmaState {
    fn new() -> Self {
        Self {
            src: 0,
            dst: 0x8000,
            blocks: 0,
            mode: DmaMode::Gdma,
            active: false,
            cancelled: false,
        }
    }
}

/// Components the memory map forwards to, borrowed from the machine for the
/// duration of one access.
pub struct Peripherals<'a> {
    pub ppu: &'a mut Ppu,
    pub apu: &'a mut Apu,
    pub timer: &'a mut Timer,
    pub keypad: &'a mut Keypad,
    pub sched: &'a mut Scheduler,
}

/// Address decoder and owner of the cartridge, work RAM, high RAM and the
/// interrupt registers. Everything else is reached through [`Peripherals`].
#[derive(Clone)]
pub struct Mmu {
    pub cart: Cartridge,
    pub wram: [[u8; WRAM_BANK_SIZE]; 8],
    pub wram_bank: usize,
    pub hram: [u8; 0x7F],
    boot_rom: Option<Vec<u8>>,
    boot_mapped: bool,
    pub if_reg: u8,
    pub ie_reg: u8,
    key0: u8,
    key1: u8,
    rp: u8,
    sb: u8,
    sc: u8,
    serial_out: Vec<u8>,
    hdma: HdmaState,
    /// CPU cycles owed to VRAM DMA, charged by the machine on the next step.
    dma_stall: u32,
    cgb: bool,
}

impl Mmu {
    pub fn new(cart: Cartridge, cgb: bool) -> Self {
        Self {
            cart,
            wram: [[0; WRAM_BANK_SIZE]; 8],
            wram_bank: 1,
            hram: [0; 0x7F],
            boot_rom: None,
            boot_mapped: false,
            if_reg: 0xE1,
            ie_reg: 0,
            key0: 0,
            key1: 0,
            rp: 0,
            sb: 0,
            sc: 0,
            serial_out: Vec::new(),
            hdma: HdmaState::new(),
            dma_stall: 0,
            cgb,
        }
    }

    /// Overlay a boot image on the low ROM area until FF50 is written.
    pub fn load_boot_rom(&mut self, data: Vec<u8>) {
        self.boot_rom = Some(data);
        self.boot_mapped = true;
    }

    pub fn boot_mapped(&self) -> bool {
        self.boot_mapped
    }

    pub fn is_cgb(&self) -> bool {
        self.cgb
    }

    pub fn double_speed(&self) -> bool {
        self.key1 & 0x80 != 0
    }

    pub fn speed_switch_armed(&self) -> bool {
        self.cgb && self.key1 & 0x01 != 0
    }

    /// Bytes shifted out over the serial port since the last call.
    pub fn take_serial(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.serial_out)
    }

    pub fn hdma_active(&self) -> bool {
        self.hdma.active
    }

    /// CPU cycles the last VRAM DMA transfers stalled for.
    pub fn take_dma_stall(&mut self) -> u32 {
        std::mem::take(&mut self.dma_stall)
    }

    fn boot_byte(&self, addr: u16) -> u8 {
        self.boot_rom
            .as_ref()
            .and_then(|b| b.get(addr as usize).copied())
            .unwrap_or(0xFF)
    }

    fn in_boot_overlay(&self, addr: u16) -> bool {
        self.boot_mapped
            && match addr {
                0x0000..=0x00FF => true,
                0x0200..=0x08FF => self.cgb,
                _ => false,
            }
    }

    pub fn read(&mut self, addr: u16, io: &mut Peripherals<'_>) -> u8 {
        match addr {
            0x0000..=0x08FF if self.in_boot_overlay(addr) => self.boot_byte(addr),
            0x0000..=0x7FFF | 0xA000..=0xBFFF => self.cart.read(addr),
            0x8000..=0x9FFF => {
                if io.ppu.vram_accessible() {
                    io.ppu.vram[io.ppu.vram_bank][(addr - 0x8000) as usize]
                } else {
                    0xFF
                }
            }
            0xC000..=0xCFFF => self.wram[0][(addr - 0xC000) as usize],
            0xD000..=0xDFFF => self.wram[self.wram_bank][(addr - 0xD000) as usize],
            0xE000..=0xEFFF => self.wram[0][(addr - 0xE000) as usize],
            0xF000..=0xFDFF => self.wram[self.wram_bank][(addr - 0xF000) as usize],
            0xFE00..=0xFE9F => {
                if io.ppu.oam_accessible() {
                    io.ppu.oam[(addr - 0xFE00) as usize]
                } else {
                    0xFF
                }
            }
            0xFEA0..=0xFEFF => 0xFF,
            0xFF00 => io.keypad.read(),
            0xFF01 => self.sb,
            0xFF02 => self.sc | if self.cgb { 0x7C } else { 0x7E },
            0xFF04..=0xFF07 => io.timer.read(addr, io.sched.now()),
            0xFF0F => self.if_reg | 0xE0,
            0xFF10..=0xFF3F => io.apu.read_reg(addr, io.sched.now()),
            0xFF40..=0xFF4B => io.ppu.read_reg(addr),
            0xFF4D if self.cgb => (self.key1 & 0x81) | 0x7E,
            0xFF4F if self.cgb => io.ppu.vram_bank as u8 | 0xFE,
            // HDMA1-4 are write-only.
            0xFF51..=0xFF54 => 0xFF,
            0xFF55 if self.cgb => {
                if self.hdma.active {
                    self.hdma.blocks.wrapping_sub(1) & 0x7F
                } else if self.hdma.cancelled {
                    0x80 | (self.hdma.blocks.wrapping_sub(1) & 0x7F)
                } else {
                    0xFF
                }
            }
            0xFF56 if self.cgb => self.rp | 0x3C,
            0xFF68..=0xFF6C => io.ppu.read_reg(addr),
            0xFF70 if self.cgb => self.wram_bank as u8 | 0xF8,
            0xFF76 | 0xFF77 => io.apu.read_pcm(addr, io.sched.now()),
            0xFF80..=0xFFFE => self.hram[(addr - 0xFF80) as usize],
            0xFFFF => self.ie_reg,
            _ => 0xFF,
        }
    }

    pub fn write(&mut self, addr: u16, val: u8, io: &mut Peripherals<'_>) {
        match addr {
            0x0000..=0x7FFF | 0xA000..=0xBFFF => self.cart.write(addr, val),
            0x8000..=0x9FFF => {
                if io.ppu.vram_accessible() {
                    io.ppu.vram[io.ppu.vram_bank][(addr - 0x8000) as usize] = val;
                }
            }
            0xC000..=0xCFFF => self.wram[0][(addr - 0xC000) as usize] = val,
            0xD000..=0xDFFF => self.wram[self.wram_bank][(addr - 0xD000) as usize] = val,
            0xE000..=0xEFFF => self.wram[0][(addr - 0xE000) as usize] = val,
            0xF000..=0xFDFF => self.wram[self.wram_bank][(addr - 0xF000) as usize] = val,
            0xFE00..=0xFE9F => {
                if io.ppu.oam_accessible() {
                    io.ppu.oam[(addr - 0xFE00) as usize] = val;
                }
            }
            0xFEA0..=0xFEFF => {}
            0xFF00 => {
                if io.keypad.write(val) {
                    self.if_reg |= 0x10;
                }
            }
            0xFF01 => self.sb = val,
            0xFF02 => self.write_serial_control(val),
            0xFF04..=0xFF07 => io.timer.write(addr, val, io.sched),
            0xFF0F => self.if_reg = (val & 0x1F) | 0xE0,
            0xFF10..=0xFF3F => io.apu.write_reg(addr, val, io.sched.now()),
            0xFF46 => {
                io.ppu.write_reg(addr, val, &mut self.if_reg);
                self.oam_dma(val, io);
            }
            0xFF40..=0xFF4B => {
                io.ppu.write_reg(addr, val, &mut self.if_reg);
                if addr == 0xFF40 && !io.ppu.lcd_enabled() {
                    self.complete_active_hdma(io.ppu);
                }
            }
            0xFF4D if self.cgb => self.key1 = (self.key1 & 0x80) | (val & 0x01),
            0xFF4F if self.cgb => io.ppu.vram_bank = (val & 0x01) as usize,
            // KEY0 is only writable by the colour boot ROM.
            0xFF4C if self.cgb && self.boot_mapped => self.key0 = val & 0x0D,
            0xFF50 => {
                if self.boot_mapped && val != 0 {
                    debug!("boot ROM unmapped");
                    self.boot_mapped = false;
                    if self.cgb {
                        self.finish_colour_boot(io.ppu);
                    }
                }
            }
            0xFF51 if self.cgb && !self.hdma.active => {
                self.hdma.src = (val as u16) << 8 | (self.hdma.src & 0x00FF);
            }
            0xFF52 if self.cgb && !self.hdma.active => {
                self.hdma.src = (self.hdma.src & 0xFF00) | (val & 0xF0) as u16;
            }
            0xFF53 if self.cgb && !self.hdma.active => {
                let raw = ((val as u16) << 8) | (self.hdma.dst & 0x00F0);
                self.hdma.dst = vram_dma_dest(raw);
            }
            0xFF54 if self.cgb && !self.hdma.active => {
                let raw = (self.hdma.dst & 0x1F00) | (val & 0xF0) as u16;
                self.hdma.dst = vram_dma_dest(raw);
            }
            0xFF55 if self.cgb => self.write_hdma_control(val, io.ppu),
            0xFF56 if self.cgb => self.rp = val & 0xC1,
            0xFF68..=0xFF6C => io.ppu.write_reg(addr, val, &mut self.if_reg),
            0xFF70 if self.cgb => {
                let bank = (val & 0x07) as usize;
                self.wram_bank = if bank == 0 { 1 } else { bank };
            }
            0xFF80..=0xFFFE => self.hram[(addr - 0xFF80) as usize] = val,
            0xFFFF => self.ie_reg = val,
            _ => {}
        }
    }

    /// Colour hardware locks into monochrome rendering at boot ROM handoff,
    /// either because the boot image asked for it through KEY0 or because
    /// the cartridge has no colour support.
    fn finish_colour_boot(&mut self, ppu: &mut Ppu) {
        if self.key0 & 0x0C == 0x04 {
            // The boot image has already loaded its palettes.
            ppu.enter_compat_mode();
        } else if !self.cart.header.cgb_supported() {
            ppu.apply_dmg_compatibility_palettes();
        }
    }

    fn write_serial_control(&mut self, val: u8) {
        self.sc = val & if self.cgb { 0x83 } else { 0x81 };
        // Only the internal clock produces a transfer: nothing is plugged in
        // to clock an external one.
        if self.sc & 0x81 == 0x81 {
            trace!("serial out {:02X}", self.sb);
            self.serial_out.push(self.sb);
            self.sb = 0xFF;
            self.sc &= 0x7F;
            self.if_reg |= 0x08;
        }
    }

    /// Copy 160 bytes into OAM. Sources in echo/OAM/IO space fold back
    /// onto work RAM.
    fn oam_dma(&mut self, page: u8, io: &mut Peripherals<'_>) {
        let mut src = (page as u16) << 8;
        if src >= 0xE000 {
            src -= 0x2000;
        }
        for i in 0..OAM_DMA_LEN {
            let byte = match src + i {
                a @ 0x8000..=0x9FFF => io.ppu.vram[io.ppu.vram_bank][(a - 0x8000) as usize],
                a => self.dma_source_byte(a),
            };
            io.ppu.oam[i as usize] = byte;
        }
    }

    /// Source read for DMA engines, which bypass the boot overlay and the
    /// video locks.
    fn dma_source_byte(&mut self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x7FFF | 0xA000..=0xBFFF => self.cart.read(addr),
            0xC000..=0xCFFF => self.wram[0][(addr - 0xC000) as usize],
            0xD000..=0xDFFF => self.wram[self.wram_bank][(addr - 0xD000) as usize],
            0xE000..=0xEFFF => self.wram[0][(addr - 0xE000) as usize],
            0xF000..=0xFDFF => self.wram[self.wram_bank][(addr - 0xF000) as usize],
            _ => 0xFF,
        }
    }

    fn write_hdma_control(&mut self, val: u8, ppu: &mut Ppu) {
        self.hdma.dst = vram_dma_dest(self.hdma.dst);
        let blocks = (val & 0x7F) + 1;
        if self.hdma.active && val & 0x80 == 0 {
            debug!("HDMA cancelled with {} blocks left", self.hdma.blocks);
            self.hdma.active = false;
            self.hdma.cancelled = true;
        } else if val & 0x80 == 0 {
            debug!("GDMA {:04X} -> {:04X}, {} blocks", self.hdma.src, self.hdma.dst, blocks);
            self.hdma.mode = DmaMode::Gdma;
            for _ in 0..blocks {
                if !self.copy_block(ppu) {
                    break;
                }
            }
            self.hdma.blocks = 0;
            self.hdma.active = false;
            self.hdma.cancelled = false;
        } else {
            debug!("HDMA {:04X} -> {:04X}, {} blocks", self.hdma.src, self.hdma.dst, blocks);
            self.hdma.mode = DmaMode::Hdma;
            self.hdma.blocks = blocks;
            self.hdma.active = true;
            self.hdma.cancelled = false;
            // Started while the LCD is off or inside HBlank: the first block
            // goes immediately.
            if !ppu.lcd_enabled() || ppu.in_hblank() {
                self.hdma_hblank_transfer(ppu);
            }
        }
    }

    /// Run one HBlank DMA block. Called by the machine on every HBlank entry.
    pub fn hdma_hblank_transfer(&mut self, ppu: &mut Ppu) {
        if !(self.hdma.active && self.hdma.mode == DmaMode::Hdma) {
            return;
        }
        let more = self.copy_block(ppu);
        self.hdma.blocks = if more { self.hdma.blocks.saturating_sub(1) } else { 0 };
        if self.hdma.blocks == 0 {
            self.hdma.active = false;
            self.hdma.cancelled = false;
        }
    }

    /// Copy one 16-byte block. Returns false once the block filled the end
    /// of VRAM, which ends the transfer.
    fn copy_block(&mut self, ppu: &mut Ppu) -> bool {
        let bank = ppu.vram_bank;
        let last = self.hdma.dst & 0x1FF0 == 0x1FF0;
        for _ in 0..HDMA_BLOCK_LEN {
            let byte = self.dma_source_byte(self.hdma.src);
            ppu.vram[bank][(self.hdma.dst & 0x1FFF) as usize] = byte;
            self.hdma.src = self.hdma.src.wrapping_add(1);
            self.hdma.dst = 0x8000 | (self.hdma.dst.wrapping_add(1) & 0x1FFF);
        }
        self.hdma.dst = vram_dma_dest(self.hdma.dst);
        self.dma_stall += if self.double_speed() { 16 } else { 8 };
        if last {
            debug!("VRAM DMA stopped at the end of VRAM");
        }
        !last
    }

    /// Turning the LCD off mid-transfer finishes the remaining blocks.
    fn complete_active_hdma(&mut self, ppu: &mut Ppu) {
        while self.hdma.active && self.hdma.mode == DmaMode::Hdma {
            self.hdma_hblank_transfer(ppu);
        }
    }

    /// Flip the speed bit of an armed KEY1. Returns false if nothing was armed.
    pub(crate) fn toggle_speed(&mut self) -> bool {
        if !self.speed_switch_armed() {
            return false;
        }
        self.key1 = (self.key1 ^ 0x80) & 0x80;
        true
    }
}

#[inline]
fn vram_dma_dest(addr: u16) -> u16 {
    0x8000 | (addr & 0x1FF0)
}

impl Snapshot for Mmu {
    fn save_state(&self, w: &mut StateWriter) {
        w.bool(self.cgb);
        let banks = if self.cgb { 8 } else { 2 };
        w.u8(banks as u8);
        for bank in &self.wram[..banks] {
            w.bytes(bank);
        }
        w.u8(self.wram_bank as u8);
        w.bytes(&self.hram);
        w.bool(self.boot_mapped);
        w.u8(self.if_reg);
        w.u8(self.ie_reg);
        w.u8(self.key0);
        w.u8(self.key1);
        w.u8(self.rp);
        w.u8(self.sb);
        w.u8(self.sc);
        w.u16(self.hdma.src);
        w.u16(self.hdma.dst);
        w.u8(self.hdma.blocks);
        w.bool(self.hdma.mode == DmaMode::Hdma);
        w.bool(self.hdma.active);
        w.bool(self.hdma.cancelled);
        w.u32(self.dma_stall);
        self.cart.save_state(w);
    }

    fn load_state(&mut self, r: &mut StateReader<'_>) -> Result<(), StateError> {
        expect_eq("colour mode", self.cgb as u64, r.bool()? as u64)?;
        let banks = if self.cgb { 8 } else { 2 };
        expect_eq("WRAM banks", banks as u64, r.u8()? as u64)?;
        for bank in &mut self.wram[..banks] {
            r.bytes_into(bank)?;
        }
        let wram_bank = r.u8()? as usize;
        if wram_bank == 0 || wram_bank >= banks {
            return Err(StateError::InvalidValue {
                what: "WRAM bank",
                value: wram_bank as u64,
            });
        }
        self.wram_bank = wram_bank;
        r.bytes_into(&mut self.hram)?;
        let boot_mapped = r.bool()?;
        if boot_mapped && self.boot_rom.is_none() {
            return Err(StateError::InvalidValue {
                what: "boot ROM mapping without a boot ROM",
                value: 1,
            });
        }
        self.boot_mapped = boot_mapped;
        self.if_reg = r.u8()? | 0xE0;
        self.ie_reg = r.u8()?;
        self.key0 = r.u8()? & 0x0D;
        self.key1 = r.u8()? & 0x81;
        self.rp = r.u8()?;
        self.sb = r.u8()?;
        self.sc = r.u8()?;
        self.hdma.src = r.u16()?;
        self.hdma.dst = vram_dma_dest(r.u16()?);
        self.hdma.blocks = r.u8()?;
        self.hdma.mode = if r.bool()? { DmaMode::Hdma } else { DmaMode::Gdma };
        self.hdma.active = r.bool()?;
        self.hdma.cancelled = r.bool()?;
        self.dma_stall = r.u32()?;
        self.cart.load_state(r)?;
        r.finish()
    }
}

/// The memory map as seen by the CPU: the MMU plus the borrowed components
/// behind it.
pub struct Bus<'a> {
    pub mmu: &'a mut Mmu,
    pub io: Peripherals<'a>,
}

impl MemoryBus for Bus<'_> {
    fn read(&mut self, addr: u16) -> u8 {
        self.mmu.read(addr, &mut self.io)
    }

    fn write(&mut self, addr: u16, val: u8) {
        self.mmu.write(addr, val, &mut self.io)
    }

    fn interrupt_enable(&self) -> u8 {
        self.mmu.ie_reg
    }

    fn interrupt_flags(&self) -> u8 {
        self.mmu.if_reg & 0x1F
    }

    fn clear_interrupt(&mut self, bit: u8) {
        self.mmu.if_reg &= !bit;
    }

    fn try_speed_switch(&mut self) -> bool {
        // STOP always resets the divider.
        self.io.timer.write(0xFF04, 0, self.io.sched);
        if !self.mmu.toggle_speed() {
            return false;
        }
        let double = self.mmu.double_speed();
        debug!("speed switch: {}", if double { "double" } else { "normal" });
        self.io.apu.set_double_speed(self.io.sched, double);
        true
    }
}
