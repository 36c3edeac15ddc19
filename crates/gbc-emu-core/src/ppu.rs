use crate::error::StateError;
use crate::sink::{SCREEN_HEIGHT, SCREEN_WIDTH};
use crate::state::{Snapshot, StateReader, StateWriter, expect_eq};

// Mode lengths in machine cycles at normal speed.
const MODE0_CYCLES: u32 = 51; // HBlank
const MODE1_CYCLES: u32 = 114; // One line during VBlank
const MODE2_CYCLES: u32 = 20; // OAM scan
const MODE3_CYCLES: u32 = 43; // Pixel transfer

// Number of lines spent in VBlank
const VBLANK_LINES: u8 = 10;

// Sprite limits
const MAX_SPRITES_PER_LINE: usize = 10;
const TOTAL_SPRITES: usize = 40;

// Internal memory sizes
pub const VRAM_BANK_SIZE: usize = 0x2000;
pub const OAM_SIZE: usize = 0xA0;
const PAL_RAM_SIZE: usize = 0x40;
const PAL_INDEX_MASK: u8 = 0x3F;
const PAL_UNUSED_BIT: u8 = 0x40;
const PAL_AUTO_INCREMENT_BIT: u8 = 0x80;

// Window X position is clipped if greater than this value
const WINDOW_X_MAX: u8 = 166;

// VRAM layout constants
const BG_MAP_0_BASE: usize = 0x1800;
const BG_MAP_1_BASE: usize = 0x1C00;
const TILE_DATA_0_BASE: usize = 0x0000;
const TILE_DATA_1_BASE: usize = 0x0800;

/// Default DMG palette colors in 0x00RRGGBB order.
const DMG_PALETTE: [u32; 4] = [0x009BBC0F, 0x008BAC0F, 0x00306230, 0x000F380F];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    HBlank = 0,
    VBlank = 1,
    OamScan = 2,
    Transfer = 3,
}

impl Mode {
    fn from_bits(v: u8) -> Self {
        match v & 0x03 {
            0 => Mode::HBlank,
            1 => Mode::VBlank,
            2 => Mode::OamScan,
            _ => Mode::Transfer,
        }
    }

    fn length(self) -> u32 {
        match self {
            Mode::HBlank => MODE0_CYCLES,
            Mode::VBlank => MODE1_CYCLES,
            Mode::OamScan => MODE2_CYCLES,
            Mode::Transfer => MODE3_CYCLES,
        }
    }
}

#[derive(Copy, Clone, Default, Debug)]
struct Sprite {
    x: i16,
    /// Tile row to fetch, Y flip already applied.
    row: u8,
    /// Selected as an 8x16 sprite.
    tall: bool,
    tile: u8,
    flags: u8,
    oam_index: usize,
}

/// Pixel processing unit.
#[derive(Clone)]
pub struct Ppu {
    pub vram: [[u8; VRAM_BANK_SIZE]; 2],
    pub vram_bank: usize,
    pub oam: [u8; OAM_SIZE],

    cgb: bool,
    /// Colour hardware running monochrome software.
    compat: bool,

    lcdc: u8,
    stat: u8,
    scy: u8,
    scx: u8,
    ly: u8,
    lyc: u8,
    lyc_eq_ly: bool,
    pub dma: u8,
    bgp: u8,
    obp0: u8,
    obp1: u8,
    wy: u8,
    wx: u8,

    /// Internal window line counter
    win_line_counter: u8,

    bgpi: u8,
    bgpd: [u8; PAL_RAM_SIZE],
    obpi: u8,
    obpd: [u8; PAL_RAM_SIZE],
    /// Object priority mode register (OPRI)
    opri: u8,

    mode_clock: u32,
    /// Current LCD mode. Public so tests and tools can place the unit in a
    /// given phase.
    pub mode: Mode,

    pub framebuffer: [u32; SCREEN_WIDTH * SCREEN_HEIGHT],
    /// BG tile attribute priority bit per pixel of the current line.
    line_priority: [bool; SCREEN_WIDTH],
    /// BG colour index 0 per pixel of the current line.
    line_color_zero: [bool; SCREEN_WIDTH],
    /// Latched sprites for the current scanline
    line_sprites: [Sprite; MAX_SPRITES_PER_LINE],
    sprite_count: usize,
    /// Indicates a completed frame is available in `framebuffer`
    frame_ready: bool,
    stat_irq_line: bool,
    frame_counter: u64,
}

impl Ppu {
    pub fn new(cgb: bool) -> Self {
        Self {
            vram: [[0; VRAM_BANK_SIZE]; 2],
            vram_bank: 0,
            oam: [0; OAM_SIZE],
            cgb,
            compat: false,
            lcdc: 0,
            stat: 0,
            scy: 0,
            scx: 0,
            ly: 0,
            lyc: 0,
            lyc_eq_ly: false,
            dma: 0,
            bgp: 0,
            obp0: 0,
            obp1: 0,
            wy: 0,
            wx: 0,
            win_line_counter: 0,
            bgpi: PAL_UNUSED_BIT,
            bgpd: [0; PAL_RAM_SIZE],
            obpi: PAL_UNUSED_BIT,
            obpd: [0; PAL_RAM_SIZE],
            opri: 0,
            mode_clock: 0,
            mode: Mode::HBlank,
            framebuffer: [0; SCREEN_WIDTH * SCREEN_HEIGHT],
            line_priority: [false; SCREEN_WIDTH],
            line_color_zero: [false; SCREEN_WIDTH],
            line_sprites: [Sprite::default(); MAX_SPRITES_PER_LINE],
            sprite_count: 0,
            frame_ready: false,
            stat_irq_line: false,
            frame_counter: 0,
        }
    }

    /// Registers as the boot ROM leaves them: LCD on, first visible line.
    pub fn apply_boot_state(&mut self) {
        self.lcdc = 0x91;
        self.stat = 0x80;
        self.dma = 0xFF;
        self.bgp = 0xFC;
        self.ly = 0;
        self.mode = Mode::OamScan;
        self.mode_clock = 0;
        self.win_line_counter = 0;
        self.lyc_eq_ly = self.ly == self.lyc;
        self.stat_irq_line = false;
        if self.cgb && !self.compat {
            // White background palettes, as the colour boot ROM leaves them.
            self.bgpd = [0xFF; PAL_RAM_SIZE];
        }
    }

    /// Load the default CGB palettes used when running a DMG cartridge in
    /// compatibility mode. These values are based on the behavior of the
    /// official boot ROM.
    pub fn apply_dmg_compatibility_palettes(&mut self) {
        const OBJ_PAL: [u16; 4] = [0x7FFF, 0x421F, 0x1CF2, 0x0000];
        const BG_PAL: [u16; 4] = [0x7FFF, 0x1BEF, 0x6180, 0x0000];

        self.compat = true;
        let (obj0, rest) = self.obpd.split_at_mut(8);
        let (obj1, _) = rest.split_at_mut(8);
        Self::write_palette(obj0, OBJ_PAL);
        Self::write_palette(obj1, OBJ_PAL);

        let (bg0, _) = self.bgpd.split_at_mut(8);
        Self::write_palette(bg0, BG_PAL);

        self.bgp = 0xE4;
        self.obp0 = 0xD0;
        self.obp1 = 0xE0;
    }

    fn write_palette(slice: &mut [u8], pal: [u16; 4]) {
        for (i, &c) in pal.iter().enumerate() {
            slice[i * 2] = (c & 0xFF) as u8;
            slice[i * 2 + 1] = (c >> 8) as u8;
        }
    }

    pub fn is_cgb(&self) -> bool {
        self.cgb
    }

    /// Switch to monochrome rendering rules, keeping palette RAM as loaded.
    pub fn enter_compat_mode(&mut self) {
        self.compat = true;
    }

    pub fn is_compat(&self) -> bool {
        self.compat
    }

    pub fn lcd_enabled(&self) -> bool {
        self.lcdc & 0x80 != 0
    }

    pub fn in_hblank(&self) -> bool {
        self.mode == Mode::HBlank
    }

    pub fn ly(&self) -> u8 {
        self.ly
    }

    /// OAM is hidden from the CPU while the PPU is reading it.
    pub fn oam_accessible(&self) -> bool {
        !self.lcd_enabled() || !matches!(self.mode, Mode::OamScan | Mode::Transfer)
    }

    /// VRAM stays visible in every mode.
    pub fn vram_accessible(&self) -> bool {
        true
    }

    /// Number of VRAM banks the current hardware exposes.
    pub fn vram_banks(&self) -> usize {
        if self.cgb { 2 } else { 1 }
    }

    /// Returns true if a full frame has been rendered and is ready to display.
    pub fn frame_ready(&self) -> bool {
        self.frame_ready
    }

    /// Clears the frame ready flag after a frame has been consumed.
    pub fn clear_frame_flag(&mut self) {
        self.frame_ready = false;
    }

    /// Returns the current value of the internal window line counter.
    pub fn window_line_counter(&self) -> u8 {
        self.win_line_counter
    }

    pub fn framebuffer(&self) -> &[u32; SCREEN_WIDTH * SCREEN_HEIGHT] {
        &self.framebuffer
    }

    /// Frames completed since power on.
    pub fn frames(&self) -> u64 {
        self.frame_counter
    }

    /// Cycles until the next mode change, or None while the LCD is off.
    pub fn cycles_to_next_event(&self) -> Option<u32> {
        self.lcd_enabled()
            .then(|| self.mode.length().saturating_sub(self.mode_clock).max(1))
    }

    fn decode_cgb_color(lo: u8, hi: u8) -> u32 {
        let raw = ((hi as u16) << 8) | lo as u16;
        let expand = |c: u16| {
            let c = (c & 0x1F) as u8;
            (c << 3 | c >> 2) as u32
        };
        (expand(raw) << 16) | (expand(raw >> 5) << 8) | expand(raw >> 10)
    }

    /// Get a CGB background palette color as 0x00RRGGBB.
    pub fn bg_palette_color(&self, palette: usize, color_id: usize) -> u32 {
        let off = palette * 8 + color_id * 2;
        Self::decode_cgb_color(self.bgpd[off], self.bgpd[off + 1])
    }

    /// Get a CGB object palette color as 0x00RRGGBB.
    pub fn ob_palette_color(&self, palette: usize, color_id: usize) -> u32 {
        let off = palette * 8 + color_id * 2;
        Self::decode_cgb_color(self.obpd[off], self.obpd[off + 1])
    }

    fn sanitize_palette_index(value: u8) -> u8 {
        (value & (PAL_AUTO_INCREMENT_BIT | PAL_INDEX_MASK)) | PAL_UNUSED_BIT
    }

    fn palette_ram_index(index: u8) -> usize {
        (index & PAL_INDEX_MASK) as usize
    }

    fn step_palette_index(index: &mut u8) {
        let current = *index;
        let idx = current & PAL_INDEX_MASK;
        let next_idx = if current & PAL_AUTO_INCREMENT_BIT != 0 {
            idx.wrapping_add(1) & PAL_INDEX_MASK
        } else {
            idx
        };
        *index = (current & PAL_AUTO_INCREMENT_BIT) | PAL_UNUSED_BIT | next_idx;
    }

    /// Colour registers only exist on colour hardware, and monochrome
    /// software cannot reach them after boot.
    fn cgb_regs(&self) -> bool {
        self.cgb && !self.compat
    }

    pub fn read_reg(&mut self, addr: u16) -> u8 {
        match addr {
            0xFF40 => self.lcdc,
            0xFF41 => {
                let mode = if self.lcd_enabled() { self.mode as u8 } else { 0 };
                (self.stat & 0x78) | 0x80 | mode | if self.lyc_eq_ly { 0x04 } else { 0 }
            }
            0xFF42 => self.scy,
            0xFF43 => self.scx,
            0xFF44 => self.ly,
            0xFF45 => self.lyc,
            0xFF46 => self.dma,
            0xFF47 => self.bgp,
            0xFF48 => self.obp0,
            0xFF49 => self.obp1,
            0xFF4A => self.wy,
            0xFF4B => self.wx,
            0xFF68 if self.cgb_regs() => self.bgpi,
            0xFF69 if self.cgb_regs() => {
                let val = self.bgpd[Self::palette_ram_index(self.bgpi)];
                Self::step_palette_index(&mut self.bgpi);
                val
            }
            0xFF6A if self.cgb_regs() => self.obpi,
            0xFF6B if self.cgb_regs() => {
                let val = self.obpd[Self::palette_ram_index(self.obpi)];
                Self::step_palette_index(&mut self.obpi);
                val
            }
            0xFF6C if self.cgb => self.opri | 0xFE,
            _ => 0xFF,
        }
    }

    pub fn write_reg(&mut self, addr: u16, val: u8, if_reg: &mut u8) {
        match addr {
            0xFF40 => {
                let was_on = self.lcd_enabled();
                self.lcdc = val;
                if was_on && !self.lcd_enabled() {
                    self.mode = Mode::HBlank;
                    self.mode_clock = 0;
                    self.win_line_counter = 0;
                    self.ly = 0;
                } else if !was_on && self.lcd_enabled() {
                    self.mode = Mode::OamScan;
                    self.mode_clock = 0;
                    self.ly = 0;
                    self.compare_ly(if_reg);
                }
            }
            0xFF41 => {
                self.stat = (self.stat & 0x07) | (val & 0x78);
                self.update_stat_irq(if_reg);
            }
            0xFF42 => self.scy = val,
            0xFF43 => self.scx = val,
            0xFF44 => {}
            0xFF45 => {
                self.lyc = val;
                self.compare_ly(if_reg);
            }
            0xFF46 => self.dma = val,
            0xFF47 => self.bgp = val,
            0xFF48 => self.obp0 = val,
            0xFF49 => self.obp1 = val,
            0xFF4A => self.wy = val,
            0xFF4B => self.wx = val,
            0xFF68 if self.cgb_regs() => self.bgpi = Self::sanitize_palette_index(val),
            0xFF69 if self.cgb_regs() => {
                let idx = Self::palette_ram_index(self.bgpi);
                self.bgpd[idx] = val;
                Self::step_palette_index(&mut self.bgpi);
            }
            0xFF6A if self.cgb_regs() => self.obpi = Self::sanitize_palette_index(val),
            0xFF6B if self.cgb_regs() => {
                let idx = Self::palette_ram_index(self.obpi);
                self.obpd[idx] = val;
                Self::step_palette_index(&mut self.obpi);
            }
            0xFF6C if self.cgb => self.opri = val & 0x01,
            _ => {}
        }
    }

    /// Collect up to 10 sprites visible on the current scanline.
    fn oam_scan(&mut self) {
        let sprite_height: i16 = if self.lcdc & 0x04 != 0 { 16 } else { 8 };
        self.sprite_count = 0;
        for i in 0..TOTAL_SPRITES {
            if self.sprite_count >= MAX_SPRITES_PER_LINE {
                break;
            }
            let base = i * 4;
            let y = self.oam[base] as i16 - 16;
            if self.ly as i16 >= y && (self.ly as i16) < y + sprite_height {
                let flags = self.oam[base + 3];
                let mut row = self.ly as i16 - y;
                if flags & 0x40 != 0 {
                    row = sprite_height - 1 - row;
                }
                self.line_sprites[self.sprite_count] = Sprite {
                    x: self.oam[base + 1] as i16 - 8,
                    row: row as u8,
                    tall: sprite_height == 16,
                    tile: self.oam[base + 2],
                    flags,
                    oam_index: i,
                };
                self.sprite_count += 1;
            }
        }
        if self.cgb && !self.compat && self.opri & 0x01 == 0 {
            // Colour priority: OAM order only
            self.line_sprites[..self.sprite_count].sort_by_key(|s| s.oam_index);
        } else {
            // Monochrome priority: X position, then OAM order
            self.line_sprites[..self.sprite_count].sort_by_key(|s| (s.x, s.oam_index));
        }
    }

    #[inline(always)]
    fn dmg_shade(palette: u8, color_id: u8) -> u8 {
        (palette >> (color_id * 2)) & 0x03
    }

    /// Resolve a BG/window colour index to RGB.
    fn bg_color(&self, palette: usize, color_id: u8) -> u32 {
        if self.compat {
            self.bg_palette_color(0, Self::dmg_shade(self.bgp, color_id) as usize)
        } else if self.cgb {
            self.bg_palette_color(palette, color_id as usize)
        } else {
            DMG_PALETTE[Self::dmg_shade(self.bgp, color_id) as usize]
        }
    }

    fn sprite_color(&self, flags: u8, color_id: u8) -> u32 {
        let dmg_palette = if flags & 0x10 != 0 { self.obp1 } else { self.obp0 };
        if self.compat {
            let pal = ((flags >> 4) & 0x01) as usize;
            self.ob_palette_color(pal, Self::dmg_shade(dmg_palette, color_id) as usize)
        } else if self.cgb {
            self.ob_palette_color((flags & 0x07) as usize, color_id as usize)
        } else {
            DMG_PALETTE[Self::dmg_shade(dmg_palette, color_id) as usize]
        }
    }

    /// Fetch one BG/window pixel: (colour index, palette, attribute priority).
    fn tile_pixel(&self, map_base: usize, map_x: usize, map_y: usize) -> (u8, usize, bool) {
        let map_idx = map_base + (map_y / 8) * 32 + map_x / 8;
        let tile_index = self.vram[0][map_idx];
        let addr = if self.lcdc & 0x10 != 0 {
            TILE_DATA_0_BASE + tile_index as usize * 16
        } else {
            TILE_DATA_1_BASE + ((tile_index as i8 as i16 + 128) as usize) * 16
        };
        let mut bit = 7 - (map_x % 8);
        let mut tile_y = map_y % 8;
        let (mut palette, mut bank, mut priority) = (0, 0, false);
        if self.cgb && !self.compat {
            let attr = self.vram[1][map_idx];
            palette = (attr & 0x07) as usize;
            bank = ((attr >> 3) & 0x01) as usize;
            if attr & 0x20 != 0 {
                bit = map_x % 8;
            }
            if attr & 0x40 != 0 {
                tile_y = 7 - tile_y;
            }
            priority = attr & 0x80 != 0;
        }
        let lo = self.vram[bank][addr + tile_y * 2];
        let hi = self.vram[bank][addr + tile_y * 2 + 1];
        (((hi >> bit) & 1) << 1 | ((lo >> bit) & 1), palette, priority)
    }

    fn render_scanline(&mut self) {
        if !self.lcd_enabled() || self.ly as usize >= SCREEN_HEIGHT {
            return;
        }
        let line = self.ly as usize * SCREEN_WIDTH;
        let colour_rules = self.cgb && !self.compat;

        self.line_priority.fill(false);
        self.line_color_zero.fill(true);

        // On colour hardware LCDC bit 0 is the BG master priority instead of
        // a BG enable.
        let bg_enabled = colour_rules || self.lcdc & 0x01 != 0;
        let master_priority = !colour_rules || self.lcdc & 0x01 != 0;

        let blank = self.bg_color(0, 0);
        self.framebuffer[line..line + SCREEN_WIDTH].fill(blank);

        if bg_enabled {
            let bg_map = if self.lcdc & 0x08 != 0 { BG_MAP_1_BASE } else { BG_MAP_0_BASE };
            let map_y = (self.ly as usize + self.scy as usize) & 0xFF;
            for x in 0..SCREEN_WIDTH {
                let map_x = (x + self.scx as usize) & 0xFF;
                let (color_id, palette, priority) = self.tile_pixel(bg_map, map_x, map_y);
                self.framebuffer[line + x] = self.bg_color(palette, color_id);
                self.line_priority[x] = priority;
                self.line_color_zero[x] = color_id == 0;
            }

            if self.lcdc & 0x20 != 0 && self.ly >= self.wy && self.wx <= WINDOW_X_MAX {
                let win_map = if self.lcdc & 0x40 != 0 { BG_MAP_1_BASE } else { BG_MAP_0_BASE };
                let wx = self.wx as isize - 7;
                let window_y = self.win_line_counter as usize;
                for x in wx.max(0) as usize..SCREEN_WIDTH {
                    let window_x = (x as isize - wx) as usize;
                    let (color_id, palette, priority) = self.tile_pixel(win_map, window_x, window_y);
                    self.framebuffer[line + x] = self.bg_color(palette, color_id);
                    self.line_priority[x] = priority;
                    self.line_color_zero[x] = color_id == 0;
                }
                self.win_line_counter = self.win_line_counter.wrapping_add(1);
            }
        }

        if self.lcdc & 0x02 == 0 {
            return;
        }
        // Sprite rows and heights are latched at OAM scan.
        let mut drawn = [false; SCREEN_WIDTH];
        for s in self.line_sprites[..self.sprite_count].iter().copied() {
            let tile = if s.tall { s.tile & 0xFE } else { s.tile };
            let bank = if colour_rules { ((s.flags >> 3) & 0x01) as usize } else { 0 };
            let addr = tile as usize * 16 + s.row as usize * 2;
            let lo = self.vram[bank][addr];
            let hi = self.vram[bank][addr + 1];
            for px in 0..8 {
                let bit = if s.flags & 0x20 != 0 { px } else { 7 - px };
                let color_id = ((hi >> bit) & 1) << 1 | ((lo >> bit) & 1);
                if color_id == 0 {
                    continue;
                }
                let sx = s.x + px as i16;
                if !(0..SCREEN_WIDTH as i16).contains(&sx) || drawn[sx as usize] {
                    continue;
                }
                let sx = sx as usize;
                // The first sprite in priority order owns the pixel even if
                // the background ends up hiding it.
                drawn[sx] = true;
                let bg_zero = !bg_enabled || self.line_color_zero[sx];
                if master_priority && !bg_zero {
                    if colour_rules && self.line_priority[sx] {
                        continue;
                    }
                    if s.flags & 0x80 != 0 {
                        continue;
                    }
                }
                self.framebuffer[line + sx] = self.sprite_color(s.flags, color_id);
            }
        }
    }

    fn compare_ly(&mut self, if_reg: &mut u8) {
        if self.lcd_enabled() {
            self.lyc_eq_ly = self.ly == self.lyc;
        }
        self.update_stat_irq(if_reg);
    }

    /// Advance by `cycles` machine cycles. Returns how many times HBlank was
    /// entered, which paces HBlank DMA.
    pub fn step(&mut self, cycles: u32, if_reg: &mut u8) -> u32 {
        if !self.lcd_enabled() {
            return 0;
        }
        let mut remaining = cycles;
        let mut hblanks = 0;
        loop {
            let left_in_mode = self.mode.length() - self.mode_clock;
            if remaining < left_in_mode {
                self.mode_clock += remaining;
                break;
            }
            remaining -= left_in_mode;
            self.mode_clock = 0;

            match self.mode {
                Mode::OamScan => {
                    self.oam_scan();
                    self.mode = Mode::Transfer;
                }
                Mode::Transfer => {
                    self.render_scanline();
                    self.mode = Mode::HBlank;
                    hblanks += 1;
                }
                Mode::HBlank => {
                    self.ly += 1;
                    if self.ly as usize == SCREEN_HEIGHT {
                        self.mode = Mode::VBlank;
                        self.frame_ready = true;
                        self.frame_counter = self.frame_counter.wrapping_add(1);
                        *if_reg |= 0x01;
                    } else {
                        self.mode = Mode::OamScan;
                    }
                }
                Mode::VBlank => {
                    self.ly += 1;
                    if self.ly >= SCREEN_HEIGHT as u8 + VBLANK_LINES {
                        self.ly = 0;
                        self.win_line_counter = 0;
                        self.mode = Mode::OamScan;
                    }
                }
            }
            self.compare_ly(if_reg);
        }
        hblanks
    }

    /// Raise the STAT interrupt on a rising edge of the combined STAT line,
    /// so a condition that stays true fires once.
    fn update_stat_irq(&mut self, if_reg: &mut u8) {
        if !self.lcd_enabled() {
            self.stat_irq_line = false;
            return;
        }
        let coincidence = self.lyc_eq_ly && self.stat & 0x40 != 0;
        let mode_signal = match self.mode {
            Mode::HBlank => self.stat & 0x08 != 0,
            Mode::VBlank => self.stat & 0x10 != 0,
            Mode::OamScan => self.stat & 0x20 != 0,
            Mode::Transfer => false,
        };
        let current = coincidence || mode_signal;
        if current && !self.stat_irq_line {
            *if_reg |= 0x02;
        }
        self.stat_irq_line = current;
    }
}

impl Snapshot for Ppu {
    fn save_state(&self, w: &mut StateWriter) {
        w.u8(self.vram_banks() as u8);
        for bank in &self.vram[..self.vram_banks()] {
            w.bytes(bank);
        }
        w.u8(self.vram_bank as u8);
        w.bytes(&self.oam);
        w.bool(self.compat);
        for reg in [
            self.lcdc, self.stat, self.scy, self.scx, self.ly, self.lyc, self.dma, self.bgp,
            self.obp0, self.obp1, self.wy, self.wx, self.win_line_counter, self.bgpi, self.obpi,
            self.opri, self.mode as u8,
        ] {
            w.u8(reg);
        }
        w.bool(self.lyc_eq_ly);
        w.bytes(&self.bgpd);
        w.bytes(&self.obpd);
        w.u32(self.mode_clock);
        w.bool(self.frame_ready);
        w.bool(self.stat_irq_line);
        w.u64(self.frame_counter);
        w.u8(self.sprite_count as u8);
        for s in &self.line_sprites[..self.sprite_count] {
            w.u16(s.x as u16);
            w.u8(s.row);
            w.bool(s.tall);
            w.u8(s.tile);
            w.u8(s.flags);
            w.u8(s.oam_index as u8);
        }
        for px in &self.framebuffer {
            w.u32(*px);
        }
    }

    fn load_state(&mut self, r: &mut StateReader<'_>) -> Result<(), StateError> {
        expect_eq("VRAM banks", self.vram_banks() as u64, r.u8()? as u64)?;
        for bank in 0..self.vram_banks() {
            r.bytes_into(&mut self.vram[bank])?;
        }
        self.vram_bank = (r.u8()? & 0x01) as usize;
        r.bytes_into(&mut self.oam)?;
        self.compat = r.bool()?;
        for reg in [
            &mut self.lcdc,
            &mut self.stat,
            &mut self.scy,
            &mut self.scx,
            &mut self.ly,
            &mut self.lyc,
            &mut self.dma,
            &mut self.bgp,
            &mut self.obp0,
            &mut self.obp1,
            &mut self.wy,
            &mut self.wx,
            &mut self.win_line_counter,
            &mut self.bgpi,
            &mut self.obpi,
            &mut self.opri,
        ] {
            *reg = r.u8()?;
        }
        self.mode = Mode::from_bits(r.u8()?);
        if self.ly >= SCREEN_HEIGHT as u8 + VBLANK_LINES {
            return Err(StateError::InvalidValue {
                what: "LY",
                value: self.ly as u64,
            });
        }
        self.lyc_eq_ly = r.bool()?;
        r.bytes_into(&mut self.bgpd)?;
        r.bytes_into(&mut self.obpd)?;
        self.mode_clock = r.u32()?.min(self.mode.length() - 1);
        self.frame_ready = r.bool()?;
        self.stat_irq_line = r.bool()?;
        self.frame_counter = r.u64()?;
        self.sprite_count = (r.u8()? as usize).min(MAX_SPRITES_PER_LINE);
        for s in &mut self.line_sprites[..self.sprite_count] {
            s.x = r.u16()? as i16;
            s.row = r.u8()?;
            s.tall = r.bool()?;
            s.row &= if s.tall { 0x0F } else { 0x07 };
            s.tile = r.u8()?;
            s.flags = r.u8()?;
            s.oam_index = r.u8()? as usize % TOTAL_SPRITES;
        }
        for px in self.framebuffer.iter_mut() {
            *px = r.u32()?;
        }
        r.finish()
    }
}
