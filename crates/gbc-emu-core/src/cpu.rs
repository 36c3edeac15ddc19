use log::warn;

use crate::error::StateError;
use crate::state::{Snapshot, StateReader, StateWriter};

#[cfg(feature = "cpu-trace")]
macro_rules! cpu_trace {
    ($($arg:tt)*) => {
        log::trace!($($arg)*);
    };
}
#[cfg(not(feature = "cpu-trace"))]
macro_rules! cpu_trace {
    ($($arg:tt)*) => {};
}

// Flag bits
pub const FLAG_Z: u8 = 0x80; // Zero
pub const FLAG_N: u8 = 0x40; // Subtract
pub const FLAG_H: u8 = 0x20; // Half Carry
pub const FLAG_C: u8 = 0x10; // Carry

// Interrupt vectors
const INTERRUPT_VBLANK: u16 = 0x40;
const INTERRUPT_STAT: u16 = 0x48;
const INTERRUPT_TIMER: u16 = 0x50;
const INTERRUPT_SERIAL: u16 = 0x58;
const INTERRUPT_JOYPAD: u16 = 0x60;

const BOOT_PC: u16 = 0x0100;
const BOOT_SP: u16 = 0xFFFE;

const DMG_BOOT_REGS: [u8; 8] = [0x01, 0xB0, 0x00, 0x13, 0x00, 0xD8, 0x01, 0x4D];
const CGB_BOOT_REGS: [u8; 8] = [0x11, 0x80, 0x00, 0x00, 0x00, 0x08, 0x00, 0x7C];

/// What the instruction engine needs from the rest of the machine.
pub trait MemoryBus {
    fn read(&mut self, addr: u16) -> u8;
    fn write(&mut self, addr: u16, val: u8);
    /// IE register.
    fn interrupt_enable(&self) -> u8;
    /// IF register, low five bits.
    fn interrupt_flags(&self) -> u8;
    fn clear_interrupt(&mut self, bit: u8);
    /// STOP was executed: reset the divider and perform a prepared CGB speed
    /// switch. Returns false when none was armed.
    fn try_speed_switch(&mut self) -> bool;
}

/// SM83 register file and execution state.
#[derive(Debug, Clone)]
pub struct Cpu {
    pub a: u8,
    pub f: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
    pub e: u8,
    pub h: u8,
    pub l: u8,
    pub pc: u16,
    pub sp: u16,
    pub ime: bool,
    pub halted: bool,
    pub stopped: bool,
    halt_bug: bool,
    /// EI takes effect after the following instruction.
    ei_pending: bool,
    /// Machine cycles used by the step in progress.
    step_cycles: u32,
}

impl Cpu {
    /// Power-on state for running a boot ROM from address 0.
    pub fn new_power_on() -> Self {
        Self {
            a: 0,
            f: 0,
            b: 0,
            c: 0,
            d: 0,
            e: 0,
            h: 0,
            l: 0,
            pc: 0x0000,
            sp: 0x0000,
            ime: false,
            halted: false,
            stopped: false,
            halt_bug: false,
            ei_pending: false,
            step_cycles: 0,
        }
    }

    /// Post-boot register state for the selected hardware.
    pub fn new(cgb: bool) -> Self {
        let [a, f, b, c, d, e, h, l] = if cgb { CGB_BOOT_REGS } else { DMG_BOOT_REGS };
        Self {
            a,
            f,
            b,
            c,
            d,
            e,
            h,
            l,
            pc: BOOT_PC,
            sp: BOOT_SP,
            ..Self::new_power_on()
        }
    }

    pub fn bc(&self) -> u16 {
        u16::from_be_bytes([self.b, self.c])
    }

    fn set_bc(&mut self, val: u16) {
        [self.b, self.c] = val.to_be_bytes();
    }

    pub fn de(&self) -> u16 {
        u16::from_be_bytes([self.d, self.e])
    }

    fn set_de(&mut self, val: u16) {
        [self.d, self.e] = val.to_be_bytes();
    }

    pub fn hl(&self) -> u16 {
        u16::from_be_bytes([self.h, self.l])
    }

    fn set_hl(&mut self, val: u16) {
        [self.h, self.l] = val.to_be_bytes();
    }

    pub fn af(&self) -> u16 {
        u16::from_be_bytes([self.a, self.f])
    }

    /// Formatted CPU state string for debugging.
    pub fn debug_state(&self) -> String {
        format!(
            "AF:{:04X} BC:{:04X} DE:{:04X} HL:{:04X} PC:{:04X} SP:{:04X} IME:{}",
            self.af(),
            self.bc(),
            self.de(),
            self.hl(),
            self.pc,
            self.sp,
            self.ime as u8
        )
    }

    fn next_interrupt(pending: u8) -> (u8, u16) {
        if pending & 0x01 != 0 {
            (0x01, INTERRUPT_VBLANK)
        } else if pending & 0x02 != 0 {
            (0x02, INTERRUPT_STAT)
        } else if pending & 0x04 != 0 {
            (0x04, INTERRUPT_TIMER)
        } else if pending & 0x08 != 0 {
            (0x08, INTERRUPT_SERIAL)
        } else {
            (0x10, INTERRUPT_JOYPAD)
        }
    }

    #[inline(always)]
    fn tick(&mut self, m_cycles: u32) {
        self.step_cycles += m_cycles;
    }

    #[inline(always)]
    fn fetch8<B: MemoryBus>(&mut self, bus: &mut B) -> u8 {
        let val = bus.read(self.pc);
        self.pc = self.pc.wrapping_add(1);
        self.tick(1);
        val
    }

    #[inline(always)]
    fn fetch16<B: MemoryBus>(&mut self, bus: &mut B) -> u16 {
        let lo = self.fetch8(bus) as u16;
        let hi = self.fetch8(bus) as u16;
        (hi << 8) | lo
    }

    #[inline(always)]
    fn read8<B: MemoryBus>(&mut self, bus: &mut B, addr: u16) -> u8 {
        let val = bus.read(addr);
        self.tick(1);
        val
    }

    #[inline(always)]
    fn write8<B: MemoryBus>(&mut self, bus: &mut B, addr: u16, val: u8) {
        bus.write(addr, val);
        self.tick(1);
    }

    fn push_stack<B: MemoryBus>(&mut self, bus: &mut B, val: u16) {
        self.sp = self.sp.wrapping_sub(1);
        self.write8(bus, self.sp, (val >> 8) as u8);
        self.sp = self.sp.wrapping_sub(1);
        self.write8(bus, self.sp, val as u8);
    }

    fn pop_stack<B: MemoryBus>(&mut self, bus: &mut B) -> u16 {
        let lo = self.read8(bus, self.sp) as u16;
        self.sp = self.sp.wrapping_add(1);
        let hi = self.read8(bus, self.sp) as u16;
        self.sp = self.sp.wrapping_add(1);
        (hi << 8) | lo
    }

    fn read_reg<B: MemoryBus>(&mut self, bus: &mut B, index: u8) -> u8 {
        match index & 0x07 {
            0 => self.b,
            1 => self.c,
            2 => self.d,
            3 => self.e,
            4 => self.h,
            5 => self.l,
            6 => self.read8(bus, self.hl()),
            _ => self.a,
        }
    }

    fn write_reg<B: MemoryBus>(&mut self, bus: &mut B, index: u8, val: u8) {
        match index & 0x07 {
            0 => self.b = val,
            1 => self.c = val,
            2 => self.d = val,
            3 => self.e = val,
            4 => self.h = val,
            5 => self.l = val,
            6 => self.write8(bus, self.hl(), val),
            _ => self.a = val,
        }
    }

    /// BC, DE, HL, SP by the two-bit pair index in bits 4-5.
    fn read_pair(&self, index: u8) -> u16 {
        match index & 0x03 {
            0 => self.bc(),
            1 => self.de(),
            2 => self.hl(),
            _ => self.sp,
        }
    }

    fn write_pair(&mut self, index: u8, val: u16) {
        match index & 0x03 {
            0 => self.set_bc(val),
            1 => self.set_de(val),
            2 => self.set_hl(val),
            _ => self.sp = val,
        }
    }

    fn condition(&self, cc: u8) -> bool {
        match cc & 0x03 {
            0 => self.f & FLAG_Z == 0,
            1 => self.f & FLAG_Z != 0,
            2 => self.f & FLAG_C == 0,
            _ => self.f & FLAG_C != 0,
        }
    }

    /// ADD/ADC/SUB/SBC/AND/XOR/OR/CP selected by `op` (bits 3-5).
    fn alu(&mut self, op: u8, val: u8) {
        let carry_in = (self.f & FLAG_C != 0) as u8;
        match op & 0x07 {
            0 | 1 => {
                let c = if op & 0x07 == 1 { carry_in } else { 0 };
                let res = self.a as u16 + val as u16 + c as u16;
                let half = (self.a & 0x0F) + (val & 0x0F) + c > 0x0F;
                self.a = res as u8;
                self.f = z_flag(self.a) | if half { FLAG_H } else { 0 } | if res > 0xFF { FLAG_C } else { 0 };
            }
            2 | 3 | 7 => {
                let c = if op & 0x07 == 3 { carry_in } else { 0 };
                let res = (self.a as i16) - (val as i16) - c as i16;
                let half = ((self.a & 0x0F) as i16) - ((val & 0x0F) as i16) - (c as i16) < 0;
                let out = res as u8;
                self.f = z_flag(out)
                    | FLAG_N
                    | if half { FLAG_H } else { 0 }
                    | if res < 0 { FLAG_C } else { 0 };
                if op & 0x07 != 7 {
                    self.a = out;
                }
            }
            4 => {
                self.a &= val;
                self.f = z_flag(self.a) | FLAG_H;
            }
            5 => {
                self.a ^= val;
                self.f = z_flag(self.a);
            }
            _ => {
                self.a |= val;
                self.f = z_flag(self.a);
            }
        }
    }

    fn inc8(&mut self, val: u8) -> u8 {
        let res = val.wrapping_add(1);
        self.f = (self.f & FLAG_C) | z_flag(res) | if val & 0x0F == 0x0F { FLAG_H } else { 0 };
        res
    }

    fn dec8(&mut self, val: u8) -> u8 {
        let res = val.wrapping_sub(1);
        self.f = (self.f & FLAG_C) | FLAG_N | z_flag(res) | if val & 0x0F == 0 { FLAG_H } else { 0 };
        res
    }

    fn add_hl(&mut self, val: u16) {
        let hl = self.hl();
        let res = hl as u32 + val as u32;
        self.f = (self.f & FLAG_Z)
            | if (hl & 0x0FFF) + (val & 0x0FFF) > 0x0FFF { FLAG_H } else { 0 }
            | if res > 0xFFFF { FLAG_C } else { 0 };
        self.set_hl(res as u16);
    }

    /// SP plus a signed immediate; flags come from the unsigned low byte add.
    fn sp_offset(&mut self, offset: u8) -> u16 {
        let val = offset as i8 as i16 as u16;
        let sp = self.sp;
        self.f = if (sp & 0x0F) + (val & 0x0F) > 0x0F { FLAG_H } else { 0 }
            | if (sp & 0xFF) + (val & 0xFF) > 0xFF { FLAG_C } else { 0 };
        sp.wrapping_add(val)
    }

    fn daa(&mut self) {
        let mut correction = 0u8;
        let mut carry = false;
        if self.f & FLAG_H != 0 || (self.f & FLAG_N == 0 && (self.a & 0x0F) > 9) {
            correction |= 0x06;
        }
        if self.f & FLAG_C != 0 || (self.f & FLAG_N == 0 && self.a > 0x99) {
            correction |= 0x60;
            carry = true;
        }
        if self.f & FLAG_N == 0 {
            self.a = self.a.wrapping_add(correction);
        } else {
            self.a = self.a.wrapping_sub(correction);
        }
        self.f = z_flag(self.a) | (self.f & FLAG_N) | if carry { FLAG_C } else { 0 };
    }

    fn handle_cb<B: MemoryBus>(&mut self, opcode: u8, bus: &mut B) {
        let r = opcode & 0x07;
        let val = self.read_reg(bus, r);
        let carry_in = (self.f & FLAG_C != 0) as u8;
        match opcode {
            0x00..=0x3F => {
                let (res, carry) = match opcode >> 3 {
                    0 => (val.rotate_left(1), val & 0x80 != 0),
                    1 => (val.rotate_right(1), val & 0x01 != 0),
                    2 => ((val << 1) | carry_in, val & 0x80 != 0),
                    3 => ((val >> 1) | (carry_in << 7), val & 0x01 != 0),
                    4 => (val << 1, val & 0x80 != 0),
                    5 => ((val >> 1) | (val & 0x80), val & 0x01 != 0),
                    6 => (val.rotate_left(4), false),
                    _ => (val >> 1, val & 0x01 != 0),
                };
                self.write_reg(bus, r, res);
                self.f = z_flag(res) | if carry { FLAG_C } else { 0 };
            }
            0x40..=0x7F => {
                // BIT only reads, so (HL) costs one cycle less than RES/SET.
                let bit = (opcode >> 3) & 0x07;
                self.f = (self.f & FLAG_C) | FLAG_H | if val & (1 << bit) == 0 { FLAG_Z } else { 0 };
            }
            0x80..=0xBF => {
                let bit = (opcode >> 3) & 0x07;
                self.write_reg(bus, r, val & !(1 << bit));
            }
            0xC0..=0xFF => {
                let bit = (opcode >> 3) & 0x07;
                self.write_reg(bus, r, val | (1 << bit));
            }
        }
    }

    /// Push PC and jump to the highest priority pending vector. Five machine
    /// cycles.
    fn dispatch_interrupt<B: MemoryBus>(&mut self, bus: &mut B) {
        self.ime = false;
        self.ei_pending = false;
        self.tick(2);
        let return_pc = self.pc;

        // Writing the high byte can land on IE and change which source is
        // taken, or cancel the dispatch entirely.
        self.sp = self.sp.wrapping_sub(1);
        self.write8(bus, self.sp, (return_pc >> 8) as u8);
        let queue = bus.interrupt_enable() & bus.interrupt_flags() & 0x1F;

        self.sp = self.sp.wrapping_sub(1);
        self.write8(bus, self.sp, return_pc as u8);
        self.tick(1);

        if queue == 0 {
            self.pc = 0;
            return;
        }
        let (bit, vector) = Self::next_interrupt(queue);
        bus.clear_interrupt(bit);
        self.pc = vector;
        cpu_trace!("interrupt {:02X} -> {:04X}", bit, vector);
    }

    /// Execute one instruction or one interrupt dispatch, returning the
    /// machine cycles it took.
    pub fn step<B: MemoryBus>(&mut self, bus: &mut B) -> u32 {
        self.step_cycles = 0;
        let pending = bus.interrupt_enable() & bus.interrupt_flags() & 0x1F;

        if self.stopped {
            return 1;
        }
        if pending != 0 {
            self.halted = false;
            if self.ime {
                self.dispatch_interrupt(bus);
                return self.step_cycles;
            }
        }
        if self.halted {
            return 1;
        }

        let enable_after = self.ei_pending;
        self.ei_pending = false;

        let opcode_pc = self.pc;
        let opcode = self.fetch8(bus);
        if self.halt_bug {
            // The byte after HALT is read twice.
            self.halt_bug = false;
            self.pc = opcode_pc;
        }
        cpu_trace!("{:04X}: {:02X} {}", opcode_pc, opcode, self.debug_state());
        self.execute(opcode, opcode_pc, bus);

        if enable_after && opcode != 0xF3 {
            self.ime = true;
        }
        self.step_cycles
    }

    fn execute<B: MemoryBus>(&mut self, opcode: u8, opcode_pc: u16, bus: &mut B) {
        match opcode {
            0x00 => {}
            // LD rr,d16
            0x01 | 0x11 | 0x21 | 0x31 => {
                let val = self.fetch16(bus);
                self.write_pair(opcode >> 4, val);
            }
            0x02 => self.write8(bus, self.bc(), self.a),
            0x12 => self.write8(bus, self.de(), self.a),
            0x22 => {
                let hl = self.hl();
                self.write8(bus, hl, self.a);
                self.set_hl(hl.wrapping_add(1));
            }
            0x32 => {
                let hl = self.hl();
                self.write8(bus, hl, self.a);
                self.set_hl(hl.wrapping_sub(1));
            }
            0x0A => self.a = self.read8(bus, self.bc()),
            0x1A => self.a = self.read8(bus, self.de()),
            0x2A => {
                let hl = self.hl();
                self.a = self.read8(bus, hl);
                self.set_hl(hl.wrapping_add(1));
            }
            0x3A => {
                let hl = self.hl();
                self.a = self.read8(bus, hl);
                self.set_hl(hl.wrapping_sub(1));
            }
            // INC rr / DEC rr
            0x03 | 0x13 | 0x23 | 0x33 => {
                let idx = opcode >> 4;
                self.write_pair(idx, self.read_pair(idx).wrapping_add(1));
                self.tick(1);
            }
            0x0B | 0x1B | 0x2B | 0x3B => {
                let idx = opcode >> 4;
                self.write_pair(idx, self.read_pair(idx).wrapping_sub(1));
                self.tick(1);
            }
            // INC r / DEC r / LD r,d8
            0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => {
                let r = opcode >> 3;
                let val = self.read_reg(bus, r);
                let res = self.inc8(val);
                self.write_reg(bus, r, res);
            }
            0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => {
                let r = opcode >> 3;
                let val = self.read_reg(bus, r);
                let res = self.dec8(val);
                self.write_reg(bus, r, res);
            }
            0x06 | 0x0E | 0x16 | 0x1E | 0x26 | 0x2E | 0x36 | 0x3E => {
                let val = self.fetch8(bus);
                self.write_reg(bus, opcode >> 3, val);
            }
            // Accumulator rotates always clear Z.
            0x07 => {
                let carry = self.a & 0x80 != 0;
                self.a = self.a.rotate_left(1);
                self.f = if carry { FLAG_C } else { 0 };
            }
            0x0F => {
                let carry = self.a & 0x01 != 0;
                self.a = self.a.rotate_right(1);
                self.f = if carry { FLAG_C } else { 0 };
            }
            0x17 => {
                let carry = self.a & 0x80 != 0;
                self.a = (self.a << 1) | (self.f & FLAG_C != 0) as u8;
                self.f = if carry { FLAG_C } else { 0 };
            }
            0x1F => {
                let carry = self.a & 0x01 != 0;
                self.a = (self.a >> 1) | (((self.f & FLAG_C != 0) as u8) << 7);
                self.f = if carry { FLAG_C } else { 0 };
            }
            0x08 => {
                let addr = self.fetch16(bus);
                self.write8(bus, addr, self.sp as u8);
                self.write8(bus, addr.wrapping_add(1), (self.sp >> 8) as u8);
            }
            0x09 | 0x19 | 0x29 | 0x39 => {
                let val = self.read_pair(opcode >> 4);
                self.add_hl(val);
                self.tick(1);
            }
            0x10 => {
                let _ = self.fetch8(bus);
                if !bus.try_speed_switch() {
                    self.stopped = true;
                }
            }
            0x18 => {
                let offset = self.fetch8(bus) as i8;
                self.pc = self.pc.wrapping_add(offset as u16);
                self.tick(1);
            }
            0x20 | 0x28 | 0x30 | 0x38 => {
                let offset = self.fetch8(bus) as i8;
                if self.condition(opcode >> 3) {
                    self.pc = self.pc.wrapping_add(offset as u16);
                    self.tick(1);
                }
            }
            0x27 => self.daa(),
            0x2F => {
                self.a = !self.a;
                self.f = (self.f & (FLAG_Z | FLAG_C)) | FLAG_N | FLAG_H;
            }
            0x37 => self.f = (self.f & FLAG_Z) | FLAG_C,
            0x3F => self.f = (self.f & FLAG_Z) | if self.f & FLAG_C != 0 { 0 } else { FLAG_C },
            0x76 => {
                let pending = bus.interrupt_enable() & bus.interrupt_flags() & 0x1F;
                if !self.ime && pending != 0 {
                    self.halt_bug = true;
                } else {
                    self.halted = true;
                }
            }
            0x40..=0x7F => {
                let val = self.read_reg(bus, opcode);
                self.write_reg(bus, opcode >> 3, val);
            }
            0x80..=0xBF => {
                let val = self.read_reg(bus, opcode);
                self.alu(opcode >> 3, val);
            }
            0xC6 | 0xCE | 0xD6 | 0xDE | 0xE6 | 0xEE | 0xF6 | 0xFE => {
                let val = self.fetch8(bus);
                self.alu(opcode >> 3, val);
            }
            // RET cc
            0xC0 | 0xC8 | 0xD0 | 0xD8 => {
                self.tick(1);
                if self.condition(opcode >> 3) {
                    self.pc = self.pop_stack(bus);
                    self.tick(1);
                }
            }
            0xC9 => {
                self.pc = self.pop_stack(bus);
                self.tick(1);
            }
            0xD9 => {
                self.pc = self.pop_stack(bus);
                self.tick(1);
                self.ime = true;
            }
            // POP / PUSH
            0xC1 | 0xD1 | 0xE1 => {
                let val = self.pop_stack(bus);
                self.write_pair((opcode >> 4) & 0x03, val);
            }
            0xF1 => {
                let val = self.pop_stack(bus);
                self.a = (val >> 8) as u8;
                self.f = (val as u8) & 0xF0;
            }
            0xC5 | 0xD5 | 0xE5 => {
                let val = self.read_pair((opcode >> 4) & 0x03);
                self.tick(1);
                self.push_stack(bus, val);
            }
            0xF5 => {
                let val = self.af() & 0xFFF0;
                self.tick(1);
                self.push_stack(bus, val);
            }
            0xC3 => {
                self.pc = self.fetch16(bus);
                self.tick(1);
            }
            0xC2 | 0xCA | 0xD2 | 0xDA => {
                let addr = self.fetch16(bus);
                if self.condition(opcode >> 3) {
                    self.pc = addr;
                    self.tick(1);
                }
            }
            0xE9 => self.pc = self.hl(),
            0xCD => {
                let addr = self.fetch16(bus);
                self.tick(1);
                self.push_stack(bus, self.pc);
                self.pc = addr;
            }
            0xC4 | 0xCC | 0xD4 | 0xDC => {
                let addr = self.fetch16(bus);
                if self.condition(opcode >> 3) {
                    self.tick(1);
                    self.push_stack(bus, self.pc);
                    self.pc = addr;
                }
            }
            0xC7 | 0xCF | 0xD7 | 0xDF | 0xE7 | 0xEF | 0xF7 | 0xFF => {
                self.tick(1);
                self.push_stack(bus, self.pc);
                self.pc = (opcode & 0x38) as u16;
            }
            0xCB => {
                let cb = self.fetch8(bus);
                self.handle_cb(cb, bus);
            }
            0xE0 => {
                let offset = self.fetch8(bus);
                self.write8(bus, 0xFF00 | offset as u16, self.a);
            }
            0xF0 => {
                let offset = self.fetch8(bus);
                self.a = self.read8(bus, 0xFF00 | offset as u16);
            }
            0xE2 => self.write8(bus, 0xFF00 | self.c as u16, self.a),
            0xF2 => self.a = self.read8(bus, 0xFF00 | self.c as u16),
            0xEA => {
                let addr = self.fetch16(bus);
                self.write8(bus, addr, self.a);
            }
            0xFA => {
                let addr = self.fetch16(bus);
                self.a = self.read8(bus, addr);
            }
            0xE8 => {
                let offset = self.fetch8(bus);
                self.sp = self.sp_offset(offset);
                self.tick(2);
            }
            0xF8 => {
                let offset = self.fetch8(bus);
                let res = self.sp_offset(offset);
                self.set_hl(res);
                self.tick(1);
            }
            0xF9 => {
                self.sp = self.hl();
                self.tick(1);
            }
            0xF3 => {
                self.ime = false;
                self.ei_pending = false;
            }
            0xFB => self.ei_pending = !self.ime,
            // D3 DB DD E3 E4 EB EC ED F4 FC FD
            _ => {
                warn!("undefined opcode {opcode:02X} at PC={opcode_pc:04X}, treated as NOP");
            }
        }
    }
}

#[inline(always)]
fn z_flag(val: u8) -> u8 {
    if val == 0 { FLAG_Z } else { 0 }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Snapshot for Cpu {
    fn save_state(&self, w: &mut StateWriter) {
        for reg in [self.a, self.f, self.b, self.c, self.d, self.e, self.h, self.l] {
            w.u8(reg);
        }
        w.u16(self.pc);
        w.u16(self.sp);
        w.bool(self.ime);
        w.bool(self.halted);
        w.bool(self.stopped);
        w.bool(self.halt_bug);
        w.bool(self.ei_pending);
    }

    fn load_state(&mut self, r: &mut StateReader<'_>) -> Result<(), StateError> {
        for reg in [
            &mut self.a,
            &mut self.f,
            &mut self.b,
            &mut self.c,
            &mut self.d,
            &mut self.e,
            &mut self.h,
            &mut self.l,
        ] {
            *reg = r.u8()?;
        }
        self.f &= 0xF0;
        self.pc = r.u16()?;
        self.sp = r.u16()?;
        self.ime = r.bool()?;
        self.halted = r.bool()?;
        self.stopped = r.bool()?;
        self.halt_bug = r.bool()?;
        self.ei_pending = r.bool()?;
        r.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlatBus {
        mem: Vec<u8>,
        ie: u8,
        iflag: u8,
    }

    impl FlatBus {
        fn with_program(at: u16, code: &[u8]) -> Self {
            let mut mem = vec![0; 0x10000];
            mem[at as usize..at as usize + code.len()].copy_from_slice(code);
            Self { mem, ie: 0, iflag: 0 }
        }
    }

    impl MemoryBus for FlatBus {
        fn read(&mut self, addr: u16) -> u8 {
            self.mem[addr as usize]
        }
        fn write(&mut self, addr: u16, val: u8) {
            if addr == 0xFFFF {
                self.ie = val;
            }
            self.mem[addr as usize] = val;
        }
        fn interrupt_enable(&self) -> u8 {
            self.ie
        }
        fn interrupt_flags(&self) -> u8 {
            self.iflag
        }
        fn clear_interrupt(&mut self, bit: u8) {
            self.iflag &= !bit;
        }
        fn try_speed_switch(&mut self) -> bool {
            false
        }
    }

    fn cpu_at(pc: u16) -> Cpu {
        let mut cpu = Cpu::new(false);
        cpu.pc = pc;
        cpu
    }

    #[test]
    fn daa_after_bcd_add() {
        // LD A,$45; ADD A,$38; DAA
        let mut bus = FlatBus::with_program(0xC000, &[0x3E, 0x45, 0xC6, 0x38, 0x27]);
        let mut cpu = cpu_at(0xC000);
        for _ in 0..3 {
            cpu.step(&mut bus);
        }
        assert_eq!(cpu.a, 0x83);
        assert_eq!(cpu.f & FLAG_C, 0);
    }

    #[test]
    fn rla_clears_zero_but_rl_sets_it() {
        // XOR A; SCF; ... A=0x80 via LD A,$80; RLA
        let mut bus = FlatBus::with_program(0xC000, &[0x3E, 0x80, 0x17, 0x3E, 0x80, 0xCB, 0x17]);
        let mut cpu = cpu_at(0xC000);
        cpu.f = 0;
        cpu.step(&mut bus);
        cpu.step(&mut bus);
        assert_eq!(cpu.a, 0);
        assert_eq!(cpu.f, FLAG_C);
        cpu.f = 0;
        cpu.step(&mut bus);
        assert_eq!(cpu.step(&mut bus), 2);
        assert_eq!(cpu.a, 0);
        assert_eq!(cpu.f, FLAG_Z | FLAG_C);
    }

    #[test]
    fn branch_costs_depend_on_condition() {
        // JR NZ,+0 with Z set then clear
        let mut bus = FlatBus::with_program(0xC000, &[0x20, 0x00, 0x20, 0x00]);
        let mut cpu = cpu_at(0xC000);
        cpu.f = FLAG_Z;
        assert_eq!(cpu.step(&mut bus), 2);
        cpu.f = 0;
        assert_eq!(cpu.step(&mut bus), 3);
    }

    #[test]
    fn fixed_instruction_costs() {
        let cases: &[(&[u8], u32)] = &[
            (&[0x00], 1),
            (&[0x01, 0x34, 0x12], 3),
            (&[0x36, 0x10], 3),
            (&[0xC5], 4),
            (&[0xC1], 3),
            (&[0xCD, 0x00, 0xD0], 6),
            (&[0xC9], 4),
            (&[0xE8, 0x01], 4),
            (&[0xF8, 0x01], 3),
            (&[0xCB, 0x46], 3),
            (&[0xCB, 0x86], 4),
            (&[0xCB, 0x11], 2),
            (&[0xFF], 4),
            (&[0xFA, 0x00, 0xC1], 4),
        ];
        for (code, cost) in cases {
            let mut bus = FlatBus::with_program(0xC000, code);
            let mut cpu = cpu_at(0xC000);
            cpu.sp = 0xDFF0;
            cpu.set_hl(0xC800);
            assert_eq!(cpu.step(&mut bus), *cost, "opcode {:02X}", code[0]);
        }
    }

    #[test]
    fn undefined_opcode_is_a_one_cycle_nop() {
        let mut bus = FlatBus::with_program(0xC000, &[0xD3, 0x00]);
        let mut cpu = cpu_at(0xC000);
        let before = cpu.af();
        assert_eq!(cpu.step(&mut bus), 1);
        assert_eq!(cpu.pc, 0xC001);
        assert_eq!(cpu.af(), before);
    }

    #[test]
    fn halt_bug_repeats_next_byte() {
        // HALT; INC A
        let mut bus = FlatBus::with_program(0xC000, &[0x76, 0x3C]);
        bus.ie = 0x04;
        bus.iflag = 0x04;
        let mut cpu = cpu_at(0xC000);
        cpu.ime = false;
        cpu.a = 0;
        cpu.step(&mut bus);
        assert!(!cpu.halted);
        cpu.step(&mut bus);
        cpu.step(&mut bus);
        assert_eq!(cpu.a, 2);
        assert_eq!(cpu.pc, 0xC002);
    }

    #[test]
    fn halt_wakes_without_ime() {
        let mut bus = FlatBus::with_program(0xC000, &[0x76, 0x00]);
        bus.ie = 0x01;
        let mut cpu = cpu_at(0xC000);
        cpu.step(&mut bus);
        assert!(cpu.halted);
        assert_eq!(cpu.step(&mut bus), 1);
        bus.iflag = 0x01;
        cpu.step(&mut bus);
        assert!(!cpu.halted);
        assert_eq!(cpu.pc, 0xC002);
        assert_eq!(bus.iflag, 0x01);
    }

    #[test]
    fn ei_is_delayed_by_one_instruction() {
        // EI; NOP; NOP
        let mut bus = FlatBus::with_program(0xC000, &[0xFB, 0x00, 0x00]);
        bus.ie = 0x04;
        bus.iflag = 0x04;
        let mut cpu = cpu_at(0xC000);
        cpu.sp = 0xDFF0;
        cpu.step(&mut bus);
        assert!(!cpu.ime);
        cpu.step(&mut bus);
        assert!(cpu.ime);
        assert_eq!(cpu.pc, 0xC002);
        assert_eq!(cpu.step(&mut bus), 5);
        assert_eq!(cpu.pc, INTERRUPT_TIMER);
        assert!(!cpu.ime);
        assert_eq!(bus.iflag, 0);
        assert_eq!(bus.mem[0xDFEE], 0x02);
        assert_eq!(bus.mem[0xDFEF], 0xC0);
    }

    #[test]
    fn dispatch_takes_highest_priority() {
        let mut bus = FlatBus::with_program(0xC000, &[0x00]);
        bus.ie = 0x1F;
        bus.iflag = 0x12;
        let mut cpu = cpu_at(0xC000);
        cpu.ime = true;
        cpu.sp = 0xDFF0;
        cpu.step(&mut bus);
        assert_eq!(cpu.pc, INTERRUPT_STAT);
        assert_eq!(bus.iflag, 0x10);
    }

    #[test]
    fn pop_af_masks_low_nibble() {
        let mut bus = FlatBus::with_program(0xC000, &[0xF1]);
        bus.mem[0xDFF0] = 0xFF;
        bus.mem[0xDFF1] = 0x12;
        let mut cpu = cpu_at(0xC000);
        cpu.sp = 0xDFF0;
        cpu.step(&mut bus);
        assert_eq!(cpu.af(), 0x12F0);
    }
}
