use crate::error::StateError;
use crate::scheduler::{Scheduler, TaskId, TaskKind};
use crate::state::{Snapshot, StateReader, StateWriter};

/// Divider ticks per machine cycle. The divider runs on the CPU clock, so
/// this stays 4 in double-speed mode as well.
const TICKS_PER_CYCLE: u64 = 4;

/// Divider/timer unit.
///
/// The divider is not stepped cycle by cycle. It is brought up to date
/// lazily from the scheduler clock whenever a register is touched, and the
/// cycle of the next TIMA overflow is computed in closed form and handed to
/// the scheduler. The overflow and the reload one cycle later are two
/// chained tasks.
#[derive(Debug, Clone)]
pub struct Timer {
    /// Internal divider in CPU clock ticks. DIV is bits 8-15.
    counter: u64,
    /// Scheduler cycle `counter` was last brought up to date at.
    synced_at: u64,
    pub tima: u8,
    pub tma: u8,
    pub tac: u8,
    /// TIMA overflowed and reads 0 until the reload task fires.
    reload_pending: bool,
    overflow_task: TaskId,
    reload_task: TaskId,
}

impl Timer {
    pub fn new(sched: &mut Scheduler, div: u16) -> Self {
        Self {
            counter: div as u64,
            synced_at: sched.now(),
            tima: 0,
            tma: 0,
            tac: 0,
            reload_pending: false,
            overflow_task: sched.register(TaskKind::TimerOverflow, 0),
            reload_task: sched.register(TaskKind::TimerReload, 0),
        }
    }

    pub fn overflow_task(&self) -> TaskId {
        self.overflow_task
    }

    pub fn reload_task(&self) -> TaskId {
        self.reload_task
    }

    /// Full 16-bit divider value at the current cycle.
    pub fn divider(&mut self, now: u64) -> u16 {
        self.sync(now);
        self.counter as u16
    }

    pub fn read(&mut self, addr: u16, now: u64) -> u8 {
        self.sync(now);
        match addr {
            0xFF04 => (self.counter as u16 >> 8) as u8,
            0xFF05 => self.tima,
            0xFF06 => self.tma,
            0xFF07 => self.tac | 0xF8,
            _ => 0xFF,
        }
    }

    pub fn write(&mut self, addr: u16, val: u8, sched: &mut Scheduler) {
        self.sync(sched.now());
        match addr {
            0xFF04 => {
                // Clearing the divider while the selected bit is high is a
                // falling edge.
                if self.signal() {
                    self.increment(sched);
                }
                self.counter = 0;
            }
            0xFF05 => {
                // Writing during the overflow window cancels the reload.
                if self.reload_pending {
                    self.reload_pending = false;
                    sched.cancel(self.reload_task);
                }
                self.tima = val;
            }
            0xFF06 => {
                // A pending reload picks up the new value when it fires.
                self.tma = val;
            }
            0xFF07 => {
                let before = self.signal();
                self.tac = val & 0x07;
                if before && !self.signal() {
                    self.increment(sched);
                }
            }
            _ => return,
        }
        self.reschedule(sched);
    }

    /// TIMA has just wrapped to 0. The reload lands one cycle later.
    pub fn on_overflow(&mut self, sched: &mut Scheduler) {
        self.sync(sched.now());
        self.tima = 0;
        self.reload_pending = true;
        sched.schedule_in(self.reload_task, 1);
    }

    pub fn on_reload(&mut self, sched: &mut Scheduler, if_reg: &mut u8) {
        self.sync(sched.now());
        self.reload_pending = false;
        self.tima = self.tma;
        *if_reg |= 0x04;
        self.reschedule(sched);
    }

    /// Rebuild the overflow task from the current register state.
    pub fn reschedule(&mut self, sched: &mut Scheduler) {
        sched.cancel(self.overflow_task);
        if self.tac & 0x04 == 0 || self.reload_pending {
            return;
        }
        self.sync(sched.now());
        let period = self.period();
        let first_edge = (self.counter / period + 1) * period;
        let edges = 0x100 - self.tima as u64;
        let overflow_at = first_edge + (edges - 1) * period;
        let delay = (overflow_at - self.counter).div_ceil(TICKS_PER_CYCLE);
        sched.schedule_in(self.overflow_task, delay);
    }

    fn sync(&mut self, now: u64) {
        if now <= self.synced_at {
            return;
        }
        let next = self.counter + (now - self.synced_at) * TICKS_PER_CYCLE;
        if self.tac & 0x04 != 0 && !self.reload_pending {
            let period = self.period();
            let edges = next / period - self.counter / period;
            // Overflow is delivered by its own task, so at most it lands on 0 here.
            self.tima = (self.tima as u64 + edges) as u8;
        }
        self.counter = next;
        self.synced_at = now;
    }

    /// Glitch increment from a register write.
    fn increment(&mut self, sched: &mut Scheduler) {
        if self.reload_pending {
            return;
        }
        if self.tima == 0xFF {
            self.tima = 0;
            self.reload_pending = true;
            sched.schedule_in(self.reload_task, 1);
        } else {
            self.tima += 1;
        }
    }

    fn bit(&self) -> u32 {
        match self.tac & 0x03 {
            0 => 9,
            1 => 3,
            2 => 5,
            _ => 7,
        }
    }

    /// Divider ticks between falling edges of the selected bit.
    fn period(&self) -> u64 {
        1 << (self.bit() + 1)
    }

    fn signal(&self) -> bool {
        self.tac & 0x04 != 0 && (self.counter >> self.bit()) & 1 != 0
    }
}

impl Snapshot for Timer {
    fn save_state(&self, w: &mut StateWriter) {
        w.u64(self.counter);
        w.u64(self.synced_at);
        w.u8(self.tima);
        w.u8(self.tma);
        w.u8(self.tac);
        w.bool(self.reload_pending);
    }

    fn load_state(&mut self, r: &mut StateReader<'_>) -> Result<(), StateError> {
        self.counter = r.u64()?;
        self.synced_at = r.u64()?;
        self.tima = r.u8()?;
        self.tma = r.u8()?;
        self.tac = r.u8()? & 0x07;
        self.reload_pending = r.bool()?;
        r.finish()
    }
}
