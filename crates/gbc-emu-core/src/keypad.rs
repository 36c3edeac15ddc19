use crate::error::StateError;
use crate::state::{Snapshot, StateReader, StateWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    Right,
    Left,
    Up,
    Down,
    A,
    B,
    Select,
    Start,
}

impl Button {
    /// (select line bit in P1, input bit).
    fn lines(self) -> (u8, u8) {
        match self {
            Button::Right => (0x10, 0x01),
            Button::Left => (0x10, 0x02),
            Button::Up => (0x10, 0x04),
            Button::Down => (0x10, 0x08),
            Button::A => (0x20, 0x01),
            Button::B => (0x20, 0x02),
            Button::Select => (0x20, 0x04),
            Button::Start => (0x20, 0x08),
        }
    }
}

/// Joypad register (P1/FF00).
#[derive(Debug, Clone)]
pub struct Keypad {
    /// Select bits 4-5 as last written (0 = line selected).
    select: u8,
    /// Pressed directions, active high.
    dpad: u8,
    /// Pressed action buttons, active high.
    buttons: u8,
}

impl Keypad {
    pub fn new() -> Self {
        Self {
            select: 0x30,
            dpad: 0,
            buttons: 0,
        }
    }

    pub fn read(&self) -> u8 {
        0xC0 | self.select | (!self.pressed_lines() & 0x0F)
    }

    /// Returns true if the write made a pressed button visible, which
    /// requests the keypad interrupt.
    pub fn write(&mut self, val: u8) -> bool {
        let before = self.pressed_lines();
        self.select = val & 0x30;
        self.pressed_lines() & !before != 0
    }

    /// Update a button. Returns true if the keypad interrupt should fire.
    pub fn set_button(&mut self, button: Button, pressed: bool) -> bool {
        let before = self.pressed_lines();
        let (line, bit) = button.lines();
        let group = if line == 0x10 {
            &mut self.dpad
        } else {
            &mut self.buttons
        };
        if pressed {
            *group |= bit;
        } else {
            *group &= !bit;
        }
        self.pressed_lines() & !before != 0
    }

    fn pressed_lines(&self) -> u8 {
        let mut lines = 0;
        if self.select & 0x10 == 0 {
            lines |= self.dpad;
        }
        if self.select & 0x20 == 0 {
            lines |= self.buttons;
        }
        lines
    }
}

impl Default for Keypad {
    fn default() -> Self {
        Self::new()
    }
}

impl Snapshot for Keypad {
    fn save_state(&self, w: &mut StateWriter) {
        w.u8(self.select);
        w.u8(self.dpad);
        w.u8(self.buttons);
    }

    fn load_state(&mut self, r: &mut StateReader<'_>) -> Result<(), StateError> {
        self.select = r.u8()? & 0x30;
        self.dpad = r.u8()? & 0x0F;
        self.buttons = r.u8()? & 0x0F;
        r.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selected_press_reads_low_and_requests_interrupt() {
        let mut pad = Keypad::new();
        assert_eq!(pad.read(), 0xFF);
        pad.write(0x20); // select directions
        assert!(pad.set_button(Button::Down, true));
        assert_eq!(pad.read() & 0x0F, 0x07);
        // Action buttons are not selected.
        assert!(!pad.set_button(Button::Start, true));
        assert_eq!(pad.read() & 0x0F, 0x07);
    }
}
