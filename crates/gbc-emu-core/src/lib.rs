//! Cycle-accurate Game Boy / Game Boy Color emulation core.
//!
//! This crate contains the platform-agnostic emulator logic (CPU/MMU/PPU/APU/etc).
//! Hosts drive it through the [`gameboy`] facade and receive video and audio
//! through the traits in [`sink`].

/// Audio Processing Unit (APU) emulation.
pub mod apu;

/// Single-producer/single-consumer queue of stereo audio frames.
pub mod audio_queue;

/// Cartridge mappers (MBC) and ROM/RAM/RTC handling.
pub mod cartridge;

/// SM83 CPU core.
pub mod cpu;

/// Error types.
pub mod error;

/// High-level facade that wires every component into a single machine.
pub mod gameboy;

/// Hardware model selection.
pub mod hardware;

/// Joypad register and keypad interrupt.
pub mod keypad;

/// Memory map and hardware plumbing.
pub mod mmu;

/// Real-time frame pacing.
pub mod pacing;

/// Pixel Processing Unit (PPU) emulation.
pub mod ppu;

/// Timeline of hardware events.
pub mod scheduler;

/// Video and audio output interfaces.
pub mod sink;

/// Snapshot and battery stream codec.
pub mod state;

/// Divider/timer unit.
pub mod timer;

pub use error::{Error, Result};
