mod config;

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use log::{error, info, warn};

use gbc_emu_core::{
    audio_queue::{AudioConsumer, audio_queue},
    cartridge::Cartridge,
    gameboy::{Config, GameBoy},
    hardware::EmulationMode,
    sink::{SCREEN_HEIGHT, SCREEN_WIDTH},
};

const DEFAULT_FRAMES: usize = 60;

#[derive(Parser, Debug)]
#[command(name = "gbc-emu", about = "Headless Game Boy / Game Boy Color runner")]
struct Args {
    /// Path to ROM file
    rom: PathBuf,

    /// Force DMG mode
    #[arg(long, conflicts_with = "cgb")]
    dmg: bool,

    /// Force CGB mode
    #[arg(long, conflicts_with = "dmg")]
    cgb: bool,

    /// Path to boot ROM file
    #[arg(long)]
    bootrom: Option<PathBuf>,

    /// Number of frames to run
    #[arg(long, conflicts_with = "cycles")]
    frames: Option<usize>,

    /// Number of machine cycles to run
    #[arg(long)]
    cycles: Option<u64>,

    /// Pace emulation to the display refresh rate
    #[arg(long)]
    realtime: bool,

    /// Pacing speed multiplier
    #[arg(long)]
    speed: Option<f64>,

    /// Never sleep between frames, even with --realtime
    #[arg(long)]
    fast: bool,

    /// Snapshot to restore before running
    #[arg(long)]
    load_state: Option<PathBuf>,

    /// Write a snapshot after running
    #[arg(long)]
    save_state: Option<PathBuf>,

    /// Write the last frame as a PNG
    #[arg(long)]
    screenshot: Option<PathBuf>,

    /// Write audio as raw unsigned 8-bit interleaved stereo
    #[arg(long)]
    audio: Option<PathBuf>,

    /// Config file (defaults to the per-user location)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the effective config back to the config file
    #[arg(long)]
    save_config: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Print bytes sent over the serial port
    #[arg(long)]
    serial: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> gbc_emu_core::Result<()> {
    let config_path = args.config.clone().unwrap_or_else(config::default_config_path);
    let mut cfg = config::load_from_file(&config_path);
    if args.dmg {
        cfg.emulation_mode = config::ModeSetting::ForceDmg;
    } else if args.cgb {
        cfg.emulation_mode = config::ModeSetting::ForceCgb;
    }
    if let Some(speed) = args.speed {
        cfg.speed = speed;
    }
    if args.save_config {
        match config::save_to_file(&config_path, &cfg) {
            Ok(()) => info!("Saved config to {}", config_path.display()),
            Err(e) => warn!("Failed to save config {}: {e}", config_path.display()),
        }
    }

    let mut cart = Cartridge::from_file(&args.rom)?;
    let battery_path = args.rom.with_extension("sav");
    if cart.has_battery() && battery_path.exists() {
        match cart.load_battery_file(&battery_path) {
            Ok(()) => info!("Loaded battery RAM from {}", battery_path.display()),
            Err(e) => warn!("Ignoring battery file {}: {e}", battery_path.display()),
        }
    }

    let mode = EmulationMode::from(cfg.emulation_mode);
    let machine_cfg = Config {
        mode,
        sample_rate: cfg.sample_rate,
        speed: cfg.speed,
        pacing: args.realtime,
        ..Config::default()
    };
    let hardware = mode.resolve(&cart.header);
    let boot_path = args.bootrom.clone().or(if hardware.is_cgb() {
        cfg.cgb_bootrom_path.clone()
    } else {
        cfg.dmg_bootrom_path.clone()
    });
    let mut gb = match boot_path {
        Some(path) => {
            let boot = fs::read(&path)?;
            info!("Running boot ROM {}", path.display());
            GameBoy::with_boot_rom(cart, boot, machine_cfg)
        }
        None => GameBoy::new(cart, machine_cfg),
    };
    gb.set_fast_forward(args.fast);

    if let Some(path) = &args.load_state {
        let data = fs::read(path)?;
        gb.load_state(&data)?;
        info!("Restored snapshot {}", path.display());
    }

    let mut audio_out = match &args.audio {
        Some(path) => {
            let (producer, consumer) = audio_queue(cfg.sample_rate as usize);
            gb.set_sample_sink(Box::new(producer));
            Some((consumer, BufWriter::new(fs::File::create(path)?)))
        }
        None => None,
    };

    let mut frames = 0usize;
    let mut cycles = 0u64;
    let target_frames = args.frames.unwrap_or(DEFAULT_FRAMES);
    loop {
        let done = match args.cycles {
            Some(limit) => cycles >= limit,
            None => frames >= target_frames,
        };
        if done || gb.stop_requested() {
            break;
        }
        cycles += gb.run_frame() as u64;
        frames += 1;
        if let Some((consumer, out)) = audio_out.as_mut() {
            drain_audio(consumer, out)?;
        }
        if args.serial {
            print_serial(&mut gb);
        }
    }
    info!("Ran {frames} frames ({cycles} cycles)");

    if let Some((_, out)) = audio_out.as_mut() {
        out.flush()?;
    }
    if let Some(path) = &args.screenshot {
        write_screenshot(path, gb.ppu.framebuffer())?;
        info!("Saved screenshot to {}", path.display());
    }
    if let Some(path) = &args.save_state {
        fs::write(path, gb.save_state())?;
        info!("Saved snapshot to {}", path.display());
    }
    if cfg.save_battery && gb.cartridge().has_battery() {
        gb.cartridge_mut().save_battery_file(&battery_path)?;
        info!("Saved battery RAM to {}", battery_path.display());
    }
    Ok(())
}

fn drain_audio(consumer: &AudioConsumer, out: &mut impl Write) -> std::io::Result<()> {
    let mut chunk = [(0x80u8, 0x80u8); 512];
    loop {
        let n = consumer.fill(&mut chunk);
        if n == 0 {
            return Ok(());
        }
        for &(left, right) in &chunk[..n] {
            out.write_all(&[left, right])?;
        }
    }
}

fn print_serial(gb: &mut GameBoy) {
    let out = gb.take_serial();
    if !out.is_empty() {
        print!("{}", String::from_utf8_lossy(&out));
        let _ = std::io::stdout().flush();
    }
}

fn frame_to_rgb(frame: &[u32]) -> Vec<u8> {
    let mut out = vec![0u8; frame.len() * 3];
    for (i, &px) in frame.iter().enumerate() {
        out[i * 3] = ((px >> 16) & 0xFF) as u8;
        out[i * 3 + 1] = ((px >> 8) & 0xFF) as u8;
        out[i * 3 + 2] = (px & 0xFF) as u8;
    }
    out
}

fn write_screenshot(path: &Path, frame: &[u32]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let w = BufWriter::new(fs::File::create(path)?);
    let mut encoder = png::Encoder::new(w, SCREEN_WIDTH as u32, SCREEN_HEIGHT as u32);
    encoder.set_color(png::ColorType::Rgb);
    encoder.set_depth(png::BitDepth::Eight);
    let mut writer = encoder.write_header().map_err(std::io::Error::other)?;
    writer
        .write_image_data(&frame_to_rgb(frame))
        .map_err(std::io::Error::other)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_to_rgb_splits_channels() {
        assert_eq!(frame_to_rgb(&[0x00123456, 0x00FFFFFF]), vec![0x12, 0x34, 0x56, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn screenshot_is_a_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shot.png");
        let frame = vec![0x00E0F8D0u32; SCREEN_WIDTH * SCREEN_HEIGHT];
        write_screenshot(&path, &frame).unwrap();
        let data = fs::read(&path).unwrap();
        assert_eq!(&data[1..4], b"PNG");
    }

    #[test]
    fn args_parse() {
        let args = Args::try_parse_from(["gbc-emu", "game.gbc", "--cgb", "--frames", "10"]).unwrap();
        assert!(args.cgb);
        assert_eq!(args.frames, Some(10));
        assert!(Args::try_parse_from(["gbc-emu", "game.gb", "--dmg", "--cgb"]).is_err());
    }
}
