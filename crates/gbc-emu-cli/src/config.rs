use log::warn;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use gbc_emu_core::hardware::EmulationMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ModeSetting {
    #[default]
    Auto,
    ForceDmg,
    ForceCgb,
}

impl From<ModeSetting> for EmulationMode {
    fn from(mode: ModeSetting) -> Self {
        match mode {
            ModeSetting::Auto => EmulationMode::Auto,
            ModeSetting::ForceDmg => EmulationMode::ForceDmg,
            ModeSetting::ForceCgb => EmulationMode::ForceCgb,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub dmg_bootrom_path: Option<PathBuf>,
    pub cgb_bootrom_path: Option<PathBuf>,
    pub emulation_mode: ModeSetting,
    pub sample_rate: u32,
    pub speed: f64,
    /// Write battery RAM next to the ROM on exit.
    pub save_battery: bool,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            dmg_bootrom_path: None,
            cgb_bootrom_path: None,
            emulation_mode: ModeSetting::Auto,
            sample_rate: gbc_emu_core::apu::DEFAULT_SAMPLE_RATE,
            speed: 1.0,
            save_battery: true,
        }
    }
}

pub fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Some(appdata) = std::env::var_os("APPDATA") {
            return PathBuf::from(appdata).join("gbc-emu").join("cli.toml");
        }
    }

    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("gbc-emu").join("cli.toml");
    }

    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home)
            .join(".config")
            .join("gbc-emu")
            .join("cli.toml");
    }

    PathBuf::from("cli.toml")
}

pub fn load_from_file(path: &Path) -> CliConfig {
    let text = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(_) => return CliConfig::default(),
    };

    match toml::from_str::<CliConfig>(&text) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(
                "Failed to parse config {}: {e}; using defaults",
                path.display()
            );
            CliConfig::default()
        }
    }
}

pub fn save_to_file(path: &Path, cfg: &CliConfig) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let text = toml::to_string_pretty(cfg).map_err(std::io::Error::other)?;
    std::fs::write(path, text)
}
