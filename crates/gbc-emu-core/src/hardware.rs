use log::warn;

use crate::cartridge::Header;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
/// Console hardware being emulated.
pub enum Model {
    #[default]
    Dmg,
    Cgb,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
/// How the hardware model is picked for a cartridge.
pub enum EmulationMode {
    /// Colour hardware for cartridges that support it, monochrome otherwise.
    #[default]
    Auto,
    ForceDmg,
    ForceCgb,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Resolved hardware configuration for one cartridge.
pub struct Hardware {
    pub model: Model,
    /// Colour hardware running monochrome software.
    pub compat: bool,
}

impl Hardware {
    #[inline]
    pub const fn is_cgb(self) -> bool {
        matches!(self.model, Model::Cgb)
    }
}

impl EmulationMode {
    pub fn resolve(self, header: &Header) -> Hardware {
        match self {
            EmulationMode::Auto if header.cgb_supported() => Hardware {
                model: Model::Cgb,
                compat: false,
            },
            EmulationMode::Auto => Hardware {
                model: Model::Dmg,
                compat: false,
            },
            EmulationMode::ForceCgb => Hardware {
                model: Model::Cgb,
                compat: !header.cgb_supported(),
            },
            EmulationMode::ForceDmg => {
                if header.cgb_only() {
                    warn!("'{}' requires colour hardware; running it on DMG anyway", header.title);
                }
                Hardware {
                    model: Model::Dmg,
                    compat: false,
                }
            }
        }
    }
}
