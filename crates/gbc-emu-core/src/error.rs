use thiserror::Error;

/// Problems with a cartridge image, detected before emulation starts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CartridgeError {
    #[error("cartridge image is {0} bytes, shorter than the 0x150-byte header")]
    TooShort(usize),

    #[error("unsupported cartridge type byte 0x{0:02X}")]
    UnsupportedType(u8),

    #[error("invalid ROM size code 0x{0:02X}")]
    BadRomSize(u8),

    #[error("invalid RAM size code 0x{0:02X}")]
    BadRamSize(u8),
}

/// Problems decoding a snapshot or battery stream, or a stream that does not
/// match the machine it is being loaded into.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("stream does not start with the expected magic")]
    BadMagic,

    #[error("unsupported stream version {0}")]
    BadVersion(u16),

    #[error("unknown section tag {0:?}")]
    UnknownTag(String),

    #[error("section {0:?} appears more than once")]
    DuplicateSection(String),

    #[error("required section {0:?} is missing")]
    MissingSection(&'static str),

    #[error("stream ended inside section {0:?}")]
    Truncated(&'static str),

    #[error("section {section:?} has {extra} unread bytes")]
    TrailingBytes { section: &'static str, extra: usize },

    #[error("{what} mismatch: stream has {found}, machine has {expected}")]
    Mismatch {
        what: &'static str,
        expected: u64,
        found: u64,
    },

    #[error("invalid value {value} for {what}")]
    InvalidValue { what: &'static str, value: u64 },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Cartridge(#[from] CartridgeError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
