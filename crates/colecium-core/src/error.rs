use std::fmt;

use crate::memory::cpu::BIOS_SIZE;

#[derive(Debug)]
pub enum Error {
    /// ROM image does not carry the `AA 55` / `55 AA` magic word.
    InvalidRom,
    /// BIOS images must be exactly 8 KiB.
    InvalidBios { actual: usize },
    /// State blob length does not match [`crate::console::Console::STATE_SIZE`].
    StateSize { expected: usize, actual: usize },
    /// Wrapper for I/O errors raised while reading or writing files.
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRom => write!(f, "missing ColecoVision magic word (AA55/55AA)"),
            Self::InvalidBios { actual } => {
                write!(f, "BIOS must be {BIOS_SIZE} bytes, got {actual}")
            }
            Self::StateSize { expected, actual } => {
                write!(f, "state blob expected {expected} bytes, got {actual}")
            }
            Self::Io(err) => write!(f, "i/o error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}
