use thiserror::Error;

use weft_exec::BlockError;

/// Engine errors.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("untranslatable instruction at {pc:#x}: {reason}")]
    Translation { pc: u64, reason: String },

    #[error("resource error: {0}")]
    Resource(#[from] BlockError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("execution broke to host with a corrupt origin cell {origin:#x}")]
    CorruptOrigin { origin: u64 },
}

pub type Result<T> = std::result::Result<T, Error>;
