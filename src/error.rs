use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    #[error("port {port} already subscribed")]
    AddrInUse { port: u16 },

    #[error("not found")]
    NotFound,

    #[error("descriptor limit reached ({limit})")]
    ResourceExhausted { limit: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("parse error: {0}")]
    Parse(&'static str),

    #[error("capture format error: {0}")]
    Format(String),
}

impl Error {
    /// Last errno as an `Error::Io`, for raw libc call sites.
    pub(crate) fn last_os() -> Self {
        Error::Io(io::Error::last_os_error())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
