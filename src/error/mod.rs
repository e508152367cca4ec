use std::io;

use thiserror::Error;

use crate::punch::PunchedPair;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io")]
    Io(#[from] io::Error),
    #[error("port pool exhausted")]
    PortExhausted,
    #[error("unknown service: {0}")]
    UnknownService(String),
    #[error("nat punch attempt timed out")]
    NatPunchAttemptTimedOut,
    /// Fewer pairs punched than requested; carries the pairs that did succeed.
    #[error("not enough connections")]
    NotEnoughConnections(Vec<PunchedPair>),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("shutdown")]
    Shutdown,
}

pub type Result<T, E = Error> = ::std::result::Result<T, E>;
