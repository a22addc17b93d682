use sip_types::header::HeaderError;
use std::io;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error("request timed out")]
    RequestTimedOut,
    #[error("no transport available for {0}")]
    NoTransport(String),
    #[error("endpoint is shutting down")]
    Cancelled,
}
