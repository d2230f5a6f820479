use std::io;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::frame::FrameError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] FrameError),
    #[error("stream closed for writing")]
    StreamClosed,
    #[error("stream reset")]
    StreamReset,
    #[error("session closed")]
    SessionClosed,
    #[error("stream ids exhausted")]
    StreamIdsExhausted,
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::InvalidConfig(_) => io::ErrorKind::InvalidInput,
            Error::Transport(_) => io::ErrorKind::BrokenPipe,
            Error::MalformedFrame(_) => io::ErrorKind::InvalidData,
            Error::StreamClosed => io::ErrorKind::BrokenPipe,
            Error::StreamReset => io::ErrorKind::ConnectionReset,
            Error::SessionClosed => io::ErrorKind::NotConnected,
            Error::StreamIdsExhausted => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

/// A write that stopped before handing off every byte.
#[derive(Debug, Error)]
#[error("{source} after writing {written} bytes")]
pub struct WriteError {
    /// Bytes enqueued before the failure.
    pub written: usize,
    #[source]
    pub source: Error,
}

impl From<WriteError> for io::Error {
    fn from(err: WriteError) -> Self {
        err.source.into()
    }
}
