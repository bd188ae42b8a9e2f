use std::io;

use quinn::{ConnectError, ConnectionError, ReadToEndError, WriteError};
use thiserror::Error;

use crate::broker::error::BrokerError;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect: {0}")]
    Connect(#[from] ConnectError),
    #[error("connection: {0}")]
    Connection(#[from] ConnectionError),
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("write: {0}")]
    Write(#[from] WriteError),
    #[error("read: {0}")]
    Read(#[from] ReadToEndError),
    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),
    #[error("certificate: {0}")]
    Certificate(String),
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("could not encode {0}")]
    CouldNotEncode(&'static str),
}

impl From<TransportError> for BrokerError {
    fn from(error: TransportError) -> Self {
        BrokerError::Transport(error.to_string())
    }
}
