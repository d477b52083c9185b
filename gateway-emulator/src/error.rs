//! Error types for the gateway emulator.

use wsn_common::FrameError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Unexpected request: {0}")]
    UnexpectedRequest(String),
}

pub type Result<T> = std::result::Result<T, Error>;
