//! Error types shared by every layer of the flashing flow.
//!
//! Errors are split by the phase that produced them so that the caller can
//! tell a noisy line (`Framing`) from a confused device (`Protocol`) or an
//! unverified flash (`DigestMismatch`, `Write`). Only the connection retry loop
//! swallows errors; everything else propagates to the top-level operation.

use std::io;

use thiserror::Error;

/// Result alias used throughout `flashcom`.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or badly escaped byte stream.
    #[error("framing error: {0}")]
    Framing(String),

    /// A response that does not match what was requested.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The boot ROM never answered the sync handshake.
    #[error("failed to connect to the boot ROM after {attempts} sync attempts")]
    Connect { attempts: usize },

    /// Non-OK status during a begin/block/end exchange with the ROM.
    #[error("{stage} failed (status {status:#04x}, error {error:#04x})")]
    Transfer {
        stage: &'static str,
        status: u8,
        error: u8,
    },

    /// The stub reported a digest for the transferred data that differs from
    /// the locally computed one.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// The stub answered a command with a non-zero status code.
    #[error("stub command {command} failed with status {status:#04x}")]
    Write { command: &'static str, status: u8 },

    /// Arguments rejected before any I/O took place.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A blocking read did not complete within the configured timeout.
    #[error("timed out waiting for the device")]
    Timeout,

    /// Structural problem in a firmware image.
    #[error("invalid firmware image: {0}")]
    Image(String),

    /// Unusable stub descriptor document.
    #[error("invalid stub descriptor: {0}")]
    StubFormat(String),

    #[error(transparent)]
    Serial(#[from] serialport::Error),

    #[error(transparent)]
    Io(io::Error),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::Timeout,
            _ => Error::Io(err),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::StubFormat(err.to_string())
    }
}

impl From<hex::FromHexError> for Error {
    fn from(err: hex::FromHexError) -> Self {
        Error::StubFormat(err.to_string())
    }
}

#[test]
fn timed_out_io_maps_to_timeout() {
    let err: Error = io::Error::new(io::ErrorKind::TimedOut, "no data").into();
    assert!(matches!(err, Error::Timeout));
}

#[test]
fn other_io_is_kept() {
    let err: Error = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
    assert!(matches!(err, Error::Io(_)));
}

#[test]
fn transfer_message_names_stage() {
    let err = Error::Transfer {
        stage: "flash begin",
        status: 1,
        error: 5,
    };
    assert_eq!(err.to_string(), "flash begin failed (status 0x01, error 0x05)");
}
