//! Loading and starting a helper program ("stub") in device RAM.
//!
//! A stub is described by a JSON document produced when the stub is built:
//!
//! ```json
//! {
//!   "entry": 1074792024,
//!   "params_start": 1074790400,
//!   "code_start": 1074790404,
//!   "num_params": 1,
//!   "code": "0800006...",
//!   "data_start": 1073643520,
//!   "data": "6205104..."
//! }
//! ```
//!
//! The stub's parameters are 32-bit words placed right before its code, so
//! both are uploaded as one blob starting at `params_start`.

use std::{convert::TryFrom, fs, path::Path};

use log::{debug, info, log_enabled, Level::Debug};
use serde::Deserialize;

use super::loader::{Destination, MemoryLoader, RAM_BLOCK_SIZE};
use crate::{
    error::{Error, Result},
    session::{Session, Transport},
    slip,
};

const FLASHER_STUB_JSON: &str = include_str!("../../stubs/flasher_stub.json");

/// Initialised data uploaded next to the code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubData {
    pub address: u32,
    pub bytes: Vec<u8>,
}

/// A validated stub, ready to upload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawStub")]
pub struct StubDescriptor {
    pub entry: u32,
    pub params_start: u32,
    pub num_params: usize,
    pub code: Vec<u8>,
    pub data: Option<StubData>,
}

#[derive(Deserialize)]
struct RawStub {
    entry: u32,
    params_start: u32,
    #[serde(default)]
    code_start: Option<u32>,
    num_params: usize,
    code: String,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    data_start: Option<u32>,
}

impl TryFrom<RawStub> for StubDescriptor {
    type Error = Error;

    fn try_from(raw: RawStub) -> Result<Self> {
        let code = hex::decode(raw.code.trim())?;
        if code.is_empty() {
            return Err(Error::StubFormat("stub has no code".into()));
        }
        if let Some(code_start) = raw.code_start {
            let expected = raw.params_start as u64 + 4 * raw.num_params as u64;
            if code_start as u64 != expected {
                return Err(Error::StubFormat(format!(
                    "code starts at {:#010x}, but {} params at {:#010x} end at {:#010x}",
                    code_start, raw.num_params, raw.params_start, expected
                )));
            }
        }
        let data = match (raw.data, raw.data_start) {
            (Some(hex_data), Some(address)) => Some(StubData {
                address,
                bytes: hex::decode(hex_data.trim())?,
            }),
            (None, None) => None,
            _ => {
                return Err(Error::StubFormat(
                    "data and data_start must be given together".into(),
                ))
            }
        };

        Ok(StubDescriptor {
            entry: raw.entry,
            params_start: raw.params_start,
            num_params: raw.num_params,
            code,
            data,
        })
    }
}

impl StubDescriptor {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// The flasher stub shipped with this crate.
    pub fn flasher() -> Result<Self> {
        Self::from_json(FLASHER_STUB_JSON)
    }

    /// Parameter words followed by the code, as laid out at `params_start`.
    pub fn code_blob(&self, params: &[u32]) -> Result<Vec<u8>> {
        if params.len() != self.num_params {
            return Err(Error::Precondition(format!(
                "stub takes {} params, {} given",
                self.num_params,
                params.len()
            )));
        }
        let mut blob = Vec::with_capacity(4 * params.len() + self.code.len());
        for param in params {
            blob.extend_from_slice(&param.to_le_bytes());
        }
        blob.extend_from_slice(&self.code);
        Ok(blob)
    }
}

/// Upload `stub` with `params` into RAM and jump to its entry point.
///
/// With `capture_output` the frames the stub sends back are collected until
/// it sends an empty one, which is not included in the result.
pub fn run_stub<T: Transport>(
    session: &mut Session<T>,
    stub: &StubDescriptor,
    params: &[u32],
    capture_output: bool,
) -> Result<Option<Vec<Vec<u8>>>> {
    let blob = stub.code_blob(params)?;
    debug!(
        "Uploading stub: {} bytes at {:#010x}, entry {:#010x}",
        blob.len(),
        stub.params_start,
        stub.entry
    );

    {
        let mut loader = MemoryLoader::new(session, Destination::Ram);
        loader.upload(&blob, stub.params_start, RAM_BLOCK_SIZE, |_| {})?;
        if let Some(data) = &stub.data {
            debug!(
                "Uploading stub data: {} bytes at {:#010x}",
                data.bytes.len(),
                data.address
            );
            loader.upload(&data.bytes, data.address, RAM_BLOCK_SIZE, |_| {})?;
        }
        loader.finish(stub.entry)?;
    }
    info!("Stub running at {:#010x}", stub.entry);

    if !capture_output {
        return Ok(None);
    }

    let mut frames = Vec::new();
    loop {
        let frame = slip::read_frame(session.port())?;
        if frame.is_empty() {
            return Ok(Some(frames));
        }
        if log_enabled!(Debug) {
            debug!(
                "Stub output:\n{}",
                hexplay::HexViewBuilder::new(&frame)
                    .row_width(16)
                    .finish()
            );
        }
        frames.push(frame);
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
