//! Request/response exchange with the boot ROM.
//!
//! Every request is one frame:
//!
//! ```text
//!   +------+--------+----------+--------------+---------------+
//!   | 0x00 | opcode | len: u16 | checksum: u32| payload (len) |
//!   +------+--------+----------+--------------+---------------+
//! ```
//!
//! and every response is one frame with a fixed 8-byte header:
//!
//! ```text
//!   +------+--------+----------+------------+------------+
//!   | 0x01 | opcode | len: u16 | value: u32 | body (len) |
//!   +------+--------+----------+------------+------------+
//! ```
//!
//! All integers are little endian. The message layouts used by the ROM
//! commands are defined once here, each with its own `encode`.

use std::fmt;

use log::{log_enabled, trace, Level::Trace};

use crate::{
    error::{Error, Result},
    session::{Session, Transport},
    slip,
};

/// Seed of the XOR checksum the ROM uses for data blocks and images.
pub const CHECKSUM_MAGIC: u8 = 0xEF;

const DIRECTION_REQUEST: u8 = 0x00;
const DIRECTION_RESPONSE: u8 = 0x01;
const HEADER_LEN: usize = 8;

/// Commands understood by the ESP8266 boot ROM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    MemBegin = 0x05,
    MemEnd = 0x06,
    MemData = 0x07,
    Sync = 0x08,
    WriteReg = 0x09,
    ReadReg = 0x0a,
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({:#04x})", self, *self as u8)
    }
}

/// Fold `data` into `state` by XOR. Chaining calls over consecutive pieces
/// gives the same result as one call over the whole.
pub fn checksum(data: &[u8], state: u8) -> u8 {
    data.iter().fold(state, |acc, b| acc ^ b)
}

// -----------------------------------------------------------------------------
// Wire layouts
// -----------------------------------------------------------------------------

/// Header of a request frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub opcode: u8,
    pub length: u16,
    pub checksum: u32,
}

impl RequestHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = DIRECTION_REQUEST;
        buf[1] = self.opcode;
        buf[2..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }
}

/// Header of a response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub direction: u8,
    pub opcode: u8,
    pub length: u16,
    pub value: u32,
}

impl ResponseHeader {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::Protocol(format!(
                "response header too short ({} bytes)",
                buf.len()
            )));
        }
        Ok(ResponseHeader {
            direction: buf[0],
            opcode: buf[1],
            length: u16::from_le_bytes([buf[2], buf[3]]),
            value: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }
}

/// Arguments of `MemBegin` and `FlashBegin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequest {
    pub size: u32,
    pub blocks: u32,
    pub block_size: u32,
    pub offset: u32,
}

impl BeginRequest {
    pub fn encode(&self) -> Vec<u8> {
        words(&[self.size, self.blocks, self.block_size, self.offset])
    }
}

/// Prefix of `MemData` and `FlashData` payloads; the block follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRequest {
    pub length: u32,
    pub sequence: u32,
}

impl DataRequest {
    pub fn encode(&self, data: &[u8]) -> Vec<u8> {
        let mut buf = words(&[self.length, self.sequence, 0, 0]);
        buf.extend_from_slice(data);
        buf
    }
}

/// Arguments of `MemEnd`. A zero entry point only leaves download mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemEndRequest {
    pub entry_point: u32,
}

impl MemEndRequest {
    pub fn encode(&self) -> Vec<u8> {
        words(&[(self.entry_point == 0) as u32, self.entry_point])
    }
}

/// Arguments of `FlashEnd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashEndRequest {
    pub reboot: bool,
}

impl FlashEndRequest {
    pub fn encode(&self) -> Vec<u8> {
        words(&[(!self.reboot) as u32])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRegRequest {
    pub address: u32,
    pub value: u32,
    pub mask: u32,
    pub delay_us: u32,
}

impl WriteRegRequest {
    pub fn encode(&self) -> Vec<u8> {
        words(&[self.address, self.value, self.mask, self.delay_us])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRegRequest {
    pub address: u32,
}

impl ReadRegRequest {
    pub fn encode(&self) -> Vec<u8> {
        words(&[self.address])
    }
}

// -----------------------------------------------------------------------------
// Exchange
// -----------------------------------------------------------------------------

/// What came back for one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub opcode: u8,
    pub value: u32,
    pub body: Vec<u8>,
}

impl Response {
    /// Memory, flash and register commands answer with a two-byte body of
    /// `(status, last_error)`; anything but `(0, _)` is a failed transfer.
    pub fn check_status(&self, stage: &'static str) -> Result<()> {
        match self.body.as_slice() {
            [0, ..] if self.body.len() >= 2 => Ok(()),
            [status, error, ..] => Err(Error::Transfer {
                stage,
                status: *status,
                error: *error,
            }),
            _ => Err(Error::Protocol(format!(
                "{}: expected a status body, got {} bytes",
                stage,
                self.body.len()
            ))),
        }
    }
}

/// Send one command (when `opcode` is given) and read exactly one response.
///
/// Without an opcode nothing is sent and the next pending response is read,
/// which is how leftover sync replies are drained. The response must start
/// right at a delimiter, come from the ROM, and echo `opcode` when one was
/// given.
pub fn command<T: Transport>(
    session: &mut Session<T>,
    opcode: Option<Opcode>,
    payload: &[u8],
    checksum_seed: u32,
) -> Result<Response> {
    if let Some(op) = opcode {
        if payload.len() > u16::MAX as usize {
            return Err(Error::Precondition(format!(
                "{} payload of {} bytes does not fit the request header",
                op,
                payload.len()
            )));
        }
        let header = RequestHeader {
            opcode: op as u8,
            length: payload.len() as u16,
            checksum: checksum_seed,
        };
        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.extend_from_slice(&header.encode());
        frame.extend_from_slice(payload);
        trace!(
            "=> {} len:{} chk:{:#04x}",
            op,
            payload.len(),
            checksum_seed
        );
        slip::write_frame(session.port(), &frame)?;
    }

    let port = session.port();
    slip::expect_end(port)?;
    let header = ResponseHeader::decode(&slip::read_escaped(port, HEADER_LEN)?)?;
    let body = slip::read_escaped(port, header.length as usize)?;
    slip::expect_end(port)?;

    trace!(
        "<= op:{:#04x} value:{:#010x} body:{} bytes",
        header.opcode,
        header.value,
        body.len()
    );
    if log_enabled!(Trace) && !body.is_empty() {
        trace!(
            "\n{}",
            hexplay::HexViewBuilder::new(&body)
                .address_offset(0)
                .row_width(16)
                .finish()
        );
    }

    if header.direction != DIRECTION_RESPONSE {
        return Err(Error::Protocol(format!(
            "not a response (direction byte {:#04x})",
            header.direction
        )));
    }
    if let Some(op) = opcode {
        if header.opcode != op as u8 {
            return Err(Error::Protocol(format!(
                "response to {} echoes opcode {:#04x}",
                op, header.opcode
            )));
        }
    }

    Ok(Response {
        opcode: header.opcode,
        value: header.value,
        body,
    })
}

fn words(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes().to_vec()).collect()
}

// =============================================================================
// Unit Tests
// =============================================================================
