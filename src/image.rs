//! Firmware image container understood by the ESP8266 boot ROM.
//!
//! ```text
//!   magic: u8 (0xE9) | segment count: u8 | flash mode: u8 | size/freq: u8
//!   entry point: u32
//!   { address: u32 | size: u32 | data (size bytes) } * segment count
//!   zero padding up to the last byte of a 16-byte line
//!   checksum: u8
//! ```
//!
//! The checksum is the XOR fold of every segment's data, seeded like the ROM
//! block checksum. Headers are not covered.

use std::{fmt, fs, path::Path, str::FromStr};

use crate::{
    error::{Error, Result},
    rom::protocol::{checksum, CHECKSUM_MAGIC},
};

/// First byte of every image.
pub const IMAGE_MAGIC: u8 = 0xE9;
/// Largest segment table the ROM loader accepts.
pub const MAX_SEGMENTS: usize = 16;
/// Largest single segment.
pub const MAX_SEGMENT_SIZE: u32 = 65536;
/// Lowest plausible load address (start of data RAM).
pub const SEGMENT_ADDR_MIN: u32 = 0x3ffe_0000;
/// Highest plausible load address (start of the flash mapping).
pub const SEGMENT_ADDR_MAX: u32 = 0x4020_0000;

const HEADER_LEN: usize = 8;

// =============================================================================
// Segments and images
// =============================================================================

/// One contiguous piece of the image, loaded at `address`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub address: u32,
    pub data: Vec<u8>,
}

impl Segment {
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }
}

/// In-memory firmware image.
///
/// Segments can only be appended through [`add_segment`](Self::add_segment),
/// which keeps the stored checksum in step with the data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    pub entry_point: u32,
    pub flash_mode: u8,
    pub flash_size_freq: u8,
    segments: Vec<Segment>,
    checksum: u8,
}

impl Default for FirmwareImage {
    fn default() -> Self {
        Self::new(0)
    }
}

impl FirmwareImage {
    pub fn new(entry_point: u32) -> Self {
        FirmwareImage {
            entry_point,
            flash_mode: 0,
            flash_size_freq: 0,
            segments: Vec::new(),
            checksum: CHECKSUM_MAGIC,
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Checksum byte as stored in the parsed file, or as computed for an
    /// image built in memory.
    pub fn checksum(&self) -> u8 {
        self.checksum
    }

    pub fn calculate_checksum(&self) -> u8 {
        self.segments
            .iter()
            .fold(CHECKSUM_MAGIC, |acc, s| checksum(&s.data, acc))
    }

    pub fn checksum_valid(&self) -> bool {
        self.checksum == self.calculate_checksum()
    }

    /// Append a segment. Data is zero-padded to a word boundary and empty
    /// data is ignored.
    pub fn add_segment(&mut self, address: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if self.segments.len() >= MAX_SEGMENTS {
            return Err(Error::Image(format!(
                "no room for another segment (limit is {})",
                MAX_SEGMENTS
            )));
        }
        let mut data = data.to_vec();
        if data.len() % 4 != 0 {
            data.resize(data.len() + 4 - data.len() % 4, 0);
        }
        check_segment(address, data.len() as u64)?;

        self.segments.push(Segment { address, data });
        self.checksum = self.calculate_checksum();
        Ok(())
    }

    /// Parse a complete image file.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);
        let header = reader.take(HEADER_LEN, "image header")?;
        let (magic, count) = (header[0], header[1] as usize);
        if magic != IMAGE_MAGIC {
            return Err(Error::Image(format!(
                "bad magic {:#04x}, expected {:#04x}",
                magic, IMAGE_MAGIC
            )));
        }
        if count > MAX_SEGMENTS {
            return Err(Error::Image(format!(
                "{} segments declared, at most {} allowed",
                count, MAX_SEGMENTS
            )));
        }

        let mut image = FirmwareImage {
            entry_point: le_u32(&header[4..8]),
            flash_mode: header[2],
            flash_size_freq: header[3],
            segments: Vec::with_capacity(count),
            checksum: 0,
        };
        for index in 0..count {
            let table = reader.take(8, "segment header")?;
            let (address, size) = (le_u32(&table[0..4]), le_u32(&table[4..8]));
            check_segment(address, size as u64)?;
            let data = reader.take(size as usize, "segment data").map_err(|_| {
                Error::Image(format!(
                    "file ends inside segment {} ({:#010x}, {} bytes)",
                    index + 1,
                    address,
                    size
                ))
            })?;
            image.segments.push(Segment {
                address,
                data: data.to_vec(),
            });
        }

        reader.take(padding_len(reader.position()), "padding")?;
        image.checksum = reader.take(1, "checksum")?[0];
        Ok(image)
    }

    /// Serialise the image, recomputing the checksum.
    pub fn to_bytes(&self) -> Vec<u8> {
        let body: usize = self.segments.iter().map(|s| 8 + s.data.len()).sum();
        let mut out = Vec::with_capacity(HEADER_LEN + body + 16);
        out.extend_from_slice(&[
            IMAGE_MAGIC,
            self.segments.len() as u8,
            self.flash_mode,
            self.flash_size_freq,
        ]);
        out.extend_from_slice(&self.entry_point.to_le_bytes());
        for segment in &self.segments {
            out.extend_from_slice(&segment.address.to_le_bytes());
            out.extend_from_slice(&segment.size().to_le_bytes());
            out.extend_from_slice(&segment.data);
        }
        out.resize(out.len() + padding_len(out.len()), 0);
        out.push(self.calculate_checksum());
        out
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::parse(&fs::read(path)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_bytes())?;
        Ok(())
    }
}

impl fmt::Display for FirmwareImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.entry_point != 0 {
            writeln!(f, "Entry point: {:08x}", self.entry_point)?;
        } else {
            writeln!(f, "Entry point not set")?;
        }
        writeln!(f, "{} segments", self.segments.len())?;
        for (index, segment) in self.segments.iter().enumerate() {
            writeln!(
                f,
                "Segment {}: {:5} bytes at {:08x}",
                index + 1,
                segment.size(),
                segment.address
            )?;
        }
        write!(
            f,
            "Checksum: {:02x} ({})",
            self.checksum,
            if self.checksum_valid() {
                "valid"
            } else {
                "invalid!"
            }
        )
    }
}

// =============================================================================
// Flash parameters
// =============================================================================

/// SPI access mode written into byte 2 of the image header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashMode {
    Qio = 0,
    Qout = 1,
    Dio = 2,
    Dout = 3,
}

/// Flash chip size (upper nibble of byte 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashSize {
    Mbit4 = 0x00,
    Mbit2 = 0x10,
    Mbit8 = 0x20,
    Mbit16 = 0x30,
    Mbit32 = 0x40,
    Mbit16C1 = 0x50,
    Mbit32C1 = 0x60,
    Mbit32C2 = 0x70,
}

/// SPI clock (lower nibble of byte 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashFreq {
    Mhz40 = 0x0,
    Mhz26 = 0x1,
    Mhz20 = 0x2,
    Mhz80 = 0xf,
}

impl FromStr for FlashMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "qio" => Ok(FlashMode::Qio),
            "qout" => Ok(FlashMode::Qout),
            "dio" => Ok(FlashMode::Dio),
            "dout" => Ok(FlashMode::Dout),
            _ => Err(Error::Precondition(format!("unknown flash mode '{}'", s))),
        }
    }
}

impl FromStr for FlashSize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "4m" => Ok(FlashSize::Mbit4),
            "2m" => Ok(FlashSize::Mbit2),
            "8m" => Ok(FlashSize::Mbit8),
            "16m" => Ok(FlashSize::Mbit16),
            "32m" => Ok(FlashSize::Mbit32),
            "16m-c1" => Ok(FlashSize::Mbit16C1),
            "32m-c1" => Ok(FlashSize::Mbit32C1),
            "32m-c2" => Ok(FlashSize::Mbit32C2),
            _ => Err(Error::Precondition(format!("unknown flash size '{}'", s))),
        }
    }
}

impl FromStr for FlashFreq {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "40m" => Ok(FlashFreq::Mhz40),
            "26m" => Ok(FlashFreq::Mhz26),
            "20m" => Ok(FlashFreq::Mhz20),
            "80m" => Ok(FlashFreq::Mhz80),
            _ => Err(Error::Precondition(format!(
                "unknown flash frequency '{}'",
                s
            ))),
        }
    }
}

/// The two header bytes describing the flash chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashParams {
    pub mode: FlashMode,
    pub size: FlashSize,
    pub freq: FlashFreq,
}

impl Default for FlashParams {
    fn default() -> Self {
        FlashParams {
            mode: FlashMode::Qio,
            size: FlashSize::Mbit4,
            freq: FlashFreq::Mhz40,
        }
    }
}

impl FlashParams {
    pub fn to_bytes(self) -> [u8; 2] {
        [self.mode as u8, self.size as u8 | self.freq as u8]
    }
}

/// Prepare a file for writing at `address`: an image written at the start of
/// flash gets its flash parameters replaced, and everything is padded with
/// `0xFF` to whole sectors.
pub fn prepare_flash_data(address: u32, mut data: Vec<u8>, params: FlashParams) -> Vec<u8> {
    if address == 0 && data.len() >= 4 && data[0] == IMAGE_MAGIC {
        data[2..4].copy_from_slice(&params.to_bytes());
    }
    let sector = crate::rom::loader::FLASH_SECTOR_SIZE as usize;
    if data.len() % sector != 0 {
        data.resize(data.len() + sector - data.len() % sector, 0xFF);
    }
    data
}

// =============================================================================
// Private stuff
// =============================================================================

fn check_segment(address: u32, size: u64) -> Result<()> {
    if address < SEGMENT_ADDR_MIN || address > SEGMENT_ADDR_MAX || size > MAX_SEGMENT_SIZE as u64
    {
        return Err(Error::Image(format!(
            "suspicious segment {:#010x}, length {}",
            address, size
        )));
    }
    Ok(())
}

/// Zero bytes needed after `len` bytes so that the checksum lands on the
/// last byte of a 16-byte line.
fn padding_len(len: usize) -> usize {
    15 - len % 16
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        ByteReader { bytes, pos: 0 }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).filter(|end| *end <= self.bytes.len());
        match end {
            Some(end) => {
                let slice = &self.bytes[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(Error::Image(format!(
                "file ends in {} at offset {}",
                what, self.pos
            ))),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
