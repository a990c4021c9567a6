//! Operations served directly by the boot ROM, without a stub.

use std::fmt;

use log::{debug, info};

use super::{
    loader::{Destination, MemoryLoader, FLASH_BLOCK_SIZE, RAM_BLOCK_SIZE},
    protocol::{command, Opcode, ReadRegRequest, WriteRegRequest},
};
use crate::{
    error::{Error, Result},
    image::FirmwareImage,
    session::{Session, Transport},
};

/// OTP words holding the factory MAC.
const OTP_MAC0: u32 = 0x3ff0_0050;
const OTP_MAC1: u32 = 0x3ff0_0054;

/// SPI controller registers used to fetch the flash JEDEC id.
const SPI_W0: u32 = 0x6000_0240;
const SPI_CMD: u32 = 0x6000_0200;
const SPI_CMD_RDID: u32 = 0x1000_0000;

// =============================================================================
// Registers
// =============================================================================

pub fn read_reg<T: Transport>(session: &mut Session<T>, address: u32) -> Result<u32> {
    let response = command(
        session,
        Some(Opcode::ReadReg),
        &ReadRegRequest { address }.encode(),
        0,
    )?;
    response.check_status("read reg")?;
    Ok(response.value)
}

/// Read-modify-write of the bits in `mask`, followed by a delay of
/// `delay_us` on the device.
pub fn write_reg<T: Transport>(
    session: &mut Session<T>,
    address: u32,
    value: u32,
    mask: u32,
    delay_us: u32,
) -> Result<()> {
    let request = WriteRegRequest {
        address,
        value,
        mask,
        delay_us,
    };
    command(session, Some(Opcode::WriteReg), &request.encode(), 0)?.check_status("write reg")
}

/// Read `size` bytes of device memory one word at a time. A trailing partial
/// word is not read.
pub fn dump_mem<T: Transport>(
    session: &mut Session<T>,
    address: u32,
    size: u32,
    mut progress: impl FnMut(usize),
) -> Result<Vec<u8>> {
    let words = size / 4;
    let mut data = Vec::with_capacity(words as usize * 4);
    for i in 0..words {
        let word = read_reg(session, address.wrapping_add(i * 4))?;
        data.extend_from_slice(&word.to_le_bytes());
        progress(data.len());
    }
    Ok(data)
}

// =============================================================================
// Identification
// =============================================================================

/// Station MAC address as programmed at the factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddress(pub [u8; 6]);

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

pub fn read_mac<T: Transport>(session: &mut Session<T>) -> Result<MacAddress> {
    let mac0 = read_reg(session, OTP_MAC0)?;
    let mac1 = read_reg(session, OTP_MAC1)?;
    let oui = match (mac1 >> 16) & 0xff {
        0 => [0x18, 0xfe, 0x34],
        1 => [0xac, 0xd0, 0x74],
        other => {
            return Err(Error::Protocol(format!(
                "unknown OUI id {:#04x} in OTP word {:#010x}",
                other, mac1
            )))
        }
    };
    Ok(MacAddress([
        oui[0],
        oui[1],
        oui[2],
        (mac1 >> 8) as u8,
        mac1 as u8,
        (mac0 >> 24) as u8,
    ]))
}

/// JEDEC id of the SPI flash chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashId(pub u32);

impl FlashId {
    pub fn manufacturer(self) -> u8 {
        self.0 as u8
    }

    pub fn device(self) -> u16 {
        ((self.0 >> 8) as u8 as u16) << 8 | (self.0 >> 16) as u8 as u16
    }

    /// Size of the chip in bytes. The last id byte is the capacity as a power
    /// of two; ids without a manufacturer or with an implausible capacity
    /// give `None`.
    pub fn capacity(self) -> Option<u32> {
        let exponent = (self.0 >> 16) as u8;
        if self.manufacturer() == 0 || !(19..=31).contains(&exponent) {
            return None;
        }
        Some(1 << exponent)
    }
}

impl fmt::Display for FlashId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Manufacturer: {:02x}, Device: {:04x}",
            self.manufacturer(),
            self.device()
        )
    }
}

/// An empty flash transfer makes the ROM attach the SPI flash, after which
/// the controller registers can be driven directly.
pub fn flash_id<T: Transport>(session: &mut Session<T>) -> Result<FlashId> {
    attach_flash(session)?;
    write_reg(session, SPI_W0, 0, 0xffff_ffff, 0)?;
    write_reg(session, SPI_CMD, SPI_CMD_RDID, 0xffff_ffff, 0)?;
    let id = read_reg(session, SPI_W0)?;
    MemoryLoader::new(session, Destination::Flash).finish(0)?;
    Ok(FlashId(id))
}

// =============================================================================
// Loading and running
// =============================================================================

/// Leave download mode and run the firmware in flash, rebooting first when
/// `reboot` is set.
pub fn run<T: Transport>(session: &mut Session<T>, reboot: bool) -> Result<()> {
    attach_flash(session)?;
    MemoryLoader::new(session, Destination::Flash).finish(reboot as u32)
}

/// Load every segment of `image` into RAM and jump to its entry point.
pub fn load_ram<T: Transport>(
    session: &mut Session<T>,
    image: &FirmwareImage,
    mut progress: impl FnMut(usize),
) -> Result<()> {
    let mut loader = MemoryLoader::new(session, Destination::Ram);
    let mut done = 0usize;
    for segment in image.segments() {
        info!(
            "Downloading {} bytes at {:08x}",
            segment.size(),
            segment.address
        );
        loader.upload(&segment.data, segment.address, RAM_BLOCK_SIZE, |n| {
            progress(done + n)
        })?;
        done += segment.data.len();
    }
    info!("All segments done, executing at {:08x}", image.entry_point);
    loader.finish(image.entry_point)
}

/// Write `data` to flash through the ROM alone. Slow, but needs nothing but
/// the ROM. The flash stays attached afterwards; finish with [`run`].
pub fn write_flash<T: Transport>(
    session: &mut Session<T>,
    address: u32,
    data: &[u8],
    progress: impl FnMut(usize),
) -> Result<()> {
    debug!("ROM flash write: {} bytes at {:#010x}", data.len(), address);
    MemoryLoader::new(session, Destination::Flash).upload(data, address, FLASH_BLOCK_SIZE, progress)
}

fn attach_flash<T: Transport>(session: &mut Session<T>) -> Result<()> {
    MemoryLoader::new(session, Destination::Flash).begin(0, 0, FLASH_BLOCK_SIZE, 0)
}

// =============================================================================
// Unit Tests
// =============================================================================
