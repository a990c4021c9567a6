//! Begin/block/end download protocol of the ROM, for RAM and for flash.
//!
//! A transfer is opened with `begin`, fed with sequentially numbered blocks
//! and closed with `finish`. Blocks are never retried: any non-OK status
//! aborts the whole transfer and whatever reached flash must be considered
//! unreliable.

use std::time::Duration;

use log::{debug, trace};

use super::protocol::{
    checksum, command, BeginRequest, DataRequest, FlashEndRequest, MemEndRequest, Opcode,
    CHECKSUM_MAGIC,
};
use crate::{
    error::{Error, Result},
    session::{Session, Transport},
};

/// Largest block the ROM accepts for RAM downloads.
pub const RAM_BLOCK_SIZE: u32 = 0x1800;
/// Block size used for ROM flash writes.
pub const FLASH_BLOCK_SIZE: u32 = 0x400;
/// Smallest erasable unit of the SPI flash.
pub const FLASH_SECTOR_SIZE: u32 = 4096;
/// Sectors in one 64 KiB erase block.
pub const SECTORS_PER_BLOCK: u32 = 16;

/// Erasing happens inside `FlashBegin`, so it gets a longer timeout.
const FLASH_BEGIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a download goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Device RAM; the data can be executed right after `finish`.
    Ram,
    /// SPI flash; the region is erased by `begin`.
    Flash,
}

impl Destination {
    fn opcodes(self) -> (Opcode, Opcode, Opcode) {
        match self {
            Destination::Ram => (Opcode::MemBegin, Opcode::MemData, Opcode::MemEnd),
            Destination::Flash => (Opcode::FlashBegin, Opcode::FlashData, Opcode::FlashEnd),
        }
    }

    fn stage(self, step: usize) -> &'static str {
        const RAM: [&str; 3] = ["mem begin", "mem data", "mem end"];
        const FLASH: [&str; 3] = ["flash begin", "flash data", "flash end"];
        match self {
            Destination::Ram => RAM[step],
            Destination::Flash => FLASH[step],
        }
    }
}

/// Number of bytes the ROM should erase for a write of `size` bytes at
/// `addr`.
///
/// The ROM erases more than it is asked to around the first erase block, so
/// short regions ask for roughly half of what they need. The result is what
/// existing images were flashed with and is kept as is.
pub fn erase_size(size: u32, addr: u32) -> u32 {
    let num_sectors = block_count(size, FLASH_SECTOR_SIZE);
    let start_sector = addr / FLASH_SECTOR_SIZE;

    let head_sectors = (SECTORS_PER_BLOCK - (start_sector % SECTORS_PER_BLOCK)).min(num_sectors);

    if num_sectors < 2 * head_sectors {
        (num_sectors + 1) / 2 * FLASH_SECTOR_SIZE
    } else {
        (num_sectors - head_sectors) * FLASH_SECTOR_SIZE
    }
}

/// Number of `block_size` blocks needed for `size` bytes.
pub fn block_count(size: u32, block_size: u32) -> u32 {
    size / block_size + (size % block_size != 0) as u32
}

/// Drives one download into RAM or flash over a borrowed session.
pub struct MemoryLoader<'a, T: Transport> {
    session: &'a mut Session<T>,
    destination: Destination,
}

impl<'a, T: Transport> MemoryLoader<'a, T> {
    pub fn new(session: &'a mut Session<T>, destination: Destination) -> Self {
        MemoryLoader {
            session,
            destination,
        }
    }

    /// Open a transfer of `total_size` bytes in `block_count` blocks at
    /// `dest_addr`. For flash, the size sent is the erase size instead.
    pub fn begin(
        &mut self,
        total_size: u32,
        block_count: u32,
        block_size: u32,
        dest_addr: u32,
    ) -> Result<()> {
        let (op, _, _) = self.destination.opcodes();
        let size = match self.destination {
            Destination::Ram => total_size,
            Destination::Flash => erase_size(total_size, dest_addr),
        };
        debug!(
            "{} {} bytes ({} x {}) at {:#010x}",
            self.destination.stage(0),
            size,
            block_count,
            block_size,
            dest_addr
        );
        let request = BeginRequest {
            size,
            blocks: block_count,
            block_size,
            offset: dest_addr,
        };

        let response = match self.destination {
            Destination::Ram => command(self.session, Some(op), &request.encode(), 0),
            Destination::Flash => {
                let saved = self.session.timeout();
                self.session.set_timeout(FLASH_BEGIN_TIMEOUT)?;
                let response = command(self.session, Some(op), &request.encode(), 0);
                self.session.set_timeout(saved)?;
                response
            }
        }?;
        response.check_status(self.destination.stage(0))
    }

    /// Send block number `seq`. The checksum covers `data` only.
    pub fn block(&mut self, data: &[u8], seq: u32) -> Result<()> {
        let (_, op, _) = self.destination.opcodes();
        trace!("{} #{} ({} bytes)", self.destination.stage(1), seq, data.len());
        let payload = DataRequest {
            length: data.len() as u32,
            sequence: seq,
        }
        .encode(data);
        let chk = checksum(data, CHECKSUM_MAGIC) as u32;
        command(self.session, Some(op), &payload, chk)?.check_status(self.destination.stage(1))
    }

    /// Close the transfer. For RAM a non-zero `entry_point` starts execution
    /// there; for flash a non-zero value reboots into the new firmware. Zero
    /// just leaves download mode.
    pub fn finish(&mut self, entry_point: u32) -> Result<()> {
        let (_, _, op) = self.destination.opcodes();
        debug!("{} (entry {:#010x})", self.destination.stage(2), entry_point);
        let payload = match self.destination {
            Destination::Ram => MemEndRequest { entry_point }.encode(),
            Destination::Flash => FlashEndRequest {
                reboot: entry_point != 0,
            }
            .encode(),
        };
        command(self.session, Some(op), &payload, 0)?.check_status(self.destination.stage(2))
    }

    /// Push `data` to `addr` as a complete begin + blocks sequence, leaving
    /// the transfer open for `finish`. Flash blocks are padded with `0xFF`
    /// to the full block size.
    pub fn upload(
        &mut self,
        data: &[u8],
        addr: u32,
        block_size: u32,
        mut progress: impl FnMut(usize),
    ) -> Result<()> {
        if block_size == 0 {
            return Err(Error::Precondition("block size must not be zero".into()));
        }
        let size = data.len() as u32;
        self.begin(size, block_count(size, block_size), block_size, addr)?;

        let mut sent = 0usize;
        for (seq, chunk) in data.chunks(block_size as usize).enumerate() {
            match self.destination {
                Destination::Flash if chunk.len() < block_size as usize => {
                    let mut padded = chunk.to_vec();
                    padded.resize(block_size as usize, 0xFF);
                    self.block(&padded, seq as u32)?;
                }
                _ => self.block(chunk, seq as u32)?,
            }
            sent += chunk.len();
            progress(sent);
        }
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockPort;

    fn sectors(n: u32) -> u32 {
        n * FLASH_SECTOR_SIZE
    }

    #[test]
    fn erase_size_short_region_from_block_start() {
        // 3 sectors, 16 head sectors available: erase ceil(4 / 2) = 2.
        assert_eq!(erase_size(sectors(3), 0), sectors(2));
        assert_eq!(erase_size(1, 0), sectors(1));
    }

    #[test]
    fn erase_size_spanning_blocks() {
        // Starting 2 sectors before a block boundary.
        let addr = sectors(14);
        assert_eq!(erase_size(sectors(10), addr), sectors(8));
    }

    #[test]
    fn erase_size_boundary_uses_tail_formula() {
        // num_sectors == 2 * head_sectors.
        let addr = sectors(12);
        assert_eq!(erase_size(sectors(8), addr), sectors(4));
    }

    #[test]
    fn erase_size_of_nothing_is_nothing() {
        assert_eq!(erase_size(0, 0), 0);
        assert_eq!(erase_size(0, 0x1000), 0);
    }

    #[test]
    fn erase_size_stays_below_twice_the_request() {
        for addr_sector in 0..SECTORS_PER_BLOCK * 2 {
            for n in 1..80 {
                let size = erase_size(sectors(n), sectors(addr_sector));
                assert!(size < 2 * sectors(n), "n={} addr={}", n, addr_sector);
                assert_eq!(size % FLASH_SECTOR_SIZE, 0);
            }
        }
    }

    #[test]
    fn block_count_rounds_up() {
        assert_eq!(block_count(0, 0x400), 0);
        assert_eq!(block_count(1, 0x400), 1);
        assert_eq!(block_count(0x400, 0x400), 1);
        assert_eq!(block_count(0x401, 0x400), 2);
    }

    #[test]
    fn ram_upload_and_finish() {
        let mut port = MockPort::new();
        port.push_rom_ok(Opcode::MemBegin as u8, 0);
        port.push_rom_ok(Opcode::MemData as u8, 0);
        port.push_rom_ok(Opcode::MemData as u8, 0);
        port.push_rom_ok(Opcode::MemEnd as u8, 0);
        let mut session = Session::new(port, 115_200);

        let data = vec![0x5Au8; RAM_BLOCK_SIZE as usize + 4];
        let mut reported = Vec::new();
        {
            let mut loader = MemoryLoader::new(&mut session, Destination::Ram);
            loader
                .upload(&data, 0x4010_0000, RAM_BLOCK_SIZE, |n| reported.push(n))
                .unwrap();
            loader.finish(0x4010_0004).unwrap();
        }
        assert_eq!(reported, vec![RAM_BLOCK_SIZE as usize, data.len()]);

        let frames = session.into_inner().written_frames();
        assert_eq!(frames.len(), 4);
        // begin: size, blocks, block size, address
        assert_eq!(
            &frames[0][8..],
            &BeginRequest {
                size: data.len() as u32,
                blocks: 2,
                block_size: RAM_BLOCK_SIZE,
                offset: 0x4010_0000,
            }
            .encode()[..]
        );
        // second data block: 4 bytes, sequence 1, checksum over the data only
        assert_eq!(frames[2][1], Opcode::MemData as u8);
        assert_eq!(&frames[2][8..16], &[4, 0, 0, 0, 1, 0, 0, 0]);
        assert_eq!(frames[2][4], checksum(&[0x5A; 4], CHECKSUM_MAGIC));
        // end with an entry point
        assert_eq!(&frames[3][8..], &[0, 0, 0, 0, 0x04, 0x00, 0x10, 0x40]);
    }

    #[test]
    fn flash_begin_sends_erase_size() {
        let mut port = MockPort::new();
        port.push_rom_ok(Opcode::FlashBegin as u8, 0);
        let mut session = Session::new(port, 115_200);

        MemoryLoader::new(&mut session, Destination::Flash)
            .begin(sectors(3), 12, FLASH_BLOCK_SIZE, 0)
            .unwrap();

        let port = session.into_inner();
        let frames = port.written_frames();
        assert_eq!(&frames[0][8..12], &sectors(2).to_le_bytes());
        // erase timeout applied, then restored
        assert_eq!(port.timeouts, vec![FLASH_BEGIN_TIMEOUT, Duration::from_secs(1)]);
    }

    #[test]
    fn flash_upload_pads_last_block() {
        let mut port = MockPort::new();
        port.push_rom_ok(Opcode::FlashBegin as u8, 0);
        port.push_rom_ok(Opcode::FlashData as u8, 0);
        let mut session = Session::new(port, 115_200);

        MemoryLoader::new(&mut session, Destination::Flash)
            .upload(&[1, 2, 3], 0x1000, FLASH_BLOCK_SIZE, |_| {})
            .unwrap();

        let frames = session.into_inner().written_frames();
        let block = &frames[1][24..];
        assert_eq!(block.len(), FLASH_BLOCK_SIZE as usize);
        assert_eq!(&block[..3], &[1, 2, 3]);
        assert!(block[3..].iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn failed_block_aborts_transfer() {
        let mut port = MockPort::new();
        port.push_rom_ok(Opcode::MemBegin as u8, 0);
        port.push_rom_response(Opcode::MemData as u8, 0, &[1, 0x07]);
        port.push_rom_ok(Opcode::MemData as u8, 0);
        let mut session = Session::new(port, 115_200);

        let data = vec![0u8; 2 * RAM_BLOCK_SIZE as usize];
        let err = MemoryLoader::new(&mut session, Destination::Ram)
            .upload(&data, 0x4010_0000, RAM_BLOCK_SIZE, |_| {})
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Transfer {
                stage: "mem data",
                status: 1,
                error: 0x07
            }
        ));
        // The second block was never sent.
        assert_eq!(session.into_inner().pending_input(), 12);
    }

    #[test]
    fn flash_finish_encodes_reboot_flag() {
        let mut port = MockPort::new();
        port.push_rom_ok(Opcode::FlashEnd as u8, 0);
        port.push_rom_ok(Opcode::FlashEnd as u8, 0);
        let mut session = Session::new(port, 115_200);

        MemoryLoader::new(&mut session, Destination::Flash)
            .finish(0)
            .unwrap();
        MemoryLoader::new(&mut session, Destination::Flash)
            .finish(1)
            .unwrap();

        let frames = session.into_inner().written_frames();
        assert_eq!(&frames[0][8..], &[1, 0, 0, 0]);
        assert_eq!(&frames[1][8..], &[0, 0, 0, 0]);
    }
}
