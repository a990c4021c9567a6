//! Client for the flasher stub.
//!
//! Once the stub runs, the ROM protocol is gone. Every request is a one-byte
//! command frame, optionally followed by a frame of little-endian `u32`
//! arguments whose length the stub checks exactly. Replies are frames too,
//! and every command ends with a one-byte status frame where zero means
//! success. Bulk write data is the exception: it is sent raw, paced by the
//! acknowledgements the stub sends back.
//!
//! ```text
//!   host                                stub
//!    | -- [1] [addr len erase] ------->  |
//!    |  <------------------ [written]    |   written = 0
//!    | -- raw data (window) ---------->  |
//!    |  <------------------ [written]    |   one per 1 KiB programmed
//!    |            ...                    |
//!    |  <------------------- [md5 x16]   |
//!    |  <------------------- [status]    |
//! ```
//!
//! The stub buffers incoming data in a 4 KiB ring without any overrun check,
//! so the write window must never exceed it.

use std::{fmt, time::Duration};

use log::{debug, info, trace};

use crate::{
    error::{Error, Result},
    rom::{
        stub::{run_stub, StubDescriptor},
        FlashId,
    },
    session::{Session, Transport},
    slip,
};

/// Frame sent by the stub once it is ready for commands.
pub const GREETING: &[u8] = b"OHAI";
/// Flash writes and erases must be aligned to this.
pub const SECTOR_SIZE: u32 = 4096;
/// Size of the stub's receive ring.
pub const STUB_BUFFER_SIZE: usize = 4096;
/// Default cap on unacknowledged bytes during a write.
pub const DEFAULT_WINDOW: usize = STUB_BUFFER_SIZE;
/// Block size requested for flash reads.
pub const READ_BLOCK_SIZE: u32 = 256;
/// The stub programs, and acknowledges, writes in chunks of this size.
pub const WRITE_CHUNK: usize = 1024;

const DIGEST_LEN: usize = 16;
const FLASH_BLOCK_SIZE: u32 = 64 * 1024;

const CHIP_ERASE_TIMEOUT: Duration = Duration::from_secs(25);
const BLOCK_ERASE_TIMEOUT: Duration = Duration::from_secs(5);
const DIGEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Commands understood by the flasher stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StubCommand {
    FlashErase = 0,
    FlashWrite = 1,
    FlashRead = 2,
    FlashDigest = 3,
    ReadChipId = 4,
    /// Answers with status 0, then restarts the chip into its boot ROM.
    Reboot = 5,
}

impl StubCommand {
    fn name(self) -> &'static str {
        match self {
            StubCommand::FlashErase => "flash erase",
            StubCommand::FlashWrite => "flash write",
            StubCommand::FlashRead => "flash read",
            StubCommand::FlashDigest => "flash digest",
            StubCommand::ReadChipId => "read chip id",
            StubCommand::Reboot => "reboot",
        }
    }
}

impl fmt::Display for StubCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Progress reporting for long transfers.
pub trait ProgressCallbacks {
    /// A transfer of `total` bytes at `addr` starts.
    fn init(&mut self, addr: u32, total: usize);
    /// `current` bytes are done.
    fn update(&mut self, current: usize);
    fn finish(&mut self);
}

/// What a completed write observed about the flow-control window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteStats {
    /// Bytes the stub reported as written.
    pub acknowledged: u32,
    /// Largest number of bytes sent but not yet acknowledged.
    pub max_in_flight: usize,
}

/// Result of a digest command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashDigest {
    /// One digest per block, when a block size was requested.
    pub blocks: Vec<[u8; DIGEST_LEN]>,
    pub total: [u8; DIGEST_LEN],
}

// =============================================================================
// Flasher
// =============================================================================

/// Talks to a running flasher stub over a borrowed session.
pub struct Flasher<'a, T: Transport> {
    session: &'a mut Session<T>,
    window: usize,
}

impl<'a, T: Transport> Flasher<'a, T> {
    /// Upload and start `stub` on a ROM session, switch the link to
    /// `flash_baud` (0 keeps the current rate) and wait for the greeting.
    pub fn start(
        session: &'a mut Session<T>,
        stub: &StubDescriptor,
        flash_baud: u32,
        window: usize,
    ) -> Result<Self> {
        check_window(window)?;
        if session.is_stub_active() {
            return Err(Error::Precondition("a stub is already running".into()));
        }
        info!("Running the flasher stub...");
        run_stub(session, stub, &[flash_baud], false)?;
        if flash_baud > 0 {
            session.change_baud_rate(flash_baud)?;
        }

        let greeting = slip::read_frame(session.port())?;
        if greeting != GREETING {
            return Err(Error::Protocol(format!(
                "failed to connect to the flasher (got {})",
                hex::encode_upper(&greeting)
            )));
        }
        session.set_stub_active(true);
        info!("Flasher stub is up at {} baud", session.baud_rate());
        Ok(Flasher { session, window })
    }

    /// Use a stub that is already running on `session`.
    pub fn attach(session: &'a mut Session<T>, window: usize) -> Result<Self> {
        check_window(window)?;
        if !session.is_stub_active() {
            return Err(Error::Precondition("no stub is running".into()));
        }
        Ok(Flasher { session, window })
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Write `data` at `addr`, erasing the region first.
    ///
    /// Both must be sector aligned. Data goes out in 1 KiB chunks, never more
    /// than the window ahead of what the stub acknowledged. The stub's digest
    /// of what it wrote must match the local one.
    ///
    /// The third argument of the command is the stub's erase flag.
    pub fn write(
        &mut self,
        addr: u32,
        data: &[u8],
        mut progress: Option<&mut dyn ProgressCallbacks>,
    ) -> Result<WriteStats> {
        check_aligned(addr, data.len())?;
        let len = data.len() as u32;
        debug!("Writing {} bytes at {:#010x}", len, addr);
        if let Some(cb) = progress.as_mut() {
            cb.init(addr, data.len());
        }

        let window = self.window;
        let stats = self.with_timeout(BLOCK_ERASE_TIMEOUT, |flasher| {
            flasher.send_command(StubCommand::FlashWrite, &[addr, len, 1])?;

            let mut sent = 0usize;
            let mut stats = WriteStats {
                acknowledged: 0,
                max_in_flight: 0,
            };
            loop {
                let frame = flasher.read_frame()?;
                stats.acknowledged = match frame.len() {
                    4 => le_u32(&frame),
                    1 => {
                        return Err(Error::Write {
                            command: StubCommand::FlashWrite.name(),
                            status: frame[0],
                        })
                    }
                    n => {
                        return Err(Error::Protocol(format!(
                            "unexpected {} byte frame while writing",
                            n
                        )))
                    }
                };
                let acked = stats.acknowledged as usize;
                if acked > sent {
                    return Err(Error::Protocol(format!(
                        "stub acknowledged {} bytes, only {} were sent",
                        acked, sent
                    )));
                }
                trace!("written {}/{} (sent {})", acked, len, sent);
                if let Some(cb) = progress.as_mut() {
                    cb.update(acked);
                }
                if acked == data.len() {
                    break;
                }

                while sent < data.len() {
                    let chunk = &data[sent..data.len().min(sent + WRITE_CHUNK)];
                    if sent - acked + chunk.len() > window {
                        break;
                    }
                    flasher.session.port().write_all(chunk)?;
                    sent += chunk.len();
                    stats.max_in_flight = stats.max_in_flight.max(sent - acked);
                }
                flasher.session.port().flush()?;
            }

            flasher.check_digest(StubCommand::FlashWrite, data)?;
            flasher.read_status(StubCommand::FlashWrite)?;
            Ok(stats)
        })?;

        if let Some(cb) = progress.as_mut() {
            cb.finish();
        }
        debug!(
            "Wrote {} bytes at {:#010x}, at most {} in flight",
            stats.acknowledged, addr, stats.max_in_flight
        );
        Ok(stats)
    }

    /// Read `len` bytes of flash at `addr`.
    ///
    /// The stub streams the blocks back to back without waiting for the
    /// host, so nothing is sent between the request and the final status.
    pub fn read(
        &mut self,
        addr: u32,
        len: u32,
        mut progress: Option<&mut dyn ProgressCallbacks>,
    ) -> Result<Vec<u8>> {
        debug!("Reading {} bytes at {:#010x}", len, addr);
        if let Some(cb) = progress.as_mut() {
            cb.init(addr, len as usize);
        }
        self.send_command(StubCommand::FlashRead, &[addr, len, READ_BLOCK_SIZE])?;

        let mut data = Vec::with_capacity(len as usize);
        while data.len() < len as usize {
            let frame = self.read_frame()?;
            let remaining = len as usize - data.len();
            if frame.len() == 1 && remaining != 1 {
                return Err(Error::Write {
                    command: StubCommand::FlashRead.name(),
                    status: frame[0],
                });
            }
            if frame.is_empty() || frame.len() > remaining {
                return Err(Error::Protocol(format!(
                    "unexpected {} byte block with {} bytes left to read",
                    frame.len(),
                    remaining
                )));
            }
            data.extend_from_slice(&frame);
            if let Some(cb) = progress.as_mut() {
                cb.update(data.len());
            }
        }

        self.check_digest(StubCommand::FlashRead, &data)?;
        self.read_status(StubCommand::FlashRead)?;
        if let Some(cb) = progress.as_mut() {
            cb.finish();
        }
        Ok(data)
    }

    /// Erase a sector-aligned region.
    pub fn erase(&mut self, addr: u32, len: u32) -> Result<()> {
        check_aligned(addr, len as usize)?;
        debug!("Erasing {} bytes at {:#010x}", len, addr);
        self.with_timeout(erase_timeout(len), |flasher| {
            flasher.send_command(StubCommand::FlashErase, &[addr, len])?;
            flasher.read_status(StubCommand::FlashErase)
        })
    }

    /// Erase the whole flash chip.
    ///
    /// The stub has no chip erase command, so this erases the region covering
    /// the capacity announced by the chip's JEDEC id. An id without a usable
    /// capacity is a precondition failure and nothing gets erased.
    pub fn erase_chip(&mut self) -> Result<u32> {
        let id = self.chip_id()?;
        let size = id.capacity().ok_or_else(|| {
            Error::Precondition(format!("cannot tell the flash size from chip id {}", id))
        })?;
        info!("Erasing the whole flash chip ({} bytes)...", size);
        self.erase(0, size)?;
        Ok(size)
    }

    /// MD5 of `len` bytes at `addr`, computed on the device. A non-zero
    /// `block_size` also returns one digest per block.
    pub fn digest(&mut self, addr: u32, len: u32, block_size: u32) -> Result<FlashDigest> {
        if block_size > SECTOR_SIZE {
            return Err(Error::Precondition(format!(
                "digest block size {} exceeds {}",
                block_size, SECTOR_SIZE
            )));
        }
        self.with_timeout(DIGEST_TIMEOUT, |flasher| {
            flasher.send_command(StubCommand::FlashDigest, &[addr, len, block_size])?;
            let mut digests = Vec::new();
            loop {
                let frame = flasher.read_frame()?;
                match frame.len() {
                    DIGEST_LEN => digests.push(to_digest(&frame)),
                    1 if frame[0] == 0 => break,
                    1 => {
                        return Err(Error::Write {
                            command: StubCommand::FlashDigest.name(),
                            status: frame[0],
                        })
                    }
                    n => {
                        return Err(Error::Protocol(format!(
                            "unexpected {} byte frame in digest reply",
                            n
                        )))
                    }
                }
            }
            let total = digests
                .pop()
                .ok_or_else(|| Error::Protocol("digest reply without a digest".into()))?;
            Ok(FlashDigest {
                blocks: digests,
                total,
            })
        })
    }

    /// JEDEC id of the flash chip, as the controller latched it.
    pub fn chip_id(&mut self) -> Result<FlashId> {
        self.send_command(StubCommand::ReadChipId, &[])?;
        let frame = self.read_frame()?;
        if frame.len() != 4 {
            return Err(Error::Protocol(format!(
                "expected a 4 byte chip id, got {} bytes",
                frame.len()
            )));
        }
        self.read_status(StubCommand::ReadChipId)?;
        let id = le_u32(&frame) & 0x00ff_ffff;
        if id == 0 {
            return Err(Error::Protocol("0 is not a valid chip id".into()));
        }
        Ok(FlashId(id))
    }

    /// Restart the chip. It comes back up in its boot ROM, so the flasher is
    /// consumed and the session is a ROM session again.
    pub fn reboot(mut self) -> Result<()> {
        info!("Leaving the flasher, rebooting the device");
        self.send_command(StubCommand::Reboot, &[])?;
        self.read_status(StubCommand::Reboot)?;
        self.session.set_stub_active(false);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Wire helpers
    // -------------------------------------------------------------------------

    fn send_command(&mut self, command: StubCommand, args: &[u32]) -> Result<()> {
        trace!("=> {} {:x?}", command, args);
        slip::write_frame(self.session.port(), &[command as u8])?;
        if !args.is_empty() {
            let payload: Vec<u8> = args.iter().flat_map(|a| a.to_le_bytes().to_vec()).collect();
            slip::write_frame(self.session.port(), &payload)?;
        }
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Vec<u8>> {
        let frame = slip::read_frame(self.session.port())?;
        trace!("<= {}", hex::encode(&frame));
        Ok(frame)
    }

    fn read_status(&mut self, command: StubCommand) -> Result<()> {
        let frame = self.read_frame()?;
        match frame.as_slice() {
            [0] => Ok(()),
            [status] => Err(Error::Write {
                command: command.name(),
                status: *status,
            }),
            _ => Err(Error::Protocol(format!(
                "{}: expected a status byte, got {} bytes",
                command,
                frame.len()
            ))),
        }
    }

    fn check_digest(&mut self, command: StubCommand, data: &[u8]) -> Result<()> {
        let frame = self.read_frame()?;
        if frame.len() != DIGEST_LEN {
            return Err(Error::Protocol(format!(
                "{}: expected a digest, got {} bytes",
                command,
                frame.len()
            )));
        }
        let expected = md5::compute(data);
        if frame[..] != expected.0[..] {
            return Err(Error::DigestMismatch {
                expected: hex::encode(expected.0),
                actual: hex::encode(&frame),
            });
        }
        Ok(())
    }

    fn with_timeout<R>(
        &mut self,
        timeout: Duration,
        f: impl FnOnce(&mut Self) -> Result<R>,
    ) -> Result<R> {
        let saved = self.session.timeout();
        self.session.set_timeout(timeout.max(saved))?;
        let result = f(self);
        self.session.set_timeout(saved)?;
        result
    }
}

fn check_window(window: usize) -> Result<()> {
    if window < WRITE_CHUNK {
        return Err(Error::Precondition(format!(
            "flow-control window of {} bytes cannot hold a {} byte chunk",
            window, WRITE_CHUNK
        )));
    }
    if window > STUB_BUFFER_SIZE {
        return Err(Error::Precondition(format!(
            "flow-control window of {} bytes overruns the stub's {} byte buffer",
            window, STUB_BUFFER_SIZE
        )));
    }
    Ok(())
}

// Big regions go out as 64 KiB block erases, allow a second for each.
fn erase_timeout(len: u32) -> Duration {
    CHIP_ERASE_TIMEOUT.max(Duration::from_secs(u64::from(len / FLASH_BLOCK_SIZE)))
}

fn check_aligned(addr: u32, len: usize) -> Result<()> {
    if addr % SECTOR_SIZE != 0 || len % SECTOR_SIZE as usize != 0 {
        return Err(Error::Precondition(format!(
            "address {:#010x} and length {} must be multiples of {}",
            addr, len, SECTOR_SIZE
        )));
    }
    if len > u32::MAX as usize {
        return Err(Error::Precondition(format!("{} bytes is too much to write", len)));
    }
    Ok(())
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn to_digest(bytes: &[u8]) -> [u8; DIGEST_LEN] {
    let mut digest = [0u8; DIGEST_LEN];
    digest.copy_from_slice(bytes);
    digest
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        io::{self, Read, Write},
    };

    use super::*;
    use crate::{rom::protocol::Opcode, settings::SettingsBuilder, testing::MockPort};

    fn stub_session(port: MockPort) -> Session<MockPort> {
        stub_session_with(port)
    }

    fn stub_session_with<T: Transport>(port: T) -> Session<T> {
        let mut session = Session::new(port, 921_600);
        session.set_stub_active(true);
        session
    }

    /// Model of the stub's write path: raw data lands in a 4 KiB ring, and
    /// every time the host waits for an acknowledgement the stub programs one
    /// 1 KiB chunk out of it.
    struct RingStub {
        total: usize,
        delimiters: usize,
        buffered: usize,
        programmed: usize,
        peak: usize,
        overrun: bool,
        received: Vec<u8>,
        output: VecDeque<u8>,
        timeout: Duration,
    }

    impl RingStub {
        fn new(total: usize) -> Self {
            RingStub {
                total,
                delimiters: 0,
                buffered: 0,
                programmed: 0,
                peak: 0,
                overrun: false,
                received: Vec::new(),
                output: VecDeque::new(),
                timeout: Duration::from_secs(1),
            }
        }

        fn send(&mut self, payload: &[u8]) {
            self.output.extend(slip::encode(payload));
        }
    }

    impl Read for RingStub {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.output.is_empty() && self.delimiters == 4 && self.programmed < self.total {
                let n = WRITE_CHUNK.min(self.total - self.programmed);
                if self.buffered >= n {
                    self.buffered -= n;
                    self.programmed += n;
                    self.send(&(self.programmed as u32).to_le_bytes());
                    if self.programmed == self.total {
                        let digest = md5::compute(&self.received).0;
                        self.send(&digest);
                        self.send(&[0]);
                    }
                }
            }
            if self.output.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "stub is waiting"));
            }
            let n = buf.len().min(self.output.len());
            for (slot, b) in buf.iter_mut().zip(self.output.drain(..n)) {
                *slot = b;
            }
            Ok(n)
        }
    }

    impl Write for RingStub {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            for &b in buf {
                // command and argument frames come first, two delimiters each
                if self.delimiters < 4 {
                    if b == 0xC0 {
                        self.delimiters += 1;
                        if self.delimiters == 4 {
                            self.send(&0u32.to_le_bytes());
                        }
                    }
                    continue;
                }
                self.received.push(b);
                self.buffered += 1;
                self.peak = self.peak.max(self.buffered);
                if self.buffered > STUB_BUFFER_SIZE {
                    self.overrun = true;
                }
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transport for RingStub {
        fn name(&self) -> Option<String> {
            None
        }

        fn timeout(&self) -> Duration {
            self.timeout
        }

        fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
            self.timeout = timeout;
            Ok(())
        }

        fn set_baud_rate(&mut self, _baud_rate: u32) -> Result<()> {
            Ok(())
        }

        fn set_rts(&mut self, _level: bool) -> Result<()> {
            Ok(())
        }

        fn set_dtr(&mut self, _level: bool) -> Result<()> {
            Ok(())
        }

        fn clear_input(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn push_acks(port: &mut MockPort, acks: impl IntoIterator<Item = u32>) {
        for ack in acks {
            port.push_frame(&ack.to_le_bytes());
        }
    }

    /// Split what was written into the command frames and the raw data that
    /// followed them.
    fn split_write(written: &[u8]) -> (Vec<Vec<u8>>, Vec<u8>) {
        let mut cursor = written;
        let command = slip::read_frame(&mut cursor).unwrap();
        let args = slip::read_frame(&mut cursor).unwrap();
        (vec![command, args], cursor.to_vec())
    }

    struct Recorder {
        init: Option<(u32, usize)>,
        updates: Vec<usize>,
        finished: bool,
    }

    impl ProgressCallbacks for Recorder {
        fn init(&mut self, addr: u32, total: usize) {
            self.init = Some((addr, total));
        }
        fn update(&mut self, current: usize) {
            self.updates.push(current);
        }
        fn finish(&mut self) {
            self.finished = true;
        }
    }

    #[test]
    fn start_uploads_stub_and_waits_for_greeting() {
        let stub = StubDescriptor::flasher().unwrap();
        let mut port = MockPort::new();
        for op in &[
            Opcode::MemBegin,
            Opcode::MemData,
            Opcode::MemBegin,
            Opcode::MemData,
            Opcode::MemEnd,
        ] {
            port.push_rom_ok(*op as u8, 0);
        }
        port.push_frame(GREETING);
        let mut session = Session::new(port, 115_200);

        {
            let flasher = Flasher::start(&mut session, &stub, 460_800, DEFAULT_WINDOW).unwrap();
            assert_eq!(flasher.window(), DEFAULT_WINDOW);
        }
        assert!(session.is_stub_active());
        assert_eq!(session.baud_rate(), 460_800);

        let frames = session.into_inner().written_frames();
        // the baud rate is the stub's only parameter
        assert_eq!(&frames[1][24..28], &460_800u32.to_le_bytes());
    }

    #[test]
    fn wrong_greeting_is_protocol_error() {
        let mut stub = StubDescriptor::flasher().unwrap();
        stub.data = None;
        let mut port = MockPort::new();
        for op in &[Opcode::MemBegin, Opcode::MemData, Opcode::MemEnd] {
            port.push_rom_ok(*op as u8, 0);
        }
        port.push_frame(b"OHNO");
        let mut session = Session::new(port, 115_200);

        let err = Flasher::start(&mut session, &stub, 0, DEFAULT_WINDOW).err().unwrap();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(!session.is_stub_active());
        assert_eq!(session.baud_rate(), 115_200);
    }

    #[test]
    fn window_bounds() {
        let mut session = stub_session(MockPort::new());
        for window in &[WRITE_CHUNK, 3072, STUB_BUFFER_SIZE] {
            assert_eq!(Flasher::attach(&mut session, *window).unwrap().window(), *window);
        }
        for window in &[WRITE_CHUNK - 1, 5120] {
            assert!(matches!(
                Flasher::attach(&mut session, *window).err().unwrap(),
                Error::Precondition(_)
            ));
        }
    }

    #[test]
    fn write_one_sector() {
        let data = vec![0xFFu8; 4096];
        let mut port = MockPort::new();
        push_acks(&mut port, vec![0, 4096]);
        port.push_frame(&md5::compute(&data).0);
        port.push_frame(&[0]);
        let mut session = stub_session(port);
        let mut recorder = Recorder {
            init: None,
            updates: Vec::new(),
            finished: false,
        };

        let stats = Flasher::attach(&mut session, DEFAULT_WINDOW)
            .unwrap()
            .write(0x1000, &data, Some(&mut recorder))
            .unwrap();
        assert_eq!(stats.acknowledged, 4096);
        assert_eq!(stats.max_in_flight, 4096);
        assert_eq!(recorder.init, Some((0x1000, 4096)));
        assert_eq!(recorder.updates, vec![0, 4096]);
        assert!(recorder.finished);

        let port = session.into_inner();
        assert_eq!(port.pending_input(), 0);
        let (frames, raw) = split_write(&port.written());
        assert_eq!(frames[0], vec![StubCommand::FlashWrite as u8]);
        assert_eq!(frames[1], vec![0, 0x10, 0, 0, 0, 0x10, 0, 0, 1, 0, 0, 0]);
        assert_eq!(raw, data);
    }

    #[test]
    fn write_never_exceeds_window() {
        let data: Vec<u8> = (0..16384u32).map(|i| (i % 251) as u8).collect();
        let mut port = MockPort::new();
        push_acks(&mut port, (0..=16).map(|i| i * 1024));
        port.push_frame(&md5::compute(&data).0);
        port.push_frame(&[0]);
        let mut session = stub_session(port);

        let stats = Flasher::attach(&mut session, DEFAULT_WINDOW)
            .unwrap()
            .write(0x10000, &data, None)
            .unwrap();
        assert_eq!(stats.acknowledged, 16384);
        assert_eq!(stats.max_in_flight, DEFAULT_WINDOW);

        let port = session.into_inner();
        // the erase flag, not a sector count, follows the length
        assert_eq!(
            port.writes[1],
            slip::encode(&[0, 0, 1, 0, 0, 0x40, 0, 0, 1, 0, 0, 0])
        );
        // every chunk goes out in its own write, four of them ahead of the
        // first acknowledgement
        let chunks: Vec<&Vec<u8>> = port.writes.iter().filter(|w| w.len() == 1024).collect();
        assert_eq!(chunks.len(), 16);
        assert_eq!(port.writes.len(), 18);
    }

    #[test]
    fn default_window_fits_the_stub_buffer() {
        let data: Vec<u8> = (0..16384u32).map(|i| (i % 253) as u8).collect();
        let window = SettingsBuilder::new().finalize().flash_window;
        let mut session = stub_session_with(RingStub::new(data.len()));

        let stats = Flasher::attach(&mut session, window)
            .unwrap()
            .write(0x20000, &data, None)
            .unwrap();
        assert_eq!(stats.acknowledged, 16384);

        let stub = session.into_inner();
        assert!(!stub.overrun);
        assert_eq!(stub.peak, STUB_BUFFER_SIZE);
        assert_eq!(stub.received, data);
    }

    #[test]
    fn three_chunk_window_writes_everything() {
        let data = vec![0x5Au8; 8192];
        let mut session = stub_session_with(RingStub::new(data.len()));

        let stats = Flasher::attach(&mut session, 3072)
            .unwrap()
            .write(0, &data, None)
            .unwrap();
        assert_eq!(stats.max_in_flight, 3072);

        let stub = session.into_inner();
        assert!(!stub.overrun);
        assert_eq!(stub.peak, 3072);
        assert_eq!(stub.received, data);
    }

    #[test]
    fn write_digest_mismatch() {
        let data = vec![0u8; 4096];
        let mut port = MockPort::new();
        push_acks(&mut port, vec![0, 4096]);
        port.push_frame(&[0xAB; 16]);
        port.push_frame(&[0]);
        let mut session = stub_session(port);

        let err = Flasher::attach(&mut session, DEFAULT_WINDOW)
            .unwrap()
            .write(0, &data, None)
            .unwrap_err();
        match err {
            Error::DigestMismatch { expected, actual } => {
                assert_eq!(expected, hex::encode(md5::compute(&data).0));
                assert_eq!(actual, "ab".repeat(16));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn write_error_status_from_stub() {
        let mut port = MockPort::new();
        port.push_frame(&[0x34]);
        let mut session = stub_session(port);

        let err = Flasher::attach(&mut session, DEFAULT_WINDOW)
            .unwrap()
            .write(0, &[0u8; 4096], None)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Write {
                command: "flash write",
                status: 0x34
            }
        ));
    }

    #[test]
    fn unaligned_write_is_rejected_before_io() {
        let mut session = stub_session(MockPort::new());
        let mut flasher = Flasher::attach(&mut session, DEFAULT_WINDOW).unwrap();
        assert!(matches!(
            flasher.write(0x800, &[0u8; 4096], None),
            Err(Error::Precondition(_))
        ));
        assert!(matches!(
            flasher.write(0x1000, &[0u8; 100], None),
            Err(Error::Precondition(_))
        ));
        assert!(session.into_inner().writes.is_empty());
    }

    #[test]
    fn read_streams_blocks_without_acks() {
        let data: Vec<u8> = (0..600u32).map(|i| i as u8).collect();
        let mut port = MockPort::new();
        for block in data.chunks(READ_BLOCK_SIZE as usize) {
            port.push_frame(block);
        }
        port.push_frame(&md5::compute(&data).0);
        port.push_frame(&[0]);
        let mut session = stub_session(port);

        let read = Flasher::attach(&mut session, DEFAULT_WINDOW)
            .unwrap()
            .read(0x2000, 600, None)
            .unwrap();
        assert_eq!(read, data);

        let port = session.into_inner();
        assert_eq!(port.pending_input(), 0);
        assert_eq!(
            port.written_frames(),
            vec![
                vec![StubCommand::FlashRead as u8],
                vec![0, 0x20, 0, 0, 0x58, 0x02, 0, 0, 0, 0x01, 0, 0]
            ]
        );
    }

    #[test]
    fn read_digest_mismatch() {
        let mut port = MockPort::new();
        port.push_frame(&[1, 2, 3, 4]);
        port.push_frame(&[0; 16]);
        port.push_frame(&[0]);
        let mut session = stub_session(port);

        let err = Flasher::attach(&mut session, DEFAULT_WINDOW)
            .unwrap()
            .read(0, 4, None)
            .unwrap_err();
        assert!(matches!(err, Error::DigestMismatch { .. }));
    }

    #[test]
    fn read_error_status_from_stub() {
        let mut port = MockPort::new();
        port.push_frame(&[0x53]);
        let mut session = stub_session(port);

        let err = Flasher::attach(&mut session, DEFAULT_WINDOW)
            .unwrap()
            .read(0, 4096, None)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Write {
                command: "flash read",
                status: 0x53
            }
        ));
    }

    #[test]
    fn erase_region_and_chip() {
        let mut port = MockPort::new();
        port.push_frame(&[0]);
        port.push_frame(&[0xef, 0x40, 0x16, 0x00]);
        port.push_frame(&[0]);
        port.push_frame(&[0]);
        let mut session = stub_session(port);

        {
            let mut flasher = Flasher::attach(&mut session, DEFAULT_WINDOW).unwrap();
            flasher.erase(0x3000, 0x2000).unwrap();
            assert_eq!(flasher.erase_chip().unwrap(), 0x40_0000);
        }

        let port = session.into_inner();
        assert_eq!(
            port.written_frames(),
            vec![
                vec![0],
                vec![0, 0x30, 0, 0, 0, 0x20, 0, 0],
                vec![4],
                vec![0],
                vec![0, 0, 0, 0, 0, 0, 0x40, 0]
            ]
        );
        // long timeouts while erasing, scaled with the size, then back to
        // the default
        assert_eq!(
            port.timeouts,
            vec![
                CHIP_ERASE_TIMEOUT,
                Duration::from_secs(1),
                Duration::from_secs(64),
                Duration::from_secs(1)
            ]
        );
    }

    #[test]
    fn chip_erase_needs_a_known_size() {
        let mut port = MockPort::new();
        port.push_frame(&[0xef, 0x40, 0x02, 0x00]);
        port.push_frame(&[0]);
        let mut session = stub_session(port);

        let err = Flasher::attach(&mut session, DEFAULT_WINDOW)
            .unwrap()
            .erase_chip()
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        // nothing was erased
        assert_eq!(session.into_inner().written_frames(), vec![vec![4]]);
    }

    #[test]
    fn digest_with_blocks() {
        let mut port = MockPort::new();
        port.push_frame(&[1; 16]);
        port.push_frame(&[2; 16]);
        port.push_frame(&[3; 16]);
        port.push_frame(&[0]);
        let mut session = stub_session(port);

        let digest = Flasher::attach(&mut session, DEFAULT_WINDOW)
            .unwrap()
            .digest(0, 8192, 4096)
            .unwrap();
        assert_eq!(digest.blocks, vec![[1; 16], [2; 16]]);
        assert_eq!(digest.total, [3; 16]);
    }

    #[test]
    fn chip_id_and_reboot() {
        let mut port = MockPort::new();
        // little-endian SPI_W0 contents, the top byte is not part of the id
        port.push_frame(&[0xef, 0x40, 0x16, 0x7f]);
        port.push_frame(&[0]);
        port.push_frame(&[0]);
        let mut session = stub_session(port);

        {
            let mut flasher = Flasher::attach(&mut session, DEFAULT_WINDOW).unwrap();
            let id = flasher.chip_id().unwrap();
            assert_eq!(id, FlashId(0x0016_40ef));
            assert_eq!(id.manufacturer(), 0xef);
            assert_eq!(id.device(), 0x4016);
            flasher.reboot().unwrap();
        }
        assert!(!session.is_stub_active());
        assert_eq!(
            session.into_inner().written_frames(),
            vec![vec![4], vec![5]]
        );
    }

    #[test]
    fn zero_chip_id_is_invalid() {
        let mut port = MockPort::new();
        port.push_frame(&[0, 0, 0, 0]);
        port.push_frame(&[0]);
        let mut session = stub_session(port);
        let mut flasher = Flasher::attach(&mut session, DEFAULT_WINDOW).unwrap();
        assert!(matches!(flasher.chip_id(), Err(Error::Protocol(_))));
    }
}
