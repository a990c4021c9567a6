//! Scripted stand-in for a serial port, used by the unit tests.
//!
//! Bytes queued with the `push_*` helpers are handed out to reads in order;
//! once the queue is empty every read times out, the way a silent device
//! would. Everything written is recorded per `write` call.

use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    time::Duration,
};

use crate::{error::Result, session::Transport, slip};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Line {
    Rts(bool),
    Dtr(bool),
}

pub(crate) struct MockPort {
    input: VecDeque<u8>,
    pub writes: Vec<Vec<u8>>,
    pub lines: Vec<Line>,
    pub timeout: Duration,
    pub timeouts: Vec<Duration>,
    pub baud_rate: u32,
    pub clears: usize,
}

impl MockPort {
    pub fn new() -> Self {
        MockPort {
            input: VecDeque::new(),
            writes: Vec::new(),
            lines: Vec::new(),
            timeout: Duration::from_secs(1),
            timeouts: Vec::new(),
            baud_rate: 115_200,
            clears: 0,
        }
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.input.extend(bytes.iter().copied());
    }

    pub fn push_frame(&mut self, payload: &[u8]) {
        self.push_bytes(&slip::encode(payload));
    }

    /// Queue a ROM response frame: direction byte, echoed opcode, body length,
    /// value and body.
    pub fn push_rom_response(&mut self, opcode: u8, value: u32, body: &[u8]) {
        let mut payload = vec![0x01, opcode];
        payload.extend_from_slice(&(body.len() as u16).to_le_bytes());
        payload.extend_from_slice(&value.to_le_bytes());
        payload.extend_from_slice(body);
        self.push_frame(&payload);
    }

    /// Queue a successful response with the usual two-byte status body.
    pub fn push_rom_ok(&mut self, opcode: u8, value: u32) {
        self.push_rom_response(opcode, value, &[0, 0]);
    }

    pub fn pending_input(&self) -> usize {
        self.input.len()
    }

    pub fn written(&self) -> Vec<u8> {
        self.writes.concat()
    }

    /// Decode every frame found in the written bytes. Only meaningful when
    /// nothing raw was written between frames.
    pub fn written_frames(&self) -> Vec<Vec<u8>> {
        let bytes = self.written();
        let mut cursor = &bytes[..];
        let mut frames = Vec::new();
        while !cursor.is_empty() {
            frames.push(slip::read_frame(&mut cursor).expect("malformed frame written"));
        }
        frames
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.input.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(self.input.len());
        for (slot, b) in buf.iter_mut().zip(self.input.drain(..n)) {
            *slot = b;
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writes.push(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for MockPort {
    fn name(&self) -> Option<String> {
        Some("mock".into())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        self.timeouts.push(timeout);
        Ok(())
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.baud_rate = baud_rate;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.lines.push(Line::Rts(level));
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.lines.push(Line::Dtr(level));
        Ok(())
    }

    // Scripted input stands for what the device will send next, so it
    // survives a flush.
    fn clear_input(&mut self) -> Result<()> {
        self.clears += 1;
        Ok(())
    }
}
