//! SLIP-style framing shared by the ROM and the flasher stub.
//!
//! A frame is its payload wrapped in [`END`] bytes, with the two reserved
//! values rewritten inside the payload:
//!
//! ```text
//!   0xC0  ->  0xDB 0xDC
//!   0xDB  ->  0xDB 0xDD
//! ```
//!
//! There is no length prefix; a frame ends at the next unescaped [`END`].
//! Readers pull one byte at a time from the live stream so that nothing past
//! the end of the current frame is consumed.

use std::io::{self, Read, Write};

use log::trace;

use crate::error::{Error, Result};

/// Frame delimiter.
pub const END: u8 = 0xC0;
/// Escape introducer.
pub const ESC: u8 = 0xDB;
/// Escaped form of [`END`] (follows [`ESC`]).
pub const ESC_END: u8 = 0xDC;
/// Escaped form of [`ESC`] (follows [`ESC`]).
pub const ESC_ESC: u8 = 0xDD;

// =============================================================================
// Encoding
// =============================================================================

/// Wrap `payload` into a complete frame.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + payload.len() / 8 + 2);
    frame.push(END);
    for &b in payload {
        match b {
            END => frame.extend_from_slice(&[ESC, ESC_END]),
            ESC => frame.extend_from_slice(&[ESC, ESC_ESC]),
            _ => frame.push(b),
        }
    }
    frame.push(END);
    frame
}

/// Encode `payload` and push it out in a single write.
pub fn write_frame<W: Write + ?Sized>(writer: &mut W, payload: &[u8]) -> Result<()> {
    writer.write_all(&encode(payload))?;
    writer.flush()?;
    Ok(())
}

// =============================================================================
// Decoding
// =============================================================================

/// Decode one frame from an in-memory buffer. Bytes preceding the first
/// delimiter are treated as line noise.
pub fn decode(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut cursor = bytes;
    read_frame(&mut cursor).map_err(|err| match err {
        Error::Io(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            Error::Framing("frame is not terminated".into())
        }
        other => other,
    })
}

/// Read the next complete frame from the stream.
///
/// Anything before the opening delimiter is discarded: a freshly reset UART
/// usually produces some garbage before the device starts talking. Once inside
/// a frame, an invalid escape sequence is a [`Error::Framing`].
pub fn read_frame<R: Read + ?Sized>(reader: &mut R) -> Result<Vec<u8>> {
    let mut skipped = 0usize;
    while read_byte(reader)? != END {
        skipped += 1;
    }
    if skipped > 0 {
        trace!("Skipped {} bytes of noise before frame", skipped);
    }

    let mut payload = Vec::new();
    loop {
        match read_byte(reader)? {
            END => return Ok(payload),
            ESC => payload.push(unescape(read_byte(reader)?)?),
            b => payload.push(b),
        }
    }
}

/// Consume exactly one delimiter, failing on anything else.
pub fn expect_end<R: Read + ?Sized>(reader: &mut R) -> Result<()> {
    match read_byte(reader)? {
        END => Ok(()),
        b => Err(Error::Framing(format!(
            "expected frame delimiter, got {:#04x}",
            b
        ))),
    }
}

/// Read `len` payload bytes from inside a frame, undoing the escaping. An
/// unescaped delimiter here means the frame ended early.
pub fn read_escaped<R: Read + ?Sized>(reader: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut payload = Vec::with_capacity(len);
    while payload.len() < len {
        match read_byte(reader)? {
            END => {
                return Err(Error::Framing(format!(
                    "frame ended after {} of {} bytes",
                    payload.len(),
                    len
                )))
            }
            ESC => payload.push(unescape(read_byte(reader)?)?),
            b => payload.push(b),
        }
    }
    Ok(payload)
}

// =============================================================================
// Private stuff
// =============================================================================

fn unescape(b: u8) -> Result<u8> {
    match b {
        ESC_END => Ok(END),
        ESC_ESC => Ok(ESC),
        other => Err(Error::Framing(format!(
            "invalid escape sequence {:#04x} {:#04x}",
            ESC, other
        ))),
    }
}

fn read_byte<R: Read + ?Sized>(reader: &mut R) -> Result<u8> {
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(1) => return Ok(byte[0]),
            Ok(_) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_escapes_reserved_bytes() {
        assert_eq!(
            encode(&[0x01, END, 0x02, ESC, 0x03]),
            vec![END, 0x01, ESC, ESC_END, 0x02, ESC, ESC_ESC, 0x03, END]
        );
    }

    #[test]
    fn empty_payload_is_two_delimiters() {
        assert_eq!(encode(&[]), vec![END, END]);
        assert_eq!(decode(&[END, END]).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn reserved_only_payload_round_trips() {
        let payload = [END, ESC, ESC, END, END, ESC_END, ESC_ESC];
        assert_eq!(decode(&encode(&payload)).unwrap(), payload.to_vec());
    }

    #[test]
    fn all_byte_values_round_trip() {
        let payload: Vec<u8> = (0..=255u8).rev().chain(0..=255u8).collect();
        assert_eq!(decode(&encode(&payload)).unwrap(), payload);
    }

    #[test]
    fn leading_noise_is_skipped() {
        let mut stream = vec![0x00, 0x55, 0xff, ESC];
        stream.extend(encode(b"OHAI"));
        assert_eq!(decode(&stream).unwrap(), b"OHAI".to_vec());
    }

    #[test]
    fn consecutive_frames_are_read_separately() {
        let mut stream = encode(b"one");
        stream.extend(encode(&[]));
        stream.extend(encode(b"two"));
        let mut cursor = &stream[..];
        assert_eq!(read_frame(&mut cursor).unwrap(), b"one".to_vec());
        assert_eq!(read_frame(&mut cursor).unwrap(), Vec::<u8>::new());
        assert_eq!(read_frame(&mut cursor).unwrap(), b"two".to_vec());
        assert!(cursor.is_empty());
    }

    #[test]
    fn invalid_escape_is_framing_error() {
        let err = decode(&[END, 0x01, ESC, 0x42, END]).unwrap_err();
        assert!(matches!(err, Error::Framing(_)));
    }

    #[test]
    fn unterminated_frame_is_framing_error() {
        let err = decode(&[END, 0x01, 0x02]).unwrap_err();
        assert!(matches!(err, Error::Framing(_)));
    }

    #[test]
    fn expect_end_rejects_other_bytes() {
        let mut cursor = &[0x01u8][..];
        assert!(matches!(expect_end(&mut cursor), Err(Error::Framing(_))));
    }

    #[test]
    fn read_escaped_stops_on_early_delimiter() {
        let mut cursor = &[0x01u8, ESC, ESC_END, END][..];
        let err = read_escaped(&mut cursor, 4).unwrap_err();
        assert!(matches!(err, Error::Framing(_)));

        let mut cursor = &[0x01u8, ESC, ESC_END, 0x02][..];
        assert_eq!(read_escaped(&mut cursor, 3).unwrap(), vec![0x01, END, 0x02]);
    }
}
