//! The serial link to one device and the state that goes with it.
//!
//! A [`Session`] exclusively owns its [`Transport`]. Every protocol layer
//! borrows the session mutably for the duration of one exchange, so there is
//! never more than one outstanding request on the wire. Dropping the session
//! closes the underlying port.

use std::{
    fmt,
    io::{Read, Write},
    time::Duration,
};

use log::debug;
use serialport::{ClearBuffer, SerialPort};

use crate::error::Result;

// =============================================================================
// Public Interface
// =============================================================================

/// Byte-oriented duplex channel with the few line controls the boot flow
/// needs. Reads block until data arrives or the configured timeout expires.
pub trait Transport: Read + Write {
    /// Name of the underlying device, when it has one.
    fn name(&self) -> Option<String>;
    fn timeout(&self) -> Duration;
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()>;
    /// Drive the RTS control line.
    fn set_rts(&mut self, level: bool) -> Result<()>;
    /// Drive the DTR control line.
    fn set_dtr(&mut self, level: bool) -> Result<()>;
    /// Discard anything received but not read yet.
    fn clear_input(&mut self) -> Result<()>;
}

impl Transport for Box<dyn SerialPort> {
    fn name(&self) -> Option<String> {
        (**self).name()
    }

    fn timeout(&self) -> Duration {
        (**self).timeout()
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        Ok((**self).set_timeout(timeout)?)
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        Ok((**self).set_baud_rate(baud_rate)?)
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        Ok((**self).write_request_to_send(level)?)
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        Ok((**self).write_data_terminal_ready(level)?)
    }

    fn clear_input(&mut self) -> Result<()> {
        Ok((**self).clear(ClearBuffer::Input)?)
    }
}

/// State of one device connection: the open transport, the current baud rate
/// and whether the flasher stub has taken over from the ROM.
pub struct Session<T: Transport> {
    port: T,
    baud_rate: u32,
    stub_active: bool,
}

impl<T: Transport> Session<T> {
    pub fn new(port: T, baud_rate: u32) -> Self {
        Session {
            port,
            baud_rate,
            stub_active: false,
        }
    }

    pub fn port(&mut self) -> &mut T {
        &mut self.port
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Switch both ends of the link to `baud_rate`. The device side must
    /// already have been told to expect the new rate.
    pub fn change_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        debug!("Switching link from {} to {} baud", self.baud_rate, baud_rate);
        self.port.set_baud_rate(baud_rate)?;
        self.baud_rate = baud_rate;
        Ok(())
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.port.set_timeout(timeout)
    }

    pub fn timeout(&self) -> Duration {
        self.port.timeout()
    }

    /// `true` once the stub is running and the ROM protocol no longer applies.
    pub fn is_stub_active(&self) -> bool {
        self.stub_active
    }

    pub(crate) fn set_stub_active(&mut self, active: bool) {
        self.stub_active = active;
    }

    /// Tear the session down and give the transport back.
    pub fn into_inner(self) -> T {
        self.port
    }
}

impl<T: Transport> fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("port", &self.port.name())
            .field("baud_rate", &self.baud_rate)
            .field("stub_active", &self.stub_active)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::{Arc, Mutex},
    };

    use serialport::{DataBits, FlowControl, Parity, StopBits};

    use super::*;
    use crate::testing::MockPort;

    /// Serial port that only remembers which buffers it was asked to clear.
    struct ClearLog(Arc<Mutex<Vec<ClearBuffer>>>);

    impl Read for ClearLog {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    impl Write for ClearLog {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SerialPort for ClearLog {
        fn name(&self) -> Option<String> {
            None
        }
        fn baud_rate(&self) -> serialport::Result<u32> {
            Ok(115_200)
        }
        fn data_bits(&self) -> serialport::Result<DataBits> {
            Ok(DataBits::Eight)
        }
        fn flow_control(&self) -> serialport::Result<FlowControl> {
            Ok(FlowControl::None)
        }
        fn parity(&self) -> serialport::Result<Parity> {
            Ok(Parity::None)
        }
        fn stop_bits(&self) -> serialport::Result<StopBits> {
            Ok(StopBits::One)
        }
        fn timeout(&self) -> Duration {
            Duration::from_secs(1)
        }
        fn set_baud_rate(&mut self, _: u32) -> serialport::Result<()> {
            Ok(())
        }
        fn set_data_bits(&mut self, _: DataBits) -> serialport::Result<()> {
            Ok(())
        }
        fn set_flow_control(&mut self, _: FlowControl) -> serialport::Result<()> {
            Ok(())
        }
        fn set_parity(&mut self, _: Parity) -> serialport::Result<()> {
            Ok(())
        }
        fn set_stop_bits(&mut self, _: StopBits) -> serialport::Result<()> {
            Ok(())
        }
        fn set_timeout(&mut self, _: Duration) -> serialport::Result<()> {
            Ok(())
        }
        fn write_request_to_send(&mut self, _: bool) -> serialport::Result<()> {
            Ok(())
        }
        fn write_data_terminal_ready(&mut self, _: bool) -> serialport::Result<()> {
            Ok(())
        }
        fn read_clear_to_send(&mut self) -> serialport::Result<bool> {
            Ok(false)
        }
        fn read_data_set_ready(&mut self) -> serialport::Result<bool> {
            Ok(false)
        }
        fn read_ring_indicator(&mut self) -> serialport::Result<bool> {
            Ok(false)
        }
        fn read_carrier_detect(&mut self) -> serialport::Result<bool> {
            Ok(false)
        }
        fn bytes_to_read(&self) -> serialport::Result<u32> {
            Ok(0)
        }
        fn bytes_to_write(&self) -> serialport::Result<u32> {
            Ok(0)
        }
        fn clear(&self, buffer_to_clear: ClearBuffer) -> serialport::Result<()> {
            if let Ok(mut log) = self.0.lock() {
                log.push(buffer_to_clear);
            }
            Ok(())
        }
        fn try_clone(&self) -> serialport::Result<Box<dyn SerialPort>> {
            Ok(Box::new(ClearLog(Arc::clone(&self.0))))
        }
        fn set_break(&self) -> serialport::Result<()> {
            Ok(())
        }
        fn clear_break(&self) -> serialport::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn clear_input_keeps_pending_output() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut port: Box<dyn SerialPort> = Box::new(ClearLog(Arc::clone(&log)));
        Transport::clear_input(&mut port).unwrap();
        assert_eq!(*log.lock().unwrap(), vec![ClearBuffer::Input]);
    }

    #[test]
    fn new_session_talks_to_rom() {
        let session = Session::new(MockPort::new(), 115_200);
        assert!(!session.is_stub_active());
        assert_eq!(session.baud_rate(), 115_200);
    }

    #[test]
    fn change_baud_rate_reaches_port() {
        let mut session = Session::new(MockPort::new(), 115_200);
        session.change_baud_rate(921_600).unwrap();
        assert_eq!(session.baud_rate(), 921_600);
        assert_eq!(session.into_inner().baud_rate, 921_600);
    }
}
