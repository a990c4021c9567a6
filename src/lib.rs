//! Flashcom talks to the boot ROM of ESP8266 chips over a serial line to load
//! programs into RAM, read and write device memory and program the SPI flash.
//!
//! The ROM speaks a slow request/response protocol framed with SLIP. For bulk
//! flash work, `flashcom` uploads a small flasher stub into RAM through the
//! ROM, starts it and switches to the stub's faster streaming protocol,
//! possibly at a higher baud rate.
//!
//! The library is layered bottom-up:
//!
//! * [`slip`] frames and unframes byte streams.
//! * [`session`] owns the serial link and the state that goes with it.
//! * [`rom`] implements the ROM protocol: connecting, loading memory, running
//!   the stub and the ROM-level commands.
//! * [`flasher`] speaks to a running flasher stub.
//! * [`image`] models the firmware image format.
//!
//! The command line tool drives those layers through a state machine that
//! opens the port (`Init`), resets and syncs the ROM (`Connect`), runs the
//! requested operation through the ROM (`RomMode`) or hands the session to
//! the flasher stub first (`StubMode`), and ends in `Done`. Each state owns
//! the session while it runs and passes it on through the event that leaves
//! it; the transitions are `From` conversions between events and states, so
//! only the ones listed there compile.

pub mod error;
pub mod flasher;
pub mod image;
pub mod rom;
pub mod session;
pub mod settings;
pub mod slip;

mod flash_protocol;
mod utils;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
pub use flash_protocol::{factory, SerialFlashProtocol};
pub use session::{Session, Transport};
pub use settings::{Operation, Settings, SettingsBuilder};
