//! `flashcom` device operation flow.
//!
//! **Example** - Importing the public interfaces through flash_protocol:
//! ```ignore
//! use crate::{
//!     flash_protocol::{self as fpsm},
//!     settings::Settings,
//! };
//! ```
//!
//! **Example** - Executing the state machine event loop:
//! ```ignore
//! let settings = SettingsBuilder::new()
//!     .path("/dev/ttyUSB0")
//!     .operation(Operation::ReadMac)
//!     .finalize();
//! let mut fpsm = fpsm::factory(settings);
//! let status = fpsm.run();
//! ```

#[macro_use]
mod macros;

mod events;
mod state_machine;
mod states;

pub use state_machine::{factory, SerialFlashProtocol};
