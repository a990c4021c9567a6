//! Helper functions to deal with serial ports and the operations run over
//! them.

mod operations;
mod ports;

pub(crate) use operations::{run_rom_operation, run_stub_operation};
pub(crate) use ports::{open_and_setup_port, select_port};
