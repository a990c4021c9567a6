//! Everything spoken with the ESP8266 boot ROM.
//!
//! Layered bottom-up: [`protocol`] frames one command and its response,
//! [`connect`] resets the chip and syncs, [`loader`] pushes blobs into RAM or
//! flash, [`stub`] uses the loader to start a helper program and
//! [`commands`] implements the remaining ROM-level operations.

pub mod commands;
pub mod connect;
pub mod loader;
pub mod protocol;
pub mod stub;

pub use commands::{
    dump_mem, flash_id, load_ram, read_mac, read_reg, run, write_flash, write_reg, FlashId,
    MacAddress,
};
pub use connect::{connect, sync, SYNC_PAYLOAD};
pub use loader::{erase_size, Destination, MemoryLoader};
pub use protocol::{checksum, command, Opcode, Response, CHECKSUM_MAGIC};
pub use stub::{run_stub, StubData, StubDescriptor};
