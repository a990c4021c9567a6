//! The device-facing operations, as run by the flash protocol states.
//!
//! Each operation prints its outcome on the terminal with the `[FC]` prefix
//! and shows a progress bar for anything that moves more than a few words.

use std::fs;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, log_enabled, Level::Debug};
use serialport::SerialPort;

use crate::{
    error::{Error, Result},
    flasher::{Flasher, ProgressCallbacks},
    image::{prepare_flash_data, FirmwareImage},
    rom::{self, Destination, MemoryLoader, StubDescriptor},
    session::Session,
    settings::Operation,
};

//==============================================================================
// Public Interface
//==============================================================================

/// Run an operation that only needs the boot ROM.
pub(crate) fn run_rom_operation(
    session: &mut Session<Box<dyn SerialPort>>,
    operation: &Operation,
) -> Result<()> {
    match operation {
        Operation::LoadRam { image } => {
            let image = FirmwareImage::from_file(image)?;
            let total: usize = image.segments().iter().map(|s| s.data.len()).sum();
            let pb = transfer_bar(total as u64, "RAM");
            rom::load_ram(session, &image, |n| pb.set_position(n as u64))?;
            pb.finish_and_clear();
            println!(
                "[FC] 🏃 Image loaded, executing at {}",
                style(format!("{:#010x}", image.entry_point)).cyan()
            );
        }
        Operation::ReadMem { address } => {
            let value = rom::read_reg(session, *address)?;
            println!("[FC] {:#010x} = {:#010x}", address, value);
        }
        Operation::WriteMem {
            address,
            value,
            mask,
        } => {
            rom::write_reg(session, *address, *value, *mask, 0)?;
            println!(
                "[FC] Wrote {:#010x}, mask {:#010x} to {:#010x}",
                value, mask, address
            );
        }
        Operation::DumpMem {
            address,
            size,
            output,
        } => {
            let pb = transfer_bar(u64::from(*size / 4 * 4), "dump");
            let data = rom::dump_mem(session, *address, *size, |n| pb.set_position(n as u64))?;
            pb.finish_and_clear();
            dump_hex(&data, *address);
            fs::write(output, &data)?;
            println!(
                "[FC] 💾 {} bytes from {:#010x} saved to {}",
                data.len(),
                address,
                style(output).green()
            );
        }
        Operation::WriteFlash {
            regions,
            flash_params,
            ..
        } => {
            for (address, path) in regions {
                let data = prepare_flash_data(*address, fs::read(path)?, *flash_params);
                let pb = transfer_bar(data.len() as u64, "flash");
                rom::write_flash(session, *address, &data, |n| pb.set_position(n as u64))?;
                pb.finish_and_clear();
                println!(
                    "[FC] ✍️  Wrote {} bytes at {:#010x} from {}",
                    data.len(),
                    address,
                    style(path).green()
                );
            }
            MemoryLoader::new(session, Destination::Flash).finish(0)?;
        }
        Operation::Run => {
            rom::run(session, false)?;
            println!("[FC] 🏃 Running the firmware in flash");
        }
        Operation::ReadMac => {
            let mac = rom::read_mac(session)?;
            println!("[FC] MAC: {}", style(mac).cyan());
        }
        Operation::FlashId => {
            let id = rom::flash_id(session)?;
            println!("[FC] Manufacturer: {:02x}", id.manufacturer());
            println!("[FC] Device: {:04x}", id.device());
        }
        Operation::RunStub { stub, params } => {
            let stub = StubDescriptor::from_file(stub)?;
            let frames = rom::run_stub(session, &stub, params, true)?.unwrap_or_default();
            for (i, frame) in frames.iter().enumerate() {
                println!("[FC] Stub output #{} ({} bytes)", i, frame.len());
                println!(
                    "{}",
                    hexplay::HexViewBuilder::new(frame).row_width(16).finish()
                );
            }
        }
        Operation::ReadFlash { .. } | Operation::EraseFlash => {
            return Err(Error::Precondition(format!(
                "{} needs the flasher stub",
                operation.name()
            )));
        }
    }
    Ok(())
}

/// Run an operation through a started flasher stub.
pub(crate) fn run_stub_operation(
    mut flasher: Flasher<'_, Box<dyn SerialPort>>,
    operation: &Operation,
) -> Result<()> {
    match operation {
        Operation::WriteFlash {
            regions,
            flash_params,
            ..
        } => {
            for (address, path) in regions {
                let data = prepare_flash_data(*address, fs::read(path)?, *flash_params);
                let mut progress = TransferProgress::new("flash");
                let stats = flasher.write(*address, &data, Some(&mut progress))?;
                debug!(
                    "{} bytes acknowledged, at most {} in flight",
                    stats.acknowledged, stats.max_in_flight
                );
                println!(
                    "[FC] ✍️  Wrote {} bytes at {:#010x} from {} (digest verified)",
                    data.len(),
                    address,
                    style(path).green()
                );
            }
            flasher.reboot()?;
            println!("[FC] 🔁 Device rebooted");
        }
        Operation::ReadFlash {
            address,
            size,
            output,
        } => {
            let mut progress = TransferProgress::new("read");
            let data = flasher.read(*address, *size, Some(&mut progress))?;
            fs::write(output, &data)?;
            println!(
                "[FC] 💾 {} bytes from {:#010x} saved to {} (digest verified)",
                data.len(),
                address,
                style(output).green()
            );
        }
        Operation::EraseFlash => {
            println!("[FC] 🧹 Erasing the flash chip, this may take a while...");
            let size = flasher.erase_chip()?;
            println!("[FC] Flash erased ({} KiB)", size / 1024);
        }
        _ => {
            return Err(Error::Precondition(format!(
                "{} is not a flasher stub operation",
                operation.name()
            )));
        }
    }
    Ok(())
}

//==============================================================================
// Private stuff
//==============================================================================

fn transfer_bar(len: u64, what: &'static str) -> ProgressBar {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[FC] {msg:>6} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .progress_chars("=> "),
    );
    pb.set_message(what);
    pb
}

/// Progress bar driven by the flasher stub transfers.
struct TransferProgress {
    what: &'static str,
    pb: Option<ProgressBar>,
}

impl TransferProgress {
    fn new(what: &'static str) -> Self {
        TransferProgress { what, pb: None }
    }
}

impl ProgressCallbacks for TransferProgress {
    fn init(&mut self, addr: u32, total: usize) {
        debug!("{} of {} bytes at {:#010x}", self.what, total, addr);
        self.pb = Some(transfer_bar(total as u64, self.what));
    }

    fn update(&mut self, current: usize) {
        if let Some(pb) = &self.pb {
            pb.set_position(current as u64);
        }
    }

    fn finish(&mut self) {
        if let Some(pb) = self.pb.take() {
            pb.finish_and_clear();
        }
    }
}

fn dump_hex(data: &[u8], address: u32) {
    if log_enabled!(Debug) {
        let view = hexplay::HexViewBuilder::new(data)
            .address_offset(address as usize)
            .row_width(16)
            .finish();
        println!("{}", view);
    }
}
