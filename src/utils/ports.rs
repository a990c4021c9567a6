//! Serial port device manipulation.

use console::{style, Term};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use serialport::{available_ports, SerialPort, SerialPortType};

use std::{io, thread, time::Duration};

use crate::Settings;

//==============================================================================
// Public Interface
//==============================================================================

pub(crate) fn select_port() -> Option<String> {
    // If no specific device was requested, we'll present the list of connected
    // devices to the user to interactively select one. The user may cancel the
    // selection to request for another refresh of connected devices, probably
    // waiting for a specific device to be connected.

    let mut found_ports;
    let mut attempt: usize = 1;
    let waiting_period: usize = 1;

    let pb = ProgressBar::new_spinner();
    pb.enable_steady_tick(120);
    pb.set_style(
        ProgressStyle::default_spinner()
            .tick_strings(&["⠋", "⠙", "⠚", "⠞", "⠖", "⠦", "⠴", "⠲", "⠳", "⠓"])
            .template("[FC] {spinner:.blue} {msg}"),
    );

    // Avoid cursor flicker during the waiting
    cursor_toggled("hide", Term::stdout().hide_cursor());
    loop {
        found_ports = enumerate_serial_ports();
        let num_ports = found_ports.len();
        if num_ports > 0 {
            pb.finish_with_message("Select the port the device is connected to:");
            break;
        } else {
            let waited = attempt * waiting_period;
            pb.set_message(format!(
                "[{:03}s {}] ⌛ Waiting for a serial adapter to be connected...",
                style(waited).dim(),
                num_ports
            ));
            attempt += 1;
        }

        thread::sleep(Duration::from_secs(waiting_period as u64));
    }
    cursor_toggled("show", Term::stdout().show_cursor());

    let selection = select_port_interactive(&found_ports);
    match &selection {
        Some(path) => {
            pb.finish_with_message(format!("👍 Serial port {} selected", style(path).green()));
        }
        None => {
            pb.finish_with_message("❌ Selection canceled -> refreshing...");
        }
    }
    selection
}

/// Open the port at `path` with the line settings and the read timeout in
/// `settings`. Opening is retried a few times since USB adapters take a
/// moment to settle after being plugged in.
pub(crate) fn open_and_setup_port(
    path: &str,
    settings: &Settings,
) -> Result<Box<dyn SerialPort>, serialport::Error> {
    use retry::{delay, retry_with_index};

    let result = retry_with_index(
        delay::Fixed::from_millis(1000).take(3),
        |index| -> Result<Box<dyn SerialPort>, serialport::Error> {
            debug!("Opening {} (attempt {})", path, index);
            serialport::new(path, settings.baud_rate)
                .data_bits(settings.data_bits)
                .stop_bits(settings.stop_bits)
                .parity(settings.parity)
                .flow_control(settings.flow_control)
                .timeout(settings.read_timeout)
                .open()
        },
    );
    match result {
        Ok(mut port) => {
            port.set_baud_rate(settings.baud_rate)?;
            port.set_data_bits(settings.data_bits)?;
            port.set_stop_bits(settings.stop_bits)?;
            port.set_parity(settings.parity)?;
            port.set_flow_control(settings.flow_control)?;

            let baud_rate = port.baud_rate()?;
            info!("Opened {} at {} baud", path, baud_rate);
            debug!("data_bits    : {:#?}", port.data_bits()?);
            debug!("stop_bits    : {:#?}", port.stop_bits()?);
            debug!("parity       : {:#?}", port.parity()?);
            debug!("flow control : {:#?}", port.flow_control()?);

            if baud_rate != settings.baud_rate {
                return Err(serialport::Error::new(
                    serialport::ErrorKind::InvalidInput,
                    format!(
                        "failed to set the baud rate to {}, which is probably not \
                         supported by the adapter",
                        settings.baud_rate
                    ),
                ));
            }

            Ok(port)
        }
        Err(err) => match err {
            retry::Error::Operation {
                error,
                total_delay,
                tries,
            } => {
                info!(
                    "Failed to open the port after {:?} and {} tries: {}",
                    total_delay, tries, error,
                );
                Err(error)
            }
            retry::Error::Internal(_) => {
                info!("Internal retry error while opening port");
                Err(serialport::Error::new(
                    serialport::ErrorKind::Unknown,
                    "internal error while retrying to open the port",
                ))
            }
        },
    }
}

//==============================================================================
// Private stuff
//==============================================================================

/// Enumerates serial devices on the system. USB adapters get their
/// manufacturer and product appended after a `:`.
fn enumerate_serial_ports() -> Vec<String> {
    let mut ports = vec![];
    match available_ports() {
        Ok(found) => {
            for p in found {
                match p.port_type {
                    SerialPortType::UsbPort(info) => {
                        let extended_name = format!(
                            "{}: ({} / {})",
                            p.port_name,
                            info.manufacturer.as_ref().map_or("", String::as_str),
                            info.product.as_ref().map_or("", String::as_str)
                        );
                        ports.push(extended_name);
                    }
                    _ => {
                        ports.push(p.port_name);
                    }
                }
            }
        }
        Err(ref e) => {
            info!("error: {}", e.to_string());
        }
    }
    ports
}

fn select_port_interactive(ports: &[String]) -> Option<String> {
    use dialoguer::{theme::ColorfulTheme, Select};

    let term = Term::buffered_stderr();
    let theme = ColorfulTheme::default();

    let mut select = Select::with_theme(&theme);
    for item in ports {
        select.item(item);
    }

    let selection = select.default(0).interact_on_opt(&term).ok().flatten()?;
    ports
        .get(selection)
        .and_then(|port| port.split(':').next())
        .map(String::from)
}

/// Report a failed cursor toggle. The port selection goes on either way,
/// only the terminal looks worse.
fn cursor_toggled(action: &str, result: io::Result<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(err) => {
            warn!("Cannot {} the terminal cursor: {}", action, err);
            false
        }
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_toggle_failure_is_reported() {
        assert!(cursor_toggled("hide", Ok(())));
        assert!(!cursor_toggled(
            "show",
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "terminal is gone"))
        ));
    }
}
