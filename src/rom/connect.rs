//! Reset the device into its boot ROM and get the ROM to sync with us.
//!
//! The ROM auto-bauds on the first bytes it sees after a reset, so a sync is
//! only meaningful right after a reset pulse. Neither the reset timing nor
//! the ROM bring-up latency is deterministic, hence two nested retry loops:
//! an outer one that pulses the control lines and an inner one that repeats
//! the sync exchange.

use std::{thread, time::Duration};

use log::{debug, info};
use retry::{delay, retry_with_index, OperationResult};

use super::protocol::{command, Opcode};
use crate::{
    error::{Error, Result},
    session::{Session, Transport},
    settings::Settings,
};

/// Sync word followed by 32 bytes of `0x55` for the auto-baud detector.
pub const SYNC_PAYLOAD: [u8; 36] = [
    0x07, 0x07, 0x12, 0x20, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
    0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
    0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
];

/// The ROM answers one sync with several identical responses; all but the
/// first are read back as bare responses.
const SYNC_EXTRA_RESPONSES: usize = 7;

/// Open a ROM session on `port`.
///
/// Gives up with [`Error::Connect`] after `connect_attempts` resets with
/// `sync_attempts` syncs each. Failures of individual syncs are expected and
/// only logged; a failure to drive the control lines is returned as is.
pub fn connect<T: Transport>(port: T, settings: &Settings) -> Result<Session<T>> {
    let mut session = Session::new(port, settings.baud_rate);
    let resets = settings.connect_attempts.max(1);
    let syncs = settings.sync_attempts.max(1);
    info!("Connecting to the boot ROM...");

    let result = retry_with_index(
        delay::NoDelay.take(resets - 1),
        |reset| -> OperationResult<(), Error> {
            debug!("Reset into the boot ROM, attempt {} of {}", reset, resets);
            if let Err(err) = reset_into_rom(&mut session, settings) {
                return OperationResult::Err(err);
            }
            if let Err(err) = session.set_timeout(settings.sync_timeout) {
                return OperationResult::Err(err);
            }

            let synced = retry_with_index(
                delay::Fixed::from_millis(settings.retry_delay.as_millis() as u64).take(syncs - 1),
                |attempt| {
                    let result = sync(&mut session);
                    if let Err(ref err) = result {
                        debug!("Sync #{}.{} failed: {}", reset, attempt, err);
                    }
                    result
                },
            );
            match synced {
                Ok(()) => OperationResult::Ok(()),
                Err(_) => OperationResult::Retry(Error::Connect {
                    attempts: resets * syncs,
                }),
            }
        },
    );

    match result {
        Ok(()) => {
            session.set_timeout(settings.read_timeout)?;
            info!("Connected to the boot ROM at {} baud", session.baud_rate());
            Ok(session)
        }
        Err(retry::Error::Operation { error, tries, .. }) => {
            info!("Giving up on the boot ROM after {} resets", tries);
            Err(error)
        }
        Err(retry::Error::Internal(msg)) => Err(Error::Protocol(msg)),
    }
}

/// One sync exchange: flush, send the sync frame, then read back the
/// remaining copies of the answer so the next command starts clean.
pub fn sync<T: Transport>(session: &mut Session<T>) -> Result<()> {
    session.port().clear_input()?;
    command(session, Some(Opcode::Sync), &SYNC_PAYLOAD, 0)?;
    for _ in 0..SYNC_EXTRA_RESPONSES {
        command(session, None, &[], 0)?;
    }
    Ok(())
}

/// Pulse the control lines so the chip restarts into its download mode.
///
/// RTS drives reset, DTR drives the boot-mode strap (GPIO0); both are active
/// high unless the adapter inverts them. Reset is pulsed with the strap
/// released, the strap is then held while the chip comes out of reset, and
/// finally released again.
fn reset_into_rom<T: Transport>(session: &mut Session<T>, settings: &Settings) -> Result<()> {
    let on = !settings.invert_control_lines;
    let off = settings.invert_control_lines;
    let port = session.port();

    port.set_dtr(off)?;
    port.set_rts(on)?;
    pause(settings.reset_delay);
    port.set_dtr(on)?;
    port.set_rts(off)?;
    pause(settings.reset_delay);
    port.set_dtr(off)?;
    Ok(())
}

fn pause(duration: Duration) {
    if duration > Duration::from_millis(0) {
        thread::sleep(duration);
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
