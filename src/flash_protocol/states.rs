//! States for the `flashcom` flash protocol state machine.
//!
//! This modules is private and restricted to the
//! [`flash_protocol`](crate::flash_protocol) scope. The public interface of the
//! flash protocol state machine is provided by
//! [`flash_protocol`](crate::flash_protocol).
//!
//! ```ignore
//! use super::states::*;
//! ```
//!
//! Refer to the [`state_machine`](super::state_machine) module for an overview
//! of states, events and transitions.

use std::fmt;

use console::style;
use log::{error, info};
use serialport::SerialPort;

use super::events::*;

use crate::{
    flasher::Flasher,
    rom::{self, StubDescriptor},
    settings::Settings,
    utils::{open_and_setup_port, run_rom_operation, run_stub_operation, select_port},
};

// =============================================================================
// Crate-Public Interface
// =============================================================================

/// Trait adding the ability for a state to be `run` after a transition into it.
pub(crate) trait Runnable {
    /// A state implements this method so it can be `run` after the state
    /// machine transitions into it.
    ///
    /// During this call, the state can do any work that needs to be done and
    /// when finished, requests a transition to a `new state` by returning the
    /// appropriate `event`. The `state` and the `event` are consumed to create
    /// the `new state` using the corresponding [`From`] trait implementation
    /// (provided such implementation exists).
    fn run(&mut self, settings: &Settings) -> Event;
}

// Init State ==================================================================

/// The initial state of the flash protocol state machine.
///
/// When no port was given in the settings, the user is asked to pick one of
/// the connected serial devices. The port is then opened and configured.
///
///  * **[`SwitchToConnectEvent`] => [`ConnectState`]** once the port is open,
///  * **[`DoneEvent`] => [`DoneState`]** when the port could not be opened.
#[derive(Debug)]
pub(crate) struct InitState {}
impl Runnable for InitState {
    fn run(&mut self, settings: &Settings) -> Event {
        info!("=> Init");

        let mut settings = settings.clone();
        let path = match settings.path.clone() {
            Some(path) => path,
            None => loop {
                if let Some(path) = select_port() {
                    break path;
                }
            },
        };
        settings.path = Some(path.clone());

        match open_and_setup_port(&path, &settings) {
            Ok(port) => Event::SwitchToConnect(SwitchToConnectEvent { settings, port }),
            Err(err) => Event::Done(DoneEvent::failed(&settings, "init", err)),
        }
    }
}

// Connect State ===============================================================

/// Resets the device into its boot ROM and syncs with it.
///
///  * **[`SwitchToRomModeEvent`] => [`RomModeState`]** after a successful sync,
///  * **[`DoneEvent`] => [`DoneState`]** when all attempts failed.
pub(crate) struct ConnectState {
    /// Consumed upon the transition to [`RomModeState`].
    pub port: Option<Box<dyn SerialPort>>,
}
impl Runnable for ConnectState {
    fn run(&mut self, settings: &Settings) -> Event {
        info!("=> Connect");

        if let Some(port) = self.port.take() {
            return match rom::connect(port, settings) {
                Ok(session) => {
                    println!("[FC] 🔗 Connected to the boot ROM");
                    Event::SwitchToRomMode(SwitchToRomModeEvent {
                        settings: settings.clone(),
                        session,
                    })
                }
                Err(err) => Event::Done(DoneEvent::failed(settings, "connect", err)),
            };
        }

        // We should never reach here!
        unreachable!()
    }
}
impl fmt::Debug for ConnectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.port {
            Some(port) => debug_fmt_serialport!(port, f).finish(),
            None => f.debug_tuple("ConnectState").finish(),
        }
    }
}

// RomMode State ===============================================================

/// Runs the requested operation against the boot ROM, unless the operation
/// needs the flasher stub.
///
///  * **[`SwitchToStubModeEvent`] => [`StubModeState`]** for stub operations,
///  * **[`DoneEvent`] => [`DoneState`]** when the operation completed or
///    failed.
#[derive(Debug)]
pub(crate) struct RomModeState {
    /// Consumed upon the transition to [`StubModeState`].
    pub session: Option<SerialSession>,
}
impl Runnable for RomModeState {
    fn run(&mut self, settings: &Settings) -> Event {
        info!("=> Rom Mode");

        if let Some(mut session) = self.session.take() {
            let operation = match &settings.operation {
                Some(operation) => operation,
                None => return Event::Done(DoneEvent::ok(settings)),
            };

            if operation.needs_stub() {
                return Event::SwitchToStubMode(SwitchToStubModeEvent {
                    settings: settings.clone(),
                    session,
                });
            }

            return match run_rom_operation(&mut session, operation) {
                Ok(()) => Event::Done(DoneEvent::ok(settings)),
                Err(err) => Event::Done(DoneEvent::failed(settings, operation.name(), err)),
            };
        }

        // We should never reach here!
        unreachable!()
    }
}

// StubMode State ==============================================================

/// Uploads and starts the flasher stub, then runs the requested operation
/// through it.
///
///  * **[`DoneEvent`] => [`DoneState`]** when the operation completed or
///    failed.
#[derive(Debug)]
pub(crate) struct StubModeState {
    pub session: Option<SerialSession>,
}
impl Runnable for StubModeState {
    fn run(&mut self, settings: &Settings) -> Event {
        info!("=> Stub Mode");

        if let Some(mut session) = self.session.take() {
            let stub = match &settings.stub {
                Some(path) => StubDescriptor::from_file(path),
                None => StubDescriptor::flasher(),
            };
            let stub = match stub {
                Ok(stub) => stub,
                Err(err) => return Event::Done(DoneEvent::failed(settings, "stub", err)),
            };

            let flasher = match Flasher::start(
                &mut session,
                &stub,
                settings.flash_baud_rate,
                settings.flash_window,
            ) {
                Ok(flasher) => flasher,
                Err(err) => return Event::Done(DoneEvent::failed(settings, "stub", err)),
            };
            println!("[FC] 🚀 Flasher stub is running");

            let result = match &settings.operation {
                Some(operation) => run_stub_operation(flasher, operation)
                    .map_err(|err| (operation.name(), err)),
                None => Ok(()),
            };
            return match result {
                Ok(()) => Event::Done(DoneEvent::ok(settings)),
                Err((phase, err)) => Event::Done(DoneEvent::failed(settings, phase, err)),
            };
        }

        // We should never reach here!
        unreachable!()
    }
}

// Done State ==================================================================

/// Reached when the flash protocol state machine completes its execution and
/// is about to terminate (normally or abnormally).
///
/// This state goes into a 2-phase execution. During the initial phase, it runs
/// like any other state to do its own things like printing some information,
/// cleaning up etc. It then triggers the [`ExitEvent`] to cause the flash
/// protocol state machine to terminate and exit.
///
/// Termination due to errors is indicated with the `failure` field in the
/// state. This condition can be used to set the return value from the flash
/// protocol state machine event loop.
#[derive(Debug, Clone)]
pub(crate) struct DoneState {
    /// Set on abnormal completion caused by an error.
    pub failure: Option<Failure>,
    /// When `true` instructs the flash protocol state machine to exit its
    /// event loop.
    pub should_exit: bool,
}
impl DoneState {
    pub fn with_error(&self) -> bool {
        self.failure.is_some()
    }
}
impl Runnable for DoneState {
    fn run(&mut self, settings: &Settings) -> Event {
        info!(
            "=> Done with{}errors",
            if self.with_error() { " " } else { " no " }
        );
        // Report errors
        if let Some(failure) = &self.failure {
            error!("{} failed: {}", failure.phase, failure.message);
            println!(
                "{}",
                style(format!("[FC] 💥 {} failed: {}", failure.phase, failure.message)).red()
            );
        } else {
            println!("{}", style("[FC] ✅ Done").green());
        }

        Event::Exit(ExitEvent {
            settings: settings.clone(),
            failure: self.failure.clone(),
        })
    }
}
