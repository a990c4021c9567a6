//! Events for the `flashcom` flash protocol state machine.
//!
//! This modules is private and restricted to the
//! [`flash_protocol`](crate::flash_protocol) scope. The public interface of the
//! flash protocol state machine is provided by
//! [`flash_protocol`](crate::flash_protocol).
//!
//! ```ignore
//! use super::events::*;
//! ```
//!
//! Refer to the [`state_machine`](super::state_machine) module for an overview
//! of states, events and transitions.

use std::fmt;

use serialport::SerialPort;

use crate::{session::Session, Settings};

/// The session type driven by the state machine.
pub(crate) type SerialSession = Session<Box<dyn SerialPort>>;

// =============================================================================
// Crate-Public Interface
// =============================================================================

// SwitchToConnectEvent ========================================================

/// Event fired to trigger a transition to [`ConnectState`].
///
/// This event happens while at the [`InitState`] after a serial port has been
/// successfully opened and configured.
pub(crate) struct SwitchToConnectEvent {
    pub settings: Settings,
    /// The serial port to be used in the next state. Consumed and moved to the
    /// next state.
    pub port: Box<dyn SerialPort>,
}
impl fmt::Debug for SwitchToConnectEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let port = &self.port;
        debug_fmt_serialport!(port, f).finish()
    }
}

// SwitchToRomModeEvent ========================================================

/// Event fired to trigger a transition to [`RomModeState`], once the boot ROM
/// answered the sync handshake.
#[derive(Debug)]
pub(crate) struct SwitchToRomModeEvent {
    pub settings: Settings,
    /// The ROM session, consumed and moved to the next state.
    pub session: SerialSession,
}

// SwitchToStubModeEvent =======================================================

/// Event fired to trigger a transition to [`StubModeState`].
///
/// This event happens while at the [`RomModeState`] when the requested
/// operation is carried out by the flasher stub.
#[derive(Debug)]
pub(crate) struct SwitchToStubModeEvent {
    pub settings: Settings,
    pub session: SerialSession,
}

// DoneEvent ===================================================================

/// What went wrong, and in which phase.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct Failure {
    pub phase: &'static str,
    pub message: String,
}

/// Event fired when the flash protocol execution completes and is about to
/// terminate. It triggers a transition to the `Done` state.
///
/// This event can happen at any state due to normal termination or abnormal
/// termination caused by an unrecoverable error.
#[derive(Debug)]
pub(crate) struct DoneEvent {
    pub settings: Settings,
    /// Set on abnormal completion.
    pub failure: Option<Failure>,
}

impl DoneEvent {
    pub fn ok(settings: &Settings) -> Self {
        DoneEvent {
            settings: settings.clone(),
            failure: None,
        }
    }

    pub fn failed(settings: &Settings, phase: &'static str, error: impl fmt::Display) -> Self {
        DoneEvent {
            settings: settings.clone(),
            failure: Some(Failure {
                phase,
                message: error.to_string(),
            }),
        }
    }
}

// ExitEvent ===================================================================

/// The last event that can be triggered in the flash protocol state machine and
/// will result in the event loop terminating with an `exit status`, handing
/// back the control to the original caller that started the state machine
/// event loop.
#[derive(Debug)]
pub(crate) struct ExitEvent {
    pub settings: Settings,
    /// Carried over from the [`DoneEvent`].
    pub failure: Option<Failure>,
}

// Events enum ==================================================================

/// Events that can be triggered within the flash protocol state machine of
/// `flashcom`.
///
/// Each possible value holds an `event`, which in turn may hold additional data
/// for the state transition. Such data is passed by the origin state for
/// potential use by the target state.
#[derive(Debug)]
pub(crate) enum Event {
    SwitchToConnect(SwitchToConnectEvent),
    SwitchToRomMode(SwitchToRomModeEvent),
    SwitchToStubMode(SwitchToStubModeEvent),
    Done(DoneEvent),
    Exit(ExitEvent),
}
