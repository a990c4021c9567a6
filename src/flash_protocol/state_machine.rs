//! `flashcom` flash protocol state machine.
//!
//! Every device-facing operation goes through the same phases: a serial port
//! is opened, the device is reset into its boot ROM and synced, then the
//! operation runs either against the ROM directly or through the flasher stub
//! which is uploaded and started on demand.
//!
//! The following state diagram summarizes the different states and transitions
//! `flashcom` goes through:
//!
//! ```text
//!   Init ──SwitchToConnect──> Connect ──SwitchToRomMode──> RomMode
//!    │                          │                           │   │
//!    │                          │          SwitchToStubMode │   │
//!    │                          │                           v   │
//!    │                          │                       StubMode│
//!    │                          │                           │   │
//!    └────────── Done ──────────┴───────────────────────────┴───┘
//!                  │
//!                  v
//!                 Done (should_exit) ──Exit──> exit status
//! ```

use super::events::*;
use super::states::*;
use crate::settings::Settings;

// =============================================================================
// Public Interface
// =============================================================================

/// Represents the `flashcom` flash protocol state machine. Use the `factory()`
/// function to get an instance then run it by calling its `run()` method.
pub struct SerialFlashProtocol {
    sm: ProtocolStates,
}
impl SerialFlashProtocol {
    /// The flash protocol state machine event loop runs until the `Done` state
    /// is reached and its `should_exit` flag is set. At such point, the event
    /// loop terminates and returns an exit code indicating no errors when equal
    /// to **`0`**; otherwise a termination with error.
    pub fn run(&mut self) -> i8 {
        loop {
            self.sm = self.sm.step();
            if let ProtocolStates::Done(sm) = &self.sm {
                if sm.state.should_exit {
                    return if sm.state.with_error() { 1 } else { 0 };
                }
            }
        }
    }
}

/// Factory function for the `flashcom` flash protocol state machine. Use it to
/// get an instance of the state machine, which you can run by invoking its
/// `run()` method.
pub fn factory(settings: Settings) -> SerialFlashProtocol {
    SerialFlashProtocol {
        // The same machine naturally starts in the `Init` state.
        sm: ProtocolStates::Init(ProtocolSM::new(settings)),
    }
}

// =============================================================================
// Private stuff
// =============================================================================

/// The raw state machine implementing `flashcom`'s flash protocol.
///
/// This is a private interface, abstracted for a simpler and more intuitive use
/// in the public `SerialFlashProtocol` interface.
#[derive(Debug)]
struct ProtocolSM<S: Runnable> {
    settings: Settings,
    state: S,
}
impl<S: Runnable> ProtocolSM<S> {
    fn run(&mut self) -> Event {
        self.state.run(&self.settings)
    }
}

/// The state machine starts in the `InitState`.
impl ProtocolSM<InitState> {
    fn new(settings: Settings) -> Self {
        ProtocolSM {
            settings,
            state: InitState {},
        }
    }
}

/// An enum wrapper around the states of the flash protocol state machine. It
/// provides a simpler and more intuitive model for manipulating states and
/// their transitions.
enum ProtocolStates {
    Init(ProtocolSM<InitState>),
    Connect(ProtocolSM<ConnectState>),
    RomMode(ProtocolSM<RomModeState>),
    StubMode(ProtocolSM<StubModeState>),
    Done(ProtocolSM<DoneState>),
}
impl ProtocolStates {
    /// The unit of work in the state machine event loop. It checks the current
    /// state and the current event and decides the next transition. State
    /// transitions from events are implemented using the rust `From`/`Into`
    /// pattern.
    fn step(&mut self) -> Self {
        match self {
            ProtocolStates::Init(sm) => {
                let event = sm.run();
                match event {
                    Event::SwitchToConnect(ev) => ProtocolStates::Connect(ev.into()),
                    Event::Done(ev) => ProtocolStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            ProtocolStates::Connect(sm) => {
                let event = sm.run();
                match event {
                    Event::SwitchToRomMode(ev) => ProtocolStates::RomMode(ev.into()),
                    Event::Done(ev) => ProtocolStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            ProtocolStates::RomMode(sm) => {
                let event = sm.run();
                match event {
                    Event::SwitchToStubMode(ev) => ProtocolStates::StubMode(ev.into()),
                    Event::Done(ev) => ProtocolStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            ProtocolStates::StubMode(sm) => {
                let event = sm.run();
                match event {
                    Event::Done(ev) => ProtocolStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            ProtocolStates::Done(sm) => {
                let event = sm.run();
                match event {
                    Event::Exit(ev) => ProtocolStates::Done(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
        }
    }
}

// -----------------------------------------------------------------------------
// State from Event transitions
// -----------------------------------------------------------------------------

impl From<SwitchToConnectEvent> for ProtocolSM<ConnectState> {
    fn from(event: SwitchToConnectEvent) -> ProtocolSM<ConnectState> {
        ProtocolSM {
            settings: event.settings,
            state: ConnectState {
                port: Some(event.port),
            },
        }
    }
}

impl From<SwitchToRomModeEvent> for ProtocolSM<RomModeState> {
    fn from(event: SwitchToRomModeEvent) -> ProtocolSM<RomModeState> {
        ProtocolSM {
            settings: event.settings,
            state: RomModeState {
                session: Some(event.session),
            },
        }
    }
}

impl From<SwitchToStubModeEvent> for ProtocolSM<StubModeState> {
    fn from(event: SwitchToStubModeEvent) -> ProtocolSM<StubModeState> {
        ProtocolSM {
            settings: event.settings,
            state: StubModeState {
                session: Some(event.session),
            },
        }
    }
}

impl From<DoneEvent> for ProtocolSM<DoneState> {
    fn from(event: DoneEvent) -> ProtocolSM<DoneState> {
        ProtocolSM {
            settings: event.settings,
            state: DoneState {
                failure: event.failure,
                should_exit: false,
            },
        }
    }
}
impl From<ExitEvent> for ProtocolSM<DoneState> {
    fn from(event: ExitEvent) -> ProtocolSM<DoneState> {
        ProtocolSM {
            settings: event.settings,
            state: DoneState {
                failure: event.failure,
                should_exit: true,
            },
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SettingsBuilder;

    #[test]
    fn done_state_exits_with_failure_status() {
        let settings = SettingsBuilder::new().path("/dev/null").finalize();
        let mut sm = ProtocolStates::Done(
            DoneEvent::failed(&settings, "connect", "no answer").into(),
        );
        sm = sm.step();
        match &sm {
            ProtocolStates::Done(done) => {
                assert!(done.state.should_exit);
                assert!(done.state.with_error());
                let failure = done.state.failure.as_ref().unwrap();
                assert_eq!(failure.phase, "connect");
                assert_eq!(failure.message, "no answer");
            }
            _ => panic!("expected the Done state"),
        }
    }

    #[test]
    fn run_returns_zero_after_clean_completion() {
        let settings = SettingsBuilder::new().path("/dev/null").finalize();
        let mut protocol = SerialFlashProtocol {
            sm: ProtocolStates::Done(DoneEvent::ok(&settings).into()),
        };
        assert_eq!(protocol.run(), 0);
    }

    #[test]
    fn run_returns_one_after_failure() {
        let settings = SettingsBuilder::new().path("/dev/null").finalize();
        let mut protocol = SerialFlashProtocol {
            sm: ProtocolStates::Done(DoneEvent::failed(&settings, "write_flash", "boom").into()),
        };
        assert_eq!(protocol.run(), 1);
    }
}
