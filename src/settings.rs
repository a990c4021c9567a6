//! Settings related to the flashcom serial port, the boot ROM handshake and
//! the requested operation.
//!
//! Use the [builder](https://doc.rust-lang.org/1.0.0/style/ownership/builders.html)
//! pattern to set the configurable values.

use std::time::Duration;

pub use serialport::{DataBits, FlowControl, Parity, StopBits};

use crate::{flasher::DEFAULT_WINDOW, image::FlashParams};

// =============================================================================
// Public Interface
// =============================================================================

/// A device-facing operation to run once the boot ROM is connected.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Operation {
    /// Load a firmware image into RAM and execute it.
    LoadRam { image: String },
    /// Read one 32-bit word of device memory.
    ReadMem { address: u32 },
    /// Read-modify-write one 32-bit word of device memory.
    WriteMem { address: u32, value: u32, mask: u32 },
    /// Dump a memory region to a file.
    DumpMem {
        address: u32,
        size: u32,
        output: String,
    },
    /// Write files to flash at the given addresses.
    WriteFlash {
        regions: Vec<(u32, String)>,
        flash_params: FlashParams,
        /// When `false`, write through the ROM only.
        use_stub: bool,
    },
    /// Read a flash region into a file.
    ReadFlash {
        address: u32,
        size: u32,
        output: String,
    },
    /// Erase the whole flash chip.
    EraseFlash,
    /// Leave download mode and run the firmware in flash.
    Run,
    ReadMac,
    FlashId,
    /// Upload an arbitrary stub and print what it sends back.
    RunStub { stub: String, params: Vec<u32> },
}

impl Operation {
    /// Whether the operation is carried out by the flasher stub rather than
    /// the ROM.
    pub fn needs_stub(&self) -> bool {
        match self {
            Operation::WriteFlash { use_stub, .. } => *use_stub,
            Operation::ReadFlash { .. } | Operation::EraseFlash => true,
            _ => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::LoadRam { .. } => "load_ram",
            Operation::ReadMem { .. } => "read_mem",
            Operation::WriteMem { .. } => "write_mem",
            Operation::DumpMem { .. } => "dump_mem",
            Operation::WriteFlash { .. } => "write_flash",
            Operation::ReadFlash { .. } => "read_flash",
            Operation::EraseFlash => "erase_flash",
            Operation::Run => "run",
            Operation::ReadMac => "read_mac",
            Operation::FlashId => "flash_id",
            Operation::RunStub { .. } => "run_stub",
        }
    }
}

/// Groups all settings used by `flashcom` and acts as a
/// [builder](https://doc.rust-lang.org/1.0.0/style/ownership/builders.html)
/// for the settings.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Settings {
    /// The port name, usually the device path.
    pub path: Option<String>,
    /// The baud rate used to talk to the boot ROM.
    pub baud_rate: u32,
    /// The baud rate the flasher stub switches to. Zero keeps `baud_rate`.
    pub flash_baud_rate: u32,
    /// Number of bits used to represent a character sent on the line.
    pub data_bits: DataBits,
    /// The type of signalling to use for controlling data transfer.
    pub flow_control: FlowControl,
    /// The type of parity to use for error checking.
    pub parity: Parity,
    /// Number of bits to use to signal the end of a character.
    pub stop_bits: StopBits,

    /// How many times the device is reset into the boot ROM before giving up.
    pub connect_attempts: usize,
    /// Sync attempts after each reset.
    pub sync_attempts: usize,
    /// Read timeout while syncing.
    pub sync_timeout: Duration,
    /// Read timeout for everything else.
    pub read_timeout: Duration,
    /// Settle time between control line changes.
    pub reset_delay: Duration,
    /// Pause between failed sync attempts.
    pub retry_delay: Duration,
    /// Set when the adapter drives RTS/DTR low for an asserted line.
    pub invert_control_lines: bool,

    /// Cap on unacknowledged bytes during stub flash writes, between one
    /// 1 KiB chunk and the stub's 4 KiB receive buffer.
    pub flash_window: usize,
    /// Stub descriptor to use instead of the embedded flasher stub.
    pub stub: Option<String>,

    /// What to do once connected.
    pub operation: Option<Operation>,

    /// Restrict creation of `Settings` instances unless through the
    /// `SettingsBuilder`.
    #[doc(hidden)]
    _private_use_builder: (),
}

/// The builder for the `Settings` values.
///
/// All values are optional and have default values that will be used if not
/// explicitly set.
///
/// **Example**
///
/// ```ignore
/// let settings = SettingsBuilder::new().path("/dev/ttyUSB0").finalize();
/// ```
pub struct SettingsBuilder {
    settings: Settings,
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SettingsBuilder {
    /// Start building the settings using default values and no path for the
    /// port.
    pub fn new() -> Self {
        SettingsBuilder {
            settings: Settings {
                path: None,
                baud_rate: 115_200,
                flash_baud_rate: 921_600,
                data_bits: DataBits::Eight,
                flow_control: FlowControl::None,
                parity: Parity::None,
                stop_bits: StopBits::One,
                connect_attempts: 4,
                sync_attempts: 4,
                sync_timeout: Duration::from_millis(300),
                read_timeout: Duration::from_secs(5),
                reset_delay: Duration::from_millis(50),
                retry_delay: Duration::from_millis(50),
                invert_control_lines: false,
                flash_window: DEFAULT_WINDOW,
                stub: None,
                operation: None,
                _private_use_builder: (),
            },
        }
    }

    /// Set the path to the serial port
    pub fn path<'a>(mut self, path: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.path = Some(path.into().as_ref().to_owned());
        self
    }

    /// Set the boot ROM baud rate in symbols-per-second
    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.settings.baud_rate = baud_rate;
        self
    }

    /// Set the baud rate used once the flasher stub runs
    pub fn flash_baud_rate(mut self, flash_baud_rate: u32) -> Self {
        self.settings.flash_baud_rate = flash_baud_rate;
        self
    }

    /// Set the number of bits used to represent a character sent on the line
    pub fn data_bits(mut self, data_bits: DataBits) -> Self {
        self.settings.data_bits = data_bits;
        self
    }

    /// Set the type of signalling to use for controlling data transfer
    pub fn flow_control(mut self, flow_control: FlowControl) -> Self {
        self.settings.flow_control = flow_control;
        self
    }

    /// Set the type of parity to use for error checking
    pub fn parity(mut self, parity: Parity) -> Self {
        self.settings.parity = parity;
        self
    }

    /// Set the number of bits to use to signal the end of a character
    pub fn stop_bits(mut self, stop_bits: StopBits) -> Self {
        self.settings.stop_bits = stop_bits;
        self
    }

    pub fn connect_attempts(mut self, connect_attempts: usize) -> Self {
        self.settings.connect_attempts = connect_attempts;
        self
    }

    pub fn sync_attempts(mut self, sync_attempts: usize) -> Self {
        self.settings.sync_attempts = sync_attempts;
        self
    }

    pub fn sync_timeout(mut self, sync_timeout: Duration) -> Self {
        self.settings.sync_timeout = sync_timeout;
        self
    }

    pub fn read_timeout(mut self, read_timeout: Duration) -> Self {
        self.settings.read_timeout = read_timeout;
        self
    }

    pub fn reset_delay(mut self, reset_delay: Duration) -> Self {
        self.settings.reset_delay = reset_delay;
        self
    }

    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.settings.retry_delay = retry_delay;
        self
    }

    /// Swap the active level of the RTS/DTR lines
    pub fn invert_control_lines(mut self, invert: bool) -> Self {
        self.settings.invert_control_lines = invert;
        self
    }

    /// Set the flow-control window for stub flash writes
    pub fn flash_window(mut self, flash_window: usize) -> Self {
        self.settings.flash_window = flash_window;
        self
    }

    /// Set the path to a stub descriptor replacing the embedded flasher
    pub fn stub<'a>(mut self, stub: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.stub = Some(stub.into().as_ref().to_owned());
        self
    }

    pub fn operation(mut self, operation: Operation) -> Self {
        self.settings.operation = Some(operation);
        self
    }

    pub fn finalize(self) -> Settings {
        self.settings
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn all_default() {
    let settings = SettingsBuilder::new().finalize();
    assert_eq!(
        settings,
        Settings {
            path: None,
            baud_rate: 115_200,
            flash_baud_rate: 921_600,
            data_bits: DataBits::Eight,
            flow_control: FlowControl::None,
            parity: Parity::None,
            stop_bits: StopBits::One,
            connect_attempts: 4,
            sync_attempts: 4,
            sync_timeout: Duration::from_millis(300),
            read_timeout: Duration::from_secs(5),
            reset_delay: Duration::from_millis(50),
            retry_delay: Duration::from_millis(50),
            invert_control_lines: false,
            flash_window: 4096,
            stub: None,
            operation: None,
            _private_use_builder: (),
        }
    )
}

#[test]
fn path() {
    let settings = SettingsBuilder::new().path("/dev/ttyUSB0").finalize();
    assert_eq!(settings.path.unwrap(), "/dev/ttyUSB0");
}

#[test]
fn baud_rates() {
    let settings = SettingsBuilder::new()
        .baud_rate(74_880)
        .flash_baud_rate(0)
        .finalize();
    assert_eq!(settings.baud_rate, 74_880);
    assert_eq!(settings.flash_baud_rate, 0);
}

#[test]
fn data_bits() {
    let data_bits = DataBits::Seven;
    let settings = SettingsBuilder::new().data_bits(data_bits).finalize();
    assert_eq!(settings.data_bits, data_bits);
}

#[test]
fn flow_control() {
    let flow_control = FlowControl::Hardware;
    let settings = SettingsBuilder::new().flow_control(flow_control).finalize();
    assert_eq!(settings.flow_control, flow_control);
}

#[test]
fn stop_bits() {
    let stop_bits = StopBits::Two;
    let settings = SettingsBuilder::new().stop_bits(stop_bits).finalize();
    assert_eq!(settings.stop_bits, stop_bits);
}

#[test]
fn parity() {
    let parity = Parity::Even;
    let settings = SettingsBuilder::new().parity(parity).finalize();
    assert_eq!(settings.parity, parity);
}

#[test]
fn handshake_timing() {
    let settings = SettingsBuilder::new()
        .connect_attempts(2)
        .sync_attempts(8)
        .sync_timeout(Duration::from_millis(100))
        .read_timeout(Duration::from_secs(3))
        .reset_delay(Duration::from_millis(0))
        .retry_delay(Duration::from_millis(10))
        .invert_control_lines(true)
        .finalize();
    assert_eq!(settings.connect_attempts, 2);
    assert_eq!(settings.sync_attempts, 8);
    assert_eq!(settings.sync_timeout, Duration::from_millis(100));
    assert_eq!(settings.read_timeout, Duration::from_secs(3));
    assert_eq!(settings.reset_delay, Duration::from_millis(0));
    assert_eq!(settings.retry_delay, Duration::from_millis(10));
    assert!(settings.invert_control_lines);
}

#[test]
fn stub_and_window() {
    let settings = SettingsBuilder::new()
        .stub("stubs/custom.json")
        .flash_window(3072)
        .finalize();
    assert_eq!(settings.stub.unwrap(), "stubs/custom.json");
    assert_eq!(settings.flash_window, 3072);
}

#[test]
fn operation_needs_stub() {
    let write = |use_stub| Operation::WriteFlash {
        regions: vec![(0, "fw.bin".into())],
        flash_params: FlashParams::default(),
        use_stub,
    };
    assert!(write(true).needs_stub());
    assert!(!write(false).needs_stub());
    assert!(Operation::EraseFlash.needs_stub());
    assert!(!Operation::ReadMac.needs_stub());

    let settings = SettingsBuilder::new().operation(Operation::Run).finalize();
    assert_eq!(settings.operation.unwrap().name(), "run");
}
