//! Helper macros for the flash protocol state machine modules.

/// Generate debug formatting code for a [`SerialPort`](serialport::SerialPort)
/// like struct.
#[macro_export]
macro_rules! debug_fmt_serialport {
    ($port:ident, $f:ident) => {
        $f.debug_tuple("")
            .field(&$port.name())
            .field(&$port.baud_rate())
            .field(&$port.timeout())
    };
}
