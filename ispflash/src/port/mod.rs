//! Transport abstraction for bootloader communication.
//!
//! Two kinds of channel carry the bootloader protocols:
//!
//! - **Serial** ([`Port`]): a duplex byte stream with per-read timeouts, used by
//!   the checksummed ISP protocol. Implemented by [`NativePort`] on top of the
//!   `serialport` crate.
//! - **USB control** ([`ControlChannel`]): whole request/response units, used
//!   by the header protocol. Implemented by `UsbControlPort` on top of `rusb`.
//!
//! ```text
//! +------------------+     +------------------+
//! |  ISP codec/link  |     |  DFU codec/link  |
//! +--------+---------+     +--------+---------+
//!          |                        |
//!          v                        v
//! +--------+---------+     +--------+---------+
//! |   Port trait     |     | ControlChannel   |
//! +--------+---------+     +--------+---------+
//!          |                        |
//!          v                        v
//! +--------+---------+     +--------+---------+
//! |    NativePort    |     |  UsbControlPort  |
//! |   (serialport)   |     |      (rusb)      |
//! +------------------+     +------------------+
//! ```

#[cfg(feature = "native")]
pub mod native;

#[cfg(feature = "usb")]
pub mod usb;

#[cfg(test)]
pub(crate) mod mock;

use std::io::{self, Read, Write};
use std::time::Duration;

use crate::error::{Error, Result};

/// Default per-read timeout.
pub const PORT_DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

/// ISP protocol revision, which decides the line parity and whether the
/// session identifies the device right after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IspRevision {
    /// Early bootloaders: no parity, no identification on connect.
    Legacy,
    /// Current bootloaders: even parity, identify and get-id on connect.
    #[default]
    Standard,
}

impl IspRevision {
    /// Line parity used by this revision.
    #[must_use]
    pub fn parity(self) -> Parity {
        match self {
            Self::Legacy => Parity::None,
            Self::Standard => Parity::Even,
        }
    }

    /// Whether the session runs identify and get-id after the handshake.
    #[must_use]
    pub fn identifies_on_connect(self) -> bool {
        matches!(self, Self::Standard)
    }
}

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Per-read timeout.
    pub timeout: Duration,
    /// Data bits.
    pub data_bits: DataBits,
    /// Parity.
    pub parity: Parity,
    /// Stop bits.
    pub stop_bits: StopBits,
    /// Flow control.
    pub flow_control: FlowControl,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115200,
            timeout: PORT_DEFAULT_TIMEOUT,
            data_bits: DataBits::Eight,
            parity: Parity::Even,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Configuration for an ISP link of the given revision: 8 data bits,
    /// one stop bit, no flow control, parity per revision.
    pub fn for_revision(
        port_name: impl Into<String>,
        baud_rate: u32,
        revision: IspRevision,
    ) -> Self {
        Self {
            parity: revision.parity(),
            ..Self::new(port_name, baud_rate)
        }
    }
}

/// Number of data bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    /// 7 data bits.
    Seven,
    /// 8 data bits.
    #[default]
    Eight,
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity.
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    #[default]
    Even,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    /// 1 stop bit.
    #[default]
    One,
    /// 2 stop bits.
    Two,
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    /// No flow control.
    #[default]
    None,
    /// Hardware flow control (RTS/CTS).
    Hardware,
}

/// Serial port information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial_number: Option<String>,
}

/// Byte-stream transport used by the ISP protocol.
pub trait Port: Read + Write + Send {
    /// Set the per-read timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current timeout.
    fn timeout(&self) -> Duration;

    /// Clear input/output buffers.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Set DTR (Data Terminal Ready) pin state.
    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// Set RTS (Request To Send) pin state.
    fn set_rts(&mut self, level: bool) -> Result<()>;

    /// Whether the port is still open.
    fn is_open(&self) -> bool;

    /// Close the port and release resources.
    ///
    /// Idempotent; safe to call from error paths.
    fn close(&mut self);

    /// Write all bytes, blocking until complete.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        Write::write_all(self, buf)?;
        Write::flush(self)?;
        Ok(())
    }

    /// Read a single byte, waiting at most the port timeout.
    fn read_byte(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        loop {
            match self.read(&mut buf) {
                Ok(1) => return Ok(buf[0]),
                Ok(_) => return Err(Error::Timeout(format!("no data on {}", self.name()))),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    return Err(Error::Timeout(format!("no data on {}", self.name())));
                },
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// Read up to `max` bytes.
    ///
    /// Keeps reading until `max` bytes arrived or one read times out. Returns
    /// what arrived; fails with [`Error::Timeout`] only if nothing did.
    fn read_up_to(&mut self, max: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; max];
        let mut filled = 0;
        while filled < max {
            match self.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) => return Err(Error::Io(e)),
            }
        }
        if filled == 0 && max > 0 {
            return Err(Error::Timeout(format!("no data on {}", self.name())));
        }
        buf.truncate(filled);
        Ok(buf)
    }
}

/// Request/response transport used by the header protocol.
///
/// Each call moves one whole unit; framing is the transport's job.
pub trait ControlChannel: Send {
    /// Send one request unit.
    fn write_request(&mut self, request: &[u8]) -> Result<()>;

    /// Receive one response unit of at most `max_len` bytes.
    fn read_response(&mut self, max_len: usize) -> Result<Vec<u8>>;

    /// Whether the channel is open.
    fn is_open(&self) -> bool;

    /// Release the device. Idempotent.
    fn close(&mut self);

    /// Human-readable identifier of the device.
    fn name(&self) -> &str;
}

/// Trait for listing available serial ports.
///
/// Separate from [`Port`] because listing needs no open port.
pub trait PortEnumerator {
    /// List all available serial ports.
    fn list_ports() -> Result<Vec<PortInfo>>;

    /// Find ports matching the given VID/PID.
    fn find_by_vid_pid(vid: u16, pid: u16) -> Result<Vec<PortInfo>> {
        let ports = Self::list_ports()?;
        Ok(ports
            .into_iter()
            .filter(|p| p.vid == Some(vid) && p.pid == Some(pid))
            .collect())
    }
}

#[cfg(feature = "native")]
pub use native::{NativePort, NativePortEnumerator};

#[cfg(feature = "usb")]
pub use usb::{UsbControlPort, UsbDeviceInfo};

#[cfg(test)]
mod tests {
    use super::mock::MockPort;
    use super::*;

    #[test]
    fn test_serial_config_for_revision() {
        let config = SerialConfig::for_revision("/dev/ttyUSB0", 57600, IspRevision::Standard);
        assert_eq!(config.parity, Parity::Even);
        assert_eq!(config.data_bits, DataBits::Eight);
        assert_eq!(config.stop_bits, StopBits::One);
        assert_eq!(config.flow_control, FlowControl::None);

        let legacy = SerialConfig::for_revision("/dev/ttyUSB0", 57600, IspRevision::Legacy);
        assert_eq!(legacy.parity, Parity::None);
        assert_eq!(legacy.baud_rate, 57600);
    }

    #[test]
    fn test_serial_config_builder() {
        let config = SerialConfig::new("COM3", 115200);
        assert_eq!(config.port_name, "COM3");
        assert_eq!(config.baud_rate, 115200);
        assert_eq!(config.timeout, PORT_DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_read_byte_times_out_on_silence() {
        let mut port = MockPort::new();
        assert!(matches!(port.read_byte(), Err(Error::Timeout(_))));
    }

    #[test]
    fn test_read_up_to_returns_partial_data() {
        let mut port = MockPort::with_rx(&[1, 2, 3]);
        assert_eq!(port.read_up_to(8).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_read_up_to_stops_at_max() {
        let mut port = MockPort::with_rx(&[1, 2, 3, 4]);
        assert_eq!(port.read_up_to(2).unwrap(), vec![1, 2]);
        assert_eq!(port.read_byte().unwrap(), 3);
    }

    #[test]
    fn test_read_up_to_fails_on_nothing() {
        let mut port = MockPort::new();
        assert!(matches!(port.read_up_to(4), Err(Error::Timeout(_))));
    }
}
