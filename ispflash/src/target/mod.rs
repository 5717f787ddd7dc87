//! Device sessions and the capability interface the bulk engine drives.
//!
//! A session is opened once per transport and speaks exactly one protocol
//! variant for its whole life:
//!
//! - [`IspLink`]: checksummed ISP frames over a serial [`Port`]; the session
//!   is established by the start-byte handshake.
//! - [`DfuLink`]: header frames over a USB [`ControlChannel`]; the session is
//!   established by opening the device.
//!
//! Both implement [`DeviceLink`], which is the only thing
//! [`Programmer`](crate::flasher::Programmer) knows about.
//!
//! [`Port`]: crate::port::Port
//! [`ControlChannel`]: crate::port::ControlChannel

pub mod dfu;
pub mod isp;

use std::fmt;

use crate::error::Result;
use crate::protocol::isp::{ISP_BANK1_ERASE, ISP_BANK2_ERASE, Opcode};

#[cfg(any(feature = "native", feature = "usb"))]
use crate::report::Reporter;

pub use dfu::DfuLink;
pub use isp::{IspConfig, IspLink};

/// Page size of the ISP protocol; also the chunk size of ISP bulk operations.
pub const ISP_PAGE_SIZE: usize = 128;

/// Chunk size of header-protocol bulk operations.
pub const DFU_CHUNK_SIZE: usize = 1024;

/// Protocol a session speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVariant {
    /// Checksummed ISP frames over serial.
    Isp,
    /// Header frames over a USB control channel.
    Dfu,
}

impl ProtocolVariant {
    /// Bulk operation chunk size.
    #[must_use]
    pub fn chunk_size(self) -> usize {
        match self {
            Self::Isp => ISP_PAGE_SIZE,
            Self::Dfu => DFU_CHUNK_SIZE,
        }
    }
}

impl fmt::Display for ProtocolVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Isp => write!(f, "ISP"),
            Self::Dfu => write!(f, "DFU"),
        }
    }
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Not connected yet, or closed.
    #[default]
    Idle,
    /// Handshake in progress.
    Probing,
    /// Device answered; commands may be dispatched.
    Connected,
    /// Handshake gave up; the transport is closed.
    Failed,
}

/// Flash bank selector for bank erase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bank {
    /// First bank.
    One,
    /// Second bank.
    Two,
}

impl Bank {
    /// Extended-erase sentinel page index for this bank.
    #[must_use]
    pub fn sentinel(self) -> u16 {
        match self {
            Self::One => ISP_BANK1_ERASE,
            Self::Two => ISP_BANK2_ERASE,
        }
    }
}

/// What an erase command should wipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseRequest {
    /// One page, basic erase (8-bit page index).
    Page(u16),
    /// One page, extended erase (16-bit page index).
    Extended(u16),
    /// Whole flash.
    Mass,
    /// One bank (extended erase only).
    Bank(Bank),
    /// Byte range (header protocol).
    Range {
        /// Start address.
        address: u32,
        /// Length in bytes.
        len: u32,
    },
}

/// Opcodes the bootloader reported through identify.
///
/// Filled once per session and read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupportedCommandSet {
    opcodes: Vec<u8>,
}

impl SupportedCommandSet {
    /// Build a set from raw opcode bytes.
    pub fn from_opcodes(opcodes: impl Into<Vec<u8>>) -> Self {
        Self {
            opcodes: opcodes.into(),
        }
    }

    /// Whether the device reported `opcode`.
    #[must_use]
    pub fn contains(&self, opcode: Opcode) -> bool {
        self.opcodes.contains(&(opcode as u8))
    }

    /// Whether the two-byte erase form is available.
    #[must_use]
    pub fn supports_extended_erase(&self) -> bool {
        self.contains(Opcode::ExtendedErase)
    }

    /// Whether nothing has been reported.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.opcodes.is_empty()
    }

    /// Raw opcode bytes in the order the device sent them.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.opcodes
    }

    /// Known opcodes, skipping bytes this crate has no name for.
    pub fn known(&self) -> impl Iterator<Item = Opcode> + '_ {
        self.opcodes.iter().filter_map(|&b| Opcode::from_byte(b))
    }
}

/// Parameters observed while the session was established.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DeviceInfo {
    /// Bootloader version byte (ISP identify) or loader version (DFU).
    pub bootloader_version: Option<u32>,
    /// Header protocol version (DFU only).
    pub protocol_version: Option<u32>,
    /// Product id (ISP get-id).
    pub product_id: Option<u16>,
    /// Opcodes reported by identify.
    pub commands: Vec<u8>,
}

/// Single capability interface over both protocol variants.
///
/// Commands fail with [`Error::NotActive`](crate::Error::NotActive) once the
/// session is closed, without touching the transport.
pub trait DeviceLink {
    /// Protocol this session speaks.
    fn variant(&self) -> ProtocolVariant;

    /// Whether commands may be dispatched.
    fn is_open(&self) -> bool;

    /// Close the session and release the transport. Idempotent.
    fn close(&mut self);

    /// Chunk size for bulk operations.
    fn chunk_size(&self) -> usize {
        self.variant().chunk_size()
    }

    /// Whether identify reported the extended erase opcode.
    fn supports_extended_erase(&self) -> bool;

    /// Parameters observed on connect.
    fn device_info(&self) -> DeviceInfo;

    /// Read `len` bytes at `address`.
    fn read_memory(&mut self, address: u32, len: usize) -> Result<Vec<u8>>;

    /// Write `data` at `address`.
    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<()>;

    /// Erase pages, a bank, a range or the whole flash.
    fn erase(&mut self, request: EraseRequest) -> Result<()>;

    /// Leave the bootloader and run code at `address`. Closes the session.
    fn start_application(&mut self, address: u32) -> Result<()>;

    /// Enable readout protection. Closes the session (device resets).
    fn readout_protect(&mut self) -> Result<()>;

    /// Disable readout protection. Closes the session (device resets).
    fn readout_unprotect(&mut self) -> Result<()>;
}

impl<L: DeviceLink + ?Sized> DeviceLink for Box<L> {
    fn variant(&self) -> ProtocolVariant {
        (**self).variant()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn close(&mut self) {
        (**self).close();
    }

    fn chunk_size(&self) -> usize {
        (**self).chunk_size()
    }

    fn supports_extended_erase(&self) -> bool {
        (**self).supports_extended_erase()
    }

    fn device_info(&self) -> DeviceInfo {
        (**self).device_info()
    }

    fn read_memory(&mut self, address: u32, len: usize) -> Result<Vec<u8>> {
        (**self).read_memory(address, len)
    }

    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<()> {
        (**self).write_memory(address, data)
    }

    fn erase(&mut self, request: EraseRequest) -> Result<()> {
        (**self).erase(request)
    }

    fn start_application(&mut self, address: u32) -> Result<()> {
        (**self).start_application(address)
    }

    fn readout_protect(&mut self) -> Result<()> {
        (**self).readout_protect()
    }

    fn readout_unprotect(&mut self) -> Result<()> {
        (**self).readout_unprotect()
    }
}

/// Where to find the device.
#[derive(Debug, Clone)]
pub enum LinkTarget {
    /// Serial ISP bootloader.
    Serial {
        /// Port name/path.
        port: String,
        /// Baud rate.
        baud: u32,
        /// Handshake and revision settings.
        config: IspConfig,
    },
    /// USB header-protocol bootloader.
    Usb {
        /// Vendor ID.
        vid: u16,
        /// Product ID.
        pid: u16,
    },
}

/// Open and connect a session for `target`.
///
/// This is the main entry point for hosts: the returned link has completed
/// its handshake and is ready for commands.
#[cfg(any(feature = "native", feature = "usb"))]
pub fn open_link(target: &LinkTarget, reporter: Reporter) -> Result<Box<dyn DeviceLink>> {
    match target {
        #[cfg(feature = "native")]
        LinkTarget::Serial { port, baud, config } => {
            Ok(Box::new(isp::open_serial(port, *baud, config.clone(), reporter)?))
        },
        #[cfg(feature = "usb")]
        LinkTarget::Usb { vid, pid } => Ok(Box::new(dfu::open_usb(*vid, *pid, reporter)?)),
        #[allow(unreachable_patterns)]
        _ => Err(crate::error::Error::Unsupported(
            "transport not compiled into this build".into(),
        )),
    }
}
