//! # ispflash
//!
//! A library for reflashing microcontrollers through their ROM bootloader.
//!
//! Two bootloader protocols are supported:
//!
//! - **ISP** over a serial port: start-byte handshake, XOR-checksummed
//!   frames, ACK/NACK after every frame.
//! - **DFU** over a USB control channel: fixed 16-byte header plus payload,
//!   one request/response round trip per command.
//!
//! On top of either session, [`Programmer`] runs the page-chunked dump,
//! erase and flash workflows with bounded per-chunk retry and optional
//! read-back verify.
//!
//! The library never prints. Progress and status go to an [`EventSink`]
//! supplied by the host; [`LogSink`] forwards them to the `log` facade.
//!
//! ## Features
//!
//! - `native` (default): serial ports via the `serialport` crate
//! - `usb` (default): USB control transfers via the `rusb` crate
//! - `serde`: serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use ispflash::{IspConfig, LinkTarget, MemoryRange, Programmer, Reporter, open_link};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let target = LinkTarget::Serial {
//!         port: "/dev/ttyUSB0".into(),
//!         baud: 115200,
//!         config: IspConfig::default(),
//!     };
//!     let link = open_link(&target, Reporter::log())?;
//!     let mut programmer = Programmer::new(link, Reporter::log());
//!
//!     let firmware = std::fs::read("firmware.bin")?;
//!     programmer.erase(MemoryRange::new(0x0800_0000, firmware.len()))?;
//!     programmer.flash(&firmware, 0x0800_0000, true)?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod device;
pub mod error;
pub mod flasher;
pub mod port;
pub mod protocol;
pub mod report;
pub mod target;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
#[cfg(feature = "usb")]
pub use port::{UsbControlPort, UsbDeviceInfo};
#[cfg(any(feature = "native", feature = "usb"))]
pub use target::open_link;
pub use {
    device::{DetectedPort, DeviceKind, auto_detect_port, detect_ports, format_port_list},
    error::{Error, ErrorCategory, Result},
    flasher::{Chunk, FLASH_BASE, FlashOptions, MemoryRange, NRETRY, Programmer},
    port::{ControlChannel, IspRevision, Port, PortEnumerator, PortInfo, SerialConfig},
    report::{Event, EventSink, LogSink, MemorySink, Reporter, Severity},
    target::{
        Bank, DeviceInfo, DeviceLink, DfuLink, EraseRequest, IspConfig, IspLink, LinkTarget,
        ProtocolVariant, SessionState, SupportedCommandSet,
    },
};
