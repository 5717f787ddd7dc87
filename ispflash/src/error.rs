//! Error types for ispflash.
//!
//! Every failure the library can surface is a variant of [`Error`]. The
//! variants are grouped into the coarse [`ErrorCategory`] a host shows to the
//! user, and [`Error::is_transient`] tells the bulk engine whether a chunk
//! operation is worth retrying.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for ispflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for ispflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the transport.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// USB error.
    #[cfg(feature = "usb")]
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// The port or device could not be opened.
    #[error("Cannot open {0}")]
    PortOpen(String),

    /// No data arrived within the read timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The device answered with something the protocol does not allow.
    #[error("Protocol invalid response: {0}")]
    InvalidResponse(String),

    /// The device rejected a frame.
    #[error("Device NACK")]
    Nack,

    /// The device refused a read because readout protection is active.
    #[error("Device is read protected")]
    ReadProtected,

    /// The device refused a write or erase because the memory is protected.
    #[error("Device is write protected")]
    WriteProtected,

    /// Read-back data differs from what was written.
    #[error("Verify failed at 0x{address:08x}")]
    VerifyMismatch {
        /// Address of the mismatching chunk.
        address: u32,
    },

    /// The device reported a failure status in a response header.
    #[error("Device reported error status {0:#x}")]
    DeviceStatus(u32),

    /// Firmware or dump file error.
    #[error("File error on {}: {source}", path.display())]
    File {
        /// Path of the file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// A command was issued without an open session.
    #[error("Not active")]
    NotActive,

    /// A caller-supplied argument is outside what the protocol can encode.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not available on this protocol variant.
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

/// Coarse error classes a host reports to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Port open failure, timeout, transport I/O.
    Port,
    /// Invalid response, NACK, protection, verify mismatch.
    Protocol,
    /// Firmware or dump file failure.
    File,
    /// Operation attempted without an active session.
    Cancelled,
    /// Bad arguments or unsupported operation.
    Usage,
}

impl Error {
    /// Category of this error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Io(_) | Self::PortOpen(_) | Self::Timeout(_) => ErrorCategory::Port,
            #[cfg(feature = "native")]
            Self::Serial(_) => ErrorCategory::Port,
            #[cfg(feature = "usb")]
            Self::Usb(_) => ErrorCategory::Port,
            Self::InvalidResponse(_)
            | Self::Nack
            | Self::ReadProtected
            | Self::WriteProtected
            | Self::VerifyMismatch { .. }
            | Self::DeviceStatus(_) => ErrorCategory::Protocol,
            Self::File { .. } => ErrorCategory::File,
            Self::NotActive => ErrorCategory::Cancelled,
            Self::InvalidArgument(_) | Self::Unsupported(_) => ErrorCategory::Usage,
        }
    }

    /// Whether repeating the same chunk operation may succeed.
    ///
    /// Transport hiccups and protocol errors are transient; a closed session,
    /// a file error or a bad argument will fail the same way every time.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Port | ErrorCategory::Protocol
        )
    }

    /// Whether this error means the transport itself is gone.
    ///
    /// Timeouts are excluded: the link is still usable after one.
    #[must_use]
    pub fn is_fatal_transport(&self) -> bool {
        match self {
            Self::Io(e) => e.kind() != io::ErrorKind::TimedOut,
            #[cfg(feature = "native")]
            Self::Serial(_) => true,
            #[cfg(feature = "usb")]
            Self::Usb(e) => !matches!(e, rusb::Error::Timeout),
            _ => false,
        }
    }

    /// Build a [`Error::File`] for `path`.
    pub fn file(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::File {
            path: path.into(),
            source,
        }
    }
}
