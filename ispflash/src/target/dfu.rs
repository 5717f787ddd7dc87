//! Header-protocol session over a USB control channel.
//!
//! There is no wire handshake: the session is `Connected` as soon as the
//! device is open. The loader and protocol versions are queried right away
//! so a host can report them, and a failing query closes the session.

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::port::ControlChannel;
use crate::protocol::dfu::{DfuCodec, DfuCommand};
use crate::report::Reporter;
use crate::target::{DeviceInfo, DeviceLink, EraseRequest, ProtocolVariant, SessionState};

/// Loader and protocol version pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfuVersion {
    /// Loader version.
    pub loader: u32,
    /// Header protocol version.
    pub protocol: u32,
}

/// Header-protocol session.
pub struct DfuLink<C: ControlChannel> {
    channel: C,
    reporter: Reporter,
    state: SessionState,
    version: Option<DfuVersion>,
}

impl<C: ControlChannel> DfuLink<C> {
    /// Wrap an opened channel.
    pub fn new(channel: C, reporter: Reporter) -> Self {
        Self {
            channel,
            reporter,
            state: SessionState::Idle,
            version: None,
        }
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Mark the session connected and query the versions.
    pub fn connect(&mut self) -> Result<()> {
        if !self.channel.is_open() {
            self.state = SessionState::Failed;
            return Err(Error::PortOpen(self.channel.name().to_string()));
        }
        self.state = SessionState::Connected;
        match self.version() {
            Ok(v) => {
                self.reporter.info(format!(
                    "Loader version: {}, protocol version: {}",
                    v.loader, v.protocol
                ));
                Ok(())
            },
            Err(e) => {
                self.close();
                Err(e)
            },
        }
    }

    fn run<T>(&mut self, op: impl FnOnce(&mut DfuCodec<'_, C>) -> Result<T>) -> Result<T> {
        if self.state != SessionState::Connected || !self.channel.is_open() {
            return Err(Error::NotActive);
        }
        let result = op(&mut DfuCodec::new(&mut self.channel));
        if let Err(e) = &result {
            if e.is_fatal_transport() {
                warn!("Transport failure, closing session: {e}");
                self.close();
            }
        }
        result
    }

    /// Version (`0x00`).
    pub fn version(&mut self) -> Result<DfuVersion> {
        let response = self.run(|codec| codec.send_request(DfuCommand::Version, 0, 0, &[], 0))?;
        let version = DfuVersion {
            loader: response.header.param1,
            protocol: response.header.param2,
        };
        self.version = Some(version);
        Ok(version)
    }

    /// Leave (`0x01`): start the application. Closes the session.
    pub fn leave(&mut self) -> Result<()> {
        let result = self
            .run(|codec| codec.send_request(DfuCommand::Leave, 0, 0, &[], 0))
            .map(|_| ());
        self.close();
        result
    }

    /// Read (`0x02`) `len` bytes at `address`.
    pub fn read(&mut self, address: u32, len: usize) -> Result<Vec<u8>> {
        let size = u32::try_from(len)
            .map_err(|_| Error::InvalidArgument(format!("read of {len} bytes")))?;
        let response =
            self.run(|codec| codec.send_request(DfuCommand::Read, address, size, &[], len))?;
        if response.payload.len() != len {
            return Err(Error::InvalidResponse(format!(
                "read of {len} bytes at 0x{address:08x} returned {}",
                response.payload.len()
            )));
        }
        Ok(response.payload)
    }

    /// Write (`0x03`) `data` at `address`.
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let size = u32::try_from(data.len())
            .map_err(|_| Error::InvalidArgument(format!("write of {} bytes", data.len())))?;
        self.run(|codec| codec.send_request(DfuCommand::Write, address, size, data, 0))
            .map(|_| ())
    }

    /// Erase (`0x04`) `len` bytes at `address`.
    pub fn erase_range(&mut self, address: u32, len: u32) -> Result<()> {
        self.run(|codec| codec.send_request(DfuCommand::Erase, address, len, &[], 0))
            .map(|_| ())
    }

    /// Close the session and the device. Idempotent.
    pub fn close(&mut self) {
        if self.state != SessionState::Idle {
            debug!("Closing DFU session on {}", self.channel.name());
        }
        self.channel.close();
        self.state = SessionState::Idle;
    }
}

impl<C: ControlChannel> DeviceLink for DfuLink<C> {
    fn variant(&self) -> ProtocolVariant {
        ProtocolVariant::Dfu
    }

    fn is_open(&self) -> bool {
        self.state == SessionState::Connected && self.channel.is_open()
    }

    fn close(&mut self) {
        DfuLink::close(self);
    }

    fn supports_extended_erase(&self) -> bool {
        false
    }

    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            bootloader_version: self.version.map(|v| v.loader),
            protocol_version: self.version.map(|v| v.protocol),
            ..DeviceInfo::default()
        }
    }

    fn read_memory(&mut self, address: u32, len: usize) -> Result<Vec<u8>> {
        self.read(address, len)
    }

    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.write(address, data)
    }

    fn erase(&mut self, request: EraseRequest) -> Result<()> {
        match request {
            EraseRequest::Range { address, len } => self.erase_range(address, len),
            other => Err(Error::Unsupported(format!(
                "{other:?} erase over the header protocol"
            ))),
        }
    }

    fn start_application(&mut self, address: u32) -> Result<()> {
        debug!("Leaving bootloader; the loader picks the entry point, not 0x{address:08x}");
        self.leave()
    }

    fn readout_protect(&mut self) -> Result<()> {
        Err(Error::Unsupported(
            "readout protection over the header protocol".into(),
        ))
    }

    fn readout_unprotect(&mut self) -> Result<()> {
        Err(Error::Unsupported(
            "readout protection over the header protocol".into(),
        ))
    }
}

impl<C: ControlChannel> Drop for DfuLink<C> {
    fn drop(&mut self) {
        self.channel.close();
    }
}

/// Open the USB device `vid:pid` and return the connected session.
#[cfg(feature = "usb")]
pub fn open_usb(
    vid: u16,
    pid: u16,
    reporter: Reporter,
) -> Result<DfuLink<crate::port::UsbControlPort>> {
    let channel = crate::port::UsbControlPort::open(vid, pid)?;
    let mut link = DfuLink::new(channel, reporter);
    link.connect()?;
    Ok(link)
}
