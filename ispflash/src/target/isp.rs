//! ISP bootloader session over a serial port.
//!
//! ## Connect Sequence
//!
//! ```text
//! Idle ──► Probing ──(ACK / NACK)──► Connected ──► identify ──► get-id
//!             │
//!             └──(attempts exhausted)──► Failed (port closed, Timeout)
//! ```
//!
//! ACK answers a fresh bootloader; NACK means the bootloader already saw a
//! start byte earlier. Both count as connected. Early revisions stop right
//! after the handshake, later ones identify the device as part of connect.

use std::thread;
use std::time::Duration;

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::port::{IspRevision, Port};
use crate::protocol::isp::{
    ISP_ACK, ISP_BANK2_ERASE, ISP_MASS_ERASE, ISP_MAX_TRANSFER, ISP_NACK, ISP_START_FRAME, IspCodec,
    Opcode,
};
use crate::report::Reporter;
use crate::target::{
    DeviceInfo, DeviceLink, EraseRequest, ProtocolVariant, SessionState, SupportedCommandSet,
};

/// Handshake probes before giving up.
pub const ISP_HANDSHAKE_ATTEMPTS: usize = 5000;

/// Time to wait for an answer to one probe.
pub const ISP_PROBE_INTERVAL: Duration = Duration::from_millis(10);

/// Bytes drained per probe before moving on to the next one.
pub const ISP_PROBE_DRAIN_LIMIT: usize = 64;

/// Acknowledgement timeout for erase commands; a mass erase takes seconds.
pub const ERASE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long DTR/RTS are held asserted by the reset pulse.
const RESET_PULSE: Duration = Duration::from_millis(100);

/// Settle time after releasing reset before the first probe.
const RESET_SETTLE: Duration = Duration::from_millis(10);

/// Session settings.
#[derive(Debug, Clone)]
pub struct IspConfig {
    /// Protocol revision.
    pub revision: IspRevision,
    /// Handshake probes before giving up.
    pub handshake_attempts: usize,
    /// Wait per probe.
    pub probe_interval: Duration,
    /// Pulse DTR/RTS before the handshake to reset the board.
    pub reset_on_connect: bool,
    /// Acknowledgement timeout for erase commands.
    pub erase_timeout: Duration,
}

impl Default for IspConfig {
    fn default() -> Self {
        Self {
            revision: IspRevision::default(),
            handshake_attempts: ISP_HANDSHAKE_ATTEMPTS,
            probe_interval: ISP_PROBE_INTERVAL,
            reset_on_connect: false,
            erase_timeout: ERASE_TIMEOUT,
        }
    }
}

impl IspConfig {
    /// Set the protocol revision.
    #[must_use]
    pub fn with_revision(mut self, revision: IspRevision) -> Self {
        self.revision = revision;
        self
    }

    /// Set the number of handshake probes.
    #[must_use]
    pub fn with_handshake_attempts(mut self, attempts: usize) -> Self {
        self.handshake_attempts = attempts;
        self
    }

    /// Enable or disable the DTR/RTS reset pulse.
    #[must_use]
    pub fn with_reset(mut self, reset: bool) -> Self {
        self.reset_on_connect = reset;
        self
    }
}

/// Version and option bytes from get-version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
    /// Bootloader version byte.
    pub version: u8,
    /// The two option bytes following the version.
    pub option_bytes: [u8; 2],
}

/// ISP session.
///
/// Generic over the port type `P`, so tests can drive it with a scripted
/// port.
pub struct IspLink<P: Port> {
    port: P,
    config: IspConfig,
    reporter: Reporter,
    state: SessionState,
    commands: SupportedCommandSet,
    bootloader_version: Option<u8>,
    product_id: Option<u16>,
}

impl<P: Port> IspLink<P> {
    /// Wrap an opened port. The session starts `Idle`; call
    /// [`connect`](Self::connect) before issuing commands.
    pub fn new(port: P, config: IspConfig, reporter: Reporter) -> Self {
        Self {
            port,
            config,
            reporter,
            state: SessionState::Idle,
            commands: SupportedCommandSet::default(),
            bootloader_version: None,
            product_id: None,
        }
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Opcodes reported by identify.
    pub fn commands(&self) -> &SupportedCommandSet {
        &self.commands
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Run the handshake and, for the standard revision, identify the device.
    ///
    /// On any failure the port is closed before the error is returned.
    pub fn connect(&mut self) -> Result<()> {
        self.state = SessionState::Probing;
        if let Err(e) = self.handshake() {
            self.state = SessionState::Failed;
            self.port.close();
            return Err(e);
        }
        self.state = SessionState::Connected;

        if self.config.revision.identifies_on_connect() {
            let identified = self.identify().and_then(|version| {
                self.reporter
                    .info(format!("Bootloader version: {}.{}", version >> 4, version & 0x0F));
                let pid = self.get_id()?;
                self.reporter.info(format!("Product ID: 0x{pid:04X}"));
                Ok(())
            });
            if let Err(e) = identified {
                self.close();
                return Err(e);
            }
        }
        Ok(())
    }

    fn handshake(&mut self) -> Result<()> {
        if self.config.reset_on_connect {
            self.pulse_reset()?;
        }
        self.port.clear_buffers()?;
        self.reporter.hint("Enter ISP mode and connect device...");

        let saved = self.port.timeout();
        self.port.set_timeout(self.config.probe_interval)?;
        let probed = self.probe();
        let restored = self.port.set_timeout(saved);
        probed.and(restored)
    }

    fn pulse_reset(&mut self) -> Result<()> {
        debug!("Resetting device");
        self.port.set_dtr(true)?;
        self.port.set_rts(true)?;
        thread::sleep(RESET_PULSE);
        self.port.set_dtr(false)?;
        self.port.set_rts(false)?;
        thread::sleep(RESET_SETTLE);
        Ok(())
    }

    fn probe(&mut self) -> Result<()> {
        for attempt in 1..=self.config.handshake_attempts {
            self.port.write_all_bytes(&[ISP_START_FRAME])?;
            // A chatty line must not hold one probe open forever
            for _ in 0..ISP_PROBE_DRAIN_LIMIT {
                match self.port.read_byte() {
                    Ok(ISP_ACK) => {
                        self.reporter.info("Device ACK");
                        return Ok(());
                    },
                    Ok(ISP_NACK) => {
                        self.reporter.info("Device already connected");
                        return Ok(());
                    },
                    Ok(other) => trace!("Probe {attempt}: ignoring 0x{other:02X}"),
                    Err(Error::Timeout(_)) => break,
                    Err(e) => return Err(e),
                }
            }
            self.reporter.yield_now();
        }
        Err(Error::Timeout(format!(
            "no answer to {} handshake probes on {}",
            self.config.handshake_attempts,
            self.port.name()
        )))
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state == SessionState::Connected && self.port.is_open() {
            Ok(())
        } else {
            Err(Error::NotActive)
        }
    }

    /// Run one command against the port. A transport failure other than a
    /// timeout ends the session.
    fn run<T>(&mut self, op: impl FnOnce(&mut P) -> Result<T>) -> Result<T> {
        self.ensure_active()?;
        let result = op(&mut self.port);
        if let Err(e) = &result {
            if e.is_fatal_transport() {
                warn!("Transport failure, closing session: {e}");
                self.close();
            }
        }
        result
    }

    /// Identify (`0x00`): bootloader version and supported opcodes.
    ///
    /// The opcode set is kept from the first successful identify of the
    /// session; later calls only return the version.
    pub fn identify(&mut self) -> Result<u8> {
        let (version, opcodes) = self.run(|port| {
            let mut codec = IspCodec::new(port);
            send_opcode(&mut codec, Opcode::Get)?;
            let len = codec.read_byte()?;
            let version = codec.read_byte()?;
            let opcodes = codec.read_exact(usize::from(len))?;
            codec.read_ack()?;
            Ok((version, opcodes))
        })?;
        self.reporter
            .debug(format!("Identify: version 0x{version:02X}, opcodes {opcodes:02X?}"));
        if self.commands.is_empty() {
            self.commands = SupportedCommandSet::from_opcodes(opcodes);
        }
        self.bootloader_version = Some(version);
        Ok(version)
    }

    /// Get-version (`0x01`): version byte and the two option bytes.
    pub fn get_version(&mut self) -> Result<VersionInfo> {
        self.run(|port| {
            let mut codec = IspCodec::new(port);
            send_opcode(&mut codec, Opcode::GetVersion)?;
            let version = codec.read_byte()?;
            let options = codec.read_exact(2)?;
            codec.read_ack()?;
            Ok(VersionInfo {
                version,
                option_bytes: [options[0], options[1]],
            })
        })
    }

    /// Get-id (`0x02`): big-endian product id.
    pub fn get_id(&mut self) -> Result<u16> {
        let pid = self.run(|port| {
            let mut codec = IspCodec::new(port);
            send_opcode(&mut codec, Opcode::GetId)?;
            // Length byte; the id is always two bytes
            codec.read_byte()?;
            let id = codec.read_exact(2)?;
            codec.read_ack()?;
            Ok(u16::from_be_bytes([id[0], id[1]]))
        })?;
        self.product_id = Some(pid);
        Ok(pid)
    }

    /// Read-memory (`0x11`): `len` bytes (1..=256) at `address`.
    ///
    /// A NACK on the opcode means readout protection is active.
    pub fn read(&mut self, address: u32, len: usize) -> Result<Vec<u8>> {
        let size = transfer_len(len)?;
        self.run(|port| {
            let mut codec = IspCodec::new(port);
            send_opcode(&mut codec, Opcode::ReadMemory)?;
            codec.send_address(address)?;
            codec.send_frame(&[size])?;
            codec.read_exact(len)
        })
    }

    /// Write-memory (`0x31`): 1..=256 bytes at `address`.
    ///
    /// A NACK on the opcode means the memory is write protected.
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let size = transfer_len(data.len())?;
        self.run(|port| {
            let mut codec = IspCodec::new(port);
            send_opcode(&mut codec, Opcode::WriteMemory)?;
            codec.send_address(address)?;
            let mut frame = Vec::with_capacity(data.len() + 1);
            frame.push(size);
            frame.extend_from_slice(data);
            codec.send_frame(&frame)
        })
    }

    /// Erase (`0x43`) with a one-byte page index, or mass erase for
    /// [`ISP_MASS_ERASE`].
    pub fn erase_basic(&mut self, page: u16) -> Result<()> {
        let frame = if page == ISP_MASS_ERASE {
            vec![0xFF]
        } else {
            let page = u8::try_from(page).map_err(|_| {
                Error::InvalidArgument(format!("page {page} does not fit basic erase"))
            })?;
            vec![0x00, page]
        };
        self.erase_with(Opcode::Erase, &frame)
    }

    /// Extended erase (`0x44`) with a two-byte page index or a mass/bank
    /// sentinel.
    pub fn erase_extended(&mut self, page: u16) -> Result<()> {
        let [hi, lo] = page.to_be_bytes();
        let frame = if page >= ISP_BANK2_ERASE {
            vec![hi, lo]
        } else {
            vec![0x00, 0x00, hi, lo]
        };
        self.erase_with(Opcode::ExtendedErase, &frame)
    }

    fn erase_with(&mut self, opcode: Opcode, frame: &[u8]) -> Result<()> {
        let erase_timeout = self.config.erase_timeout;
        self.run(|port| {
            send_opcode(&mut IspCodec::new(port), opcode)?;
            let saved = port.timeout();
            port.set_timeout(erase_timeout)?;
            let sent = IspCodec::new(port).send_frame(frame);
            let restored = port.set_timeout(saved);
            sent.and(restored)
        })
    }

    /// Go (`0x21`): jump to `address`. The device leaves the bootloader, so
    /// the session is closed whether or not the command went through.
    pub fn go(&mut self, address: u32) -> Result<()> {
        let result = self.run(|port| {
            let mut codec = IspCodec::new(port);
            send_opcode(&mut codec, Opcode::Go)?;
            codec.send_address(address)
        });
        self.close();
        result
    }

    /// Readout-protect (`0x82`). The device resets; the session is closed.
    pub fn readout_protect(&mut self) -> Result<()> {
        self.protection_command(Opcode::ReadoutProtect)
    }

    /// Readout-unprotect (`0x92`). The device mass erases and resets; the
    /// session is closed.
    pub fn readout_unprotect(&mut self) -> Result<()> {
        self.protection_command(Opcode::ReadoutUnprotect)
    }

    fn protection_command(&mut self, opcode: Opcode) -> Result<()> {
        let erase_timeout = self.config.erase_timeout;
        let result = self.run(|port| {
            send_opcode(&mut IspCodec::new(port), opcode)?;
            // Second ACK once the option bytes are rewritten
            let saved = port.timeout();
            port.set_timeout(erase_timeout)?;
            let acked = IspCodec::new(port).read_ack();
            let restored = port.set_timeout(saved);
            acked.and(restored)
        });
        self.close();
        result
    }

    /// Close the session and the port. Idempotent.
    pub fn close(&mut self) {
        if self.state != SessionState::Idle {
            debug!("Closing ISP session on {}", self.port.name());
        }
        self.port.close();
        self.state = SessionState::Idle;
        self.commands = SupportedCommandSet::default();
    }
}

/// Send an opcode frame, turning a NACK into the protection error the
/// command implies.
fn send_opcode<P: Port + ?Sized>(codec: &mut IspCodec<'_, P>, opcode: Opcode) -> Result<()> {
    trace!("ISP command {}", opcode.name());
    match codec.send_request_byte(opcode as u8) {
        Err(Error::Nack) => Err(match opcode {
            Opcode::ReadMemory => Error::ReadProtected,
            Opcode::WriteMemory | Opcode::Erase | Opcode::ExtendedErase => Error::WriteProtected,
            _ => Error::Nack,
        }),
        other => other,
    }
}

/// Encode a transfer length as its `len - 1` byte.
fn transfer_len(len: usize) -> Result<u8> {
    if len == 0 || len > ISP_MAX_TRANSFER {
        return Err(Error::InvalidArgument(format!(
            "transfer of {len} bytes, expected 1..={ISP_MAX_TRANSFER}"
        )));
    }
    u8::try_from(len - 1)
        .map_err(|_| Error::InvalidArgument(format!("transfer of {len} bytes")))
}

impl<P: Port> DeviceLink for IspLink<P> {
    fn variant(&self) -> ProtocolVariant {
        ProtocolVariant::Isp
    }

    fn is_open(&self) -> bool {
        self.ensure_active().is_ok()
    }

    fn close(&mut self) {
        IspLink::close(self);
    }

    fn supports_extended_erase(&self) -> bool {
        self.commands.supports_extended_erase()
    }

    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            bootloader_version: self.bootloader_version.map(u32::from),
            protocol_version: None,
            product_id: self.product_id,
            commands: self.commands.as_bytes().to_vec(),
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
            EraseRequest::Page(page) => self.erase_basic(page),
            EraseRequest::Extended(page) => self.erase_extended(page),
            EraseRequest::Mass => {
                if self.supports_extended_erase() {
                    self.erase_extended(ISP_MASS_ERASE)
                } else {
                    self.erase_basic(ISP_MASS_ERASE)
                }
            },
            EraseRequest::Bank(bank) => {
                if !self.supports_extended_erase() {
                    return Err(Error::Unsupported(
                        "bank erase needs the extended erase command".into(),
                    ));
                }
                self.erase_extended(bank.sentinel())
            },
            EraseRequest::Range { .. } => Err(Error::Unsupported(
                "ISP erases pages, not byte ranges".into(),
            )),
        }
    }

    fn start_application(&mut self, address: u32) -> Result<()> {
        self.go(address)
    }

    fn readout_protect(&mut self) -> Result<()> {
        IspLink::readout_protect(self)
    }

    fn readout_unprotect(&mut self) -> Result<()> {
        IspLink::readout_unprotect(self)
    }
}

impl<P: Port> Drop for IspLink<P> {
    fn drop(&mut self) {
        self.port.close();
    }
}

/// Open a serial port for `revision`, run the handshake and return the
/// connected session.
#[cfg(feature = "native")]
pub fn open_serial(
    port_name: &str,
    baud: u32,
    config: IspConfig,
    reporter: Reporter,
) -> Result<IspLink<crate::port::NativePort>> {
    let serial = crate::port::SerialConfig::for_revision(port_name, baud, config.revision);
    let port = crate::port::NativePort::open(&serial)?;
    let mut link = IspLink::new(port, config, reporter);
    link.connect()?;
    Ok(link)
}
