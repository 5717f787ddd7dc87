//! Checksummed ISP framing.
//!
//! ## Frame Format
//!
//! ```text
//! host   +-----------------+----------+
//!        | payload (1..n)  | checksum |
//!        +-----------------+----------+
//! device +-----------+
//!        | ACK/NACK  |
//!        +-----------+
//! ```
//!
//! The checksum is the XOR of the payload bytes. A one-byte payload (a
//! command opcode or a length byte) is seeded with `0xFF`, so the pair is
//! self-complementing; longer payloads are seeded with `0x00`.
//!
//! Every frame is acknowledged before the next one is sent.

use crate::error::{Error, Result};
use crate::port::Port;
use log::trace;

/// Start token sent repeatedly during the handshake.
pub const ISP_START_FRAME: u8 = 0x7F;

/// Positive acknowledgement.
pub const ISP_ACK: u8 = 0x79;

/// Negative acknowledgement.
pub const ISP_NACK: u8 = 0x1F;

/// Mass erase sentinel page index.
pub const ISP_MASS_ERASE: u16 = 0xFFFF;

/// Bank 1 erase sentinel page index.
pub const ISP_BANK1_ERASE: u16 = 0xFFFE;

/// Bank 2 erase sentinel page index.
pub const ISP_BANK2_ERASE: u16 = 0xFFFD;

/// Largest read or write a single command can move.
pub const ISP_MAX_TRANSFER: usize = 256;

/// ISP command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Opcode {
    /// Bootloader version and supported commands.
    Get = 0x00,
    /// Bootloader version and read protection status.
    GetVersion = 0x01,
    /// Product id.
    GetId = 0x02,
    /// Read up to 256 bytes.
    ReadMemory = 0x11,
    /// Jump to code at an address.
    Go = 0x21,
    /// Write up to 256 bytes.
    WriteMemory = 0x31,
    /// Erase with one-byte page indices.
    Erase = 0x43,
    /// Erase with two-byte page indices.
    ExtendedErase = 0x44,
    /// Enable readout protection.
    ReadoutProtect = 0x82,
    /// Disable readout protection.
    ReadoutUnprotect = 0x92,
}

impl Opcode {
    /// Opcode for a raw byte, if known.
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0x00 => Self::Get,
            0x01 => Self::GetVersion,
            0x02 => Self::GetId,
            0x11 => Self::ReadMemory,
            0x21 => Self::Go,
            0x31 => Self::WriteMemory,
            0x43 => Self::Erase,
            0x44 => Self::ExtendedErase,
            0x82 => Self::ReadoutProtect,
            0x92 => Self::ReadoutUnprotect,
            _ => return None,
        })
    }

    /// Human-readable command name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Get => "identify",
            Self::GetVersion => "get-version",
            Self::GetId => "get-id",
            Self::ReadMemory => "read-memory",
            Self::Go => "go",
            Self::WriteMemory => "write-memory",
            Self::Erase => "erase",
            Self::ExtendedErase => "extended-erase",
            Self::ReadoutProtect => "readout-protect",
            Self::ReadoutUnprotect => "readout-unprotect",
        }
    }
}

/// Checksum of a frame payload.
pub fn checksum(payload: &[u8]) -> u8 {
    let seed = if payload.len() > 1 { 0x00 } else { 0xFF };
    payload.iter().fold(seed, |acc, b| acc ^ b)
}

/// Serialize a payload with its trailing checksum.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 1);
    frame.extend_from_slice(payload);
    frame.push(checksum(payload));
    frame
}

/// Interpret an acknowledgement byte.
pub fn check_ack(byte: u8) -> Result<()> {
    match byte {
        ISP_ACK => Ok(()),
        ISP_NACK => Err(Error::Nack),
        other => Err(Error::InvalidResponse(format!(
            "expected ACK/NACK, got 0x{other:02X}"
        ))),
    }
}

/// Frame codec over a serial port.
#[derive(Debug)]
pub struct IspCodec<'a, P: Port + ?Sized> {
    port: &'a mut P,
}

impl<'a, P: Port + ?Sized> IspCodec<'a, P> {
    /// Wrap a port.
    pub fn new(port: &'a mut P) -> Self {
        Self { port }
    }

    /// Send a checksummed frame and wait for its acknowledgement.
    pub fn send_frame(&mut self, payload: &[u8]) -> Result<()> {
        let frame = encode_frame(payload);
        trace!("ISP TX {frame:02X?}");
        self.port.write_all_bytes(&frame)?;
        self.read_ack()
    }

    /// Send a single opcode frame.
    pub fn send_request_byte(&mut self, cmd: u8) -> Result<()> {
        self.send_frame(&[cmd])
    }

    /// Send a 4-byte big-endian address frame.
    pub fn send_address(&mut self, address: u32) -> Result<()> {
        self.send_frame(&address.to_be_bytes())
    }

    /// Send a bare ACK byte to the device.
    pub fn send_ack(&mut self) -> Result<()> {
        self.port.write_all_bytes(&[ISP_ACK])
    }

    /// Read and check one acknowledgement byte.
    pub fn read_ack(&mut self) -> Result<()> {
        let byte = self.port.read_byte()?;
        trace!("ISP RX ack 0x{byte:02X}");
        check_ack(byte)
    }

    /// Read one response byte.
    pub fn read_byte(&mut self) -> Result<u8> {
        self.port.read_byte()
    }

    /// Read exactly `len` response bytes.
    ///
    /// A short read is an invalid response.
    pub fn read_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        let data = self.port.read_up_to(len)?;
        if data.len() < len {
            return Err(Error::InvalidResponse(format!(
                "expected {len} bytes, got {}",
                data.len()
            )));
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::MockPort;

    #[test]
    fn test_single_byte_checksum_is_complement() {
        for cmd in [0x00u8, 0x01, 0x02, 0x11, 0x21, 0x31, 0x43, 0x44, 0x82, 0x92] {
            assert_eq!(checksum(&[cmd]), 0xFF ^ cmd);
        }
    }

    #[test]
    fn test_multi_byte_checksum_is_plain_xor() {
        assert_eq!(checksum(&[0x08, 0x00, 0x00, 0x00]), 0x08);
        assert_eq!(checksum(&[0x12, 0x34]), 0x12 ^ 0x34);
        assert_eq!(checksum(&[0xFF, 0xFF]), 0x00);
    }

    #[test]
    fn test_encode_frame_appends_checksum() {
        assert_eq!(encode_frame(&[0x11]), vec![0x11, 0xEE]);
        assert_eq!(
            encode_frame(&[0x08, 0x00, 0x01, 0x00]),
            vec![0x08, 0x00, 0x01, 0x00, 0x09]
        );
    }

    #[test]
    fn test_send_frame_ack() {
        let mut port = MockPort::with_rx(&[ISP_ACK]);
        IspCodec::new(&mut port).send_request_byte(0x00).unwrap();
        assert_eq!(port.written(), vec![0x00, 0xFF]);
    }

    #[test]
    fn test_send_frame_nack() {
        let mut port = MockPort::with_rx(&[ISP_NACK]);
        let result = IspCodec::new(&mut port).send_frame(&[0x31]);
        assert!(matches!(result, Err(Error::Nack)));
    }

    #[test]
    fn test_send_frame_garbage_is_invalid_response() {
        let mut port = MockPort::with_rx(&[0x42]);
        let result = IspCodec::new(&mut port).send_frame(&[0x31]);
        assert!(matches!(result, Err(Error::InvalidResponse(_))));
    }

    #[test]
    fn test_send_frame_without_reply_times_out() {
        let mut port = MockPort::new();
        let result = IspCodec::new(&mut port).send_frame(&[0x31]);
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[test]
    fn test_send_address_is_big_endian() {
        let mut port = MockPort::with_rx(&[ISP_ACK]);
        IspCodec::new(&mut port)
            .send_address(0x0800_0080)
            .unwrap();
        assert_eq!(port.written(), vec![0x08, 0x00, 0x00, 0x80, 0x88]);
    }

    #[test]
    fn test_read_exact_short_is_invalid_response() {
        let mut port = MockPort::with_rx(&[1, 2, 3]);
        let result = IspCodec::new(&mut port).read_exact(4);
        assert!(matches!(result, Err(Error::InvalidResponse(_))));
    }

    #[test]
    fn test_opcode_round_trip_names() {
        assert_eq!(Opcode::from_byte(0x44), Some(Opcode::ExtendedErase));
        assert_eq!(Opcode::from_byte(0x63), None);
        assert_eq!(Opcode::ReadMemory.name(), "read-memory");
    }
}
