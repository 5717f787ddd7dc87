//! Header protocol spoken over the USB control channel.
//!
//! ## Frame Format
//!
//! ```text
//! +-----+----------+-----------+---------+---------+-----------+
//! | CMD | reserved | data size | param 1 | param 2 |  payload  |
//! +-----+----------+-----------+---------+---------+-----------+
//! |  1  |    3     |  4 (LE)   |  4 (LE) |  4 (LE) | data size |
//! +-----+----------+-----------+---------+---------+-----------+
//! ```
//!
//! Requests and responses share the layout. A response echoes the request
//! command; a device-side failure comes back with [`DFU_ERROR_CMD`] and the
//! error code in `param1`. There is no checksum, the transport is reliable.

use byteorder::{ByteOrder, LittleEndian};
use log::trace;

use crate::error::{Error, Result};
use crate::port::ControlChannel;

/// Size of the fixed header.
pub const DFU_HEADER_SIZE: usize = 16;

/// Command byte of a failure response.
pub const DFU_ERROR_CMD: u8 = 0xFF;

/// Header protocol commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuCommand {
    /// Loader and protocol version in `param1`/`param2`.
    Version = 0x00,
    /// Leave the bootloader and start the application.
    Leave = 0x01,
    /// Read `param2` bytes at `param1`.
    Read = 0x02,
    /// Write the payload at `param1`.
    Write = 0x03,
    /// Erase `param2` bytes at `param1`.
    Erase = 0x04,
}

/// Fixed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Command byte.
    pub cmd: u8,
    /// Payload length following the header.
    pub data_size: u32,
    /// First parameter.
    pub param1: u32,
    /// Second parameter.
    pub param2: u32,
}

impl Header {
    /// Serialize to the wire layout.
    pub fn encode(&self) -> [u8; DFU_HEADER_SIZE] {
        let mut buf = [0u8; DFU_HEADER_SIZE];
        buf[0] = self.cmd;
        LittleEndian::write_u32(&mut buf[4..8], self.data_size);
        LittleEndian::write_u32(&mut buf[8..12], self.param1);
        LittleEndian::write_u32(&mut buf[12..16], self.param2);
        buf
    }

    /// Parse a header from the start of `data`.
    ///
    /// Fails with [`Error::InvalidResponse`] if `data` is shorter than the
    /// header.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < DFU_HEADER_SIZE {
            return Err(Error::InvalidResponse(format!(
                "response of {} bytes is shorter than the {DFU_HEADER_SIZE}-byte header",
                data.len()
            )));
        }
        Ok(Self {
            cmd: data[0],
            data_size: LittleEndian::read_u32(&data[4..8]),
            param1: LittleEndian::read_u32(&data[8..12]),
            param2: LittleEndian::read_u32(&data[12..16]),
        })
    }
}

/// Build a complete request: header followed by payload.
#[allow(clippy::cast_possible_truncation)]
pub fn encode_request(cmd: DfuCommand, param1: u32, param2: u32, payload: &[u8]) -> Vec<u8> {
    let header = Header {
        cmd: cmd as u8,
        // Payloads are bounded by the chunk size
        data_size: payload.len() as u32,
        param1,
        param2,
    };
    let mut buf = Vec::with_capacity(DFU_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}

/// A parsed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Response header.
    pub header: Header,
    /// Response payload.
    pub payload: Vec<u8>,
}

/// Validate a raw response to `cmd`.
pub fn parse_response(cmd: DfuCommand, raw: &[u8]) -> Result<Response> {
    let header = Header::parse(raw)?;
    if header.cmd == DFU_ERROR_CMD {
        return Err(Error::DeviceStatus(header.param1));
    }
    if header.cmd != cmd as u8 {
        return Err(Error::InvalidResponse(format!(
            "response to command 0x{:02X} carries command 0x{:02X}",
            cmd as u8, header.cmd
        )));
    }
    let body = &raw[DFU_HEADER_SIZE..];
    let size = header.data_size as usize;
    if body.len() < size {
        return Err(Error::InvalidResponse(format!(
            "header announces {size} payload bytes, got {}",
            body.len()
        )));
    }
    Ok(Response {
        header,
        payload: body[..size].to_vec(),
    })
}

/// Request/response codec over a control channel.
pub struct DfuCodec<'a, C: ControlChannel + ?Sized> {
    channel: &'a mut C,
}

impl<'a, C: ControlChannel + ?Sized> DfuCodec<'a, C> {
    /// Wrap a channel.
    pub fn new(channel: &'a mut C) -> Self {
        Self { channel }
    }

    /// One round trip: write header + payload, read and validate the reply.
    ///
    /// `reply_payload` is the largest payload the caller expects back.
    pub fn send_request(
        &mut self,
        cmd: DfuCommand,
        param1: u32,
        param2: u32,
        payload: &[u8],
        reply_payload: usize,
    ) -> Result<Response> {
        let request = encode_request(cmd, param1, param2, payload);
        trace!(
            "DFU TX {:?} p1=0x{param1:08X} p2=0x{param2:08X} ({} payload bytes)",
            cmd,
            payload.len()
        );
        self.channel.write_request(&request)?;
        let raw = self
            .channel
            .read_response(DFU_HEADER_SIZE + reply_payload)?;
        trace!("DFU RX {} bytes", raw.len());
        parse_response(cmd, &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::MockChannel;

    fn reply(cmd: u8, param1: u32, param2: u32, payload: &[u8]) -> Vec<u8> {
        #[allow(clippy::cast_possible_truncation)]
        let header = Header {
            cmd,
            data_size: payload.len() as u32,
            param1,
            param2,
        };
        let mut raw = header.encode().to_vec();
        raw.extend_from_slice(payload);
        raw
    }

    #[test]
    fn test_request_layout() {
        let raw = encode_request(DfuCommand::Write, 0x0800_0000, 0, &[0xAA, 0xBB]);
        assert_eq!(raw.len(), DFU_HEADER_SIZE + 2);
        assert_eq!(raw[0], 0x03);
        assert_eq!(&raw[1..4], &[0, 0, 0]);
        assert_eq!(&raw[4..8], &[2, 0, 0, 0]);
        assert_eq!(&raw[8..12], &[0x00, 0x00, 0x00, 0x08]);
        assert_eq!(&raw[16..], &[0xAA, 0xBB]);
    }

    #[test]
    fn test_short_response_is_invalid() {
        let result = parse_response(DfuCommand::Version, &[0u8; DFU_HEADER_SIZE - 1]);
        assert!(matches!(result, Err(Error::InvalidResponse(_))));
    }

    #[test]
    fn test_mismatched_command_is_invalid() {
        let raw = reply(DfuCommand::Read as u8, 0, 0, &[]);
        let result = parse_response(DfuCommand::Write, &raw);
        assert!(matches!(result, Err(Error::InvalidResponse(_))));
    }

    #[test]
    fn test_error_status() {
        let raw = reply(DFU_ERROR_CMD, 7, 0, &[]);
        let result = parse_response(DfuCommand::Erase, &raw);
        assert!(matches!(result, Err(Error::DeviceStatus(7))));
    }

    #[test]
    fn test_truncated_payload_is_invalid() {
        let mut raw = reply(DfuCommand::Read as u8, 0, 0, &[1, 2, 3, 4]);
        raw.truncate(DFU_HEADER_SIZE + 2);
        let result = parse_response(DfuCommand::Read, &raw);
        assert!(matches!(result, Err(Error::InvalidResponse(_))));
    }

    #[test]
    fn test_round_trip_over_channel() {
        let mut channel = MockChannel::new();
        channel.push_response(reply(DfuCommand::Version as u8, 2, 1, &[]));

        let response = DfuCodec::new(&mut channel)
            .send_request(DfuCommand::Version, 0, 0, &[], 0)
            .unwrap();

        assert_eq!(response.header.param1, 2);
        assert_eq!(response.header.param2, 1);
        assert_eq!(channel.requests().len(), 1);
        assert_eq!(channel.requests()[0].len(), DFU_HEADER_SIZE);
    }
}
