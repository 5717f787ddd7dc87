//! Serial port discovery and USB bridge classification.
//!
//! Discovery is a pure query: it never opens a port and has no effect on a
//! session. USB bootloader devices are listed separately by
//! `port::usb::list_devices`.

use crate::error::{Error, Result};

#[cfg(feature = "native")]
use {
    crate::port::{NativePortEnumerator, PortEnumerator},
    log::{debug, info, trace},
};

/// Known USB bridges in front of a bootloader UART.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum DeviceKind {
    /// CH340/CH341 USB-to-Serial converter.
    Ch340,
    /// Silicon Labs CP210x USB-to-Serial converter.
    Cp210x,
    /// FTDI FT232/FT2232/FT4232 USB-to-Serial converter.
    Ftdi,
    /// Prolific PL2303 USB-to-Serial converter.
    Prolific,
    /// ST-Link virtual COM port.
    StLink,
    /// Unknown device.
    Unknown,
}

const KNOWN_USB_BRIDGES: &[(u16, &[u16], DeviceKind)] = &[
    (
        0x1A86,
        &[0x7523, 0x7522, 0x5523, 0x5512, 0x55D4],
        DeviceKind::Ch340,
    ),
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71, 0xEA63], DeviceKind::Cp210x),
    (
        0x0403,
        &[0x6001, 0x6010, 0x6011, 0x6014, 0x6015],
        DeviceKind::Ftdi,
    ),
    (0x067B, &[0x2303, 0x23A3, 0x23C3, 0x23D3], DeviceKind::Prolific),
    (0x0483, &[0x374B, 0x374E, 0x374F, 0x3752, 0x3753], DeviceKind::StLink),
];

impl DeviceKind {
    /// Classify a VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        KNOWN_USB_BRIDGES
            .iter()
            .find(|(known_vid, pids, _)| vid == *known_vid && pids.contains(&pid))
            .map_or(Self::Unknown, |(_, _, kind)| *kind)
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ch340 => "CH340/CH341",
            Self::Cp210x => "CP210x",
            Self::Ftdi => "FTDI",
            Self::Prolific => "PL2303",
            Self::StLink => "ST-Link VCP",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether the bridge is recognised.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// A serial port with its USB metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DetectedPort {
    /// Port name/path (e.g., "/dev/ttyUSB0" or "COM3").
    pub name: String,
    /// Classified bridge.
    pub device: DeviceKind,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

/// List serial ports with classification. Enumeration failures yield an
/// empty list.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    let ports = match NativePortEnumerator::list_ports() {
        Ok(ports) => ports,
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            return Vec::new();
        },
    };

    ports
        .into_iter()
        .map(|info| {
            let device = match (info.vid, info.pid) {
                (Some(vid), Some(pid)) => {
                    let kind = DeviceKind::from_vid_pid(vid, pid);
                    trace!("Found USB port: {} ({vid:04X}:{pid:04X}, {kind:?})", info.name);
                    kind
                },
                _ => DeviceKind::Unknown,
            };
            DetectedPort {
                name: info.name,
                device,
                vid: info.vid,
                pid: info.pid,
                manufacturer: info.manufacturer,
                product: info.product,
                serial: info.serial_number,
            }
        })
        .collect()
}

/// Without the native backend there is nothing to enumerate.
#[cfg(not(feature = "native"))]
pub fn detect_ports() -> Vec<DetectedPort> {
    Vec::new()
}

/// Pick a port when the user gave none: a recognised bridge first, else the
/// first port.
#[cfg(feature = "native")]
pub fn auto_detect_port() -> Result<DetectedPort> {
    let ports = detect_ports();

    if let Some(port) = ports.iter().find(|p| p.device.is_known()) {
        info!("Auto-detected {} bridge: {}", port.device.name(), port.name);
        return Ok(port.clone());
    }

    ports
        .into_iter()
        .next()
        .inspect(|port| info!("Using first available port: {}", port.name))
        .ok_or_else(|| Error::PortOpen("no serial port found".into()))
}

/// Port auto-detection needs the native backend.
#[cfg(not(feature = "native"))]
pub fn auto_detect_port() -> Result<DetectedPort> {
    Err(Error::Unsupported(
        "port auto-detection needs the native feature".into(),
    ))
}

/// One display line per port.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    ports
        .iter()
        .map(|port| {
            let device_info = if port.device.is_known() {
                format!(" [{}]", port.device.name())
            } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
                format!(" [VID:{vid:04X} PID:{pid:04X}]")
            } else {
                String::new()
            };
            let product_info = port
                .product
                .as_ref()
                .map(|p| format!(" - {p}"))
                .unwrap_or_default();
            format!("{}{device_info}{product_info}", port.name)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: &str, device: DeviceKind, ids: Option<(u16, u16)>) -> DetectedPort {
        DetectedPort {
            name: name.to_string(),
            device,
            vid: ids.map(|(v, _)| v),
            pid: ids.map(|(_, p)| p),
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    #[test]
    fn test_device_kind_from_vid_pid() {
        assert_eq!(DeviceKind::from_vid_pid(0x1A86, 0x7523), DeviceKind::Ch340);
        assert_eq!(DeviceKind::from_vid_pid(0x10C4, 0xEA60), DeviceKind::Cp210x);
        assert_eq!(DeviceKind::from_vid_pid(0x0483, 0x374B), DeviceKind::StLink);
        // DFU-mode ST part is not a UART bridge
        assert_eq!(DeviceKind::from_vid_pid(0x0483, 0xDF11), DeviceKind::Unknown);
    }

    #[test]
    fn test_format_port_list() {
        let mut ch340 = port("/dev/ttyUSB0", DeviceKind::Ch340, Some((0x1A86, 0x7523)));
        ch340.product = Some("USB-Serial".to_string());
        let ports = vec![
            ch340,
            port("/dev/ttyACM0", DeviceKind::Unknown, Some((0x1234, 0x5678))),
            port("/dev/ttyS0", DeviceKind::Unknown, None),
        ];

        let formatted = format_port_list(&ports);

        assert_eq!(formatted[0], "/dev/ttyUSB0 [CH340/CH341] - USB-Serial");
        assert_eq!(formatted[1], "/dev/ttyACM0 [VID:1234 PID:5678]");
        assert_eq!(formatted[2], "/dev/ttyS0");
    }

    #[test]
    fn test_detect_ports_is_idempotent() {
        assert_eq!(detect_ports(), detect_ports());
    }
}
