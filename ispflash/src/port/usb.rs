//! USB control-channel transport using `rusb`.
//!
//! Requests and responses travel as vendor control transfers on endpoint 0,
//! one whole unit per transfer, so the header protocol needs no framing of
//! its own.

use {
    crate::{
        error::{Error, Result},
        port::ControlChannel,
    },
    log::{debug, trace},
    rusb::{DeviceHandle, Direction, GlobalContext, Recipient, RequestType},
    std::time::Duration,
};

/// Vendor request code carrying header-protocol units.
pub const DFU_VENDOR_REQUEST: u8 = 0x01;

/// Timeout for a single control transfer.
pub const USB_TIMEOUT: Duration = Duration::from_millis(5000);

/// A USB device found during enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDeviceInfo {
    /// Bus number.
    pub bus: u8,
    /// Device address on the bus.
    pub address: u8,
    /// Vendor ID.
    pub vid: u16,
    /// Product ID.
    pub pid: u16,
}

impl UsbDeviceInfo {
    /// Identifier in `bus:address` form.
    pub fn name(&self) -> String {
        format!("usb:{:03}:{:03}", self.bus, self.address)
    }
}

/// List attached devices matching `vid`/`pid`.
pub fn list_devices(vid: u16, pid: u16) -> Result<Vec<UsbDeviceInfo>> {
    let devices = rusb::devices()?;
    let mut found = Vec::new();
    for device in devices.iter() {
        let Ok(desc) = device.device_descriptor() else {
            continue;
        };
        if desc.vendor_id() == vid && desc.product_id() == pid {
            trace!(
                "Found USB device {:04X}:{:04X} at {}:{}",
                vid,
                pid,
                device.bus_number(),
                device.address()
            );
            found.push(UsbDeviceInfo {
                bus: device.bus_number(),
                address: device.address(),
                vid,
                pid,
            });
        }
    }
    Ok(found)
}

/// Vendor control channel to a bootloader device.
pub struct UsbControlPort {
    handle: Option<DeviceHandle<GlobalContext>>,
    name: String,
    timeout: Duration,
}

impl UsbControlPort {
    /// Open the first device matching `vid`/`pid`.
    pub fn open(vid: u16, pid: u16) -> Result<Self> {
        let handle = rusb::open_device_with_vid_pid(vid, pid)
            .ok_or_else(|| Error::PortOpen(format!("USB device {vid:04X}:{pid:04X}")))?;
        let name = format!("usb {vid:04X}:{pid:04X}");
        debug!("Opened {name}");
        Ok(Self {
            handle: Some(handle),
            name,
            timeout: USB_TIMEOUT,
        })
    }

    fn handle(&self) -> Result<&DeviceHandle<GlobalContext>> {
        self.handle.as_ref().ok_or(Error::NotActive)
    }
}

impl ControlChannel for UsbControlPort {
    fn write_request(&mut self, request: &[u8]) -> Result<()> {
        let request_type =
            rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Device);
        let written = self.handle()?.write_control(
            request_type,
            DFU_VENDOR_REQUEST,
            0,
            0,
            request,
            self.timeout,
        )?;
        trace!("USB OUT {written}/{} bytes", request.len());
        if written != request.len() {
            return Err(Error::InvalidResponse(format!(
                "short control write: {written} of {} bytes",
                request.len()
            )));
        }
        Ok(())
    }

    fn read_response(&mut self, max_len: usize) -> Result<Vec<u8>> {
        let request_type =
            rusb::request_type(Direction::In, RequestType::Vendor, Recipient::Device);
        let mut buf = vec![0u8; max_len];
        let read = self.handle()?.read_control(
            request_type,
            DFU_VENDOR_REQUEST,
            0,
            0,
            &mut buf,
            self.timeout,
        )?;
        trace!("USB IN {read} bytes");
        buf.truncate(read);
        Ok(buf)
    }

    fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    fn close(&mut self) {
        if self.handle.take().is_some() {
            debug!("Closed {}", self.name);
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_name_format() {
        let info = UsbDeviceInfo {
            bus: 1,
            address: 12,
            vid: 0x0483,
            pid: 0xDF11,
        };
        assert_eq!(info.name(), "usb:001:012");
    }

    #[test]
    fn test_list_devices_is_repeatable() {
        // No device is expected on a build host; both queries must agree
        let first = list_devices(0xFFFF, 0xFFFF).map(|d| d.len()).unwrap_or(0);
        let second = list_devices(0xFFFF, 0xFFFF).map(|d| d.len()).unwrap_or(0);
        assert_eq!(first, second);
    }
}
