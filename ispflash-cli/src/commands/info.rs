//! Device info and port listing command implementations.

use {
    crate::{Cli, config::Config, session},
    anyhow::Result,
    console::style,
    ispflash::{
        DetectedPort, DeviceInfo, DeviceLink, ProtocolVariant, UsbDeviceInfo, auto_detect_port,
        detect_ports, port::usb::list_devices, protocol::Opcode,
    },
    log::debug,
};

/// USB devices matching the configured ids. Enumeration failures (no USB
/// stack, no permissions) are treated as no devices.
fn usb_devices(cli: &Cli, config: &Config) -> Vec<UsbDeviceInfo> {
    let (vid, pid) = session::usb_ids(cli, config);
    list_devices(vid, pid).unwrap_or_else(|e| {
        debug!("USB enumeration failed: {e}");
        Vec::new()
    })
}

fn ports_json(detected: &[DetectedPort], usb: &[UsbDeviceInfo]) -> serde_json::Value {
    let ports: Vec<serde_json::Value> = detected
        .iter()
        .map(|p| {
            serde_json::json!({
                "name": p.name,
                "device": p.device.name(),
                "known": p.device.is_known(),
                "vid": p.vid,
                "pid": p.pid,
                "manufacturer": p.manufacturer,
                "product": p.product,
                "serial": p.serial,
            })
        })
        .collect();
    let usb: Vec<serde_json::Value> = usb
        .iter()
        .map(|d| {
            serde_json::json!({
                "name": d.name(),
                "vid": d.vid,
                "pid": d.pid,
            })
        })
        .collect();
    serde_json::json!({
        "ok": true,
        "data": {
            "ports": ports,
            "usb": usb,
        }
    })
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(cli: &Cli, config: &Config, json: bool) -> Result<()> {
    let detected = detect_ports();
    let usb = usb_devices(cli, config);

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&ports_json(&detected, &usb))?
        );
        return Ok(());
    }

    eprintln!("{}", style("Serial ports").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
    } else {
        for port in &detected {
            let device_type = if port.device.is_known() {
                format!(" [{}]", style(port.device.name()).yellow())
            } else {
                String::new()
            };
            let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
                format!(" ({vid:04X}:{pid:04X})")
            } else {
                String::new()
            };
            let product = port
                .product
                .as_deref()
                .map(|p| format!(" - {}", style(p).dim()))
                .unwrap_or_default();

            eprintln!(
                "  {} {}{device_type}{vid_pid}{product}",
                style("•").green(),
                style(&port.name).cyan(),
            );
        }

        if let Ok(auto_port) = auto_detect_port() {
            eprintln!(
                "\n{} Auto-detected: {}",
                style("→").green().bold(),
                style(&auto_port.name).cyan().bold()
            );
        }
    }

    if !usb.is_empty() {
        eprintln!("\n{}", style("USB bootloaders").bold().underlined());
        for device in &usb {
            eprintln!(
                "  {} {} ({:04X}:{:04X})",
                style("•").green(),
                style(device.name()).cyan(),
                device.vid,
                device.pid
            );
        }
    }

    Ok(())
}

/// Bootloader version as the protocol encodes it: nibbles for ISP, a plain
/// number for DFU.
fn format_version(variant: ProtocolVariant, version: u32) -> String {
    match variant {
        ProtocolVariant::Isp => format!("{}.{}", version >> 4, version & 0x0F),
        ProtocolVariant::Dfu => version.to_string(),
    }
}

/// Opcode names for the identify command list; unknown bytes stay hex.
fn command_names(info: &DeviceInfo) -> Vec<String> {
    info.commands
        .iter()
        .map(|&byte| {
            Opcode::from_byte(byte)
                .map_or_else(|| format!("0x{byte:02X}"), |op| op.name().to_string())
        })
        .collect()
}

/// Info command implementation.
pub(crate) fn cmd_info(cli: &Cli, config: &Config, json: bool) -> Result<()> {
    let session = session::connect(cli, config)?;
    let link = session.programmer.link();
    let variant = link.variant();
    let info = link.device_info();

    if json {
        let names = command_names(&info);
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "protocol": variant.to_string(),
                "extended_erase": link.supports_extended_erase(),
                "device": &info,
                "command_names": names,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("{}", style("Device Information").bold().underlined());
    println!("  Protocol:           {variant}");
    if let Some(version) = info.bootloader_version {
        println!(
            "  Bootloader version: {}",
            format_version(variant, version)
        );
    }
    if let Some(protocol) = info.protocol_version {
        println!("  Protocol version:   {protocol}");
    }
    if let Some(pid) = info.product_id {
        println!("  Product ID:         0x{pid:04X}");
    }
    if !info.commands.is_empty() {
        println!("  Commands:           {}", command_names(&info).join(", "));
        println!(
            "  Erase:              {}",
            if link.supports_extended_erase() {
                "extended"
            } else {
                "basic"
            }
        );
    }

    Ok(())
}
