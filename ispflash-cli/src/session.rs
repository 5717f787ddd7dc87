//! Link selection and connection for device commands.

use {
    crate::{Cli, config::Config, progress::ConsoleSink, use_fancy_output},
    anyhow::{Context, Result},
    console::style,
    ispflash::{
        DeviceLink, FLASH_BASE, FlashOptions, IspConfig, IspRevision, LinkTarget, Programmer,
        Reporter, auto_detect_port, open_link,
    },
    std::sync::Arc,
};

/// Default serial baud rate.
pub(crate) const DEFAULT_BAUD: u32 = 115200;

/// ST system-memory DFU device.
pub(crate) const DEFAULT_USB_VID: u16 = 0x0483;
/// ST system-memory DFU device.
pub(crate) const DEFAULT_USB_PID: u16 = 0xDF11;

/// A connected programmer plus the sink rendering its events.
pub(crate) struct Session {
    pub(crate) programmer: Programmer<Box<dyn DeviceLink>>,
    pub(crate) sink: Arc<ConsoleSink>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.sink.finish();
    }
}

/// USB ids from CLI, then config, then the ST DFU default.
pub(crate) fn usb_ids(cli: &Cli, config: &Config) -> (u16, u16) {
    (
        cli.vid.or(config.usb.vid).unwrap_or(DEFAULT_USB_VID),
        cli.pid.or(config.usb.pid).unwrap_or(DEFAULT_USB_PID),
    )
}

/// Flash base from config, or the default.
pub(crate) fn flash_base(config: &Config) -> u32 {
    config.flash.base.unwrap_or(FLASH_BASE)
}

/// Resolve which link to open. Port auto-detection only runs when neither
/// the command line nor the config names a port.
pub(crate) fn resolve_target(cli: &Cli, config: &Config) -> Result<LinkTarget> {
    if cli.usb {
        let (vid, pid) = usb_ids(cli, config);
        return Ok(LinkTarget::Usb { vid, pid });
    }

    let port = match cli.port.clone().or_else(|| config.connection.port.clone()) {
        Some(port) => port,
        None => auto_detect_port().context("No serial port given")?.name,
    };
    let baud = cli.baud.or(config.connection.baud).unwrap_or(DEFAULT_BAUD);
    let revision = if cli.legacy || config.connection.legacy {
        IspRevision::Legacy
    } else {
        IspRevision::Standard
    };
    let isp = IspConfig::default()
        .with_revision(revision)
        .with_reset(cli.reset || config.connection.reset);

    Ok(LinkTarget::Serial {
        port,
        baud,
        config: isp,
    })
}

fn describe(target: &LinkTarget) -> String {
    match target {
        LinkTarget::Serial { port, baud, .. } => format!("{port} @ {baud} baud"),
        LinkTarget::Usb { vid, pid } => format!("USB {vid:04X}:{pid:04X}"),
    }
}

/// Open the link and wrap it in a programmer configured from `config`.
pub(crate) fn connect(cli: &Cli, config: &Config) -> Result<Session> {
    let target = resolve_target(cli, config)?;
    let name = describe(&target);
    if !cli.quiet {
        eprintln!("{} Using {}", style("🔌").cyan(), style(&name).bold());
    }

    let sink = Arc::new(ConsoleSink::new(cli.quiet, use_fancy_output()));
    let reporter = Reporter::new(sink.clone());
    let link = open_link(&target, reporter.clone())
        .with_context(|| format!("Failed to connect to {name}"))?;

    let mut options = FlashOptions {
        flash_base: flash_base(config),
        ..FlashOptions::default()
    };
    if let Some(retries) = config.flash.retries {
        options.retries = retries;
    }

    Ok(Session {
        programmer: Programmer::new(link, reporter).with_options(options),
        sink,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["ispflash"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_usb_target_uses_defaults() {
        let target = resolve_target(&cli(&["--usb", "info"]), &Config::default()).unwrap();
        assert!(matches!(
            target,
            LinkTarget::Usb {
                vid: DEFAULT_USB_VID,
                pid: DEFAULT_USB_PID
            }
        ));
    }

    #[test]
    fn test_cli_overrides_config() {
        let mut config = Config::default();
        config.connection.port = Some("/dev/ttyACM0".to_string());
        config.connection.baud = Some(9600);
        config.connection.legacy = true;

        let target = resolve_target(&cli(&["-p", "/dev/ttyUSB1", "info"]), &config).unwrap();
        match target {
            LinkTarget::Serial { port, baud, config } => {
                assert_eq!(port, "/dev/ttyUSB1");
                assert_eq!(baud, 9600);
                assert_eq!(config.revision, IspRevision::Legacy);
                assert!(!config.reset_on_connect);
            },
            LinkTarget::Usb { .. } => panic!("Expected serial target"),
        }
    }

    #[test]
    fn test_config_port_skips_detection() {
        let mut config = Config::default();
        config.connection.port = Some("COM7".to_string());
        config.usb.vid = Some(0x1234);

        let target = resolve_target(&cli(&["--reset", "info"]), &config).unwrap();
        match target {
            LinkTarget::Serial { port, baud, config } => {
                assert_eq!(port, "COM7");
                assert_eq!(baud, DEFAULT_BAUD);
                assert!(config.reset_on_connect);
            },
            LinkTarget::Usb { .. } => panic!("Expected serial target"),
        }
        assert_eq!(usb_ids(&cli(&["info"]), &config), (0x1234, DEFAULT_USB_PID));
    }
}
