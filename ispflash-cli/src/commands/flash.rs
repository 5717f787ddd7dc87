//! Dump, erase and flash command implementations.

use {
    crate::{Cli, CliError, config::Config, session},
    anyhow::{Context, Result},
    console::style,
    ispflash::{DeviceLink, MemoryRange, ProtocolVariant},
    std::path::Path,
};

/// Flash command switches.
pub(crate) struct FlashArgs {
    /// Read back and compare every chunk.
    pub(crate) verify: bool,
    /// Erase the image range before writing.
    pub(crate) erase: bool,
    /// Start the application afterwards.
    pub(crate) go: bool,
}

/// Dump command implementation.
pub(crate) fn cmd_dump(
    cli: &Cli,
    config: &Config,
    file: &Path,
    address: u32,
    size: usize,
) -> Result<()> {
    let mut session = session::connect(cli, config)?;
    session
        .programmer
        .dump_to_file(MemoryRange::new(address, size), file)
        .with_context(|| format!("Dump to {} failed", file.display()))?;

    if !cli.quiet {
        eprintln!(
            "\n{} Dumped {size} bytes to {}",
            style("✓").green().bold(),
            file.display()
        );
    }
    Ok(())
}

/// Erase command implementation.
pub(crate) fn cmd_erase(
    cli: &Cli,
    config: &Config,
    all: bool,
    address: Option<u32>,
    size: Option<usize>,
) -> Result<()> {
    let range = match (all, address, size) {
        (true, _, _) => None,
        (false, Some(address), Some(size)) => Some(MemoryRange::new(address, size)),
        _ => {
            return Err(CliError::Usage(
                "erase needs --all or both --address and --size".to_string(),
            )
            .into());
        },
    };

    let mut session = session::connect(cli, config)?;
    match range {
        Some(range) => session.programmer.erase(range).context("Erase failed")?,
        None => session.programmer.mass_erase().context("Mass erase failed")?,
    }

    if !cli.quiet {
        eprintln!("\n{} Erase complete", style("✓").green().bold());
    }
    Ok(())
}

/// Flash command implementation.
pub(crate) fn cmd_flash(
    cli: &Cli,
    config: &Config,
    firmware: &Path,
    address: Option<u32>,
    args: &FlashArgs,
) -> Result<()> {
    // Read the image before touching the device
    let data = std::fs::read(firmware)
        .with_context(|| format!("Failed to read firmware {}", firmware.display()))?;
    if data.is_empty() {
        return Err(CliError::Usage(format!("{} is empty", firmware.display())).into());
    }
    let base = address.unwrap_or_else(|| session::flash_base(config));
    let verify = args.verify && !config.flash.skip_verify;

    if !cli.quiet {
        eprintln!(
            "{} {} ({} bytes) @ 0x{base:08X}",
            style("📦").cyan(),
            firmware.display(),
            data.len()
        );
    }

    let mut session = session::connect(cli, config)?;
    let variant = session.programmer.link().variant();

    // The header protocol erases as part of flashing
    if args.erase && variant == ProtocolVariant::Isp {
        session
            .programmer
            .erase(MemoryRange::new(base, data.len()))
            .context("Erase failed")?;
    }

    session
        .programmer
        .flash(&data, base, verify)
        .context("Flash failed")?;

    if args.go {
        session
            .programmer
            .go(base)
            .context("Failed to start application")?;
    }

    if !cli.quiet {
        eprintln!("\n{} Flash complete", style("🎉").green().bold());
    }
    Ok(())
}
