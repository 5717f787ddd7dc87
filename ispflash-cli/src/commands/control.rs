//! Single-command workflows: readout protection and starting the application.
//!
//! All of these end the bootloader session, so each opens its own.

use {
    crate::{Cli, config::Config, session},
    anyhow::{Context, Result},
    console::style,
};

/// Protect command implementation.
pub(crate) fn cmd_protect(cli: &Cli, config: &Config) -> Result<()> {
    let mut session = session::connect(cli, config)?;
    session
        .programmer
        .protect()
        .context("Readout protection failed")?;
    Ok(())
}

/// Unprotect command implementation.
pub(crate) fn cmd_unprotect(cli: &Cli, config: &Config) -> Result<()> {
    let mut session = session::connect(cli, config)?;
    session
        .programmer
        .unprotect()
        .context("Readout unprotection failed")?;
    Ok(())
}

/// Go command implementation.
pub(crate) fn cmd_go(cli: &Cli, config: &Config, address: Option<u32>) -> Result<()> {
    let address = address.unwrap_or_else(|| session::flash_base(config));
    let mut session = session::connect(cli, config)?;
    session
        .programmer
        .go(address)
        .with_context(|| format!("Failed to start application at 0x{address:08X}"))?;

    if !cli.quiet {
        eprintln!(
            "{} Application started at 0x{address:08X}",
            style("🚀").green().bold()
        );
    }
    Ok(())
}
