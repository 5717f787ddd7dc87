//! ispflash CLI - Command-line tool for reflashing microcontrollers through
//! their ROM bootloader.
//!
//! ## Features
//!
//! - ISP over a serial port, DFU-style header protocol over USB
//! - Dump, erase and flash with per-chunk retry and read-back verify
//! - Mass erase, readout protection, start application
//! - Serial port discovery with USB bridge classification
//! - Configuration files and environment variable support

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;
use env_logger::Env;
use log::debug;
use std::path::PathBuf;
use std::process::ExitCode;

mod commands;
mod config;
mod progress;
mod session;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(true);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(std::sync::atomic::Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Errors the CLI raises itself, before the library is involved.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Arguments are inconsistent or incomplete.
    #[error("{0}")]
    Usage(String),
}

/// ispflash - Reflash microcontrollers through their ROM bootloader.
///
/// Environment variables:
///   ISPFLASH_PORT   - Default serial port
///   ISPFLASH_BAUD   - Default baud rate (default: 115200)
///   NO_COLOR        - Disable colored output
#[derive(Parser)]
#[command(name = "ispflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "ISPFLASH_PORT")]
    port: Option<String>,

    /// Baud rate for the serial link.
    #[arg(short, long, global = true, env = "ISPFLASH_BAUD")]
    baud: Option<u32>,

    /// Talk to a USB bootloader instead of a serial port.
    #[arg(long, global = true)]
    usb: bool,

    /// USB Vendor ID (hex).
    #[arg(long, global = true, value_parser = parse_hex_u16)]
    vid: Option<u16>,

    /// USB Product ID (hex).
    #[arg(long, global = true, value_parser = parse_hex_u16)]
    pid: Option<u16>,

    /// Legacy ISP revision: no parity, no identify on connect.
    #[arg(long, global = true)]
    legacy: bool,

    /// Pulse DTR/RTS to reset the board before the handshake.
    #[arg(long, global = true)]
    reset: bool,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available serial ports and matching USB devices.
    ListPorts {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Connect and show what the bootloader reports.
    Info {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Read device memory into a file.
    Dump {
        /// Output file.
        file: PathBuf,

        /// Start address (hex).
        #[arg(short, long, value_parser = parse_hex_u32)]
        address: u32,

        /// Number of bytes to read (decimal, or hex with 0x).
        #[arg(short, long, value_parser = parse_size)]
        size: usize,
    },

    /// Erase a range, or the whole flash with --all.
    Erase {
        /// Mass erase.
        #[arg(long, conflicts_with_all = ["address", "size"])]
        all: bool,

        /// Start address (hex).
        #[arg(short, long, value_parser = parse_hex_u32, requires = "size")]
        address: Option<u32>,

        /// Number of bytes (decimal, or hex with 0x).
        #[arg(short, long, value_parser = parse_size, requires = "address")]
        size: Option<usize>,
    },

    /// Erase, write and verify a flat binary image.
    Flash {
        /// Firmware image.
        firmware: PathBuf,

        /// Load address (hex, default: flash base).
        #[arg(short, long, value_parser = parse_hex_u32)]
        address: Option<u32>,

        /// Skip read-back verify.
        #[arg(long)]
        no_verify: bool,

        /// Skip erasing the target range first.
        #[arg(long)]
        no_erase: bool,

        /// Start the application after flashing.
        #[arg(long)]
        go: bool,
    },

    /// Enable readout protection (device resets).
    Protect,

    /// Disable readout protection (flash is erased, device resets).
    Unprotect,

    /// Leave the bootloader and run the application.
    Go {
        /// Entry address (hex, default: flash base).
        #[arg(short, long, value_parser = parse_hex_u32)]
        address: Option<u32>,
    },
}

/// Parse hexadecimal address (supports 0x prefix and underscores).
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    // Support underscore separators like 0x0800_0000
    let s: String = s.chars().filter(|c| *c != '_').collect();
    u32::from_str_radix(&s, 16).map_err(|e| format!("Invalid hex address: {e}"))
}

/// Parse a hexadecimal USB identifier.
fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let s = s.trim();
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(s, 16).map_err(|e| format!("Invalid hex id: {e}"))
}

/// Parse a byte count: decimal, `0x` hex, or with a `K`/`M` suffix.
fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    let (digits, scale) = match s.char_indices().last() {
        Some((i, 'k' | 'K')) => (&s[..i], 1024),
        Some((i, 'm' | 'M')) => (&s[..i], 1024 * 1024),
        _ => (s, 1),
    };
    let value = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        usize::from_str_radix(hex, 16)
    } else {
        digits.parse::<usize>()
    }
    .map_err(|e| format!("Invalid size: {e}"))?;

    let size = value
        .checked_mul(scale)
        .ok_or_else(|| format!("Size too large: {s}"))?;
    if size == 0 {
        return Err("Size must be greater than zero".to_string());
    }
    Ok(size)
}

/// Exit code for a failed run: 2 for usage errors, 1 otherwise.
fn exit_code(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<CliError>().is_some() {
        return 2;
    }
    match err.downcast_ref::<ispflash::Error>() {
        Some(e) if e.category() == ispflash::ErrorCategory::Usage => 2,
        _ => 1,
    }
}

fn main() -> ExitCode {
    // Honor the NO_COLOR convention (https://no-color.org/)
    if std::env::var_os("NO_COLOR").is_some() {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }
    STDERR_IS_TTY.store(
        console::Term::stderr().is_term(),
        std::sync::atomic::Ordering::Relaxed,
    );

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "ispflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code(&err))
        },
    }
}

fn run(cli: &Cli) -> Result<()> {
    // Load configuration
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::ListPorts { json } => commands::info::cmd_list_ports(cli, &config, *json),
        Commands::Info { json } => commands::info::cmd_info(cli, &config, *json),
        Commands::Dump {
            file,
            address,
            size,
        } => commands::flash::cmd_dump(cli, &config, file, *address, *size),
        Commands::Erase { all, address, size } => {
            commands::flash::cmd_erase(cli, &config, *all, *address, *size)
        },
        Commands::Flash {
            firmware,
            address,
            no_verify,
            no_erase,
            go,
        } => commands::flash::cmd_flash(
            cli,
            &config,
            firmware,
            *address,
            &commands::flash::FlashArgs {
                verify: !*no_verify,
                erase: !*no_erase,
                go: *go,
            },
        ),
        Commands::Protect => commands::control::cmd_protect(cli, &config),
        Commands::Unprotect => commands::control::cmd_unprotect(cli, &config),
        Commands::Go { address } => commands::control::cmd_go(cli, &config, *address),
    }
}
