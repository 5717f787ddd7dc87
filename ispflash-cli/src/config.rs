//! Configuration file support for ispflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (ISPFLASH_*)
//! 3. Local config file (./ispflash.toml)
//! 4. Global config file (~/.config/ispflash/config.toml)
//!
//! The first two are handled by clap; this module merges the files.

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Local configuration file name.
pub const LOCAL_CONFIG: &str = "ispflash.toml";

/// Serial connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: Option<String>,
    /// Default baud rate.
    pub baud: Option<u32>,
    /// Use the legacy ISP revision (no parity, no identify).
    #[serde(default)]
    pub legacy: bool,
    /// Pulse DTR/RTS before the handshake.
    #[serde(default)]
    pub reset: bool,
}

/// USB bootloader identification.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbConfig {
    /// USB Vendor ID.
    pub vid: Option<u16>,
    /// USB Product ID.
    pub pid: Option<u16>,
}

/// Bulk operation defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlashConfig {
    /// Address of flash page 0.
    pub base: Option<u32>,
    /// Retries per chunk.
    pub retries: Option<usize>,
    /// Skip read-back verify by default.
    #[serde(default)]
    pub skip_verify: bool,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Serial connection.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// USB device.
    #[serde(default)]
    pub usb: UsbConfig,
    /// Flash defaults.
    #[serde(default)]
    pub flash: FlashConfig,
}

impl Config {
    /// Load configuration from the global file, then the local one.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file. Missing or malformed files
    /// yield `None`; malformed ones are logged.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "ispflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; set fields in `other` win.
    fn merge(&mut self, other: Self) {
        if other.connection.port.is_some() {
            self.connection.port = other.connection.port;
        }
        if other.connection.baud.is_some() {
            self.connection.baud = other.connection.baud;
        }
        self.connection.legacy |= other.connection.legacy;
        self.connection.reset |= other.connection.reset;

        if other.usb.vid.is_some() {
            self.usb.vid = other.usb.vid;
        }
        if other.usb.pid.is_some() {
            self.usb.pid = other.usb.pid;
        }

        if other.flash.base.is_some() {
            self.flash.base = other.flash.base;
        }
        if other.flash.retries.is_some() {
            self.flash.retries = other.flash.retries;
        }
        self.flash.skip_verify |= other.flash.skip_verify;
    }
}
