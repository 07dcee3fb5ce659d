//! Bridge configuration management

use crate::usb::libusb::TransportSettings;
use crate::usb::registry::{
    DEFAULT_MAX_SLOTS, DEFAULT_NAME_PREFIX, DEFAULT_SLOT_BASE, RegistrySettings,
};
use crate::usb::worker::WorkerSettings;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use transport::DeviceMatch;

/// Highest slot number plus one
const SLOT_LIMIT: u32 = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub bridge: BridgeSettings,
    pub device: DeviceSettings,
    #[serde(default)]
    pub transfers: TransferSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeSettings {
    pub log_level: String,
}

/// Which device to bind and how to publish it
///
/// ```toml
/// [device]
/// vendor_id = "0x2341"
/// product_id = "0x0043"
/// name_prefix = "ttyardu"
/// slot_base = 192
/// max_slots = 64
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Vendor ID as a hex string ("0x2341")
    pub vendor_id: String,
    /// Product ID as a hex string ("0x0043")
    pub product_id: String,
    #[serde(default = "DeviceSettings::default_name_prefix")]
    pub name_prefix: String,
    #[serde(default = "DeviceSettings::default_slot_base")]
    pub slot_base: u32,
    #[serde(default = "DeviceSettings::default_max_slots")]
    pub max_slots: u32,
}

impl DeviceSettings {
    fn default_name_prefix() -> String {
        DEFAULT_NAME_PREFIX.to_string()
    }

    fn default_slot_base() -> u32 {
        DEFAULT_SLOT_BASE
    }

    fn default_max_slots() -> u32 {
        DEFAULT_MAX_SLOTS
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Bulk IN timeout in milliseconds
    #[serde(default = "TransferSettings::default_read_timeout")]
    pub read_timeout_ms: u64,
    /// Bulk OUT timeout in milliseconds
    #[serde(default = "TransferSettings::default_write_timeout")]
    pub write_timeout_ms: u64,
    /// OUT transfers that may wait for the writer thread per device
    #[serde(default = "TransferSettings::default_write_queue_depth")]
    pub write_queue_depth: usize,
    /// Rescan interval when hotplug is unavailable
    #[serde(default = "TransferSettings::default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            read_timeout_ms: Self::default_read_timeout(),
            write_timeout_ms: Self::default_write_timeout(),
            write_queue_depth: Self::default_write_queue_depth(),
            poll_interval_ms: Self::default_poll_interval(),
        }
    }
}

impl TransferSettings {
    fn default_read_timeout() -> u64 {
        10_000
    }

    fn default_write_timeout() -> u64 {
        10_000
    }

    fn default_write_queue_depth() -> usize {
        32
    }

    fn default_poll_interval() -> u64 {
        1_000
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bridge: BridgeSettings {
                log_level: "info".to_string(),
            },
            device: DeviceSettings {
                vendor_id: format!("{:#06x}", DeviceMatch::ARDUINO_UNO_R3.vendor_id),
                product_id: format!("{:#06x}", DeviceMatch::ARDUINO_UNO_R3.product_id),
                name_prefix: DeviceSettings::default_name_prefix(),
                slot_base: DeviceSettings::default_slot_base(),
                max_slots: DeviceSettings::default_max_slots(),
            },
            transfers: TransferSettings::default(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from the specified path
    ///
    /// Without a path, the first existing file among `default_path()` and
    /// `/etc/ardu-usb/bridge.toml` is used.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            expand_path(&p)
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/ardu-usb/bridge.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: BridgeConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("{}", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let path = expand_path(path);
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("ardu-usb").join("bridge.toml")
        } else {
            PathBuf::from(".config/ardu-usb/bridge.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.bridge.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.bridge.log_level,
                valid_levels.join(", ")
            ));
        }

        parse_hex_id(&self.device.vendor_id, "vendor_id")?;
        parse_hex_id(&self.device.product_id, "product_id")?;

        if self.device.name_prefix.is_empty() {
            return Err(anyhow!("name_prefix must not be empty"));
        }

        if self.device.max_slots == 0 {
            return Err(anyhow!("max_slots must be at least 1"));
        }

        let end = u64::from(self.device.slot_base) + u64::from(self.device.max_slots);
        if end > u64::from(SLOT_LIMIT) {
            return Err(anyhow!(
                "Slot range {}..{} exceeds {}",
                self.device.slot_base,
                end,
                SLOT_LIMIT
            ));
        }

        let transfers = &self.transfers;
        for (name, value) in [
            ("read_timeout_ms", transfers.read_timeout_ms),
            ("write_timeout_ms", transfers.write_timeout_ms),
            ("poll_interval_ms", transfers.poll_interval_ms),
        ] {
            if value == 0 {
                return Err(anyhow!("{} must be greater than 0", name));
            }
        }

        if transfers.write_queue_depth == 0 {
            return Err(anyhow!("write_queue_depth must be at least 1"));
        }

        Ok(())
    }

    /// The vendor/product pair to bind
    pub fn device_match(&self) -> Result<DeviceMatch> {
        Ok(DeviceMatch::new(
            parse_hex_id(&self.device.vendor_id, "vendor_id")?,
            parse_hex_id(&self.device.product_id, "product_id")?,
        ))
    }

    pub fn registry_settings(&self) -> Result<RegistrySettings> {
        Ok(RegistrySettings {
            matcher: self.device_match()?,
            slot_base: self.device.slot_base,
            max_slots: self.device.max_slots,
            name_prefix: self.device.name_prefix.clone(),
            read_timeout: Duration::from_millis(self.transfers.read_timeout_ms),
        })
    }

    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            write_timeout: Duration::from_millis(self.transfers.write_timeout_ms),
            write_queue_depth: self.transfers.write_queue_depth,
        }
    }

    pub fn worker_settings(&self) -> Result<WorkerSettings> {
        Ok(WorkerSettings {
            matcher: self.device_match()?,
            poll_interval: Duration::from_millis(self.transfers.poll_interval_ms),
        })
    }
}

/// Parse a hex ID ("0x2341")
fn parse_hex_id(id: &str, name: &str) -> Result<u16> {
    let hex_part = id
        .strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .ok_or_else(|| {
            anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x2341')",
                name,
                id
            )
        })?;

    if hex_part.is_empty() || hex_part.len() > 4 {
        return Err(anyhow!(
            "Invalid {} '{}', hex part must be 1-4 digits",
            name,
            id
        ));
    }

    u16::from_str_radix(hex_part, 16)
        .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))
}

fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref())
}
