//! Flash session configuration
//!
//! `FlashConfig` is loaded from TOML once, validated, and then handed to a
//! [`SessionManager`](crate::SessionManager) which keeps it for the lifetime
//! of the session. Every field has a default so an empty document is valid.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::kwp::MAX_BLOCK_LEN;

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Configuration for a flash session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Bus bitrate to use instead of probing (0 = auto)
    #[serde(default)]
    pub forced_baud_rate: u32,
    /// Adapter port to use instead of auto-detection ("" = auto)
    #[serde(default)]
    pub forced_comport: String,
    /// Only try the P-bus bitrate
    #[serde(default)]
    pub only_pbus: bool,
    /// Skip the TesterPresent probe when opening
    #[serde(default)]
    pub disable_connection_check: bool,
    /// Delay between consecutive frames of one message
    #[serde(default)]
    pub sleep_time: SleepTime,
    /// Run security access as part of `open`
    #[serde(default)]
    pub security_access_on_open: bool,
    /// Log every raw frame at trace level
    #[serde(default)]
    pub enable_raw_frame_logging: bool,
    #[serde(default)]
    pub addressing: AddressingConfig,
    #[serde(default)]
    pub keepalive: KeepaliveConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub flash: FlashOptions,
    #[serde(default)]
    pub live_values: LiveValueConfig,
    /// Service ID overrides for ECU families with non-standard numbering
    #[serde(default)]
    pub service_overrides: ServiceOverrides,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            forced_baud_rate: 0,
            forced_comport: String::new(),
            only_pbus: false,
            disable_connection_check: false,
            sleep_time: SleepTime::default(),
            security_access_on_open: false,
            enable_raw_frame_logging: false,
            addressing: AddressingConfig::default(),
            keepalive: KeepaliveConfig::default(),
            security: SecurityConfig::default(),
            transfer: TransferConfig::default(),
            flash: FlashOptions::default(),
            live_values: LiveValueConfig::default(),
            service_overrides: ServiceOverrides::default(),
        }
    }
}

impl FlashConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let keepalive = &self.keepalive;
        if keepalive.enabled && keepalive.interval_ms >= keepalive.ecu_session_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "keepalive.interval_ms ({}) must be shorter than keepalive.ecu_session_timeout_ms ({})",
                keepalive.interval_ms, keepalive.ecu_session_timeout_ms
            )));
        }
        if keepalive.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "keepalive.timeout_ms must be non-zero".to_string(),
            ));
        }

        let transfer = &self.transfer;
        if transfer.block_size == 0 || transfer.block_size > MAX_BLOCK_LEN {
            return Err(ConfigError::Invalid(format!(
                "transfer.block_size must be between 1 and {}, got {}",
                MAX_BLOCK_LEN, transfer.block_size
            )));
        }
        if transfer.block_attempts == 0 {
            return Err(ConfigError::Invalid(
                "transfer.block_attempts must be at least 1".to_string(),
            ));
        }

        let security = &self.security;
        if security.max_key_attempts == 0 {
            return Err(ConfigError::Invalid(
                "security.max_key_attempts must be at least 1".to_string(),
            ));
        }
        for (name, mode) in [
            ("read_access_mode", security.read_access_mode),
            ("write_access_mode", security.write_access_mode),
        ] {
            // Seed modes are odd, the key goes to mode + 1
            if mode % 2 == 0 {
                return Err(ConfigError::Invalid(format!(
                    "security.{} must be odd, got 0x{:02X}",
                    name, mode
                )));
            }
        }

        if self.addressing.tx_id == self.addressing.rx_id {
            return Err(ConfigError::Invalid(
                "addressing.tx_id and addressing.rx_id must differ".to_string(),
            ));
        }

        Ok(())
    }

    /// Forced adapter port, if any
    pub fn comport(&self) -> Option<&str> {
        if self.forced_comport.is_empty() {
            None
        } else {
            Some(self.forced_comport.as_str())
        }
    }
}

/// Inter-frame delay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SleepTime {
    /// Adapter default
    #[default]
    Default,
    /// Explicit delay in milliseconds
    Custom(u64),
}

const DEFAULT_SLEEP_TIME_MS: u64 = 2;

impl SleepTime {
    pub fn as_duration(&self) -> Duration {
        match self {
            SleepTime::Default => Duration::from_millis(DEFAULT_SLEEP_TIME_MS),
            SleepTime::Custom(ms) => Duration::from_millis(*ms),
        }
    }
}

// =============================================================================
// Bus Addressing
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressingConfig {
    /// Tester -> ECU CAN id
    #[serde(default = "default_tx_id")]
    pub tx_id: u32,
    /// ECU -> tester CAN id
    #[serde(default = "default_rx_id")]
    pub rx_id: u32,
}

fn default_tx_id() -> u32 {
    0x7E0
}

fn default_rx_id() -> u32 {
    0x7E8
}

impl Default for AddressingConfig {
    fn default() -> Self {
        Self {
            tx_id: default_tx_id(),
            rx_id: default_rx_id(),
        }
    }
}

// =============================================================================
// Keepalive
// =============================================================================

/// Keepalive configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Interval between TesterPresent requests
    #[serde(default = "default_keepalive_interval")]
    pub interval_ms: u64,
    /// Wait for each TesterPresent response (also used for the open probe)
    #[serde(default = "default_keepalive_timeout")]
    pub timeout_ms: u64,
    /// ECU drops the diagnostic session after this much silence
    #[serde(default = "default_ecu_session_timeout")]
    pub ecu_session_timeout_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_keepalive_interval() -> u64 {
    2000
}

fn default_keepalive_timeout() -> u64 {
    1000
}

fn default_ecu_session_timeout() -> u64 {
    5000
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval_ms: default_keepalive_interval(),
            timeout_ms: default_keepalive_timeout(),
            ecu_session_timeout_ms: default_ecu_session_timeout(),
        }
    }
}

impl KeepaliveConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// =============================================================================
// Security Access
// =============================================================================

/// Seed/key access modes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Seed request mode granting read access
    #[serde(default = "default_read_access_mode")]
    pub read_access_mode: u8,
    /// Seed request mode granting write access
    #[serde(default = "default_write_access_mode")]
    pub write_access_mode: u8,
    /// Total key attempts before giving up
    #[serde(default = "default_max_key_attempts")]
    pub max_key_attempts: u32,
}

fn default_read_access_mode() -> u8 {
    0x03
}

fn default_write_access_mode() -> u8 {
    0x01
}

fn default_max_key_attempts() -> u32 {
    2
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            read_access_mode: default_read_access_mode(),
            write_access_mode: default_write_access_mode(),
            max_key_attempts: default_max_key_attempts(),
        }
    }
}

// =============================================================================
// Block Transfer
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Bytes per TransferData / ReadMemoryByAddress block
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// Total attempts per block, including the first
    #[serde(default = "default_block_attempts")]
    pub block_attempts: u32,
    /// Delay before retrying a block
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    /// Wait for each response frame
    #[serde(default = "default_frame_timeout")]
    pub frame_timeout_ms: u64,
    /// Longest total wait while the ECU keeps answering "response pending"
    #[serde(default = "default_response_pending_timeout")]
    pub response_pending_timeout_ms: u64,
}

fn default_block_size() -> usize {
    0x80
}

fn default_block_attempts() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    50
}

fn default_frame_timeout() -> u64 {
    1000
}

fn default_response_pending_timeout() -> u64 {
    30000
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            block_attempts: default_block_attempts(),
            retry_delay_ms: default_retry_delay(),
            frame_timeout_ms: default_frame_timeout(),
            response_pending_timeout_ms: default_response_pending_timeout(),
        }
    }
}

impl TransferConfig {
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn response_pending_timeout(&self) -> Duration {
        Duration::from_millis(self.response_pending_timeout_ms)
    }
}

// =============================================================================
// Flash Sequence
// =============================================================================

/// How a written image is verified
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyMode {
    /// Compare the ECU's CRC-32 over the region at transfer exit
    #[default]
    Checksum,
    /// Read every block back and compare
    ReadBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashOptions {
    #[serde(default = "default_true")]
    pub erase_before_write: bool,
    /// Local routine id of the erase routine
    #[serde(default = "default_erase_routine_id")]
    pub erase_routine_id: u8,
    /// Diagnostic mode selected before programming
    #[serde(default = "default_programming_mode")]
    pub programming_mode: u8,
    #[serde(default)]
    pub verify: VerifyMode,
    #[serde(default = "default_true")]
    pub reset_after_write: bool,
}

fn default_erase_routine_id() -> u8 {
    0x52
}

fn default_programming_mode() -> u8 {
    0x85
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            erase_before_write: default_true(),
            erase_routine_id: default_erase_routine_id(),
            programming_mode: default_programming_mode(),
            verify: VerifyMode::default(),
            reset_after_write: default_true(),
        }
    }
}

// =============================================================================
// Live Values
// =============================================================================

/// ADC and thermo read configuration (physical = raw * scale + offset)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveValueConfig {
    #[serde(default = "default_live_timeout")]
    pub timeout_ms: u64,
    /// Local id of ADC channel 0; channel n is read from `adc_base_id + n`
    #[serde(default = "default_adc_base_id")]
    pub adc_base_id: u8,
    #[serde(default = "default_thermo_id")]
    pub thermo_id: u8,
    /// Millivolts per count
    #[serde(default = "default_adc_scale")]
    pub adc_scale: f32,
    #[serde(default)]
    pub adc_offset: f32,
    /// Degrees Celsius per count
    #[serde(default = "default_thermo_scale")]
    pub thermo_scale: f32,
    #[serde(default = "default_thermo_offset")]
    pub thermo_offset: f32,
}

fn default_live_timeout() -> u64 {
    250
}

fn default_adc_base_id() -> u8 {
    0x80
}

fn default_thermo_id() -> u8 {
    0x90
}

fn default_adc_scale() -> f32 {
    // 10-bit converter on a 5 V reference
    5000.0 / 1023.0
}

fn default_thermo_scale() -> f32 {
    0.1
}

fn default_thermo_offset() -> f32 {
    -40.0
}

impl Default for LiveValueConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_live_timeout(),
            adc_base_id: default_adc_base_id(),
            thermo_id: default_thermo_id(),
            adc_scale: default_adc_scale(),
            adc_offset: 0.0,
            thermo_scale: default_thermo_scale(),
            thermo_offset: default_thermo_offset(),
        }
    }
}

impl LiveValueConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// =============================================================================
// Service Overrides
// =============================================================================

/// Service ID overrides for ECU families
///
/// Families that deviate from KWP2000 numbering replace individual ids;
/// anything left unset keeps the standard value.
///
/// # Example
/// ```toml
/// [service_overrides]
/// transfer_data = 0xBA            # Standard: 0x36
/// request_transfer_exit = 0xBB    # Standard: 0x37
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceOverrides {
    /// StartDiagnosticSession (standard: 0x10)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_diagnostic_session: Option<u8>,
    /// ECUReset (standard: 0x11)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ecu_reset: Option<u8>,
    /// ReadDataByLocalIdentifier (standard: 0x21)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_data_by_local_id: Option<u8>,
    /// ReadMemoryByAddress (standard: 0x23)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_memory_by_address: Option<u8>,
    /// SecurityAccess (standard: 0x27)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_access: Option<u8>,
    /// StartRoutineByLocalIdentifier (standard: 0x31)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_routine_by_local_id: Option<u8>,
    /// TransferData (standard: 0x36)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_data: Option<u8>,
    /// RequestTransferExit (standard: 0x37)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_transfer_exit: Option<u8>,
    /// TesterPresent (standard: 0x3E)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tester_present: Option<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = FlashConfig::from_toml_str("").unwrap();

        assert_eq!(config.forced_baud_rate, 0);
        assert_eq!(config.comport(), None);
        assert_eq!(config.sleep_time, SleepTime::Default);
        assert_eq!(config.sleep_time.as_duration(), Duration::from_millis(2));
        assert_eq!(config.addressing.tx_id, 0x7E0);
        assert_eq!(config.addressing.rx_id, 0x7E8);
        assert_eq!(config.keepalive.interval_ms, 2000);
        assert_eq!(config.transfer.block_size, 0x80);
        assert_eq!(config.transfer.block_attempts, 3);
        assert_eq!(config.security.max_key_attempts, 2);
        assert_eq!(config.flash.verify, VerifyMode::Checksum);
    }

    #[test]
    fn test_parse_full_document() {
        let toml = r#"
            forced_baud_rate = 500000
            forced_comport = "COM3"
            only_pbus = true
            sleep_time = { custom = 5 }
            enable_raw_frame_logging = true

            [keepalive]
            interval_ms = 1500
            ecu_session_timeout_ms = 4000

            [transfer]
            block_size = 256
            block_attempts = 5

            [flash]
            verify = "read_back"
            reset_after_write = false

            [service_overrides]
            transfer_data = 0xBA
        "#;

        let config = FlashConfig::from_toml_str(toml).unwrap();

        assert_eq!(config.forced_baud_rate, 500_000);
        assert_eq!(config.comport(), Some("COM3"));
        assert!(config.only_pbus);
        assert_eq!(config.sleep_time, SleepTime::Custom(5));
        assert_eq!(config.keepalive.interval(), Duration::from_millis(1500));
        assert_eq!(config.keepalive.timeout_ms, 1000);
        assert_eq!(config.transfer.block_size, 256);
        assert_eq!(config.transfer.block_attempts, 5);
        assert_eq!(config.flash.verify, VerifyMode::ReadBack);
        assert!(!config.flash.reset_after_write);
        assert!(config.flash.erase_before_write);
        assert_eq!(config.service_overrides.transfer_data, Some(0xBA));
    }

    #[test]
    fn test_keepalive_must_beat_ecu_timeout() {
        let toml = r#"
            [keepalive]
            interval_ms = 5000
            ecu_session_timeout_ms = 5000
        "#;
        let err = FlashConfig::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_disabled_keepalive_skips_interval_check() {
        let toml = r#"
            [keepalive]
            enabled = false
            interval_ms = 9000
        "#;
        assert!(FlashConfig::from_toml_str(toml).is_ok());
    }

    #[test]
    fn test_rejects_oversized_block() {
        let toml = format!("[transfer]\nblock_size = {}", MAX_BLOCK_LEN + 1);
        let err = FlashConfig::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("block_size"));
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let err = FlashConfig::from_toml_str("[transfer]\nblock_attempts = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_even_seed_mode() {
        let err = FlashConfig::from_toml_str("[security]\nwrite_access_mode = 2").unwrap_err();
        assert!(err.to_string().contains("write_access_mode"));
    }

    #[test]
    fn test_parse_error() {
        let err = FlashConfig::from_toml_str("forced_baud_rate = \"fast\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "forced_baud_rate = 47619").unwrap();

        let config = FlashConfig::from_file(file.path()).unwrap();
        assert_eq!(config.forced_baud_rate, 47_619);
    }
}
