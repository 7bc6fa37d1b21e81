// MIT License - Copyright (c) 2026 Peter Wright
// Engine configuration

use std::str::FromStr;
use std::time::Duration;

use crate::constants::{
    DEFAULT_INTERCOM_HEADER, DEFAULT_MAX_RETRY, DEFAULT_PRIMARY_HEADER, DEFAULT_PRIMARY_TIMEOUT,
    DEFAULT_PROBE_TIMEOUT, DEFAULT_READ_TIMEOUT, DEFAULT_STABLE_CYCLES,
    PRIMARY_HEADER_CANDIDATES,
};
use crate::devices::virtual_device::VirtualKind;
use crate::devices::DeviceKind;
use crate::error::WallpadError;

/// How the entrance switch is emulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntranceMode {
    /// No entrance emulation
    #[default]
    Off,
    /// Answer the wallpad only while a trigger is pending; the light cutoff stays a real device
    Minimal,
    /// Old entrance switch at 0xAD; the emulator owns the light cutoff
    Full,
    /// New entrance switch at 0xCC
    New,
}

impl EntranceMode {
    /// The virtual device this mode impersonates.
    pub fn virtual_kind(&self) -> Option<VirtualKind> {
        match self {
            Self::Off => None,
            Self::Minimal | Self::Full => Some(VirtualKind::Entrance),
            Self::New => Some(VirtualKind::Entrance2),
        }
    }

    /// Whether the real light cutoff device must be dropped.
    pub fn owns_cutoff(&self) -> bool {
        matches!(self, Self::Full | Self::New)
    }
}

impl FromStr for EntranceMode {
    type Err = WallpadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(Self::Off),
            "minimal" => Ok(Self::Minimal),
            "full" => Ok(Self::Full),
            "new" => Ok(Self::New),
            other => Err(WallpadError::InvalidConfig {
                details: format!("unknown entrance_mode '{other}'"),
            }),
        }
    }
}

/// Whether the intercom door release is emulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IntercomMode {
    #[default]
    Off,
    On,
}

impl FromStr for IntercomMode {
    type Err = WallpadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(Self::Off),
            "on" => Ok(Self::On),
            other => Err(WallpadError::InvalidConfig {
                details: format!("unknown intercom_mode '{other}'"),
            }),
        }
    }
}

/// Configuration of the bus engine.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Topic prefix (default: "sds")
    pub prefix: String,
    /// Announce newly seen devices to the automation layer
    pub discovery: bool,
    /// Accept commands for real devices
    pub wallpad_mode: bool,
    pub entrance_mode: EntranceMode,
    pub intercom_mode: IntercomMode,
    /// Bus address of the emulated intercom
    pub intercom_header: u8,
    /// Hold the shared entrance call before releasing the door
    pub intercom_delay: bool,
    /// Retry window for commands and trigger steps
    pub max_retry: Duration,
    /// Start answering a virtual query this many bytes early (0..=2)
    pub early_response: u8,
    /// Steady-state read timeout
    pub read_timeout: Duration,
    /// Startup probe timeout
    pub probe_timeout: Duration,
    /// Permit the aggressive transmission fallback (serial lines only)
    pub allow_aggressive: bool,
    /// Primary-header cycles before the loop settles
    pub stable_cycles: u32,
    /// Time to wait for the primary header before trying a fallback
    pub primary_timeout: Duration,
    pub primary_header: u8,
    /// Fallback primary headers, consumed from the end
    pub primary_candidates: Vec<u8>,
    /// Decimal places of the electricity, gas and water meters
    pub energy_decimals: [u8; 3],
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            prefix: "sds".to_string(),
            discovery: true,
            wallpad_mode: true,
            entrance_mode: EntranceMode::Off,
            intercom_mode: IntercomMode::Off,
            intercom_header: DEFAULT_INTERCOM_HEADER,
            intercom_delay: false,
            max_retry: DEFAULT_MAX_RETRY,
            early_response: 2,
            read_timeout: DEFAULT_READ_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            allow_aggressive: true,
            stable_cycles: DEFAULT_STABLE_CYCLES,
            primary_timeout: DEFAULT_PRIMARY_TIMEOUT,
            primary_header: DEFAULT_PRIMARY_HEADER,
            primary_candidates: PRIMARY_HEADER_CANDIDATES.to_vec(),
            energy_decimals: [0, 2, 2],
        }
    }
}

impl BusConfig {
    pub fn builder() -> BusConfigBuilder {
        BusConfigBuilder::default()
    }

    /// Real device classes decoded in this installation.
    pub fn enabled_devices(&self) -> Vec<DeviceKind> {
        DeviceKind::ALL
            .into_iter()
            .filter(|k| !(*k == DeviceKind::Cutoff && self.entrance_mode.owns_cutoff()))
            .collect()
    }

    /// Emulated modules with their bus addresses.
    pub fn virtual_devices(&self) -> Vec<(VirtualKind, u8)> {
        let mut devices = Vec::new();
        if let Some(kind) = self.entrance_mode.virtual_kind() {
            devices.push((kind, kind.default_header0()));
        }
        if self.intercom_mode == IntercomMode::On {
            devices.push((VirtualKind::Intercom, self.intercom_header));
        }
        devices
    }
}

/// Builder for BusConfig.
#[derive(Debug, Clone, Default)]
pub struct BusConfigBuilder {
    config: BusConfig,
}

impl BusConfigBuilder {
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.prefix = prefix.into();
        self
    }

    pub fn discovery(mut self, discovery: bool) -> Self {
        self.config.discovery = discovery;
        self
    }

    pub fn wallpad_mode(mut self, enabled: bool) -> Self {
        self.config.wallpad_mode = enabled;
        self
    }

    pub fn entrance_mode(mut self, mode: EntranceMode) -> Self {
        self.config.entrance_mode = mode;
        self
    }

    pub fn intercom_mode(mut self, mode: IntercomMode) -> Self {
        self.config.intercom_mode = mode;
        self
    }

    pub fn intercom_header(mut self, header0: u8) -> Self {
        self.config.intercom_header = header0;
        self
    }

    pub fn intercom_delay(mut self, delay: bool) -> Self {
        self.config.intercom_delay = delay;
        self
    }

    pub fn max_retry(mut self, max_retry: Duration) -> Self {
        self.config.max_retry = max_retry;
        self
    }

    pub fn early_response(mut self, bytes: u8) -> Self {
        self.config.early_response = bytes.min(2);
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.config.probe_timeout = timeout;
        self
    }

    pub fn allow_aggressive(mut self, allow: bool) -> Self {
        self.config.allow_aggressive = allow;
        self
    }

    pub fn stable_cycles(mut self, cycles: u32) -> Self {
        self.config.stable_cycles = cycles.max(1);
        self
    }

    pub fn primary_timeout(mut self, timeout: Duration) -> Self {
        self.config.primary_timeout = timeout;
        self
    }

    pub fn primary_header(mut self, header0: u8) -> Self {
        self.config.primary_header = header0;
        self
    }

    pub fn primary_candidates(mut self, candidates: Vec<u8>) -> Self {
        self.config.primary_candidates = candidates;
        self
    }

    pub fn energy_decimals(mut self, decimals: [u8; 3]) -> Self {
        self.config.energy_decimals = decimals;
        self
    }

    pub fn build(self) -> BusConfig {
        self.config
    }
}

/// Parse a hex header option such as `"A4"` or `"A45A"` (only the first byte counts).
pub fn parse_header0(s: &str) -> Result<u8, WallpadError> {
    let digits = s.trim().get(..2).unwrap_or(s);
    u8::from_str_radix(digits, 16)
        .ok()
        .filter(|b| b & crate::constants::HEADER_MARK != 0)
        .ok_or_else(|| WallpadError::InvalidConfig {
            details: format!("invalid header '{s}'"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = BusConfig::builder()
            .prefix("wallpad")
            .entrance_mode(EntranceMode::New)
            .intercom_mode(IntercomMode::On)
            .intercom_header(0xA5)
            .max_retry(Duration::from_secs(5))
            .build();

        assert_eq!(config.prefix, "wallpad");
        assert_eq!(config.max_retry, Duration::from_secs(5));
        assert_eq!(
            config.virtual_devices(),
            vec![(VirtualKind::Entrance2, 0xCC), (VirtualKind::Intercom, 0xA5)]
        );
    }

    #[test]
    fn test_defaults() {
        let config = BusConfig::builder().build();
        assert_eq!(config.stable_cycles, 30);
        assert_eq!(config.primary_timeout, Duration::from_secs(6));
        assert_eq!(config.primary_header, 0xA1);
        assert_eq!(config.read_timeout, Duration::from_secs(10));
        assert!(config.virtual_devices().is_empty());
    }

    #[test]
    fn test_cutoff_follows_entrance_mode() {
        let with = |mode| {
            BusConfig::builder()
                .entrance_mode(mode)
                .build()
                .enabled_devices()
                .contains(&DeviceKind::Cutoff)
        };
        assert!(with(EntranceMode::Off));
        assert!(with(EntranceMode::Minimal));
        assert!(!with(EntranceMode::Full));
        assert!(!with(EntranceMode::New));
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("minimal".parse::<EntranceMode>().unwrap(), EntranceMode::Minimal);
        assert_eq!("on".parse::<IntercomMode>().unwrap(), IntercomMode::On);
        assert!("sometimes".parse::<EntranceMode>().is_err());
    }

    #[test]
    fn test_parse_header0() {
        assert_eq!(parse_header0("A4").unwrap(), 0xA4);
        assert_eq!(parse_header0("a45a").unwrap(), 0xA4);
        assert!(parse_header0("41").is_err());
        assert!(parse_header0("zz").is_err());
    }

    #[test]
    fn test_early_response_is_clamped() {
        assert_eq!(BusConfig::builder().early_response(7).build().early_response, 2);
    }
}
