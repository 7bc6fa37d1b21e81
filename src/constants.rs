// MIT License - Copyright (c) 2026 Peter Wright
// Bus constants

use std::time::Duration;

/// Prefix byte of every device state frame and of the generic acknowledgement.
pub const HEADER_0_STATE: u8 = 0xB0;

/// Second header byte of the wallpad's "is anyone there" poll.
///
/// A wallpad still scanning for a module has nobody answering in that slot,
/// which makes it a safe moment to inject a command.
pub const HEADER_1_SCAN: u8 = 0x5A;

/// First byte of a frame always has the top bit set; the second never does.
pub const HEADER_MARK: u8 = 0x80;

/// Mask applied to the XOR checksum (top bit is always clear).
pub const CHECKSUM_MASK: u8 = 0x7F;

/// Placeholder in a canned virtual response meaning "copy the live byte from the bus".
pub const FOLLOW_SENTINEL: u8 = 0xFF;

/// Header0 used to count polling cycles when nothing else is configured.
pub const DEFAULT_PRIMARY_HEADER: u8 = 0xA1;

/// Fallback primary headers, consumed from the end.
pub const PRIMARY_HEADER_CANDIDATES: [u8; 6] = [0xAB, 0xAC, 0xAD, 0xAE, 0xC2, 0xA5];

/// Number of primary-header cycles after which the loop settles.
pub const DEFAULT_STABLE_CYCLES: u32 = 30;

/// How long to wait for the primary header before trying the next candidate.
pub const DEFAULT_PRIMARY_TIMEOUT: Duration = Duration::from_secs(6);

/// Steady-state read timeout.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout of the startup probe that detects a dead link.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Retries older than this are logged at warning level.
pub const RETRY_WARN_AFTER: Duration = Duration::from_secs(3);

/// Default retry window for commands and virtual trigger steps.
pub const DEFAULT_MAX_RETRY: Duration = Duration::from_secs(20);

/// Default intercom bus address.
pub const DEFAULT_INTERCOM_HEADER: u8 = 0xA4;

/// Intercom header1 values with availability side effects.
pub const INTERCOM_PUBLIC_RING: u8 = 0x32;
pub const INTERCOM_PRIVATE_RING: u8 = 0x31;
pub const INTERCOM_CALL_STARTED: u8 = 0x36;
pub const INTERCOM_CALL_ENDED: u8 = 0x3E;

/// Discovery topic root and node id.
pub const DISCOVERY_PREFIX: &str = "homeassistant";
pub const DISCOVERY_NODE_ID: &str = "sds_wallpad";

/// Minimum packet dump duration when dumping is enabled.
pub const MIN_DUMP_TIME: Duration = Duration::from_secs(10);
