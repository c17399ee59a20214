//! Session management for ECU communication
//!
//! This module handles the connection lifecycle, seed/key security access,
//! and the keepalive that holds the ECU in its diagnostic session.

mod manager;
mod security;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use manager::{JobGuard, SessionManager};
pub use security::{KeyAlgorithm, SecurityAccess, XorKeyAlgorithm};

/// Powertrain bus bitrate
pub const PBUS_BAUD_RATE: u32 = 500_000;
/// Instrument bus bitrate
pub const IBUS_BAUD_RATE: u32 = 47_619;

/// Connection state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Closed,
    Connecting,
    SecurityPending,
    Open,
    /// Keepalive or link failure; only `open` leaves this state
    Faulted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Closed => "closed",
            SessionState::Connecting => "connecting",
            SessionState::SecurityPending => "security pending",
            SessionState::Open => "open",
            SessionState::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

/// Granted security access, ordered from least to most privileged
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    #[default]
    None,
    Read,
    Write,
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SecurityLevel::None => "none",
            SecurityLevel::Read => "read",
            SecurityLevel::Write => "write",
        };
        f.write_str(s)
    }
}

/// Snapshot of the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub state: SessionState,
    /// Bitrate the ECU answered on
    pub baud_rate: Option<u32>,
    /// Adapter port requested from the transport (`None` = auto-detect)
    pub comport: Option<String>,
    pub only_pbus: bool,
    pub forced_baud_rate: Option<u32>,
    pub forced_comport: Option<String>,
    /// Delay between consecutive frames
    pub sleep_time: Duration,
    pub connection_check_disabled: bool,
    pub security_level: SecurityLevel,
}

impl Session {
    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_levels_are_ordered() {
        assert!(SecurityLevel::None < SecurityLevel::Read);
        assert!(SecurityLevel::Read < SecurityLevel::Write);
        assert_eq!(SecurityLevel::default(), SecurityLevel::None);
    }
}
