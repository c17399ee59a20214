//! KWP2000-style request layer
//!
//! Service ids follow KWP2000 (ISO 14230-3) numbering by default. ECU
//! families that deviate override individual ids through
//! [`ServiceOverrides`](crate::config::ServiceOverrides).

mod nrc;
mod services;

pub use nrc::NegativeResponseCode;
pub use services::{KwpService, BLOCK_CHECKSUM_LEN, BLOCK_HEADER_LEN, MAX_BLOCK_LEN};

use crate::config::ServiceOverrides;

/// Offset added to a service id in a positive response
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

/// Standard KWP2000 service id constants
pub mod service_id {
    pub const START_DIAGNOSTIC_SESSION: u8 = 0x10;
    pub const ECU_RESET: u8 = 0x11;
    pub const READ_DATA_BY_LOCAL_ID: u8 = 0x21;
    pub const READ_MEMORY_BY_ADDRESS: u8 = 0x23;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const START_ROUTINE_BY_LOCAL_ID: u8 = 0x31;
    pub const TRANSFER_DATA: u8 = 0x36;
    pub const REQUEST_TRANSFER_EXIT: u8 = 0x37;
    pub const TESTER_PRESENT: u8 = 0x3E;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
}

/// TesterPresent (0x3E) sub-functions
pub mod tester_present_mode {
    /// ECU answers with a positive response
    pub const RESPONSE_REQUIRED: u8 = 0x01;
    /// ECU stays silent
    pub const NO_RESPONSE: u8 = 0x02;
}

/// ECUReset (0x11) reset modes
pub mod reset_mode {
    pub const POWER_ON: u8 = 0x01;
    pub const NON_VOLATILE_MEMORY: u8 = 0x02;
}

/// Resolved service IDs for a specific ECU family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceIds {
    pub start_diagnostic_session: u8,
    pub ecu_reset: u8,
    pub read_data_by_local_id: u8,
    pub read_memory_by_address: u8,
    pub security_access: u8,
    pub start_routine_by_local_id: u8,
    pub transfer_data: u8,
    pub request_transfer_exit: u8,
    pub tester_present: u8,
    pub negative_response: u8,
}

impl Default for ServiceIds {
    fn default() -> Self {
        Self {
            start_diagnostic_session: service_id::START_DIAGNOSTIC_SESSION,
            ecu_reset: service_id::ECU_RESET,
            read_data_by_local_id: service_id::READ_DATA_BY_LOCAL_ID,
            read_memory_by_address: service_id::READ_MEMORY_BY_ADDRESS,
            security_access: service_id::SECURITY_ACCESS,
            start_routine_by_local_id: service_id::START_ROUTINE_BY_LOCAL_ID,
            transfer_data: service_id::TRANSFER_DATA,
            request_transfer_exit: service_id::REQUEST_TRANSFER_EXIT,
            tester_present: service_id::TESTER_PRESENT,
            negative_response: service_id::NEGATIVE_RESPONSE,
        }
    }
}

impl ServiceIds {
    /// Create ServiceIds with ECU-family overrides applied
    pub fn from_overrides(overrides: &ServiceOverrides) -> Self {
        let mut ids = Self::default();

        if let Some(v) = overrides.start_diagnostic_session {
            ids.start_diagnostic_session = v;
        }
        if let Some(v) = overrides.ecu_reset {
            ids.ecu_reset = v;
        }
        if let Some(v) = overrides.read_data_by_local_id {
            ids.read_data_by_local_id = v;
        }
        if let Some(v) = overrides.read_memory_by_address {
            ids.read_memory_by_address = v;
        }
        if let Some(v) = overrides.security_access {
            ids.security_access = v;
        }
        if let Some(v) = overrides.start_routine_by_local_id {
            ids.start_routine_by_local_id = v;
        }
        if let Some(v) = overrides.transfer_data {
            ids.transfer_data = v;
        }
        if let Some(v) = overrides.request_transfer_exit {
            ids.request_transfer_exit = v;
        }
        if let Some(v) = overrides.tester_present {
            ids.tester_present = v;
        }

        ids
    }
}

/// Positive response id for a service
pub fn positive_response(service: u8) -> u8 {
    service.wrapping_add(POSITIVE_RESPONSE_OFFSET)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_apply_only_set_fields() {
        let overrides = ServiceOverrides {
            transfer_data: Some(0xBA),
            ..Default::default()
        };
        let ids = ServiceIds::from_overrides(&overrides);

        assert_eq!(ids.transfer_data, 0xBA);
        assert_eq!(ids.security_access, service_id::SECURITY_ACCESS);
    }
}
