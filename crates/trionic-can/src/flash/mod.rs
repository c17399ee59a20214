//! Whole-image flash operations and live value reads

mod orchestrator;

use serde::{Deserialize, Serialize};

pub use crate::config::VerifyMode;
pub use orchestrator::FlashOrchestrator;

/// Live measurement channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveChannel {
    /// Analog input by channel number
    Adc(u8),
    /// Thermocouple input
    Thermo,
}
