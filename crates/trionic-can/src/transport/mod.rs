//! Transport layer for ECU communication
//!
//! This module provides the pieces between a CAN adapter and the request
//! layer:
//! - [`CanTransport`], the adapter interface an application implements
//! - [`Channel`], which owns the transport and moves whole messages
//! - [`mock::SimulatedEcu`], an in-memory ECU for testing
//!
//! # Example
//!
//! ```ignore
//! use trionic_can::transport::{mock::SimulatedEcu, Channel};
//! use trionic_can::FlashConfig;
//!
//! let config = FlashConfig::default();
//! let channel = Channel::new(Box::new(SimulatedEcu::new()), &config);
//! channel.open(None, Some(500_000)).await?;
//! let response = channel.request(&[0x3E, 0x01], Duration::from_secs(1)).await?;
//! ```

mod adapter;
mod channel;
pub mod error;
pub mod mock;

pub use adapter::{CanFrame, CanTransport};
pub use channel::{Addressing, Channel, ChannelGuard};
pub use error::LinkError;
