//! Bluetooth communication layer for `AirPods`.
//!
//! This module provides Bluetooth connectivity including L2CAP socket
//! management, the per-device link state machine, adapter discovery and
//! the device manager tying them together.

pub mod connection;
pub mod discovery;
pub mod l2cap;
pub mod manager;
#[cfg(test)]
pub mod mock;
