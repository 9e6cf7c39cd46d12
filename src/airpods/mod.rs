//! `AirPods` device management and protocol implementation.
//!
//! This module contains all the AirPods-specific functionality including
//! the device model, protocol parsing, the state registry and command
//! dispatch.

pub mod battery;
pub mod codec;
pub mod device;
pub mod dispatcher;
pub mod parser;
pub mod protocol;
pub mod recognition;
pub mod registry;
