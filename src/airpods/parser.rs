//! Packet parsing utilities for `AirPods` protocol.
//!
//! This module contains functions to parse the AAP payload types received
//! from `AirPods` devices over the L2CAP connection. Every parser validates
//! the envelope and the opcode-declared length before reading fields.

use std::str;

use log::{debug, warn};
use smol_str::SmolStr;
use thiserror::Error;

use crate::airpods::{
   device::{Battery, ComponentBattery, EarDetection},
   protocol::{
      BatteryStatus, CONTROL_PACKET_LEN, Component, FeatureId, HDR_BATTERY_STATE, HDR_CMD_CTL,
      HDR_EAR_DETECTION, HDR_METADATA, Model,
   },
};

/// Error type for protocol parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtoError {
   /// Packet is not of the expected type
   #[error("Not a {expected} packet")]
   WrongPacketType { expected: &'static str },

   /// Packet does not start with a known envelope header
   #[error("Bad envelope header")]
   BadHeader,

   /// Packet is too short for the expected format
   #[error("Packet too short: expected at least {expected} bytes, got {actual}")]
   PacketTooShort { expected: usize, actual: usize },

   /// Invalid battery count in battery status packet
   #[error("Invalid battery count: {count} (must be 1-4)")]
   InvalidBatteryCount { count: u8 },

   /// Packet size doesn't match expected size based on content
   #[error("Packet size mismatch: expected {expected} bytes, got {actual} bytes")]
   PacketSizeMismatch { expected: usize, actual: usize },

   /// Generic invalid packet format
   #[error("Invalid packet format: {reason}")]
   InvalidFormat { reason: &'static str },
}

pub type Result<T> = std::result::Result<T, ProtoError>;

fn ensure_len(data: &[u8], expected: usize) -> Result<()> {
   if data.len() < expected {
      return Err(ProtoError::PacketTooShort {
         expected,
         actual: data.len(),
      });
   }
   Ok(())
}

/// Parses a battery status packet.
///
/// The packet carries a component count followed by 5-byte records of
/// `[component, pad, level, status, pad]`. Components reporting
/// `Disconnected` are left absent.
pub fn parse_battery_status(data: &[u8]) -> Result<Battery> {
   if !data.starts_with(HDR_BATTERY_STATE) {
      return Err(ProtoError::WrongPacketType {
         expected: "battery status",
      });
   }
   ensure_len(data, 7)?;

   let battery_count = data[6];
   if !(1..=4).contains(&battery_count) {
      return Err(ProtoError::InvalidBatteryCount {
         count: battery_count,
      });
   }

   let expected_length = 7 + 5 * battery_count as usize;
   if data.len() != expected_length {
      return Err(ProtoError::PacketSizeMismatch {
         expected: expected_length,
         actual: data.len(),
      });
   }

   let mut left = None;
   let mut right = None;
   let mut case = None;
   let mut headphone = None;
   let mut saw_bud = false;

   for record in data[7..].chunks_exact(5) {
      let (id, level, status) = (record[0], record[2], record[3]);

      let Some(component) = Component::from_repr(id) else {
         warn!("Unknown component type 0x{id:02x}");
         continue;
      };
      saw_bud |= component != Component::Headphone;

      let charging = match BatteryStatus::from_repr(status) {
         Some(BatteryStatus::Disconnected) => continue,
         Some(status) => Some(status == BatteryStatus::Charging),
         None => {
            warn!("Unknown battery status 0x{status:02x} for component {component}");
            None
         },
      };
      let level = (level <= 100).then_some(level);
      debug!("Parsed component: {component} = {level:?}% (charging: {charging:?})");

      let state = Some(ComponentBattery { level, charging });
      match component {
         Component::Left => left = state,
         Component::Right => right = state,
         Component::Case => case = state,
         Component::Headphone => headphone = state,
      }
   }

   match (headphone, saw_bud) {
      (Some(_), true) => Err(ProtoError::InvalidFormat {
         reason: "battery reports both buds and a headphone",
      }),
      (Some(headphone), false) => Ok(Battery::Single {
         headphone: Some(headphone),
      }),
      (None, _) => Ok(Battery::Dual { left, right, case }),
   }
}

/// Parses a control packet into its setting id and value.
pub fn parse_control(data: &[u8]) -> Result<(FeatureId, u32)> {
   let Some(rest) = data.strip_prefix(HDR_CMD_CTL) else {
      return Err(ProtoError::WrongPacketType { expected: "control" });
   };
   if data.len() != CONTROL_PACKET_LEN {
      return Err(ProtoError::PacketSizeMismatch {
         expected: CONTROL_PACKET_LEN,
         actual: data.len(),
      });
   }
   let (setting, value) = rest
      .split_first()
      .ok_or(ProtoError::InvalidFormat { reason: "missing setting id" })?;
   let value: [u8; 4] = value
      .try_into()
      .map_err(|_| ProtoError::InvalidFormat { reason: "bad control value" })?;
   Ok((FeatureId::from_id(*setting), u32::from_le_bytes(value)))
}

/// Parses an ear detection packet.
///
/// Each ear byte is `0x00` in ear, `0x01` out of ear, `0x02` in the case.
pub fn parse_ear_detection(data: &[u8]) -> Result<EarDetection> {
   if !data.starts_with(HDR_EAR_DETECTION) {
      return Err(ProtoError::WrongPacketType {
         expected: "ear detection",
      });
   }
   ensure_len(data, 8)?;
   let placement = |b: u8| match b {
      0x00 => Some(true),
      0x01 | 0x02 => Some(false),
      _ => None,
   };
   Ok(EarDetection::Buds {
      left: placement(data[6]),
      right: placement(data[7]),
   })
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Metadata {
   pub name: Option<SmolStr>,
   pub model: Option<Model>,
}

fn is_model_number(s: &str) -> bool {
   s.len() == 5 && s.starts_with('A') && s[1..].bytes().all(|b| b.is_ascii_digit())
}

/// Parses the device metadata packet.
///
/// The payload is a run of NUL-separated strings holding the device name,
/// its model number, manufacturer and firmware details.
pub fn parse_metadata(data: &[u8]) -> Result<Metadata> {
   if !data.starts_with(HDR_METADATA) {
      return Err(ProtoError::WrongPacketType {
         expected: "metadata",
      });
   }
   ensure_len(data, 20)?;

   let mut metadata = Metadata::default();
   let strings = data[HDR_METADATA.len()..]
      .split(|&b| b == 0)
      .filter_map(|chunk| str::from_utf8(chunk).ok())
      .map(str::trim)
      .filter(|s| s.len() > 1 && !s.chars().any(char::is_control));

   for text in strings {
      if is_model_number(text) {
         if metadata.model.is_none() {
            metadata.model = Some(Model::from_model_number(text));
         }
      } else if metadata.name.is_none() && text.chars().any(char::is_alphabetic) {
         metadata.name = Some(text.into());
      }
   }
   Ok(metadata)
}

#[cfg(test)]
mod tests {
   use super::*;

   fn battery_packet(records: &[(u8, u8, u8)]) -> Vec<u8> {
      let mut packet = HDR_BATTERY_STATE.to_vec();
      packet.push(records.len() as u8);
      for &(component, level, status) in records {
         packet.extend_from_slice(&[component, 0x01, level, status, 0x01]);
      }
      packet
   }

   #[test]
   fn test_parse_dual_battery() {
      let packet = battery_packet(&[(0x04, 85, 0x02), (0x02, 90, 0x02), (0x08, 75, 0x01)]);
      let battery = parse_battery_status(&packet).expect("valid battery");
      assert_eq!(
         battery,
         Battery::Dual {
            left: Some(ComponentBattery::new(85, false)),
            right: Some(ComponentBattery::new(90, false)),
            case: Some(ComponentBattery::new(75, true)),
         }
      );
   }

   #[test]
   fn test_parse_disconnected_component_absent() {
      let packet = battery_packet(&[(0x04, 50, 0x02), (0x08, 0, 0x04)]);
      let battery = parse_battery_status(&packet).expect("valid battery");
      assert_eq!(
         battery,
         Battery::Dual {
            left: Some(ComponentBattery::new(50, false)),
            right: None,
            case: None,
         }
      );
   }

   #[test]
   fn test_parse_headphone_battery() {
      let packet = battery_packet(&[(0x01, 64, 0x00)]);
      let battery = parse_battery_status(&packet).expect("valid battery");
      assert_eq!(
         battery,
         Battery::Single {
            headphone: Some(ComponentBattery::new(64, false)),
         }
      );
   }

   #[test]
   fn test_parse_battery_rejects_mixed_layout() {
      let packet = battery_packet(&[(0x01, 64, 0x00), (0x04, 50, 0x00)]);
      assert!(matches!(
         parse_battery_status(&packet),
         Err(ProtoError::InvalidFormat { .. })
      ));
   }

   #[test]
   fn test_parse_battery_length_checks() {
      let mut packet = battery_packet(&[(0x04, 50, 0x00)]);
      packet.push(0xAA);
      assert!(matches!(
         parse_battery_status(&packet),
         Err(ProtoError::PacketSizeMismatch { .. })
      ));
      assert!(matches!(
         parse_battery_status(&HDR_BATTERY_STATE[..]),
         Err(ProtoError::PacketTooShort { .. })
      ));
      let mut packet = HDR_BATTERY_STATE.to_vec();
      packet.push(9);
      assert!(matches!(
         parse_battery_status(&packet),
         Err(ProtoError::InvalidBatteryCount { count: 9 })
      ));
   }

   #[test]
   fn test_parse_unknown_status_keeps_level() {
      let packet = battery_packet(&[(0x04, 42, 0x7e)]);
      let Battery::Dual { left, .. } = parse_battery_status(&packet).expect("valid battery") else {
         panic!("expected dual layout");
      };
      assert_eq!(
         left,
         Some(ComponentBattery {
            level: Some(42),
            charging: None,
         })
      );
   }

   #[test]
   fn test_parse_control() {
      let packet = [0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0x0D, 0x02, 0x00, 0x00, 0x00];
      assert_eq!(parse_control(&packet), Ok((FeatureId::NOISE_CONTROL, 2)));
      assert!(parse_control(&packet[..9]).is_err());
   }

   #[test]
   fn test_parse_ear_detection() {
      let packet = [0x04, 0x00, 0x04, 0x00, 0x06, 0x00, 0x00, 0x02];
      assert_eq!(
         parse_ear_detection(&packet),
         Ok(EarDetection::Buds {
            left: Some(true),
            right: Some(false),
         })
      );
      assert!(parse_ear_detection(&packet[..7]).is_err());
   }

   #[test]
   fn test_parse_metadata() {
      let mut packet = HDR_METADATA.to_vec();
      packet.extend_from_slice(&[0x02, 0x04, 0x00]);
      packet.extend_from_slice(b"Jane's AirPods Pro\0A2084\0Apple Inc.\0GX1234\0");
      let metadata = parse_metadata(&packet).expect("valid metadata");
      assert_eq!(metadata.name.as_deref(), Some("Jane's AirPods Pro"));
      assert_eq!(metadata.model, Some(Model::AirPodsPro));
   }
}
