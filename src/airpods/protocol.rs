//! `AirPods` protocol definitions and data structures.
//!
//! This module contains all the protocol-specific constants, packet
//! definitions, and enumerations for communicating with `AirPods` devices
//! over the Apple Accessory Protocol (AAP).

use std::{fmt, str::FromStr, sync::LazyLock};

use serde::{Deserialize, Serialize};

use crate::bluetooth::l2cap::Packet;

pub const PKT_HANDSHAKE: &[u8] = &[
   0x00, 0x00, 0x04, 0x00, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];
pub const PKT_SET_FEATURES: &[u8] = &[
   0x04, 0x00, 0x04, 0x00, 0x4d, 0x00, 0xff, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];
pub const PKT_REQUEST_NOTIFY: &[u8] = &[
   0x04, 0x00, 0x04, 0x00, 0x0f, 0x00, 0xff, 0xff, 0xff, 0xff, 0xff,
];

/// Envelope of every data packet.
pub const HDR_DATA: &[u8] = b"\x04\x00\x04\x00";
/// Envelope of the handshake acknowledgement.
pub const HDR_ACK_HANDSHAKE: &[u8] = b"\x01\x00\x04\x00";

// Opcodes following `HDR_DATA`, little-endian u16 on the wire.
pub const OP_BATTERY_STATE: u16 = 0x0004;
pub const OP_EAR_DETECTION: u16 = 0x0006;
pub const OP_CONTROL: u16 = 0x0009;
pub const OP_METADATA: u16 = 0x001d;
pub const OP_ACK_FEATURES: u16 = 0x002b;

// Prefixes used for hooks and logging
pub const HDR_BATTERY_STATE: &[u8] = b"\x04\x00\x04\x00\x04\x00";
pub const HDR_EAR_DETECTION: &[u8] = b"\x04\x00\x04\x00\x06\x00";
pub const HDR_CMD_CTL: &[u8] = b"\x04\x00\x04\x00\x09\x00";
pub const HDR_METADATA: &[u8] = b"\x04\x00\x04\x00\x1d\x00";
pub const HDR_ACK_FEATURES: &[u8] = b"\x04\x00\x04\x00\x2b";

/// Length of a control packet: header, opcode, setting id and a u32 value.
pub const CONTROL_PACKET_LEN: usize = HDR_CMD_CTL.len() + 1 + 4;

/// Battery-bearing components of an accessory.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
)]
pub enum Component {
   Headphone = 0x01,
   Right = 0x02,
   Left = 0x04,
   Case = 0x08,
}

/// Battery status byte of a component.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
)]
#[repr(u8)]
pub enum BatteryStatus {
   Normal = 0x00,
   Charging = 0x01,
   Discharging = 0x02,
   Disconnected = 0x04,
}

/// Noise control modes supported by `AirPods`.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[strum(ascii_case_insensitive)]
#[repr(u32)]
pub enum NoiseControlMode {
   #[strum(to_string = "off")]
   Off = 0x01,
   #[strum(to_string = "anc", serialize = "nc")]
   Anc = 0x02,
   #[strum(to_string = "transparency", serialize = "trans")]
   Transparency = 0x03,
   #[strum(to_string = "adaptive", serialize = "adapt")]
   Adaptive = 0x04,
}

impl NoiseControlMode {
   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// Broad shape of an accessory, which decides its battery layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelFamily {
   /// Left and right buds with a charging case.
   DualEarbud,
   /// A single over-ear headphone.
   SingleHeadphone,
}

/// Feature flags an accessory model is known to support.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
   pub ear_detection: bool,
   pub noise_control: bool,
   pub spatial_audio: bool,
}

/// Known accessory models.
#[derive(
   Debug,
   Clone,
   Copy,
   Default,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
pub enum Model {
   #[strum(to_string = "airpods_1")]
   AirPods1,
   #[strum(to_string = "airpods_2")]
   AirPods2,
   #[strum(to_string = "airpods_3")]
   AirPods3,
   #[strum(to_string = "airpods_pro")]
   AirPodsPro,
   #[strum(to_string = "airpods_pro_2")]
   AirPodsPro2,
   #[strum(to_string = "airpods_pro_2_usbc")]
   AirPodsPro2UsbC,
   #[strum(to_string = "airpods_max")]
   AirPodsMax,
   #[strum(to_string = "airpods_max_usbc")]
   AirPodsMaxUsbC,
   #[strum(to_string = "powerbeats_pro")]
   PowerbeatsPro,
   #[strum(to_string = "beats_fit_pro")]
   BeatsFitPro,
   #[strum(to_string = "beats_studio_buds")]
   BeatsStudioBuds,
   #[strum(to_string = "beats_solo_pro")]
   BeatsSoloPro,
   #[default]
   #[strum(to_string = "unknown")]
   Unknown,
}

/// (model, product id, model numbers)
const MODEL_TABLE: &[(Model, u16, &[&str])] = &[
   (Model::AirPods1, 0x2002, &["A1523", "A1722"]),
   (Model::AirPods2, 0x200F, &["A2031", "A2032"]),
   (Model::AirPods3, 0x2013, &["A2564", "A2565"]),
   (Model::AirPodsPro, 0x200E, &["A2083", "A2084"]),
   (Model::AirPodsPro2, 0x2014, &["A2698", "A2699", "A2931"]),
   (Model::AirPodsPro2UsbC, 0x2024, &["A3047", "A3048", "A3049"]),
   (Model::AirPodsMax, 0x200A, &["A2096"]),
   (Model::AirPodsMaxUsbC, 0x201F, &["A3184"]),
   (Model::PowerbeatsPro, 0x200B, &["A2047", "A2048", "A2453", "A2454"]),
   (Model::BeatsFitPro, 0x2012, &["A2576", "A2577", "A2578"]),
   (Model::BeatsStudioBuds, 0x2011, &["A2512", "A2513", "A2514"]),
   (Model::BeatsSoloPro, 0x200C, &["A1881"]),
];

impl Model {
   /// Looks a model up by its Bluetooth product id.
   pub fn from_product_id(pid: u32) -> Self {
      MODEL_TABLE
         .iter()
         .find(|(_, id, _)| u32::from(*id) == pid)
         .map_or(Self::Unknown, |(model, ..)| *model)
   }

   /// Looks a model up by the model number reported in the metadata packet.
   pub fn from_model_number(number: &str) -> Self {
      MODEL_TABLE
         .iter()
         .find(|(_, _, numbers)| numbers.iter().any(|n| n.eq_ignore_ascii_case(number)))
         .map_or(Self::Unknown, |(model, ..)| *model)
   }

   pub const fn is_known(self) -> bool {
      !matches!(self, Self::Unknown)
   }

   pub const fn family(self) -> Option<ModelFamily> {
      match self {
         Self::AirPodsMax | Self::AirPodsMaxUsbC | Self::BeatsSoloPro => {
            Some(ModelFamily::SingleHeadphone)
         },
         Self::Unknown => None,
         _ => Some(ModelFamily::DualEarbud),
      }
   }

   pub const fn capabilities(self) -> Capabilities {
      match self {
         Self::AirPods1 | Self::AirPods2 => Capabilities {
            ear_detection: true,
            noise_control: false,
            spatial_audio: false,
         },
         Self::AirPods3 => Capabilities {
            ear_detection: true,
            noise_control: false,
            spatial_audio: true,
         },
         Self::AirPodsPro
         | Self::AirPodsPro2
         | Self::AirPodsPro2UsbC
         | Self::AirPodsMax
         | Self::AirPodsMaxUsbC
         | Self::BeatsFitPro => Capabilities {
            ear_detection: true,
            noise_control: true,
            spatial_audio: true,
         },
         Self::PowerbeatsPro => Capabilities {
            ear_detection: true,
            noise_control: false,
            spatial_audio: false,
         },
         Self::BeatsStudioBuds | Self::BeatsSoloPro => Capabilities {
            ear_detection: false,
            noise_control: true,
            spatial_audio: false,
         },
         Self::Unknown => Capabilities {
            ear_detection: false,
            noise_control: false,
            spatial_audio: false,
         },
      }
   }

   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// Known setting ids, sorted by id.
pub const KNOWN_FEATURES: &[(u8, &str)] = &[
   (FeatureId::NOISE_CONTROL.id(), "noise_control"),
   (FeatureId::ONE_BUD_ANC.id(), "one_bud_anc"),
   (FeatureId::VOLUME_INTERVAL.id(), "volume_interval"),
   (FeatureId::VOLUME_SWIPE.id(), "volume_swipe"),
   (FeatureId::ADAPTIVE_VOLUME.id(), "adaptive_volume"),
   (FeatureId::CONVERSATIONAL.id(), "conversational"),
   (FeatureId::HEARING_ASSIST.id(), "hearing_assist"),
   (FeatureId::ALLOW_OFF.id(), "allow_off"),
];

/// Identifier of a control setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct FeatureId(u8);

impl FromStr for FeatureId {
   type Err = strum::ParseError;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      for (repr, name) in KNOWN_FEATURES {
         if name.eq_ignore_ascii_case(s) {
            return Ok(Self(*repr));
         }
      }
      let hex = s
         .strip_prefix("0x")
         .or_else(|| s.strip_prefix("0X"))
         .unwrap_or(s);
      if hex.len() == 2 {
         return u8::from_str_radix(hex, 16)
            .map(Self)
            .map_err(|_| strum::ParseError::VariantNotFound);
      }
      Err(strum::ParseError::VariantNotFound)
   }
}

static U8_TO_HEX: LazyLock<[[u8; 2]; 256]> = LazyLock::new(|| {
   let mut featids = [[0u8; 2]; 256];
   for i in 0..=255u8 {
      const fn nibble_to_hex(n: u8) -> u8 {
         if n < 10 { n + b'0' } else { n - 10 + b'a' }
      }
      featids[i as usize] = [nibble_to_hex(i >> 4), nibble_to_hex(i & 0x0f)];
   }
   featids
});

impl FeatureId {
   pub const NOISE_CONTROL: Self = Self(0x0D);
   pub const ONE_BUD_ANC: Self = Self(0x1B);
   pub const VOLUME_INTERVAL: Self = Self(0x23);
   pub const VOLUME_SWIPE: Self = Self(0x25);
   pub const ADAPTIVE_VOLUME: Self = Self(0x26);
   pub const CONVERSATIONAL: Self = Self(0x28);
   pub const HEARING_ASSIST: Self = Self(0x33);
   pub const ALLOW_OFF: Self = Self(0x34);

   pub const fn from_id(repr: u8) -> Self {
      Self(repr)
   }

   pub const fn id(self) -> u8 {
      self.0
   }

   pub fn try_to_str(self) -> Option<&'static str> {
      let Ok(i) = KNOWN_FEATURES.binary_search_by_key(&self.0, |(repr, _)| *repr) else {
         return None;
      };
      let (_, name) = KNOWN_FEATURES[i];
      Some(name)
   }

   pub fn to_str(self) -> &'static str {
      if let Some(name) = self.try_to_str() {
         name
      } else {
         let bytes = &U8_TO_HEX[self.0 as usize];
         str::from_utf8(bytes).unwrap_or("??")
      }
   }
}

impl fmt::Display for FeatureId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.to_str())
   }
}

/// Key pairing a sent command with the echo that acknowledges it.
///
/// Control commands are acknowledged by the accessory echoing the control
/// packet, so the key is the setting id together with the value written.
/// An echo carrying a different value is a state report, not an ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId {
   setting: FeatureId,
   value: u32,
}

impl CorrelationId {
   pub const fn control(setting: FeatureId, value: u32) -> Self {
      Self { setting, value }
   }
}

impl fmt::Display for CorrelationId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "ctl:{}={}", self.setting, self.value)
   }
}

/// Builds a control packet for sending commands to `AirPods`.
pub fn build_control_packet(cmd: u8, data: [u8; 4]) -> Packet {
   HDR_CMD_CTL
      .iter()
      .copied()
      .chain([cmd])
      .chain(data.iter().copied())
      .collect()
}

/// Operation carried in the value of a feature toggle packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FeatureCmd {
   Query = 0,
   Enable = 1,
   Disable = 2,
}

impl FeatureCmd {
   pub fn build(self, feature: FeatureId) -> Packet {
      let data = self as u32;
      build_control_packet(feature.id(), data.to_le_bytes())
   }

   pub const fn toggle(enabled: bool) -> Self {
      if enabled {
         Self::Enable
      } else {
         Self::Disable
      }
   }

   pub const fn from_value(value: u32) -> Option<Self> {
      match value {
         0 => Some(Self::Query),
         1 => Some(Self::Enable),
         2 => Some(Self::Disable),
         _ => None,
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_known_features_sorted() {
      assert!(KNOWN_FEATURES.windows(2).all(|w| w[0].0 < w[1].0));
      for (id, name) in KNOWN_FEATURES {
         assert_eq!(FeatureId::from_id(*id).to_str(), *name);
      }
   }

   #[test]
   fn test_feature_from_str() {
      assert_eq!(
         "Conversational".parse::<FeatureId>().ok(),
         Some(FeatureId::CONVERSATIONAL)
      );
      assert_eq!("0x1b".parse::<FeatureId>().ok(), Some(FeatureId::ONE_BUD_ANC));
      assert_eq!("7f".parse::<FeatureId>().ok(), Some(FeatureId::from_id(0x7f)));
      assert!("bogus".parse::<FeatureId>().is_err());
      assert_eq!(FeatureId::from_id(0x7f).to_str(), "7f");
   }

   #[test]
   fn test_noise_mode_names() {
      assert_eq!("anc".parse::<NoiseControlMode>().ok(), Some(NoiseControlMode::Anc));
      assert_eq!("nc".parse::<NoiseControlMode>().ok(), Some(NoiseControlMode::Anc));
      assert_eq!(
         "Transparency".parse::<NoiseControlMode>().ok(),
         Some(NoiseControlMode::Transparency)
      );
      assert_eq!(
         "adapt".parse::<NoiseControlMode>().ok(),
         Some(NoiseControlMode::Adaptive)
      );
      assert_eq!(NoiseControlMode::Anc.to_str(), "anc");
      assert_eq!(NoiseControlMode::Transparency.to_str(), "transparency");
   }

   #[test]
   fn test_model_lookup() {
      assert_eq!(Model::from_product_id(0x2014), Model::AirPodsPro2);
      assert_eq!(Model::from_product_id(0x1234), Model::Unknown);
      assert_eq!(Model::from_model_number("a2084"), Model::AirPodsPro);
      assert_eq!(
         Model::AirPodsMax.family(),
         Some(ModelFamily::SingleHeadphone)
      );
      assert_eq!(Model::AirPods2.family(), Some(ModelFamily::DualEarbud));
      assert_eq!(Model::Unknown.family(), None);
      assert!(!Model::AirPods2.capabilities().noise_control);
   }

   #[test]
   fn test_build_feature_packet() {
      let packet = FeatureCmd::Enable.build(FeatureId::CONVERSATIONAL);
      assert_eq!(
         packet.as_slice(),
         &[0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0x28, 0x01, 0x00, 0x00, 0x00]
      );
      assert_eq!(packet.len(), CONTROL_PACKET_LEN);
   }
}
