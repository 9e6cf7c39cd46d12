//! AAP frame codec.
//!
//! `decode` validates the envelope of one L2CAP packet and turns it into a
//! [`Frame`]; `encode` turns a [`CommandIntent`] into the packet to send.
//! Both are pure: state is only changed by whoever applies the result.

use log::warn;

use crate::{
   airpods::{
      device::DeviceStatusUpdate,
      parser::{self, ProtoError},
      protocol::{
         CorrelationId, FeatureCmd, FeatureId, HDR_ACK_HANDSHAKE, HDR_DATA, NoiseControlMode,
         OP_ACK_FEATURES, OP_BATTERY_STATE, OP_CONTROL, OP_EAR_DETECTION, OP_METADATA,
         build_control_packet,
      },
   },
   bluetooth::l2cap::Packet,
};

/// A decoded AAP packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
   HandshakeAck,
   FeaturesAck,
   Status(DeviceStatusUpdate),
   /// Echo of a control setting. It acknowledges a command for `setting`
   /// and carries the resulting state.
   Control {
      setting: FeatureId,
      value: u32,
      update: DeviceStatusUpdate,
   },
   Unknown {
      opcode: u16,
   },
}

impl Frame {
   /// Correlation id this frame acknowledges, if any.
   pub const fn correlation(&self) -> Option<CorrelationId> {
      match self {
         Self::Control { setting, value, .. } => {
            Some(CorrelationId::control(*setting, *value))
         },
         _ => None,
      }
   }

   /// State carried by this frame, if any.
   pub fn update(&self) -> Option<&DeviceStatusUpdate> {
      match self {
         Self::Status(update) | Self::Control { update, .. } => Some(update),
         _ => None,
      }
   }
}

/// Decodes one packet.
pub fn decode(data: &[u8]) -> Result<Frame, ProtoError> {
   if data.starts_with(HDR_ACK_HANDSHAKE) {
      return Ok(Frame::HandshakeAck);
   }
   let Some(rest) = data.strip_prefix(HDR_DATA) else {
      return Err(ProtoError::BadHeader);
   };
   let [lo, hi, ..] = *rest else {
      return Err(ProtoError::PacketTooShort {
         expected: HDR_DATA.len() + 2,
         actual: data.len(),
      });
   };

   let frame = match u16::from_le_bytes([lo, hi]) {
      OP_BATTERY_STATE => Frame::Status(DeviceStatusUpdate {
         battery: Some(parser::parse_battery_status(data)?),
         ..Default::default()
      }),
      OP_EAR_DETECTION => Frame::Status(DeviceStatusUpdate {
         ear_detection: Some(parser::parse_ear_detection(data)?),
         ..Default::default()
      }),
      OP_METADATA => {
         let metadata = parser::parse_metadata(data)?;
         Frame::Status(DeviceStatusUpdate {
            name: metadata.name,
            model: metadata.model,
            ..Default::default()
         })
      },
      OP_CONTROL => {
         let (setting, value) = parser::parse_control(data)?;
         Frame::Control {
            setting,
            value,
            update: control_update(setting, value),
         }
      },
      OP_ACK_FEATURES => Frame::FeaturesAck,
      opcode => Frame::Unknown { opcode },
   };
   Ok(frame)
}

fn control_update(setting: FeatureId, value: u32) -> DeviceStatusUpdate {
   let mut update = DeviceStatusUpdate::default();
   if setting == FeatureId::NOISE_CONTROL {
      update.noise_mode = NoiseControlMode::from_repr(value);
      if update.noise_mode.is_none() {
         warn!("Unknown noise control mode 0x{value:02x}");
      }
   } else {
      match FeatureCmd::from_value(value) {
         Some(FeatureCmd::Enable) => update.features.push((setting, true)),
         Some(FeatureCmd::Disable) => update.features.push((setting, false)),
         Some(FeatureCmd::Query) | None => {},
      }
   }
   update
}

/// A high-level request for the accessory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandIntent {
   SetNoiseMode(NoiseControlMode),
   SetFeature { feature: FeatureId, enabled: bool },
   /// Opaque packet for functions without a dedicated command.
   Raw(Packet),
}

impl CommandIntent {
   pub const fn action(&self) -> &'static str {
      match self {
         Self::SetNoiseMode(_) => "set_noise_mode",
         Self::SetFeature { .. } => "set_feature",
         Self::Raw(_) => "passthrough",
      }
   }

   /// Correlation id of the echo that acknowledges this command.
   ///
   /// Raw packets have no known echo and complete once written.
   pub const fn correlation(&self) -> Option<CorrelationId> {
      match self {
         Self::SetNoiseMode(mode) => {
            Some(CorrelationId::control(FeatureId::NOISE_CONTROL, *mode as u32))
         },
         Self::SetFeature { feature, enabled } => Some(CorrelationId::control(
            *feature,
            FeatureCmd::toggle(*enabled) as u32,
         )),
         Self::Raw(_) => None,
      }
   }
}

/// Encodes a command into the packet to write.
pub fn encode(intent: &CommandIntent) -> Packet {
   match intent {
      CommandIntent::SetNoiseMode(mode) => {
         build_control_packet(FeatureId::NOISE_CONTROL.id(), (*mode as u32).to_le_bytes())
      },
      CommandIntent::SetFeature { feature, enabled } => {
         FeatureCmd::toggle(*enabled).build(*feature)
      },
      CommandIntent::Raw(packet) => packet.clone(),
   }
}
