use std::{collections::HashMap, str::FromStr};

use bluer::Address;
use log::info;
use zbus::{fdo, interface, object_server::SignalEmitter, zvariant};

use crate::{
   airpods::{
      codec::CommandIntent,
      protocol::{FeatureId, NoiseControlMode},
   },
   bluetooth::{l2cap::Packet, manager::BluetoothManager},
   error::{AirPodsError, Result},
};

pub struct AirPodsService {
   bluetooth_manager: BluetoothManager,
}

impl AirPodsService {
   pub const fn new(bluetooth_manager: BluetoothManager) -> Self {
      Self { bluetooth_manager }
   }
}

fn parse_address(address: &str) -> fdo::Result<Address> {
   Address::from_str(address).map_err(|e| fdo::Error::InvalidArgs(e.to_string()))
}

fn to_fdo(err: AirPodsError) -> fdo::Error {
   match err {
      AirPodsError::InvalidCommand(msg) => fdo::Error::InvalidArgs(msg),
      err => fdo::Error::Failed(err.to_string()),
   }
}

type Params<'a> = HashMap<String, zvariant::Value<'a>>;

fn param<'p>(params: &'p Params<'_>, key: &str) -> Result<&'p zvariant::Value<'p>> {
   params
      .get(key)
      .ok_or_else(|| AirPodsError::InvalidCommand(format!("Missing '{key}' parameter")))
}

fn string_param(params: &Params<'_>, key: &str) -> Result<String> {
   param(params, key)?
      .downcast_ref::<String>()
      .map_err(|e| AirPodsError::InvalidCommand(format!("Invalid '{key}' parameter: {e}")))
}

fn bool_param(params: &Params<'_>, key: &str) -> Result<bool> {
   param(params, key)?
      .downcast_ref::<bool>()
      .map_err(|e| AirPodsError::InvalidCommand(format!("Invalid '{key}' parameter: {e}")))
}

fn parse_packet(hex_packet: &str) -> Result<Packet> {
   let bytes = hex::decode(hex_packet.trim())
      .map_err(|e| AirPodsError::InvalidCommand(format!("Invalid packet: {e}")))?;
   if bytes.is_empty() {
      return Err(AirPodsError::InvalidCommand("Empty packet".into()));
   }
   Ok(Packet::from_vec(bytes))
}

/// Turns a `SendCommand` action and its parameters into a command.
fn parse_command(action: &str, params: &Params<'_>) -> Result<CommandIntent> {
   match action {
      "set_noise_mode" => {
         let value = string_param(params, "value")?;
         let mode = NoiseControlMode::from_str(&value)
            .map_err(|_| AirPodsError::InvalidCommand(format!("Invalid noise mode: {value}")))?;
         Ok(CommandIntent::SetNoiseMode(mode))
      },
      "set_feature" => {
         let name = string_param(params, "feature")?;
         let enabled = bool_param(params, "enabled")?;
         let feature = FeatureId::from_str(&name)
            .map_err(|_| AirPodsError::InvalidCommand(format!("Unknown feature: {name}")))?;
         Ok(CommandIntent::SetFeature { feature, enabled })
      },
      "passthrough" => {
         let packet = string_param(params, "packet")?;
         Ok(CommandIntent::Raw(parse_packet(&packet)?))
      },
      _ => Err(AirPodsError::InvalidCommand(format!("Unknown action: {action}"))),
   }
}

#[interface(name = "org.kde.plasma.airpods")]
impl AirPodsService {
   async fn get_devices(&self) -> String {
      let devices = self
         .bluetooth_manager
         .all_devices()
         .iter()
         .map(|d| d.to_json())
         .collect();
      serde_json::Value::Array(devices).to_string()
   }

   async fn get_device(&self, address: String) -> fdo::Result<String> {
      let addr = parse_address(&address)?;
      let dev = self.bluetooth_manager.get_device(addr).map_err(to_fdo)?;
      Ok(dev.to_json().to_string())
   }

   async fn passthrough(&self, address: String, packet: String) -> fdo::Result<bool> {
      let addr = parse_address(&address)?;
      let packet = parse_packet(&packet).map_err(to_fdo)?;
      self
         .bluetooth_manager
         .send_command(addr, CommandIntent::Raw(packet))
         .await
         .map_err(to_fdo)?;
      Ok(true)
   }

   async fn send_command(
      &self,
      address: String,
      action: String,
      params: Params<'_>,
   ) -> fdo::Result<bool> {
      let addr = parse_address(&address)?;
      let intent = parse_command(&action, &params).map_err(to_fdo)?;
      let ack = self
         .bluetooth_manager
         .send_command(addr, intent)
         .await
         .map_err(to_fdo)?;
      info!("{address}: {action} acknowledged after {} attempt(s)", ack.attempts);
      Ok(true)
   }

   async fn connect_device(&self, address: String) -> fdo::Result<bool> {
      let addr = parse_address(&address)?;
      self
         .bluetooth_manager
         .connect_device(addr)
         .await
         .map_err(to_fdo)?;
      Ok(true)
   }

   async fn disconnect_device(&self, address: String) -> fdo::Result<bool> {
      let addr = parse_address(&address)?;
      self
         .bluetooth_manager
         .disconnect_device(addr)
         .await
         .map_err(to_fdo)?;
      Ok(true)
   }

   // Signals
   #[zbus(signal)]
   pub async fn device_connected(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_disconnected(emitter: &SignalEmitter<'_>, address: &str)
   -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn battery_updated(
      emitter: &SignalEmitter<'_>,
      address: &str,
      battery: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn noise_control_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      mode: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn ear_detection_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      ear_detection: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_name_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      name: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_error(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   #[zbus(property)]
   async fn devices(&self) -> String {
      self.get_devices().await
   }

   #[zbus(property)]
   async fn connected_count(&self) -> u32 {
      self.bluetooth_manager.connected_count()
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn params<const N: usize>(entries: [(&str, zvariant::Value<'static>); N]) -> Params<'static> {
      entries
         .into_iter()
         .map(|(k, v)| (k.to_string(), v))
         .collect()
   }

   #[test]
   fn test_noise_mode_aliases() {
      for (value, mode) in [
         ("anc", NoiseControlMode::Anc),
         ("nc", NoiseControlMode::Anc),
         ("Transparency", NoiseControlMode::Transparency),
         ("trans", NoiseControlMode::Transparency),
         ("adapt", NoiseControlMode::Adaptive),
         ("off", NoiseControlMode::Off),
      ] {
         let intent = parse_command("set_noise_mode", &params([("value", value.into())]))
            .expect("valid mode");
         assert_eq!(intent, CommandIntent::SetNoiseMode(mode), "{value}");
      }
      assert!(matches!(
         parse_command("set_noise_mode", &params([("value", "loud".into())])),
         Err(AirPodsError::InvalidCommand(_))
      ));
      assert!(matches!(
         parse_command("set_noise_mode", &params([])),
         Err(AirPodsError::InvalidCommand(_))
      ));
   }

   #[test]
   fn test_set_feature_by_name_or_id() {
      let by_name = parse_command(
         "set_feature",
         &params([("feature", "conversational".into()), ("enabled", true.into())]),
      )
      .expect("known feature");
      let by_id = parse_command(
         "set_feature",
         &params([("feature", "0x28".into()), ("enabled", true.into())]),
      )
      .expect("hex id");
      assert_eq!(by_name, by_id);
      assert_eq!(by_name, CommandIntent::SetFeature {
         feature: FeatureId::CONVERSATIONAL,
         enabled: true,
      });

      // `enabled` must be a boolean
      assert!(matches!(
         parse_command(
            "set_feature",
            &params([("feature", "conversational".into()), ("enabled", "yes".into())]),
         ),
         Err(AirPodsError::InvalidCommand(_))
      ));
   }

   #[test]
   fn test_passthrough_packet() {
      let intent = parse_command("passthrough", &params([("packet", "04000400090033".into())]))
         .expect("hex packet");
      assert_eq!(
         intent,
         CommandIntent::Raw(Packet::from_slice(&[0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0x33]))
      );
      assert!(parse_packet("zz").is_err());
      assert!(parse_packet("").is_err());
   }

   #[test]
   fn test_unknown_action() {
      assert!(matches!(
         parse_command("self_destruct", &params([])),
         Err(AirPodsError::InvalidCommand(_))
      ));
   }

   #[test]
   fn test_error_mapping() {
      assert!(matches!(
         to_fdo(AirPodsError::InvalidCommand("bad".into())),
         fdo::Error::InvalidArgs(_)
      ));
      assert!(matches!(to_fdo(AirPodsError::DeviceNotConnected), fdo::Error::Failed(_)));
   }
}
