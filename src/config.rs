//! Configuration management for the `AirPods` service.
//!
//! This module handles loading and saving configuration from disk,
//! including known devices and connection parameters.

use std::{
   env, fs,
   path::{Path, PathBuf},
   str::FromStr,
   time::Duration,
};

use bluer::Address;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::{
   bluetooth::connection::LinkPolicy,
   error::{AirPodsError, Result},
};

/// Upper bound for every configured delay or timeout, in seconds.
const MAX_DELAY_SEC: u64 = 24 * 60 * 60;

/// Upper bound for the battery history window, in minutes.
const MAX_BATTERY_HORIZON_MIN: u64 = 7 * 24 * 60;

/// Main configuration structure for the service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
   #[serde(default)]
   pub known_devices: Vec<KnownDevice>,

   #[serde(default = "default_retry_count")]
   pub connection_retry_count: u32,

   #[serde(default = "default_reconnect_delay")]
   pub reconnect_delay_ms: u64,

   #[serde(default = "default_max_reconnect_delay")]
   pub max_reconnect_delay_sec: u64,

   #[serde(default = "default_handshake_timeout")]
   pub handshake_timeout_ms: u64,

   #[serde(default = "default_command_timeout")]
   pub command_timeout_ms: u64,

   #[serde(default = "default_command_retries")]
   pub command_retries: u32,

   #[serde(default = "default_keepalive_interval")]
   pub keepalive_interval_sec: u64,

   #[serde(default = "default_keepalive_timeout")]
   pub keepalive_timeout_sec: u64,

   /// Events buffered per subscriber before the oldest is dropped
   #[serde(default = "default_event_buffer")]
   pub event_buffer: usize,

   /// Window of battery history used for time-to-empty estimates
   #[serde(default = "default_battery_horizon")]
   pub battery_horizon_min: u64,
}

/// Represents a known `AirPods` device.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct KnownDevice {
   pub address: String,
   pub name: String,
}

const fn default_retry_count() -> u32 {
   10
}

const fn default_reconnect_delay() -> u64 {
   2000
}

const fn default_max_reconnect_delay() -> u64 {
   120
}

const fn default_handshake_timeout() -> u64 {
   5000
}

const fn default_command_timeout() -> u64 {
   3000
}

const fn default_command_retries() -> u32 {
   2
}

const fn default_keepalive_interval() -> u64 {
   30
}

const fn default_keepalive_timeout() -> u64 {
   95
}

const fn default_event_buffer() -> usize {
   256
}

const fn default_battery_horizon() -> u64 {
   120
}

impl Default for Config {
   fn default() -> Self {
      Self {
         known_devices: vec![],
         connection_retry_count: default_retry_count(),
         reconnect_delay_ms: default_reconnect_delay(),
         max_reconnect_delay_sec: default_max_reconnect_delay(),
         handshake_timeout_ms: default_handshake_timeout(),
         command_timeout_ms: default_command_timeout(),
         command_retries: default_command_retries(),
         keepalive_interval_sec: default_keepalive_interval(),
         keepalive_timeout_sec: default_keepalive_timeout(),
         event_buffer: default_event_buffer(),
         battery_horizon_min: default_battery_horizon(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         // Create default config
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save_to(&self, path: &Path) -> Result<()> {
      // Ensure directory exists
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(airpods_home) = env::var("AIRPODS_HOME") {
         PathBuf::from(airpods_home)
      } else {
         dirs::config_dir().ok_or(AirPodsError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("airpods-service").join("config.toml"))
   }

   /// Returns the configured name if the address is a known device.
   pub fn known_device(&self, address: Address) -> Option<&str> {
      self
         .known_devices
         .iter()
         .find(|d| Address::from_str(&d.address).is_ok_and(|a| a == address))
         .map(|d| d.name.as_str())
   }

   /// Drops known devices whose address does not parse.
   pub fn validate(&mut self) {
      self.known_devices.retain(|d| {
         let valid = Address::from_str(&d.address).is_ok();
         if !valid {
            warn!("Ignoring known device {} with invalid address {}", d.name, d.address);
         }
         valid
      });

      let max_delay_ms = MAX_DELAY_SEC * 1000;
      clamp("reconnect_delay_ms", &mut self.reconnect_delay_ms, max_delay_ms);
      clamp("max_reconnect_delay_sec", &mut self.max_reconnect_delay_sec, MAX_DELAY_SEC);
      clamp("handshake_timeout_ms", &mut self.handshake_timeout_ms, max_delay_ms);
      clamp("command_timeout_ms", &mut self.command_timeout_ms, max_delay_ms);
      clamp("keepalive_interval_sec", &mut self.keepalive_interval_sec, MAX_DELAY_SEC);
      clamp("keepalive_timeout_sec", &mut self.keepalive_timeout_sec, MAX_DELAY_SEC);
      clamp("battery_horizon_min", &mut self.battery_horizon_min, MAX_BATTERY_HORIZON_MIN);
   }

   pub fn link_policy(&self) -> LinkPolicy {
      LinkPolicy {
         retry_count: self.connection_retry_count,
         reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
         max_reconnect_delay: Duration::from_secs(self.max_reconnect_delay_sec),
         handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
         keepalive_interval: Duration::from_secs(self.keepalive_interval_sec),
         keepalive_timeout: Duration::from_secs(self.keepalive_timeout_sec),
         command_timeout: Duration::from_millis(self.command_timeout_ms),
         command_retries: self.command_retries,
      }
   }

   pub const fn battery_horizon(&self) -> Duration {
      Duration::from_secs(self.battery_horizon_min.saturating_mul(60))
   }
}

fn clamp(name: &str, value: &mut u64, max: u64) {
   if *value > max {
      warn!("{name} = {value} is too large, using {max}");
      *value = max;
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_missing_file_creates_defaults() {
      let dir = tempfile::tempdir().expect("tempdir");
      let path = dir.path().join("airpods-service").join("config.toml");
      let config = Config::load_from(&path).expect("load");
      assert_eq!(config, Config::default());
      assert!(path.exists());

      let reloaded = Config::load_from(&path).expect("reload");
      assert_eq!(reloaded, config);
   }

   #[test]
   fn test_partial_file_uses_defaults() {
      let dir = tempfile::tempdir().expect("tempdir");
      let path = dir.path().join("config.toml");
      fs::write(
         &path,
         r#"
command_retries = 5
keepalive_timeout_sec = 60

[[known_devices]]
address = "AA:BB:CC:DD:EE:FF"
name = "Studio AirPods"
"#,
      )
      .expect("write");

      let config = Config::load_from(&path).expect("load");
      assert_eq!(config.command_retries, 5);
      assert_eq!(config.connection_retry_count, 10);
      assert_eq!(
         config.known_device(Address::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF])),
         Some("Studio AirPods")
      );

      let policy = config.link_policy();
      assert_eq!(policy.keepalive_timeout, Duration::from_secs(60));
      assert_eq!(policy.reconnect_delay, Duration::from_secs(2));
      assert_eq!(policy.command_timeout, Duration::from_secs(3));
      assert_eq!(config.battery_horizon(), Duration::from_secs(7200));
   }

   #[test]
   fn test_invalid_file_is_an_error() {
      let dir = tempfile::tempdir().expect("tempdir");
      let path = dir.path().join("config.toml");
      fs::write(&path, "command_retries = \"many\"").expect("write");
      assert!(matches!(
         Config::load_from(&path),
         Err(AirPodsError::TomlParse(_))
      ));
   }

   #[test]
   fn test_validate_drops_bad_addresses() {
      let mut config = Config {
         known_devices: vec![
            KnownDevice {
               address: "not-an-address".into(),
               name: "Broken".into(),
            },
            KnownDevice {
               address: "11:22:33:44:55:66".into(),
               name: "Fine".into(),
            },
         ],
         ..Config::default()
      };
      config.validate();
      assert_eq!(config.known_devices.len(), 1);
      assert_eq!(config.known_devices[0].name, "Fine");
   }

   #[test]
   fn test_validate_clamps_huge_values() {
      let mut config = Config {
         reconnect_delay_ms: u64::MAX,
         max_reconnect_delay_sec: u64::MAX,
         keepalive_interval_sec: u64::MAX,
         keepalive_timeout_sec: u64::MAX,
         command_timeout_ms: u64::MAX,
         battery_horizon_min: u64::MAX,
         ..Config::default()
      };
      assert_eq!(config.battery_horizon(), Duration::from_secs(u64::MAX));

      config.validate();
      assert_eq!(config.keepalive_timeout_sec, MAX_DELAY_SEC);
      assert_eq!(config.battery_horizon(), Duration::from_secs(7 * 24 * 60 * 60));
      let policy = config.link_policy();
      assert_eq!(policy.keepalive_interval, Duration::from_secs(MAX_DELAY_SEC));
      assert_eq!(policy.command_timeout, Duration::from_secs(MAX_DELAY_SEC));
      assert!(policy.retry_delay(u32::MAX) < Duration::from_secs(MAX_DELAY_SEC + 1));

      // Defaults are untouched
      let mut defaults = Config::default();
      defaults.validate();
      assert_eq!(defaults, Config::default());
   }
}
