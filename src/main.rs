//! `AirPods` D-Bus Service
//!
//! This service keeps a live model of nearby `AirPods` over the accessory
//! protocol and publishes it on D-Bus, including battery monitoring, noise
//! control, and feature management.

use std::sync::Arc;

use log::{info, warn};
use tokio::signal;
use zbus::{Connection, connection, object_server::InterfaceRef};

use bluetooth::{discovery, l2cap::L2CapConnector, manager::BluetoothManager};
use dbus::AirPodsService;
use event::{AirPodsEvent, Notifier, Subscription};

mod airpods;
mod bluetooth;
mod config;
mod dbus;
mod error;
mod event;
mod ringbuf;

use crate::{dbus::AirPodsServiceSignals, error::Result};

const OBJECT_PATH: &str = "/org/kairpods/manager";

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting AirPods D-Bus service...");

   let mut config = config::Config::load()?;
   config.validate();
   info!(
      "Loaded configuration with {} known devices",
      config.known_devices.len()
   );

   let notifier = Arc::new(Notifier::new(config.event_buffer));
   let signals = notifier.subscribe();

   let bluetooth_manager =
      BluetoothManager::new(&config, Arc::new(L2CapConnector::default()), notifier);
   let service = AirPodsService::new(bluetooth_manager.clone());

   let connection = connection::Builder::session()?
      .name("org.kairpods")?
      .serve_at(OBJECT_PATH, service)?
      .build()
      .await?;
   info!("AirPods D-Bus service started at org.kairpods");

   spawn_signal_forwarder(&connection, signals).await?;
   let _discovery = discovery::spawn(bluetooth_manager, config).await?;

   signal::ctrl_c().await?;
   info!("Shutting down AirPods service...");

   Ok(())
}

async fn forward(
   iface: &InterfaceRef<AirPodsService>,
   address: &str,
   event: AirPodsEvent,
) -> zbus::Result<()> {
   match event {
      AirPodsEvent::DeviceConnected => iface.device_connected(address).await,
      AirPodsEvent::DeviceDisconnected => iface.device_disconnected(address).await,
      AirPodsEvent::BatteryUpdated(battery) => {
         iface
            .battery_updated(address, &battery.to_json().to_string())
            .await
      },
      AirPodsEvent::NoiseControlChanged(mode) => {
         iface.noise_control_changed(address, mode.to_str()).await
      },
      AirPodsEvent::EarDetectionChanged(ear_detection) => {
         iface
            .ear_detection_changed(address, &ear_detection.to_json().to_string())
            .await
      },
      AirPodsEvent::DeviceNameChanged(name) => iface.device_name_changed(address, &name).await,
      AirPodsEvent::DeviceError => iface.device_error(address).await,
   }
}

/// Republishes registry events as D-Bus signals.
async fn spawn_signal_forwarder(connection: &Connection, events: Subscription) -> Result<()> {
   let iface = connection
      .object_server()
      .interface::<_, AirPodsService>(OBJECT_PATH)
      .await?;
   tokio::spawn(async move {
      let mut reported = 0;
      loop {
         let (address, event) = events.recv().await;
         if let Err(e) = forward(&iface, &address.to_string(), event).await {
            warn!("Error dispatching event: {e}");
         }
         let dropped = events.dropped();
         if dropped > reported {
            warn!("Signal forwarder fell behind, {} events lost", dropped - reported);
            reported = dropped;
         }
      }
   });
   Ok(())
}
