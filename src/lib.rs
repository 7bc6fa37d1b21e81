// MIT License - Copyright (c) 2026 Peter Wright
// RS485 bus engine for Samsung SDS wallpads
//
//! # sds-wallpad
//!
//! Talks to a Samsung SDS wallpad over its RS485 bus, either through a
//! serial adapter or an RS485-to-Ethernet bridge.
//!
//! The engine decodes state frames from lights, plugs, thermostats, the
//! ventilation fan, the gas valve and the energy meters, slips commands
//! into the wallpad's polling slots, and can impersonate the entrance
//! switch and the intercom so that elevator calls, gas cutoff and door
//! release become remotely controllable.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use sds_wallpad::{BusConfig, BusEngine, EntranceMode, TcpTransport};
//! use sds_wallpad::event::{command_channel, event_channel};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BusConfig::builder()
//!         .prefix("sds")
//!         .entrance_mode(EntranceMode::Full)
//!         .allow_aggressive(false)
//!         .build();
//!
//!     let (event_tx, mut events) = event_channel();
//!     let (command_tx, commands) = command_channel();
//!     tokio::spawn(async move {
//!         while let Some(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let mut transport = TcpTransport::connect("192.168.0.50", 8899, Duration::from_secs(10)).await?;
//!     let mut engine = BusEngine::new(config, event_tx, commands);
//!
//!     command_tx.send(sds_wallpad::parse_inbound("sds", "sds/virtual/entrance/ev/command", "ON")?
//!         .expect("trigger command"))?;
//!     engine.run(&mut transport).await?;
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod command;
pub mod config;
pub mod constants;
pub mod devices;
pub mod discovery;
pub mod dump;
pub mod emulator;
pub mod error;
pub mod event;
pub mod protocol;
pub mod queue;
pub mod transport;

// Re-exports for convenience
pub use bus::BusEngine;
pub use command::{parse_inbound, BusCommand};
pub use config::{BusConfig, BusConfigBuilder, EntranceMode, IntercomMode};
pub use devices::virtual_device::VirtualKind;
pub use devices::DeviceKind;
pub use error::{Result, WallpadError};
pub use event::{BusEvent, EventReceiver};
pub use transport::{BusTransport, SerialSettings, SerialTransport, StreamTransport, TcpTransport};
