#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # wftnp 🚴
//!
//! A Rust library for controlling Wahoo KICKR smart trainers over the Wahoo
//! Fitness Trainer Network Protocol (WFTNP).
//!
//! Recent KICKR trainers expose their BLE GATT surface over plain TCP on the
//! local network ("Direct Connect"): each WFTNP frame tunnels one GATT
//! operation, so service discovery, characteristic reads and writes, and
//! notifications all work over a socket instead of a Bluetooth link. On top
//! of that tunnel the trainer speaks the standard FTMS (Fitness Machine
//! Service) profile.
//!
//! The library covers the full control surface:
//!
//! - **Framing**: incremental decoding with single-byte resynchronization, so
//!   a corrupt frame never poisons the stream
//! - **FTMS**: ERG power targets, grade simulation, wheel circumference, and
//!   Indoor Bike Data telemetry (speed, cadence, power, distance)
//! - **Liveness**: an idle window detects silently dead connections, and a
//!   supervisor reconnects with exponential backoff
//! - **Activity**: telemetry is classified Active/Sleeping so hosts can tell
//!   a rider coasting from a trainer left powered on overnight
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use wftnp::{
//!     ActivityState, TelemetryRecord, TrainerConfig, TrainerDevice, TrainerHandler, DEFAULT_PORT,
//! };
//!
//! struct PrintHandler;
//!
//! #[async_trait::async_trait]
//! impl TrainerHandler for PrintHandler {
//!     async fn on_telemetry(&self, record: TelemetryRecord, activity: ActivityState) {
//!         println!("{activity}: {:?} W", record.power_w);
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let trainer = TrainerDevice::connect(
//!         "192.168.1.40",
//!         DEFAULT_PORT,
//!         TrainerConfig::default(),
//!         Arc::new(PrintHandler),
//!     )
//!     .await?;
//!
//!     // Hold 200 W regardless of cadence
//!     trainer.set_erg_watts(200).await?;
//!
//!     // Or simulate a 4.5% climb
//!     trainer.set_grade(4.5).await?;
//!
//!     trainer.disconnect().await;
//!     Ok(())
//! }
//! ```

/// Activity classification and update throttling
pub mod activity;
/// Main trainer control interface
pub mod device;
/// Error types and handling
pub mod error;
/// WFTNP wire framing and incremental decoding
pub mod frame;
/// FTMS characteristic encoding and parsing
pub mod ftms;
/// TCP session, request correlation, and the read loop
pub mod session;
/// Reconnection supervisor and backoff schedule
pub mod supervisor;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use device::{TrainerDevice, TrainerHandler};
pub use error::{CommandError, ConnectError, FrameError, Result, WftnpError};
pub use ftms::{ControlCommand, ControlResponse, CpResult};
pub use session::{DisconnectReason, Session, SessionEvents};
pub use supervisor::Backoff;
pub use types::{
    ActivityState, ConnectionState, DeviceInformation, SupervisorState, TelemetryRecord,
    TrainerConfig,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default TCP port a KICKR listens on for WFTNP connections
pub const DEFAULT_PORT: u16 = 5555;
