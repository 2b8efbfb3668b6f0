//! # Energy Meter Driver
//!
//! Async driver for a laboratory energy meter that speaks a SCPI-like ASCII
//! protocol over a serial link. The driver sequences configuration and trigger
//! commands with the settling delays the firmware needs, reads fixed-size reply
//! windows, and retries the whole exchange when a reply does not parse.
//!
//! ## Crate Structure
//!
//! - **`config`**: Figment-based configuration (TOML file + environment).
//! - **`driver`**: The `EnergyMeter` driver: energy reads with bounded retry,
//!   range selection, and generic get/set primitives.
//! - **`error`**: The `MeterError` enum shared by every module.
//! - **`logging`**: Tracing subscriber setup for applications.
//! - **`protocol`**: Command strings, reply windows, range scale factors and
//!   reply parsing.
//! - **`session`**: Session configuration and the open/close/reopen lifecycle.
//! - **`transport`**: The `Transport`/`Connector` seams with serial and mock
//!   implementations.

pub mod config;
pub mod driver;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod session;
pub mod transport;

pub use config::Config;
pub use driver::{EnergyMeter, EnergyReading, RangeReading, DEFAULT_RETRY_LIMIT};
pub use error::{MeterError, MeterResult};
pub use protocol::Range;
pub use session::{Session, SessionConfig};
