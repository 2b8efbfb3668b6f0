//! Byte-stream transports for the energy meter.
//!
//! The driver never talks to a serial port directly. It goes through the
//! [`Transport`] trait (write, bounded read, flush, close) and obtains
//! transports from a [`Connector`], which lets a session reopen itself with a
//! new timeout without knowing whether it sits on real hardware or on the
//! scripted [`mock::MockTransport`].

use crate::error::MeterResult;
use crate::session::SessionConfig;
use async_trait::async_trait;

pub mod mock;
pub mod serial;

pub use mock::{MockConnector, MockTransport};
pub use serial::{SerialConnector, SerialTransport};

#[async_trait]
pub trait Transport: Send {
    /// Write all bytes of `data`.
    async fn write(&mut self, data: &[u8]) -> MeterResult<()>;

    /// Read up to `max_bytes`, returning early once the window is full or the
    /// read timeout elapses. A timeout is not an error: fewer bytes (possibly
    /// none) come back.
    async fn read(&mut self, max_bytes: usize) -> MeterResult<Vec<u8>>;

    /// Discard stale input and push out pending output.
    async fn flush(&mut self) -> MeterResult<()>;

    /// Release the underlying device. Called at most once per transport.
    async fn close(&mut self) -> MeterResult<()>;

    /// Human readable description for logs.
    fn describe(&self) -> String;
}

/// Opens transports for a session configuration.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &SessionConfig) -> MeterResult<Box<dyn Transport>>;
}
