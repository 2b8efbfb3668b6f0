//! Custom error types for the energy meter driver.
//!
//! `MeterError` is the single error type surfaced by the library. Built with
//! `thiserror`, it separates lifecycle failures (the port could not be opened)
//! from in-protocol I/O failures and configuration mistakes.
//!
//! ## Error Hierarchy
//!
//! - **`Connection`**: the serial port could not be opened or reopened. This is
//!   the only error that is expected to stop a caller.
//! - **`NotConnected`**: an operation needed an attached session but the session
//!   had been closed (or a reopen failed).
//! - **`Io`**: a write, read or flush on an open transport failed.
//! - **`Configuration`**: semantic errors in values that parsed fine (empty port
//!   name, zero baud rate, unknown log level).
//! - **`Config`**: the configuration file or environment could not be extracted.
//!
//! Timeouts and corrupt replies during an energy read are not errors; they are
//! reported through [`crate::driver::EnergyReading`].

use thiserror::Error;

/// Convenience alias for results using the driver error type.
pub type MeterResult<T> = std::result::Result<T, MeterError>;

#[derive(Error, Debug)]
pub enum MeterError {
    /// Opening (or reopening) the transport failed.
    ///
    /// Typical causes: the port does not exist, is held by another process, or
    /// the user lacks permission.
    #[error("Failed to open energy meter port '{port}': {source}")]
    Connection {
        port: String,
        #[source]
        source: std::io::Error,
    },

    /// The session is closed. After a failed reopen this is how the original
    /// [`MeterError::Connection`] shows up on every later operation.
    #[error("Energy meter session is not connected")]
    NotConnected,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),
}

impl MeterError {
    pub(crate) fn connection(port: impl Into<String>, source: std::io::Error) -> Self {
        MeterError::Connection {
            port: port.into(),
            source,
        }
    }

    /// Whether the caller should treat the session as gone.
    ///
    /// Only lifecycle failures qualify; an I/O error on an open port leaves the
    /// session attached and the next command may well succeed.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            MeterError::Connection { .. } | MeterError::NotConnected
        )
    }
}

impl From<figment::Error> for MeterError {
    fn from(value: figment::Error) -> Self {
        MeterError::Config(Box::new(value))
    }
}
