//! Session lifecycle for the meter's byte-stream connection.
//!
//! A [`Session`] owns at most one open [`Transport`]. The configuration it was
//! opened with is immutable; changing the read timeout means closing and
//! reopening, which is what [`Session::reconfigure_timeout`] does.

use crate::error::{MeterError, MeterResult};
use crate::transport::{Connector, Transport};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_BAUD_RATE: u32 = 115_200;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

/// Port parameters for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Must match the rate configured on the meter
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Read timeout
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

impl SessionConfig {
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn validate(&self) -> MeterResult<()> {
        if self.port.trim().is_empty() {
            return Err(MeterError::Configuration(
                "Serial port must not be empty".to_string(),
            ));
        }
        if self.baud_rate == 0 {
            return Err(MeterError::Configuration(
                "Baud rate must be positive".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(MeterError::Configuration(
                "Read timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// An exclusively owned connection to the meter.
///
/// Dropping the session drops the transport, which releases the port even when
/// [`Session::close`] was never awaited.
pub struct Session {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    transport: Option<Box<dyn Transport>>,
}

impl Session {
    /// Open a session.
    ///
    /// # Errors
    /// [`MeterError::Configuration`] for an invalid config,
    /// [`MeterError::Connection`] if the port cannot be opened.
    pub async fn open(config: SessionConfig, connector: Arc<dyn Connector>) -> MeterResult<Self> {
        config.validate()?;
        let transport = connector.connect(&config).await?;
        tracing::debug!(transport = %transport.describe(), "Energy meter session opened");
        Ok(Self {
            config,
            connector,
            transport: Some(transport),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_none()
    }

    /// Attached transport, if any.
    pub fn transport(&mut self) -> Option<&mut (dyn Transport + 'static)> {
        self.transport.as_deref_mut()
    }

    /// Release the transport. Closing a closed session is a no-op.
    ///
    /// The transport is detached even if its close fails; the error is still
    /// returned so the caller can log it.
    pub async fn close(&mut self) -> MeterResult<()> {
        match self.transport.take() {
            Some(mut transport) => {
                let result = transport.close().await;
                tracing::debug!(port = %self.config.port, "Energy meter session closed");
                result
            }
            None => Ok(()),
        }
    }

    /// Re-establish a closed session with the stored configuration.
    pub async fn reopen(&mut self) -> MeterResult<()> {
        if !self.is_closed() {
            return Ok(());
        }
        let transport = self.connector.connect(&self.config).await?;
        self.transport = Some(transport);
        tracing::debug!(port = %self.config.port, "Energy meter session reopened");
        Ok(())
    }

    /// Close, then reopen with `timeout`.
    ///
    /// Not atomic: if the reopen fails the call returns
    /// [`MeterError::Connection`] and the session stays closed. Later
    /// operations report [`MeterError::NotConnected`] as the lasting form of
    /// that connection failure until [`Session::reopen`] succeeds; both answer
    /// `true` to [`MeterError::is_connection_lost`].
    pub async fn reconfigure_timeout(&mut self, timeout: Duration) -> MeterResult<()> {
        let mut config = self.config.clone().with_timeout(timeout);
        config.validate()?;

        if let Err(e) = self.close().await {
            tracing::warn!(error = %e, "Error closing session before timeout change");
        }
        std::mem::swap(&mut self.config, &mut config);
        self.reopen().await
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockConnector;

    fn config() -> SessionConfig {
        SessionConfig::new("/dev/ttyUSB0", DEFAULT_BAUD_RATE)
    }

    #[test]
    fn config_validation() {
        assert!(config().validate().is_ok());
        assert!(SessionConfig::new("", 115200).validate().is_err());
        assert!(SessionConfig::new("/dev/ttyS0", 0).validate().is_err());
        assert!(config()
            .with_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn config_deserializes_humantime_timeout() {
        let cfg: SessionConfig = toml::from_str(
            r#"
            port = "/dev/ttyACM1"
            timeout = "750ms"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.port, "/dev/ttyACM1");
        assert_eq!(cfg.baud_rate, DEFAULT_BAUD_RATE);
        assert_eq!(cfg.timeout, Duration::from_millis(750));
    }

    #[tokio::test]
    async fn open_failure_is_connection_error() {
        let mock = MockConnector::new();
        mock.fail_next_connect();
        let err = Session::open(config(), Arc::new(mock)).await.unwrap_err();
        assert!(matches!(err, MeterError::Connection { .. }));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let mock = MockConnector::new();
        let mut session = Session::open(config(), Arc::new(mock.clone())).await.unwrap();
        assert!(!session.is_closed());

        session.close().await.unwrap();
        assert!(session.is_closed());
        session.close().await.unwrap();
        assert!(session.is_closed());
        assert_eq!(mock.closes(), 1);
    }

    #[tokio::test]
    async fn reconfigure_timeout_reopens() {
        let mock = MockConnector::new();
        let mut session = Session::open(config(), Arc::new(mock.clone())).await.unwrap();

        session
            .reconfigure_timeout(Duration::from_secs(2))
            .await
            .unwrap();

        assert!(!session.is_closed());
        assert_eq!(session.config().timeout, Duration::from_secs(2));
        assert_eq!(mock.connects(), 2);
        assert_eq!(mock.closes(), 1);
        assert_eq!(mock.last_timeout(), Some(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn failed_reopen_leaves_session_closed() {
        let mock = MockConnector::new();
        let mut session = Session::open(config(), Arc::new(mock.clone())).await.unwrap();

        mock.fail_next_connect();
        let err = session
            .reconfigure_timeout(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MeterError::Connection { .. }));
        assert!(err.is_connection_lost());
        assert!(session.is_closed());
        assert!(session.transport().is_none());

        session.reopen().await.unwrap();
        assert!(!session.is_closed());
        assert_eq!(session.config().timeout, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn drop_releases_transport() {
        let mock = MockConnector::new();
        let session = Session::open(config(), Arc::new(mock.clone())).await.unwrap();
        assert!(mock.is_open());
        drop(session);
        assert!(!mock.is_open());
    }
}
