//! Serial transport backed by `tokio-serial`.
//!
//! Ports are opened 8N1 without flow control on a blocking thread so the
//! runtime never stalls on a slow USB-serial adapter.

use super::{Connector, Transport};
use crate::error::{MeterError, MeterResult};
use crate::session::SessionConfig;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::task::spawn_blocking;
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};

/// Read until `max_bytes` have arrived or `timeout` elapses.
///
/// Partial replies are returned as received; an empty vector means nothing
/// arrived before the deadline. End of stream stops the read early.
pub async fn read_window<R>(reader: &mut R, max_bytes: usize, timeout: Duration) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let deadline = tokio::time::Instant::now() + timeout;
    let mut buf = vec![0u8; max_bytes];
    let mut filled = 0usize;

    while filled < max_bytes {
        match tokio::time::timeout_at(deadline, reader.read(&mut buf[filled..])).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => filled += n,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            Ok(Err(e)) => return Err(e),
            // Deadline reached; hand back what arrived.
            Err(_) => break,
        }
    }

    buf.truncate(filled);
    Ok(buf)
}

/// Open a serial port asynchronously using spawn_blocking.
///
/// # Errors
///
/// Returns [`MeterError::Connection`] when the port cannot be opened or the
/// blocking task fails.
pub async fn open_serial_async(port_path: &str, baud_rate: u32) -> MeterResult<SerialStream> {
    let port_path_owned = port_path.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| MeterError::connection(&port_path_owned, e.into()))
    })
    .await
    .map_err(|e| MeterError::connection(port_path, std::io::Error::other(e)))?
}

/// A live serial connection to the meter.
pub struct SerialTransport {
    port_name: String,
    timeout: Duration,
    stream: Option<SerialStream>,
}

impl SerialTransport {
    pub async fn open(config: &SessionConfig) -> MeterResult<Self> {
        let stream = open_serial_async(&config.port, config.baud_rate).await?;
        tracing::debug!(
            port = %config.port,
            baud_rate = config.baud_rate,
            timeout_ms = config.timeout.as_millis() as u64,
            "Serial port opened"
        );
        Ok(Self {
            port_name: config.port.clone(),
            timeout: config.timeout,
            stream: Some(stream),
        })
    }

    fn stream(&mut self) -> MeterResult<&mut SerialStream> {
        self.stream.as_mut().ok_or(MeterError::NotConnected)
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn write(&mut self, data: &[u8]) -> MeterResult<()> {
        let stream = self.stream()?;
        stream.write_all(data).await?;
        Ok(())
    }

    async fn read(&mut self, max_bytes: usize) -> MeterResult<Vec<u8>> {
        let timeout = self.timeout;
        let stream = self.stream()?;
        Ok(read_window(stream, max_bytes, timeout).await?)
    }

    async fn flush(&mut self) -> MeterResult<()> {
        let stream = self.stream()?;
        stream
            .clear(ClearBuffer::Input)
            .map_err(std::io::Error::from)?;
        stream.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> MeterResult<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await?;
            tracing::debug!(port = %self.port_name, "Serial port closed");
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("serial {}", self.port_name)
    }
}

/// Connector that opens real serial ports.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialConnector;

#[async_trait]
impl Connector for SerialConnector {
    async fn connect(&self, config: &SessionConfig) -> MeterResult<Box<dyn Transport>> {
        Ok(Box::new(SerialTransport::open(config).await?))
    }
}
