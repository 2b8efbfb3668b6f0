//! Scripted in-memory transport for testing the driver without hardware.
//!
//! The mock provides:
//! - Queued replies, one per `read` call (an empty queue behaves like a timeout)
//! - One-shot failure injection for connect, write and read
//! - A log of every write, flush, connect and close for test verification
//!
//! State lives behind an `Arc`, so a test keeps a [`MockConnector`] handle for
//! inspection after the driver has taken ownership of the transport.

use super::{Connector, Transport};
use crate::error::{MeterError, MeterResult};
use crate::session::SessionConfig;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// One scripted answer to a `read` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    /// Bytes returned (truncated to the requested window).
    Bytes(Vec<u8>),
    /// Nothing arrives before the read timeout.
    Silence,
    /// The read itself fails.
    Error(ErrorKind),
}

impl MockReply {
    pub fn text(reply: &str) -> Self {
        MockReply::Bytes(reply.as_bytes().to_vec())
    }
}

#[derive(Debug, Default)]
struct MockState {
    replies: VecDeque<MockReply>,
    writes: Vec<String>,
    flushes: usize,
    connects: usize,
    closes: usize,
    open: bool,
    last_timeout: Option<Duration>,
    fail_next_connect: bool,
    fail_next_write: bool,
}

/// Shared handle to the scripted device.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a reply for a later `read`.
    pub fn push_reply(&self, reply: MockReply) {
        self.state().replies.push_back(reply);
    }

    /// Queue a textual reply.
    pub fn push_text(&self, reply: &str) {
        self.push_reply(MockReply::text(reply));
    }

    /// Make the next `connect` fail with a permission error.
    pub fn fail_next_connect(&self) {
        self.state().fail_next_connect = true;
    }

    /// Make the next `write` fail with a broken pipe.
    pub fn fail_next_write(&self) {
        self.state().fail_next_write = true;
    }

    /// Every command written so far, in order.
    pub fn writes(&self) -> Vec<String> {
        self.state().writes.clone()
    }

    /// Number of times `command` (with terminator) was written.
    pub fn count_writes(&self, command: &str) -> usize {
        self.state().writes.iter().filter(|w| *w == command).count()
    }

    pub fn flushes(&self) -> usize {
        self.state().flushes
    }

    pub fn connects(&self) -> usize {
        self.state().connects
    }

    pub fn closes(&self) -> usize {
        self.state().closes
    }

    /// Whether a transport from this connector is currently open.
    pub fn is_open(&self) -> bool {
        self.state().open
    }

    /// Read timeout of the most recent successful connect.
    pub fn last_timeout(&self) -> Option<Duration> {
        self.state().last_timeout
    }

    pub fn pending_replies(&self) -> usize {
        self.state().replies.len()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, config: &SessionConfig) -> MeterResult<Box<dyn Transport>> {
        let mut state = self.state();
        if std::mem::take(&mut state.fail_next_connect) {
            return Err(MeterError::connection(
                &config.port,
                std::io::Error::new(ErrorKind::PermissionDenied, "mock connect failure"),
            ));
        }
        state.connects += 1;
        state.open = true;
        state.last_timeout = Some(config.timeout);
        drop(state);

        Ok(Box::new(MockTransport {
            state: self.state.clone(),
            port: config.port.clone(),
            timeout: config.timeout,
            closed: false,
        }))
    }
}

/// Transport half of the mock, owned by the session.
#[derive(Debug)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    port: String,
    timeout: Duration,
    closed: bool,
}

impl MockTransport {
    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> MeterResult<()> {
        if self.closed {
            Err(MeterError::NotConnected)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn write(&mut self, data: &[u8]) -> MeterResult<()> {
        self.ensure_open()?;
        let mut state = self.state();
        if std::mem::take(&mut state.fail_next_write) {
            return Err(std::io::Error::new(ErrorKind::BrokenPipe, "mock write failure").into());
        }
        state.writes.push(String::from_utf8_lossy(data).into_owned());
        Ok(())
    }

    async fn read(&mut self, max_bytes: usize) -> MeterResult<Vec<u8>> {
        self.ensure_open()?;
        let reply = self.state().replies.pop_front().unwrap_or(MockReply::Silence);
        match reply {
            MockReply::Bytes(mut bytes) => {
                bytes.truncate(max_bytes);
                Ok(bytes)
            }
            MockReply::Silence => {
                tokio::time::sleep(self.timeout).await;
                Ok(Vec::new())
            }
            MockReply::Error(kind) => {
                Err(std::io::Error::new(kind, "mock read failure").into())
            }
        }
    }

    async fn flush(&mut self) -> MeterResult<()> {
        self.ensure_open()?;
        self.state().flushes += 1;
        Ok(())
    }

    async fn close(&mut self) -> MeterResult<()> {
        if !self.closed {
            self.closed = true;
            let mut state = self.state();
            state.closes += 1;
            state.open = false;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("mock {}", self.port)
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        if !self.closed {
            self.state().open = false;
        }
    }
}
