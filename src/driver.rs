//! Energy meter protocol driver.
//!
//! Reference: Coherent energy meter SCPI command set (RS-232/USB-serial)
//!
//! Protocol Overview:
//! - Format: SCPI-like ASCII commands, LF terminated
//! - Baud: 115200 by default, must match the meter
//! - Replies: scientific notation in joules, e.g. `3.0000e-9`, padded to an
//!   11-byte window
//! - The firmware needs ~100 ms between commands; nothing is acknowledged
//!
//! Energy read sequence (one attempt):
//!
//! | step | action                          |
//! |------|---------------------------------|
//! | 1    | flush stale input, settle       |
//! | 2    | `CONF:READ:CONT LAST`, settle   |
//! | 3    | `INIT`, settle                  |
//! | 4    | `FETC:NEXT?`, settle            |
//! | 5    | read 11 bytes and parse         |
//! | 6    | on success `ABOR`               |
//!
//! Low ranges (a few nJ) are noisy and often need a second attempt; high ranges
//! usually read cleanly on the first.
//!
//! # Usage
//!
//! ```rust,ignore
//! use energy_meter::{EnergyMeter, EnergyReading, Range, SessionConfig};
//!
//! let mut meter = EnergyMeter::open(SessionConfig::new("/dev/ttyUSB0", 115200)).await?;
//! meter.set_range_to(Range::Nj30).await;
//! match meter.read_energy().await? {
//!     EnergyReading::Measured { nanojoules, .. } => println!("{nanojoules} nJ"),
//!     failed => eprintln!("no reading: {failed}"),
//! }
//! meter.close().await?;
//! ```

use crate::error::{MeterError, MeterResult};
use crate::protocol::{
    self, Range, CMD_ABORT, CMD_CONTINUOUS_LAST, CMD_FETCH_NEXT, CMD_INIT, CMD_RANGE_QUERY,
    CMD_RANGE_SELECT, RANGE_READ_BYTES, READ_WINDOW_BYTES, SETTLE_DELAY, ZERO_RANGE_REPLY,
};
use crate::session::{Session, SessionConfig};
use crate::transport::{Connector, SerialConnector};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{instrument, Instrument, Span};

pub const DEFAULT_RETRY_LIMIT: u32 = 2;

/// Outcome of one logical energy read.
#[derive(Debug, Clone, PartialEq)]
pub enum EnergyReading {
    /// A reply parsed; `attempts` counts full command sequences used.
    Measured { nanojoules: f64, attempts: u32 },
    /// The last attempt produced no bytes (or the read itself failed).
    TimedOut { attempts: u32 },
    /// The last attempt produced bytes that are not a number.
    Corrupted { attempts: u32, reply: String },
}

impl EnergyReading {
    pub fn nanojoules(&self) -> Option<f64> {
        match self {
            EnergyReading::Measured { nanojoules, .. } => Some(*nanojoules),
            _ => None,
        }
    }

    /// Collapse to a bare value, `0.0` on failure.
    ///
    /// A measured zero and a failed read are indistinguishable afterwards.
    pub fn value_or_zero(&self) -> f64 {
        self.nanojoules().unwrap_or(0.0)
    }

    pub fn attempts(&self) -> u32 {
        match self {
            EnergyReading::Measured { attempts, .. }
            | EnergyReading::TimedOut { attempts }
            | EnergyReading::Corrupted { attempts, .. } => *attempts,
        }
    }

    pub fn is_measured(&self) -> bool {
        matches!(self, EnergyReading::Measured { .. })
    }
}

impl fmt::Display for EnergyReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnergyReading::Measured { nanojoules, .. } => write!(f, "{} nJ", nanojoules),
            EnergyReading::TimedOut { attempts } => {
                write!(f, "read timed out after {} attempt(s)", attempts)
            }
            EnergyReading::Corrupted { attempts, reply } => write!(
                f,
                "unparsable reply {:?} after {} attempt(s)",
                reply, attempts
            ),
        }
    }
}

/// Reply to a range query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeReading {
    /// Empty reply or the meter's zero sentinel.
    Zero,
    /// Anything else, left as received.
    Raw(String),
}

impl RangeReading {
    /// Range whose scale factor the raw reply encodes, if any.
    pub fn matching_range(&self) -> Option<Range> {
        match self {
            RangeReading::Zero => None,
            RangeReading::Raw(reply) => protocol::clean_reply(reply.as_bytes())
                .parse::<f64>()
                .ok()
                .and_then(Range::from_scale_factor),
        }
    }
}

/// How a single attempt went wrong.
enum AttemptFailure {
    Silent,
    Corrupted(String),
}

/// Driver for the energy meter.
///
/// All operations take `&mut self`: the protocol has no request ids, so only
/// one command sequence may be in flight. Share a meter between tasks through
/// an external `tokio::sync::Mutex`.
pub struct EnergyMeter {
    session: Session,
    retry_limit: u32,
    settle_delay: Duration,
    span: Span,
}

impl EnergyMeter {
    /// Open the meter on a real serial port.
    pub async fn open(config: SessionConfig) -> MeterResult<Self> {
        Self::open_with(config, Arc::new(SerialConnector)).await
    }

    /// Open the meter through any connector (mock transports in tests).
    pub async fn open_with(config: SessionConfig, connector: Arc<dyn Connector>) -> MeterResult<Self> {
        let span = tracing::debug_span!("energy_meter", port = %config.port);
        let session = Session::open(config, connector)
            .instrument(span.clone())
            .await?;
        Ok(Self::with_session(session, span))
    }

    /// Wrap an already open session. `span` becomes the parent of every
    /// diagnostic this driver emits.
    pub fn with_session(session: Session, span: Span) -> Self {
        Self {
            session,
            retry_limit: DEFAULT_RETRY_LIMIT,
            settle_delay: SETTLE_DELAY,
            span,
        }
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    /// Attempts allowed per energy read. Raise this on the lowest ranges,
    /// where the meter often reports nothing on the first try.
    pub fn set_retry_limit(&mut self, retry_limit: u32) {
        self.retry_limit = retry_limit;
    }

    pub fn settle_delay(&self) -> Duration {
        self.settle_delay
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    /// Release the port. Idempotent.
    pub async fn close(&mut self) -> MeterResult<()> {
        self.session.close().instrument(self.span.clone()).await
    }

    /// Reopen a closed session with its stored configuration.
    pub async fn reopen(&mut self) -> MeterResult<()> {
        self.session.reopen().instrument(self.span.clone()).await
    }

    /// Close the port and reopen it with a new read timeout.
    ///
    /// On failure the meter is left closed; see [`Session::reconfigure_timeout`].
    pub async fn set_timeout(&mut self, timeout: Duration) -> MeterResult<()> {
        self.session
            .reconfigure_timeout(timeout)
            .instrument(self.span.clone())
            .await
    }

    // =========================================================================
    // Command dispatch
    // =========================================================================

    /// Write `command` (plus ` argument` when given) to the meter.
    ///
    /// Silently does nothing when the session is closed, so commands issued
    /// after a close never fail. `Ok(())` therefore does not prove delivery.
    pub async fn send_command(&mut self, command: &str, argument: Option<&str>) -> MeterResult<()> {
        let line = protocol::frame_command(command, argument);
        let span = &self.span;
        let Some(transport) = self.session.transport() else {
            tracing::debug!(parent: &self.span, command = %line.trim_end(), "Session closed, command dropped");
            return Ok(());
        };
        tracing::debug!(parent: span, command = %line.trim_end(), "Sending command");
        transport.write(line.as_bytes()).await
    }

    /// Read up to `byte_count` bytes within the session timeout.
    ///
    /// A short or empty result means the meter did not answer in time.
    pub async fn read_reply(&mut self, byte_count: usize) -> MeterResult<Vec<u8>> {
        let transport = self
            .session
            .transport()
            .ok_or(MeterError::NotConnected)?;
        let reply = transport.read(byte_count).await?;
        tracing::debug!(
            parent: &self.span,
            requested = byte_count,
            received = reply.len(),
            raw = ?String::from_utf8_lossy(&reply),
            "Read reply"
        );
        Ok(reply)
    }

    /// Discard stale input before a new exchange.
    pub async fn flush(&mut self) -> MeterResult<()> {
        let transport = self
            .session
            .transport()
            .ok_or(MeterError::NotConnected)?;
        transport.flush().await
    }

    // =========================================================================
    // Energy read
    // =========================================================================

    /// Read one energy value in nanojoules.
    ///
    /// Runs the full command sequence up to `retry_limit` times (at least once)
    /// until a reply parses. Timeouts and garbage replies are reported through
    /// [`EnergyReading`]; only a missing session is an error.
    #[instrument(parent = &self.span, skip(self), fields(retry_limit = self.retry_limit))]
    pub async fn read_energy(&mut self) -> MeterResult<EnergyReading> {
        if self.is_closed() {
            return Err(MeterError::NotConnected);
        }

        let max_attempts = self.retry_limit.max(1);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let failure = match self.energy_attempt().await {
                Ok(joules) => {
                    let nanojoules = protocol::to_nanojoules(joules);
                    if let Err(e) = self.send_command(CMD_ABORT, None).await {
                        tracing::warn!(error = %e, "Failed to abort acquisition after read");
                    }
                    tracing::debug!(nanojoules, attempts, "Energy read");
                    return Ok(EnergyReading::Measured {
                        nanojoules,
                        attempts,
                    });
                }
                Err(failure) => failure,
            };

            if attempts >= max_attempts {
                let reading = match failure {
                    AttemptFailure::Silent => EnergyReading::TimedOut { attempts },
                    AttemptFailure::Corrupted(reply) => EnergyReading::Corrupted { attempts, reply },
                };
                tracing::warn!(%reading, "Giving up on energy read");
                return Ok(reading);
            }

            match &failure {
                AttemptFailure::Silent => {
                    tracing::debug!(attempt = attempts, "No energy reply, retrying")
                }
                AttemptFailure::Corrupted(reply) => {
                    tracing::debug!(attempt = attempts, reply = %reply, "Unparsable energy reply, retrying")
                }
            }
        }
    }

    /// Legacy form of [`EnergyMeter::read_energy`]: `0.0` stands in for any
    /// failure, including a closed session.
    pub async fn get_energy_nj(&mut self) -> f64 {
        match self.read_energy().await {
            Ok(reading) => reading.value_or_zero(),
            Err(e) => {
                tracing::error!(parent: &self.span, error = %e, "Energy read failed");
                0.0
            }
        }
    }

    /// One full flush / configure / trigger / fetch sequence.
    async fn energy_attempt(&mut self) -> Result<f64, AttemptFailure> {
        if let Err(e) = self.flush().await {
            tracing::debug!(error = %e, "Flush before energy read failed");
        }
        tokio::time::sleep(self.settle_delay).await;

        for command in [CMD_CONTINUOUS_LAST, CMD_INIT, CMD_FETCH_NEXT] {
            if let Err(e) = self.send_command(command, None).await {
                tracing::debug!(command, error = %e, "Write failed during energy read");
            }
            tokio::time::sleep(self.settle_delay).await;
        }

        let raw = match self.read_reply(READ_WINDOW_BYTES).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::debug!(error = %e, "Energy reply read failed");
                return Err(AttemptFailure::Silent);
            }
        };

        match protocol::parse_reading(&raw) {
            Some(joules) => Ok(joules),
            None => {
                let cleaned = protocol::clean_reply(&raw);
                if cleaned.is_empty() {
                    Err(AttemptFailure::Silent)
                } else {
                    Err(AttemptFailure::Corrupted(cleaned))
                }
            }
        }
    }

    // =========================================================================
    // Generic get/set
    // =========================================================================

    /// Send `<command> <value>`. `None` sends nothing.
    ///
    /// Write failures are logged and swallowed.
    pub async fn set_value<V: fmt::Display>(&mut self, command: &str, value: Option<V>) {
        let Some(value) = value else {
            return;
        };
        let argument = value.to_string();
        if let Err(e) = self.send_command(command, Some(&argument)).await {
            tracing::error!(parent: &self.span, command, error = %e, "Error occurred while writing to serial port");
        }
    }

    /// Send a query and read back up to `bytes_to_read` bytes.
    ///
    /// The caller embeds any `?` in `command`. `None` performs no I/O. The read
    /// is attempted even when the write failed; a failed read is logged and
    /// yields `None`.
    pub async fn get_value(&mut self, command: &str, bytes_to_read: Option<usize>) -> Option<Vec<u8>> {
        let bytes_to_read = bytes_to_read?;

        if let Err(e) = self.send_command(command, None).await {
            tracing::error!(parent: &self.span, command, error = %e, "Error occurred while writing to serial port");
        }

        match self.read_reply(bytes_to_read).await {
            Ok(reply) => Some(reply),
            Err(e) => {
                tracing::error!(parent: &self.span, command, error = %e, "Error occurred while reading from serial port");
                None
            }
        }
    }

    // =========================================================================
    // Range
    // =========================================================================

    /// Select a range by name (`300nJ`, `30nJ`, `3nJ`).
    ///
    /// `None` and unknown names are ignored without writing anything; parse
    /// with [`Range::from_str`](std::str::FromStr) first when feedback is needed.
    pub async fn set_range(&mut self, range: Option<&str>) {
        let Some(name) = range else {
            return;
        };
        match name.parse::<Range>() {
            Ok(range) => self.set_range_to(range).await,
            Err(e) => tracing::debug!(parent: &self.span, error = %e, "Ignoring range request"),
        }
    }

    pub async fn set_range_to(&mut self, range: Range) {
        tracing::debug!(parent: &self.span, %range, "Selecting range");
        self.set_value(CMD_RANGE_SELECT, Some(range.command_argument()))
            .await;
    }

    /// Query the selected range.
    ///
    /// The reply is not parsed; use [`RangeReading::matching_range`] to map it
    /// back to a [`Range`]. A failed exchange reads as [`RangeReading::Zero`].
    pub async fn get_range(&mut self) -> RangeReading {
        let reply = self
            .get_value(CMD_RANGE_QUERY, Some(RANGE_READ_BYTES))
            .await
            .unwrap_or_default();
        let cleaned = protocol::clean_reply(&reply);
        tracing::debug!(parent: &self.span, range = %cleaned, "Range reply");

        if is_zero_range_reply(&cleaned) {
            RangeReading::Zero
        } else {
            RangeReading::Raw(String::from_utf8_lossy(&reply).into_owned())
        }
    }
}

fn is_zero_range_reply(cleaned: &str) -> bool {
    cleaned.is_empty()
        || cleaned.eq_ignore_ascii_case(ZERO_RANGE_REPLY)
        || cleaned.parse::<f64>().is_ok_and(|v| v == 0.0)
}

impl fmt::Debug for EnergyMeter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnergyMeter")
            .field("session", &self.session)
            .field("retry_limit", &self.retry_limit)
            .field("settle_delay", &self.settle_delay)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockConnector, MockReply};
    use tracing_test::traced_test;

    async fn meter(mock: &MockConnector) -> EnergyMeter {
        EnergyMeter::open_with(
            SessionConfig::new("/dev/ttyUSB0", 115200),
            Arc::new(mock.clone()),
        )
        .await
        .unwrap()
    }

    #[test]
    fn zero_range_replies() {
        assert!(is_zero_range_reply(""));
        assert!(is_zero_range_reply("0.000e+00"));
        assert!(is_zero_range_reply("0.000E+00"));
        assert!(is_zero_range_reply("0"));
        assert!(!is_zero_range_reply("2.950e-07"));
        assert!(!is_zero_range_reply("0.000+e00x"));
    }

    #[test]
    fn range_reading_maps_back_to_range() {
        assert_eq!(
            RangeReading::Raw("2.950e-08\r\n".into()).matching_range(),
            Some(Range::Nj30)
        );
        assert_eq!(RangeReading::Raw("garbage".into()).matching_range(), None);
        assert_eq!(RangeReading::Zero.matching_range(), None);
    }

    #[test]
    fn energy_reading_accessors() {
        let measured = EnergyReading::Measured {
            nanojoules: 12.5,
            attempts: 1,
        };
        assert_eq!(measured.nanojoules(), Some(12.5));
        assert_eq!(measured.to_string(), "12.5 nJ");

        let corrupted = EnergyReading::Corrupted {
            attempts: 2,
            reply: "ERR".into(),
        };
        assert_eq!(corrupted.value_or_zero(), 0.0);
        assert_eq!(corrupted.attempts(), 2);
        assert!(!corrupted.is_measured());
    }

    #[tokio::test(start_paused = true)]
    async fn energy_sequence_command_order() {
        let mock = MockConnector::new();
        mock.push_text("1.2500e-8\r\n");
        let mut meter = meter(&mock).await;

        let reading = meter.read_energy().await.unwrap();
        let nj = reading.nanojoules().unwrap();
        assert!((nj - 12.5).abs() < 1e-9, "got {}", nj);
        assert_eq!(
            mock.writes(),
            vec!["CONF:READ:CONT LAST\n", "INIT\n", "FETC:NEXT?\n", "ABOR\n"]
        );
        assert_eq!(mock.flushes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn energy_attempt_waits_settle_delays() {
        let mock = MockConnector::new();
        mock.push_text("3.0000e-9\r\n");
        let mut meter = meter(&mock).await;

        let start = tokio::time::Instant::now();
        meter.read_energy().await.unwrap();
        assert_eq!(start.elapsed(), SETTLE_DELAY * 4);
    }

    #[tokio::test(start_paused = true)]
    async fn read_error_counts_as_timeout() {
        let mock = MockConnector::new();
        mock.push_reply(MockReply::Error(std::io::ErrorKind::Other));
        mock.push_reply(MockReply::Error(std::io::ErrorKind::Other));
        let mut meter = meter(&mock).await;

        let reading = meter.read_energy().await.unwrap();
        assert_eq!(reading, EnergyReading::TimedOut { attempts: 2 });
        assert_eq!(mock.count_writes("ABOR\n"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retry_limit_still_attempts_once() {
        let mock = MockConnector::new();
        mock.push_text("garbage");
        let mut meter = meter(&mock).await.with_retry_limit(0);

        let reading = meter.read_energy().await.unwrap();
        assert_eq!(
            reading,
            EnergyReading::Corrupted {
                attempts: 1,
                reply: "garbage".into()
            }
        );
        assert_eq!(mock.count_writes("INIT\n"), 1);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn retry_is_logged() {
        let mock = MockConnector::new();
        mock.push_text("#$%^&*");
        mock.push_text("5.0000e-9\r\n");
        let mut meter = meter(&mock).await;

        assert!(meter.read_energy().await.unwrap().is_measured());
        assert!(logs_contain("Unparsable energy reply, retrying"));
    }

    #[tokio::test]
    async fn read_energy_on_closed_meter() {
        let mock = MockConnector::new();
        let mut meter = meter(&mock).await;
        meter.close().await.unwrap();

        assert!(matches!(
            meter.read_energy().await,
            Err(MeterError::NotConnected)
        ));
        assert_eq!(meter.get_energy_nj().await, 0.0);
        assert!(mock.writes().is_empty());
    }

    #[tokio::test]
    async fn get_value_without_byte_count_does_nothing() {
        let mock = MockConnector::new();
        let mut meter = meter(&mock).await;

        assert_eq!(meter.get_value("SYST:INF?", None).await, None);
        assert!(mock.writes().is_empty());
    }

    #[tokio::test]
    async fn get_value_reads_window() {
        let mock = MockConnector::new();
        mock.push_text("PM10-19C   extra");
        let mut meter = meter(&mock).await;

        let reply = meter.get_value("SYST:INF?", Some(11)).await;
        assert_eq!(reply.as_deref(), Some(&b"PM10-19C   "[..]));
        assert_eq!(mock.writes(), vec!["SYST:INF?\n"]);
    }

    #[tokio::test]
    #[traced_test]
    async fn set_value_logs_and_swallows_write_error() {
        let mock = MockConnector::new();
        let mut meter = meter(&mock).await;

        mock.fail_next_write();
        meter.set_value("CONF:WAVE", Some(1064)).await;
        assert!(logs_contain("Error occurred while writing to serial port"));
        assert!(!meter.is_closed());

        meter.set_value::<u32>("CONF:WAVE", None).await;
        meter.set_value("CONF:WAVE", Some(1064)).await;
        assert_eq!(mock.writes(), vec!["CONF:WAVE 1064\n"]);
    }

    #[tokio::test]
    #[traced_test]
    async fn get_value_reads_after_failed_write() {
        let mock = MockConnector::new();
        mock.push_text("1.0e-9\r\n");
        let mut meter = meter(&mock).await;

        mock.fail_next_write();
        let reply = meter.get_value("SYST:INF?", Some(11)).await;
        assert_eq!(reply.as_deref(), Some(&b"1.0e-9\r\n"[..]));
        assert!(logs_contain("Error occurred while writing to serial port"));
    }

    #[tokio::test]
    #[traced_test]
    async fn get_value_read_error_yields_none() {
        let mock = MockConnector::new();
        mock.push_reply(MockReply::Error(std::io::ErrorKind::BrokenPipe));
        let mut meter = meter(&mock).await;

        assert_eq!(meter.get_value("SYST:INF?", Some(11)).await, None);
        assert!(logs_contain("Error occurred while reading from serial port"));
    }

    #[tokio::test]
    async fn get_range_read_error_reads_as_zero() {
        let mock = MockConnector::new();
        mock.push_reply(MockReply::Error(std::io::ErrorKind::Other));
        let mut meter = meter(&mock).await;

        assert_eq!(meter.get_range().await, RangeReading::Zero);
        assert_eq!(mock.writes(), vec!["CONFigure:RANGe:SELect?\n"]);
    }

    #[tokio::test]
    async fn set_timeout_reopens_port() {
        let mock = MockConnector::new();
        let mut meter = meter(&mock).await;

        meter.set_timeout(Duration::from_secs(1)).await.unwrap();
        assert!(!meter.is_closed());
        assert_eq!(mock.last_timeout(), Some(Duration::from_secs(1)));

        mock.fail_next_connect();
        let err = meter.set_timeout(Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, MeterError::Connection { .. }));
        assert!(meter.is_closed());
        let err = meter.read_energy().await.unwrap_err();
        assert!(matches!(err, MeterError::NotConnected));
        assert!(err.is_connection_lost());
        assert_eq!(meter.get_range().await, RangeReading::Zero);

        meter.reopen().await.unwrap();
        assert!(!meter.is_closed());
    }
}
