//! Wire-level vocabulary of the energy meter.
//!
//! Commands are ASCII, newline terminated:
//! - Set: `<COMMAND> <value>\n`
//! - Query: `<COMMAND>?\n` (the question mark is part of the command string)
//!
//! Replies are a floating point literal such as `3.0000e-9` padded with
//! terminator bytes to a fixed window. The window size is a contract with the
//! instrument and never a caller choice.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Line terminator appended to every command.
pub const TERMINATOR: &str = "\n";

/// Reply window for the energy fetch and the range query.
pub const READ_WINDOW_BYTES: usize = 11;

/// Reply window for range queries.
pub const RANGE_READ_BYTES: usize = READ_WINDOW_BYTES;

/// Wait inserted between commands so the firmware can process the previous one.
pub const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Energy readings arrive in joules; this divisor yields nanojoules.
pub const NANOJOULE: f64 = 1e-9;

/// Reply the meter sends for a cleared range selection.
pub const ZERO_RANGE_REPLY: &str = "0.000e+00";

pub const CMD_CONTINUOUS_LAST: &str = "CONF:READ:CONT LAST";
pub const CMD_INIT: &str = "INIT";
pub const CMD_FETCH_NEXT: &str = "FETC:NEXT?";
pub const CMD_ABORT: &str = "ABOR";
pub const CMD_RANGE_SELECT: &str = "CONFigure:RANGe:SELect";
pub const CMD_RANGE_QUERY: &str = "CONFigure:RANGe:SELect?";

/// Measurement range of the energy meter.
///
/// Each range maps to the full-scale literal the meter expects as the argument
/// of `CONFigure:RANGe:SELect`. The literal is not applied to readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Range {
    Nj300,
    Nj30,
    Nj3,
}

impl Range {
    pub const ALL: [Range; 3] = [Range::Nj300, Range::Nj30, Range::Nj3];

    /// Scale factor sent to the instrument.
    pub fn scale_factor(self) -> f64 {
        match self {
            Range::Nj300 => 2.95e-7,
            Range::Nj30 => 2.95e-8,
            Range::Nj3 => 2.95e-9,
        }
    }

    /// Name used on the front panel and in configuration files.
    pub fn name(self) -> &'static str {
        match self {
            Range::Nj300 => "300nJ",
            Range::Nj30 => "30nJ",
            Range::Nj3 => "3nJ",
        }
    }

    /// Argument for the range select command, e.g. `2.95e-7`.
    pub fn command_argument(self) -> String {
        format!("{:e}", self.scale_factor())
    }

    /// Range whose scale factor matches `value` within float noise.
    pub fn from_scale_factor(value: f64) -> Option<Range> {
        Range::ALL.into_iter().find(|range| {
            let expected = range.scale_factor();
            ((value - expected) / expected).abs() < 1e-6
        })
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownRange(pub String);

impl fmt::Display for UnknownRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Unknown range '{}'. Must be one of: 300nJ, 30nJ, 3nJ",
            self.0
        )
    }
}

impl std::error::Error for UnknownRange {}

impl FromStr for Range {
    type Err = UnknownRange;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Range::ALL
            .into_iter()
            .find(|range| range.name() == s)
            .ok_or_else(|| UnknownRange(s.to_string()))
    }
}

/// Frame a command line, appending the terminator unless already present.
pub fn frame_command(command: &str, argument: Option<&str>) -> String {
    let mut line = match argument {
        Some(arg) => format!("{} {}", command, arg),
        None => command.to_string(),
    };
    if !line.ends_with(TERMINATOR) {
        line.push_str(TERMINATOR);
    }
    line
}

/// Strip whitespace, NUL padding and terminators from a raw reply.
pub fn clean_reply(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_matches(|c: char| c.is_whitespace() || c == '\0')
        .to_string()
}

/// Parse a reply window as a floating point value.
pub fn parse_reading(raw: &[u8]) -> Option<f64> {
    let cleaned = clean_reply(raw);
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Convert a raw reading in joules to nanojoules.
pub fn to_nanojoules(joules: f64) -> f64 {
    joules / NANOJOULE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_names_round_trip() {
        for range in Range::ALL {
            assert_eq!(range.name().parse::<Range>(), Ok(range));
        }
        assert!("bogus".parse::<Range>().is_err());
        assert!("300NJ".parse::<Range>().is_err());
    }

    #[test]
    fn range_command_arguments() {
        assert_eq!(Range::Nj300.command_argument(), "2.95e-7");
        assert_eq!(Range::Nj30.command_argument(), "2.95e-8");
        assert_eq!(Range::Nj3.command_argument(), "2.95e-9");
    }

    #[test]
    fn range_from_scale_factor() {
        assert_eq!(Range::from_scale_factor(2.95e-8), Some(Range::Nj30));
        assert_eq!(Range::from_scale_factor(2.9500e-9), Some(Range::Nj3));
        assert_eq!(Range::from_scale_factor(1.0e-6), None);
    }

    #[test]
    fn frame_command_appends_terminator_once() {
        assert_eq!(frame_command("INIT", None), "INIT\n");
        assert_eq!(frame_command("ABOR\n", None), "ABOR\n");
        assert_eq!(
            frame_command(CMD_RANGE_SELECT, Some("2.95e-7")),
            "CONFigure:RANGe:SELect 2.95e-7\n"
        );
    }

    #[test]
    fn parse_reading_tolerates_padding() {
        let cases: Vec<(&[u8], Option<f64>)> = vec![
            (&b"3.0000e-9\r\n"[..], Some(3.0e-9)),
            (&b" 1.5E-07\n\0\0"[..], Some(1.5e-7)),
            (&b"0.0000e+00\n"[..], Some(0.0)),
            (&b""[..], None),
            (&b"\r\n"[..], None),
            (&b"ERR 101\n"[..], None),
            (&b"3.00"[..], Some(3.0)),
            (&b"NaN"[..], None),
        ];
        for (raw, expected) in cases {
            assert_eq!(parse_reading(raw), expected, "input {:?}", raw);
        }
    }

    #[test]
    fn nanojoule_scaling() {
        let nj = to_nanojoules(3.0000e-9);
        assert!((nj - 3.0).abs() < 1e-9, "got {}", nj);
        assert_eq!(to_nanojoules(0.0), 0.0);
    }
}
