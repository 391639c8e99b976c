//! Flight file names
//!
//! Every flight is a set of files sharing one rotation key:
//! `dat_07.pb3`, `fsl_07.pb3`, `gps_07.pb3`, `log_07.txt` (and `prf_07.txt`),
//! or with date keys `dat_2024-06-01-3.pb3` and so on.

use crate::error::{Result, StorageError};
use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest two-digit suffix before rolling over to 0
pub const MAX_SUFFIX: u8 = 99;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stream {
    Sensor,
    State,
    Gps,
    Log,
    /// Performance dump written when pausing
    Perf,
}

impl Stream {
    /// Streams opened for every flight
    pub const RECORDED: [Stream; 4] = [Stream::Sensor, Stream::State, Stream::Gps, Stream::Log];

    /// Every stream that belongs to a flight set
    pub const ALL: [Stream; 5] = [
        Stream::Sensor,
        Stream::State,
        Stream::Gps,
        Stream::Log,
        Stream::Perf,
    ];

    pub fn prefix(self) -> &'static str {
        match self {
            Stream::Sensor => "dat_",
            Stream::State => "fsl_",
            Stream::Gps => "gps_",
            Stream::Log => "log_",
            Stream::Perf => "prf_",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Stream::Sensor | Stream::State | Stream::Gps => "pb3",
            Stream::Log | Stream::Perf => "txt",
        }
    }

    /// Directory name in the per-stream layout
    pub fn dir_name(self) -> &'static str {
        match self {
            Stream::Sensor => "sensor",
            Stream::State => "state",
            Stream::Gps => "gps",
            Stream::Log | Stream::Perf => "log",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Stream> {
        Stream::ALL
            .into_iter()
            .find(|s| s.prefix().trim_end_matches('_') == prefix)
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stream::Sensor => "sensor",
            Stream::State => "state",
            Stream::Gps => "gps",
            Stream::Log => "log",
            Stream::Perf => "perf",
        };
        f.write_str(name)
    }
}

/// Rotation key shared by all files of one flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FlightKey {
    /// Two-digit rolling suffix
    Suffix(u8),
    /// Calendar date plus a per-day sequence starting at 1
    Dated { date: NaiveDate, seq: u32 },
}

impl fmt::Display for FlightKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlightKey::Suffix(n) => write!(f, "{:02}", n),
            FlightKey::Dated { date, seq } => write!(f, "{}-{}", date.format("%Y-%m-%d"), seq),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationScheme {
    #[default]
    Suffix,
    DateSequence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    /// All streams in the data directory
    #[default]
    Flat,
    /// One directory per stream under the data directory
    PerStream,
}

impl Layout {
    pub fn directory(self, data_dir: &str, stream: Stream) -> String {
        match self {
            Layout::Flat => data_dir.to_string(),
            Layout::PerStream => crate::fs::catalog::join(data_dir, stream.dir_name()),
        }
    }

    /// Directories to create at mount, parents first.
    pub fn directories(self, data_dir: &str) -> Vec<String> {
        let mut dirs = Vec::new();
        if data_dir != "/" {
            dirs.push(data_dir.to_string());
        }
        for stream in Stream::ALL {
            let dir = self.directory(data_dir, stream);
            if dir != "/" && !dirs.contains(&dir) {
                dirs.push(dir);
            }
        }
        dirs
    }
}

/// Formats and parses file names for one rotation scheme
#[derive(Debug, Clone)]
pub struct FlightNaming {
    scheme: RotationScheme,
    pattern: Regex,
}

impl FlightNaming {
    const SUFFIX_PATTERN: &'static str = r"^(dat|fsl|gps|log|prf)_([0-9]{2})\.(pb3|txt)$";
    const DATE_PATTERN: &'static str =
        r"^(dat|fsl|gps|log|prf)_([0-9]{4})-([0-9]{2})-([0-9]{2})-([0-9]+)\.(pb3|txt)$";

    pub fn new(scheme: RotationScheme) -> Result<Self> {
        let source = match scheme {
            RotationScheme::Suffix => Self::SUFFIX_PATTERN,
            RotationScheme::DateSequence => Self::DATE_PATTERN,
        };
        let pattern = Regex::new(source)
            .map_err(|e| StorageError::Parameter(format!("file name pattern: {}", e)))?;
        Ok(FlightNaming { scheme, pattern })
    }

    pub fn scheme(&self) -> RotationScheme {
        self.scheme
    }

    pub fn file_name(&self, stream: Stream, key: FlightKey) -> String {
        format!("{}{}.{}", stream.prefix(), key, stream.extension())
    }

    /// Stream and key of a file name, if it belongs to a flight set.
    pub fn parse(&self, name: &str) -> Option<(Stream, FlightKey)> {
        let caps = self.pattern.captures(name)?;
        let stream = Stream::from_prefix(caps.get(1)?.as_str())?;
        let ext = caps.get(caps.len() - 1)?.as_str();
        if ext != stream.extension() {
            return None;
        }

        let key = match self.scheme {
            RotationScheme::Suffix => {
                let n: u8 = caps.get(2)?.as_str().parse().ok()?;
                FlightKey::Suffix(n)
            }
            RotationScheme::DateSequence => {
                let year: i32 = caps.get(2)?.as_str().parse().ok()?;
                let month: u32 = caps.get(3)?.as_str().parse().ok()?;
                let day: u32 = caps.get(4)?.as_str().parse().ok()?;
                let seq: u32 = caps.get(5)?.as_str().parse().ok()?;
                FlightKey::Dated {
                    date: NaiveDate::from_ymd_opt(year, month, day)?,
                    seq,
                }
            }
        };
        Some((stream, key))
    }
}
