//! Structured waveform data decoded from a value change dump.
//!
//! A [`WaveformData`] maps each dump alias (the short identifier code the
//! dump uses in place of a signal's name) to a [`Signal`] holding its
//! declared type, name, width and value trace. Values are built once through
//! [`WaveformBuilder`] and are read-only afterwards.

pub mod vcd;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Declared type of a dumped variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerilogDataType {
    /// `wire`, also used for unrecognized type keywords.
    Wire,
    /// `reg`
    Reg,
    /// `input`
    Input,
    /// `output`
    Output,
    /// `inout`
    Inout,
    /// `integer`
    Integer,
    /// `real`
    Real,
    /// `time`
    Time,
    /// `realtime`
    Realtime,
    /// `event`
    Event,
    /// `supply0`
    Supply0,
    /// `supply1`
    Supply1,
}

impl VerilogDataType {
    /// Map a `$var` type keyword, falling back to [`Wire`](Self::Wire).
    #[must_use]
    pub fn from_keyword(keyword: &str) -> Self {
        match keyword {
            "wire" => Self::Wire,
            "reg" => Self::Reg,
            "input" => Self::Input,
            "output" => Self::Output,
            "inout" => Self::Inout,
            "integer" => Self::Integer,
            "real" => Self::Real,
            "time" => Self::Time,
            "realtime" => Self::Realtime,
            "event" => Self::Event,
            "supply0" => Self::Supply0,
            "supply1" => Self::Supply1,
            _ => Self::Wire,
        }
    }
}

/// Unit of the dump timescale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    /// Seconds.
    S,
    /// Milliseconds.
    Ms,
    /// Microseconds.
    Us,
    /// Nanoseconds.
    Ns,
    /// Picoseconds.
    Ps,
    /// Femtoseconds.
    Fs,
}

impl TimeUnit {
    /// Parse a unit token (case-insensitive), falling back to nanoseconds.
    #[must_use]
    pub fn from_token(token: &str) -> Self {
        match token.to_ascii_lowercase().as_str() {
            "s" => Self::S,
            "ms" => Self::Ms,
            "us" => Self::Us,
            "ns" => Self::Ns,
            "ps" => Self::Ps,
            "fs" => Self::Fs,
            _ => Self::Ns,
        }
    }

    /// Length of one unit in femtoseconds.
    #[must_use]
    pub const fn femtoseconds(self) -> u64 {
        match self {
            Self::S => 1_000_000_000_000_000,
            Self::Ms => 1_000_000_000_000,
            Self::Us => 1_000_000_000,
            Self::Ns => 1_000_000,
            Self::Ps => 1_000,
            Self::Fs => 1,
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = match self {
            Self::S => "s",
            Self::Ms => "ms",
            Self::Us => "us",
            Self::Ns => "ns",
            Self::Ps => "ps",
            Self::Fs => "fs",
        };
        f.write_str(unit)
    }
}

/// Invalid signal declarations or value insertions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalError {
    /// The signal name was empty or whitespace.
    #[error("signal name cannot be empty")]
    EmptyName,
    /// The signal width was zero.
    #[error("signal width must be positive")]
    InvalidWidth,
    /// A value was inserted at a negative time.
    #[error("time {0} is negative")]
    NegativeTime(i64),
    /// A value already exists at this time.
    #[error("a value is already recorded at time {0}")]
    DuplicateTime(u64),
    /// A value was inserted before the last recorded time.
    #[error("time {time} is before the last recorded time {last}")]
    OutOfOrder {
        /// Rejected time.
        time: u64,
        /// Last recorded time.
        last: u64,
    },
}

/// A dumped signal and its value trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SignalRecord")]
pub struct Signal {
    kind: VerilogDataType,
    name: String,
    width: u32,
    trace: BTreeMap<u64, u64>,
}

/// Serialized form of [`Signal`], checked on the way in.
#[derive(Deserialize)]
struct SignalRecord {
    kind: VerilogDataType,
    name: String,
    width: u32,
    #[serde(default)]
    trace: BTreeMap<u64, u64>,
}

impl TryFrom<SignalRecord> for Signal {
    type Error = SignalError;

    fn try_from(record: SignalRecord) -> Result<Self, Self::Error> {
        let mut signal = Signal::new(record.kind, &record.name, record.width)?;
        signal.trace = record.trace;
        Ok(signal)
    }
}

impl Signal {
    /// Declare a signal. The name is trimmed.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty or the width is zero.
    pub fn new(kind: VerilogDataType, name: &str, width: u32) -> Result<Self, SignalError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SignalError::EmptyName);
        }
        if width == 0 {
            return Err(SignalError::InvalidWidth);
        }
        Ok(Self {
            kind,
            name: name.to_string(),
            width,
            trace: BTreeMap::new(),
        })
    }

    /// Declared type.
    #[must_use]
    pub fn kind(&self) -> VerilogDataType {
        self.kind
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared bit width.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Record `value` at `time`.
    ///
    /// Times must be non-negative and strictly increasing.
    ///
    /// # Errors
    ///
    /// Returns an error for a negative, duplicate, or earlier time.
    pub fn push(&mut self, time: i64, value: u64) -> Result<(), SignalError> {
        let time = u64::try_from(time).map_err(|_| SignalError::NegativeTime(time))?;
        if let Some((&last, _)) = self.trace.last_key_value() {
            if time == last {
                return Err(SignalError::DuplicateTime(time));
            }
            if time < last {
                return Err(SignalError::OutOfOrder { time, last });
            }
        }
        self.trace.insert(time, value);
        Ok(())
    }

    /// `(time, value)` pairs in time order.
    pub fn trace(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.trace.iter().map(|(&t, &v)| (t, v))
    }

    /// Value in effect at `time`: the last change at or before it.
    #[must_use]
    pub fn value_at(&self, time: u64) -> Option<u64> {
        self.trace.range(..=time).next_back().map(|(_, &v)| v)
    }

    /// Number of recorded changes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.trace.len()
    }

    /// True if no change was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trace.is_empty()
    }
}

/// Invalid waveform construction steps.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaveformError {
    /// The alias was empty or whitespace.
    #[error("signal id cannot be empty")]
    EmptySignalId,
    /// A signal is already registered under this alias.
    #[error("signal id '{0}' is already registered")]
    DuplicateSignalId(String),
    /// No signal is registered under this alias.
    #[error("signal id '{0}' not found")]
    SignalNotFound(String),
    /// The signal rejected the value.
    #[error("signal '{id}': {source}")]
    Signal {
        /// Alias of the signal.
        id: String,
        /// Underlying violation.
        #[source]
        source: SignalError,
    },
}

/// Decoded waveform: timescale plus signals keyed by dump alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WaveformRecord")]
pub struct WaveformData {
    time_unit: TimeUnit,
    time_scale: u64,
    signals: BTreeMap<String, Signal>,
}

#[derive(Deserialize)]
struct WaveformRecord {
    time_unit: TimeUnit,
    time_scale: u64,
    #[serde(default)]
    signals: BTreeMap<String, Signal>,
}

impl TryFrom<WaveformRecord> for WaveformData {
    type Error = WaveformError;

    fn try_from(record: WaveformRecord) -> Result<Self, Self::Error> {
        let mut builder = WaveformData::builder(record.time_unit, record.time_scale);
        for (id, signal) in record.signals {
            builder.add_signal(&id, signal)?;
        }
        Ok(builder.build())
    }
}

impl WaveformData {
    /// Start building a waveform with the given timescale.
    #[must_use]
    pub fn builder(time_unit: TimeUnit, time_scale: u64) -> WaveformBuilder {
        WaveformBuilder {
            data: WaveformData {
                time_unit,
                time_scale,
                signals: BTreeMap::new(),
            },
        }
    }

    /// Timescale unit.
    #[must_use]
    pub fn time_unit(&self) -> TimeUnit {
        self.time_unit
    }

    /// Timescale multiplier; 0 when the dump declared none.
    #[must_use]
    pub fn time_scale(&self) -> u64 {
        self.time_scale
    }

    /// Length of one dump time step in femtoseconds.
    #[must_use]
    pub fn time_unit_femtoseconds(&self) -> u64 {
        self.time_unit.femtoseconds().saturating_mul(self.time_scale)
    }

    /// Signal registered under `id`.
    #[must_use]
    pub fn signal(&self, id: &str) -> Option<&Signal> {
        self.signals.get(id)
    }

    /// First signal whose display name is `name`, with its alias.
    #[must_use]
    pub fn signal_by_name(&self, name: &str) -> Option<(&str, &Signal)> {
        self.signals
            .iter()
            .find(|(_, s)| s.name == name)
            .map(|(id, s)| (id.as_str(), s))
    }

    /// All signals, ordered by alias.
    pub fn signals(&self) -> impl Iterator<Item = (&str, &Signal)> + '_ {
        self.signals.iter().map(|(id, s)| (id.as_str(), s))
    }

    /// Number of registered signals.
    #[must_use]
    pub fn len(&self) -> usize {
        self.signals.len()
    }

    /// True if no signal is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }
}

/// Builder for [`WaveformData`].
#[derive(Debug, Clone)]
pub struct WaveformBuilder {
    data: WaveformData,
}

impl WaveformBuilder {
    /// Register `signal` under `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if `id` is empty or already registered.
    pub fn add_signal(&mut self, id: &str, signal: Signal) -> Result<(), WaveformError> {
        if id.trim().is_empty() {
            return Err(WaveformError::EmptySignalId);
        }
        if self.data.signals.contains_key(id) {
            return Err(WaveformError::DuplicateSignalId(id.to_string()));
        }
        self.data.signals.insert(id.to_string(), signal);
        Ok(())
    }

    /// True if a signal is registered under `id`.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.data.signals.contains_key(id)
    }

    /// Declared width of the signal under `id`.
    #[must_use]
    pub fn width_of(&self, id: &str) -> Option<u32> {
        self.data.signals.get(id).map(Signal::width)
    }

    /// Record `value` at `time` on the signal under `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if `id` is unknown or the signal rejects the value.
    pub fn add_value(&mut self, id: &str, time: i64, value: u64) -> Result<(), WaveformError> {
        let signal = self
            .data
            .signals
            .get_mut(id)
            .ok_or_else(|| WaveformError::SignalNotFound(id.to_string()))?;
        signal.push(time, value).map_err(|source| WaveformError::Signal {
            id: id.to_string(),
            source,
        })
    }

    /// Finish building.
    #[must_use]
    pub fn build(self) -> WaveformData {
        self.data
    }
}
