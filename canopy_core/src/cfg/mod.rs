/*
    Configuration snapshots. Everything here is plain data loaded from
    JSON; a running controller only ever sees a complete, validated
    snapshot and gets a new one on reconfiguration.
*/
use crate::lock::ResourceKey;
use crate::util::StorageError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;
use strum_macros::{Display, EnumString};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError
{
    #[error("cannot read config {path}: {source}")]
    Io
    {
        path: PathBuf,
        #[source]
        source: std::io::Error
    },
    #[error("malformed config {path}: {source}")]
    Json
    {
        path: PathBuf,
        #[source]
        source: serde_json::Error
    },
    #[error("input {id}: period must be at least 0.001 seconds, got {period}")]
    InvalidPeriod { id: String, period: f64 },
    #[error("input {id}: {field} must be a non-negative number of seconds, got {value}")]
    InvalidDuration { id: String, field: &'static str, value: f64 },
    #[error("input {id}: edge detection needs a gpio pin")]
    EdgeWithoutGpio { id: String },
    #[error("input {0} is configured more than once")]
    DuplicateInput(String),
    #[error("conditional {id}: period must be a positive number of seconds, got {period}")]
    InvalidConditionalPeriod { id: String, period: f64 },
    #[error(transparent)]
    Storage(#[from] StorageError)
}

fn default_sample_rate() -> f64 { 0.1 }
fn default_lock_dir() -> PathBuf { PathBuf::from("/var/lock") }
fn default_lock_attempts() -> u32 { 600 }
fn default_lock_poll_ms() -> u64 { 100 }
fn default_store_path() -> PathBuf { PathBuf::from("measurements.jsonl") }
fn default_conditionals_path() -> PathBuf { PathBuf::from("conditionals.json") }
fn default_log_level() -> String { "info".to_string() }
fn default_retries() -> u32 { 3 }
fn default_retry_delay() -> f64 { 2.0 }
fn default_true() -> bool { true }

const MAX_SECONDS: f64 = 1.0e9;
/// Shortest polling period. Anything below would not advance the schedule.
pub const MIN_PERIOD: f64 = 0.001;

/// Seconds as a Duration. Anything not a positive finite number is zero,
/// absurdly large values are capped.
pub fn seconds(value: f64) -> Duration
{
    if value.is_finite() && value > 0.0
    {
        Duration::from_secs_f64(value.min(MAX_SECONDS))
    }
    else
    {
        Duration::from_secs(0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig
{
    /// Loop cadence in seconds.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,
    #[serde(default = "default_lock_attempts")]
    pub lock_attempts: u32,
    #[serde(default = "default_lock_poll_ms")]
    pub lock_poll_ms: u64,
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub inputs: Vec<InputChannelConfig>,
    #[serde(default = "default_conditionals_path")]
    pub conditionals_path: PathBuf
}

impl Default for DaemonConfig
{
    fn default() -> Self
    {
        DaemonConfig {
            sample_rate: default_sample_rate(),
            lock_dir: default_lock_dir(),
            lock_attempts: default_lock_attempts(),
            lock_poll_ms: default_lock_poll_ms(),
            store_path: default_store_path(),
            log_level: default_log_level(),
            inputs: Vec::new(),
            conditionals_path: default_conditionals_path()
        }
    }
}

impl DaemonConfig
{
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError>
    {
        let path = path.as_ref();
        let file = File::open(path)
                    .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        let cfg: DaemonConfig = serde_json::from_reader(BufReader::new(file))
                    .map_err(|source| ConfigError::Json { path: path.to_path_buf(), source })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError>
    {
        let mut seen = std::collections::HashSet::new();
        for input in self.inputs.iter()
        {
            if !seen.insert(input.unique_id.as_str())
            {
                return Err(ConfigError::DuplicateInput(input.unique_id.clone()));
            }
            input.validate()?;
        }
        Ok(())
    }

    pub fn sample_rate(&self) -> Duration
    {
        seconds(self.sample_rate)
    }

    pub fn lock_poll(&self) -> Duration
    {
        Duration::from_millis(self.lock_poll_ms)
    }

    pub fn input(&self, unique_id: &str) -> Option<&InputChannelConfig>
    {
        self.inputs.iter().find(|x| x.unique_id == unique_id)
    }
}

/// Which edge(s) an input or a conditional reacts to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EdgeDirection
{
    Rising,
    Falling,
    Both
}

impl EdgeDirection
{
    /// True if a conditional listening for `self` reacts to `detected`.
    pub fn matches(&self, detected: EdgeDirection) -> bool
    {
        *self == EdgeDirection::Both || *self == detected
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PreOutputConfig
{
    pub output_id: String,
    #[serde(default)]
    pub channel: u32,
    /// Seconds the output stays on before the read.
    #[serde(default)]
    pub duration: f64,
    /// Keep the output on for the whole read and switch it off afterwards.
    #[serde(default)]
    pub during_measure: bool
}

impl PreOutputConfig
{
    pub fn duration(&self) -> Duration
    {
        seconds(self.duration)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EdgeInputConfig
{
    pub edge: EdgeDirection,
    #[serde(default)]
    pub bouncetime_ms: u64,
    /// Debounce window in seconds.
    #[serde(default)]
    pub reset_period: f64
}

impl EdgeInputConfig
{
    pub fn reset_period(&self) -> Duration
    {
        seconds(self.reset_period)
    }

    pub fn bouncetime(&self) -> Duration
    {
        Duration::from_millis(self.bouncetime_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdcScalingConfig
{
    #[serde(default)]
    pub channel: u32,
    pub volts_min: f64,
    pub volts_max: f64,
    pub units_min: f64,
    pub units_max: f64,
    #[serde(default)]
    pub inverse_scale: bool,
    pub unit: String
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelUnit
{
    pub channel: u32,
    pub measurement: String,
    pub unit: String
}

/// # InputChannelConfig
/// Everything a controller needs to know about one input. Replaced as
/// a whole on reconfiguration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InputChannelConfig
{
    pub unique_id: String,
    #[serde(default)]
    pub name: String,
    /// Device type tag resolved through the driver registry.
    pub device: String,
    #[serde(default = "default_true")]
    pub is_activated: bool,
    /// Seconds between measurements.
    pub period: f64,
    #[serde(default)]
    pub start_offset: f64,
    #[serde(default)]
    pub pre_output: Option<PreOutputConfig>,
    #[serde(default)]
    pub resource: Option<ResourceKey>,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,
    #[serde(default)]
    pub gpio: Option<u8>,
    #[serde(default)]
    pub edge: Option<EdgeInputConfig>,
    #[serde(default)]
    pub adc: Option<AdcScalingConfig>,
    #[serde(default)]
    pub units: Vec<ChannelUnit>,
    /// Driver specific settings that the engine passes through untouched.
    #[serde(default)]
    pub options: BTreeMap<String, serde_json::Value>
}

impl InputChannelConfig
{
    pub fn new(unique_id: &str, device: &str, period: f64) -> Self
    {
        InputChannelConfig {
            unique_id: unique_id.to_string(),
            name: unique_id.to_string(),
            device: device.to_string(),
            is_activated: true,
            period,
            start_offset: 0.0,
            pre_output: None,
            resource: None,
            retries: default_retries(),
            retry_delay: default_retry_delay(),
            gpio: None,
            edge: None,
            adc: None,
            units: Vec::new(),
            options: BTreeMap::new()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError>
    {
        if !(self.period.is_finite() && self.period >= MIN_PERIOD)
        {
            return Err(ConfigError::InvalidPeriod { id: self.unique_id.clone(), period: self.period });
        }

        let durations = [
            ("start_offset", self.start_offset),
            ("retry_delay", self.retry_delay),
            ("pre_output.duration", self.pre_output.as_ref().map(|p| p.duration).unwrap_or(0.0)),
            ("edge.reset_period", self.edge.as_ref().map(|e| e.reset_period).unwrap_or(0.0)),
        ];
        for (field, value) in durations.iter()
        {
            if !(value.is_finite() && *value >= 0.0)
            {
                return Err(ConfigError::InvalidDuration { id: self.unique_id.clone(), field: *field, value: *value });
            }
        }

        if self.edge.is_some() && self.gpio.is_none()
        {
            return Err(ConfigError::EdgeWithoutGpio { id: self.unique_id.clone() });
        }
        Ok(())
    }

    pub fn period(&self) -> Duration
    {
        seconds(self.period)
    }

    pub fn start_offset(&self) -> Duration
    {
        seconds(self.start_offset)
    }

    pub fn retry_delay(&self) -> Duration
    {
        seconds(self.retry_delay)
    }

    pub fn display_name(&self) -> &str
    {
        if self.name.is_empty() { &self.unique_id } else { &self.name }
    }

    pub fn option_f64(&self, key: &str) -> Option<f64>
    {
        self.options.get(key).and_then(|v| v.as_f64())
    }

    pub fn option_str(&self, key: &str) -> Option<&str>
    {
        self.options.get(key).and_then(|v| v.as_str())
    }
}

/// For edge conditionals: react to the edge itself, or to the level the
/// line has when the edge is seen.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalSelect
{
    Edge,
    State { high: bool }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConditionalMode
{
    Periodic { period: f64 },
    Edge { signal_select: SignalSelect, edge_direction: EdgeDirection }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConditionalConfig
{
    pub unique_id: String,
    pub input_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub is_activated: bool,
    pub mode: ConditionalMode,
    /// Opaque reference handed to the action dispatcher on trigger.
    pub action: String
}

impl ConditionalConfig
{
    pub fn validate(&self) -> Result<(), ConfigError>
    {
        if let ConditionalMode::Periodic { period } = self.mode
        {
            if !(period.is_finite() && period > 0.0)
            {
                return Err(ConfigError::InvalidConditionalPeriod { id: self.unique_id.clone(), period });
            }
        }
        Ok(())
    }
}
