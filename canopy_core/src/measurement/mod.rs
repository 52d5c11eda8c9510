use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Channel index used for edge events of digital inputs.
pub const EDGE_CHANNEL: u32 = 0;
pub const EDGE_UNIT: &str = "edge";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Measurement
{
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>
}

impl Measurement
{
    pub fn new(value: f64, unit: &str, timestamp: DateTime<Utc>) -> Self
    {
        Measurement { value, unit: unit.to_string(), timestamp }
    }

    pub fn now(value: f64, unit: &str) -> Self
    {
        Self::new(value, unit, Utc::now())
    }
}

/// # MeasurementSet
/// The result of one successful acquisition: at most one measurement per
/// channel index. Produced by a driver and never changed afterwards.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSet
{
    channels: BTreeMap<u32, Measurement>
}

impl MeasurementSet
{
    pub fn new() -> Self
    {
        MeasurementSet { channels: BTreeMap::new() }
    }

    /// Builder style insert, replaces an existing entry for `channel`.
    pub fn with(mut self, channel: u32, measurement: Measurement) -> Self
    {
        self.insert(channel, measurement);
        self
    }

    pub fn insert(&mut self, channel: u32, measurement: Measurement)
    {
        self.channels.insert(channel, measurement);
    }

    pub fn get(&self, channel: u32) -> Option<&Measurement>
    {
        self.channels.get(&channel)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u32, &Measurement)>
    {
        self.channels.iter()
    }

    pub fn len(&self) -> usize
    {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.channels.is_empty()
    }

    /// The set recorded for an accepted edge: +1 for rising, -1 for falling.
    pub fn edge(rising: bool) -> Self
    {
        let value = if rising { 1.0 } else { -1.0 };
        MeasurementSet::new().with(EDGE_CHANNEL, Measurement::now(value, EDGE_UNIT))
    }
}
