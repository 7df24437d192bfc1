use std::fmt;

use serde::{Serialize, Serializer};

/// A metric value.
///
/// Counters scraped from a statistics source are always integers, but Carbon itself stores every datapoint as a
/// float, so both representations are accepted on the wire.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MetricValue {
    /// An integer value.
    Integer(i64),

    /// A floating-point value.
    Float(f64),
}

impl From<i64> for MetricValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(value) => write!(f, "{}", value),
            Self::Float(value) => write!(f, "{}", value),
        }
    }
}

impl Serialize for MetricValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Integer(value) => serializer.serialize_i64(*value),
            Self::Float(value) => serializer.serialize_f64(*value),
        }
    }
}

/// A single timestamped measurement.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricRecord {
    name: String,
    timestamp: i64,
    value: MetricValue,
}

impl MetricRecord {
    /// Creates a new `MetricRecord`.
    pub fn new<N, V>(name: N, timestamp: i64, value: V) -> Self
    where
        N: Into<String>,
        V: Into<MetricValue>,
    {
        Self {
            name: name.into(),
            timestamp,
            value: value.into(),
        }
    }

    /// Returns the dot-delimited metric name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the timestamp of the measurement, in seconds since the Unix epoch.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Returns the measured value.
    pub fn value(&self) -> MetricValue {
        self.value
    }
}

// Carbon expects each datapoint as `(name, (timestamp, value))`.
impl Serialize for MetricRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.name, (self.timestamp, self.value)).serialize(serializer)
    }
}

/// An ordered set of metrics produced by a single poll cycle.
///
/// Every record in a batch shares the batch timestamp, which is captured once when the cycle begins.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricBatch {
    timestamp: i64,
    records: Vec<MetricRecord>,
}

impl MetricBatch {
    /// Creates an empty batch for the given cycle timestamp.
    pub fn new(timestamp: i64) -> Self {
        Self {
            timestamp,
            records: Vec::new(),
        }
    }

    /// Appends a metric to the batch, stamped with the batch timestamp.
    pub fn push<N, V>(&mut self, name: N, value: V)
    where
        N: Into<String>,
        V: Into<MetricValue>,
    {
        self.records.push(MetricRecord::new(name, self.timestamp, value));
    }

    /// Returns the batch timestamp.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Returns the records in the batch, in insertion order.
    pub fn records(&self) -> &[MetricRecord] {
        &self.records
    }

    /// Returns the number of records in the batch.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if the batch holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Finds the first record with the given name.
    pub fn get(&self, name: &str) -> Option<&MetricRecord> {
        self.records.iter().find(|record| record.name == name)
    }

    /// Consumes the batch and returns the records.
    pub fn into_records(self) -> Vec<MetricRecord> {
        self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_stamps_every_record() {
        let mut batch = MetricBatch::new(1_700_000_000);
        batch.push("dns.ns1.memory.TotalUse", 2048);
        batch.push("dns.ns1.memory.InUse", 1024);
        batch.push("dns.ns1.memory.Ratio", 0.5);

        assert_eq!(batch.len(), 3);
        assert!(batch.records().iter().all(|r| r.timestamp() == 1_700_000_000));
        assert_eq!(batch.get("dns.ns1.memory.Ratio").map(|r| r.value()), Some(MetricValue::Float(0.5)));
    }

    #[test]
    fn duplicate_names_are_kept() {
        let mut batch = MetricBatch::new(10);
        batch.push("a.b", 1);
        batch.push("a.b", 2);

        let values = batch.into_records().into_iter().map(|r| r.value()).collect::<Vec<_>>();
        assert_eq!(values, vec![MetricValue::Integer(1), MetricValue::Integer(2)]);
    }
}
