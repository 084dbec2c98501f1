use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

/// A single diagnostic or positional reading.
///
/// Diagnostic collaborators report either bare numbers or a magnitude with a
/// unit attached, so both shapes are kept explicitly.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Scalar(f64),
    Quantity(f64, String),
}

impl MetricValue {
    /// The numeric part of the reading
    pub fn magnitude(&self) -> f64 {
        match self {
            MetricValue::Scalar(v) => *v,
            MetricValue::Quantity(v, _) => *v,
        }
    }

    /// The unit, empty for scalars
    pub fn unit(&self) -> &str {
        match self {
            MetricValue::Scalar(_) => "",
            MetricValue::Quantity(_, unit) => unit,
        }
    }

    /// Text shown on the dashboard: coordinates and other scalars get 5 decimals,
    /// quantities get 1.
    pub fn display(&self) -> String {
        match self {
            MetricValue::Scalar(v) => format!("{v:.5}"),
            MetricValue::Quantity(v, _) => format!("{v:.1}"),
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Scalar(v) => write!(f, "{v}"),
            MetricValue::Quantity(v, unit) if unit.is_empty() => write!(f, "{v}"),
            MetricValue::Quantity(v, unit) => write!(f, "{v} {unit}"),
        }
    }
}

/// Latest value per metric name for one monitoring session.
///
/// Written by the GPS poll task (`LATITUDE`/`LONGITUDE`) and the diagnostics
/// consumer (named OBD metrics), read by the dashboard. A single lock guards
/// the whole map, so `get_all` always sees every key either before or after a
/// write, never halfway.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    inner: Arc<Mutex<HashMap<String, MetricValue>>>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: MetricValue) {
        self.lock().insert(key.into(), value);
    }

    /// Insert every entry under one lock, readers see all of them or none
    pub fn set_many<K: Into<String>>(&self, entries: impl IntoIterator<Item = (K, MetricValue)>) {
        let mut map = self.lock();
        for (key, value) in entries {
            map.insert(key.into(), value);
        }
    }

    pub fn get(&self, key: &str) -> Option<MetricValue> {
        self.lock().get(key).cloned()
    }

    /// Coherent copy of every entry
    pub fn get_all(&self) -> HashMap<String, MetricValue> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // a panicking writer can only have been between whole inserts, the map itself is intact
    fn lock(&self) -> MutexGuard<'_, HashMap<String, MetricValue>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
