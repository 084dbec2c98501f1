pub mod mqtt_handler;

// MODULES
pub mod acquisition;
pub mod diagnostics;
pub mod gps;
pub mod logger;
pub mod snapshot;

use serde::Serialize;

use crate::gps::GeoFix;

/// A position report as sent to the telemetry endpoint
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TelemetryDocument {
    pub latitude: f64,
    pub longitude: f64,
    /// Unix epoch, milliseconds
    pub timestamp: i64,
}

impl TelemetryDocument {
    /// Stamp a fix with the current time
    pub fn from_fix(fix: GeoFix) -> Self {
        Self {
            latitude: fix.latitude,
            longitude: fix.longitude,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Snapshot key holding the latest decoded latitude
pub const LATITUDE_KEY: &str = "LATITUDE";

/// Snapshot key holding the latest decoded longitude
pub const LONGITUDE_KEY: &str = "LONGITUDE";

/// the device telemetry topic of the ingestion endpoint
pub const DEFAULT_TOPIC: &str = "v1/devices/me/telemetry";
