//! Boundary to the on-board diagnostics collaborator.
//!
//! The OBD protocol itself lives outside this crate. A collaborator is told
//! which metrics to watch and pushes every sample it reads into a
//! [`SampleSink`], from whatever thread or task it runs its own polling on.
//! The acquisition loop drains the other end of that queue.

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{trace, warn};

use crate::snapshot::MetricValue;

/// The OBD-II commands the daemon watches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    Rpm,
    Speed,
    EngineLoad,
    RunTime,
    CoolantTemp,
    IntakeTemp,
    AmbiantAirTemp,
    CatalystTempB1S1,
    OilTemp,
    FuelLevel,
    FuelRate,
    FuelPressure,
    EthanolPercent,
    IntakePressure,
    BarometricPressure,
    Maf,
}

impl Metric {
    pub const ALL: [Metric; 16] = [
        Metric::Rpm,
        Metric::Speed,
        Metric::EngineLoad,
        Metric::RunTime,
        Metric::CoolantTemp,
        Metric::IntakeTemp,
        Metric::AmbiantAirTemp,
        Metric::CatalystTempB1S1,
        Metric::OilTemp,
        Metric::FuelLevel,
        Metric::FuelRate,
        Metric::FuelPressure,
        Metric::EthanolPercent,
        Metric::IntakePressure,
        Metric::BarometricPressure,
        Metric::Maf,
    ];

    /// Command name, also used as the snapshot key and in the log
    pub fn name(&self) -> &'static str {
        match self {
            Metric::Rpm => "RPM",
            Metric::Speed => "SPEED",
            Metric::EngineLoad => "ENGINE_LOAD",
            Metric::RunTime => "RUN_TIME",
            Metric::CoolantTemp => "COOLANT_TEMP",
            Metric::IntakeTemp => "INTAKE_TEMP",
            Metric::AmbiantAirTemp => "AMBIANT_AIR_TEMP",
            Metric::CatalystTempB1S1 => "CATALYST_TEMP_B1S1",
            Metric::OilTemp => "OIL_TEMP",
            Metric::FuelLevel => "FUEL_LEVEL",
            Metric::FuelRate => "FUEL_RATE",
            Metric::FuelPressure => "FUEL_PRESSURE",
            Metric::EthanolPercent => "ETHANOL_PERCENT",
            Metric::IntakePressure => "INTAKE_PRESSURE",
            Metric::BarometricPressure => "BAROMETRIC_PRESSURE",
            Metric::Maf => "MAF",
        }
    }

    /// Unit the dashboard labels this metric with
    pub fn display_unit(&self) -> &'static str {
        match self {
            Metric::Rpm => "rpm",
            Metric::Speed => "km/h",
            Metric::RunTime => "s",
            Metric::Maf => "g/s",
            Metric::FuelRate => "L/h",
            Metric::EngineLoad | Metric::FuelLevel | Metric::EthanolPercent => "%",
            Metric::FuelPressure | Metric::IntakePressure | Metric::BarometricPressure => "kPa",
            Metric::CoolantTemp
            | Metric::IntakeTemp
            | Metric::AmbiantAirTemp
            | Metric::CatalystTempB1S1
            | Metric::OilTemp => "°C",
        }
    }
}

/// One sample as read from the vehicle
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticResponse {
    pub command: Metric,
    /// `None` when the vehicle answered without data
    pub value: Option<MetricValue>,
}

impl DiagnosticResponse {
    pub fn new(command: Metric, value: MetricValue) -> Self {
        Self {
            command,
            value: Some(value),
        }
    }

    pub fn null(command: Metric) -> Self {
        Self {
            command,
            value: None,
        }
    }

    pub fn is_null(&self) -> bool {
        self.value.is_none()
    }
}

/// Where a collaborator pushes samples. Cheap to clone, never blocks.
#[derive(Debug, Clone)]
pub struct SampleSink {
    tx: mpsc::Sender<DiagnosticResponse>,
}

impl SampleSink {
    pub fn new(tx: mpsc::Sender<DiagnosticResponse>) -> Self {
        Self { tx }
    }

    /// Queue a sample, returns false if it was dropped
    pub fn deliver(&self, response: DiagnosticResponse) -> bool {
        match self.tx.try_send(response) {
            Ok(()) => true,
            Err(TrySendError::Full(response)) => {
                warn!(
                    "Diagnostics queue full, dropping {} sample",
                    response.command.name()
                );
                false
            }
            Err(TrySendError::Closed(response)) => {
                trace!(
                    "Session over, discarding {} sample",
                    response.command.name()
                );
                false
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum DiagnosticsError {
    #[error("diagnostics interface unavailable: {0}")]
    Unavailable(String),
}

/// An OBD interface that reports samples on its own schedule
pub trait Diagnostics: Send {
    /// Whether the connected vehicle answers this command
    fn supports(&self, metric: Metric) -> bool;

    /// Deliver every future sample of `metric` to `sink`
    fn watch(&mut self, metric: Metric, sink: SampleSink);

    /// Drop every watch, the next session registers its own
    fn unwatch_all(&mut self);

    /// Start the background sampling
    fn start(&mut self) -> Result<(), DiagnosticsError>;

    fn stop(&mut self);
}

/// Stand-in when no OBD interface is present, every metric reads as unsupported
#[derive(Debug, Default)]
pub struct NoDiagnostics;

impl Diagnostics for NoDiagnostics {
    fn supports(&self, _metric: Metric) -> bool {
        false
    }

    fn watch(&mut self, _metric: Metric, _sink: SampleSink) {}

    fn unwatch_all(&mut self) {}

    fn start(&mut self) -> Result<(), DiagnosticsError> {
        Ok(())
    }

    fn stop(&mut self) {}
}
