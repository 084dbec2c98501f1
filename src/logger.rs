use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, FixedOffset, Local, Utc};
use thiserror::Error;
use tracing::debug;

use crate::snapshot::MetricValue;

/// Column names written as the first row of every session file
pub const HEADER: [&str; 4] = ["Timestamp", "Command", "Value", "Units"];

#[derive(Debug, Error)]
pub enum LogError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not write row: {0}")]
    Csv(#[from] csv::Error),
}

/// Wall clock used for file names and row timestamps
#[derive(Debug, Clone, Copy, Default)]
pub enum LogClock {
    /// the host's configured zone
    #[default]
    Local,
    Fixed(FixedOffset),
}

impl LogClock {
    pub fn now(&self) -> DateTime<FixedOffset> {
        match self {
            LogClock::Local => Local::now().fixed_offset(),
            LogClock::Fixed(offset) => Utc::now().with_timezone(offset),
        }
    }
}

/// One diagnostic reading as written to disk
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub timestamp: DateTime<FixedOffset>,
    pub metric: String,
    pub value: MetricValue,
}

impl Observation {
    pub fn unit(&self) -> &str {
        self.value.unit()
    }
}

/// Append-only CSV record of a single monitoring session.
///
/// The file is opened and closed on every append, so a crash loses at most
/// the row being written.
#[derive(Debug)]
pub struct ObservationLog {
    path: PathBuf,
}

impl ObservationLog {
    /// Create a fresh session file under `dir` and write the header row.
    /// An existing file is never reused, a numeric suffix is added instead.
    pub fn open(
        dir: impl AsRef<Path>,
        session_start: DateTime<FixedOffset>,
    ) -> Result<ObservationLog, LogError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|source| LogError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let stem = format!(
            "vehicle-data-{}",
            session_start.format("%y-%m-%d-%H-%M-%S")
        );
        let (path, file) = create_unique(dir, &stem)?;

        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(HEADER)?;
        writer.flush().map_err(|source| LogError::Io {
            path: path.clone(),
            source,
        })?;

        debug!("Logging observations to {}", path.display());
        Ok(ObservationLog { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one row
    pub fn append(&self, observation: &Observation) -> Result<(), LogError> {
        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|source| LogError::Io {
                path: self.path.clone(),
                source,
            })?;

        let timestamp = observation.timestamp.format("%Y-%m-%d %H:%M:%S").to_string();
        let value = observation.value.magnitude().to_string();

        let mut writer = csv::Writer::from_writer(file);
        writer.write_record([
            timestamp.as_str(),
            observation.metric.as_str(),
            value.as_str(),
            observation.unit(),
        ])?;
        writer.flush().map_err(|source| LogError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

fn create_unique(dir: &Path, stem: &str) -> Result<(PathBuf, File), LogError> {
    let mut attempt = 0u32;
    loop {
        let name = match attempt {
            0 => format!("{stem}.csv"),
            n => format!("{stem}-{n}.csv"),
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
            Err(source) => return Err(LogError::Io { path, source }),
        }
    }
}
