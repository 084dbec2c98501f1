use std::{
    io::{self, BufRead, BufReader},
    ops::Range,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use serialport::SerialPort;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    mqtt_handler::TelemetryLink,
    snapshot::{MetricValue, Snapshot},
    TelemetryDocument, LATITUDE_KEY, LONGITUDE_KEY,
};

/// Shortest sentence that still reaches the longitude hemisphere byte
pub const SENTENCE_MIN_LEN: usize = 31;

const LAT_DEGREES: Range<usize> = 14..16;
const LAT_MINUTES: Range<usize> = 16..18;
const LAT_FRACTION: Range<usize> = 18..21;
const LAT_HEMISPHERE: usize = 21;
const LON_DEGREES: Range<usize> = 22..25;
const LON_MINUTES: Range<usize> = 25..27;
const LON_FRACTION: Range<usize> = 27..30;
const LON_HEMISPHERE: usize = 30;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DecodeError {
    #[error("malformed sentence ({len} bytes): {reason}")]
    Malformed { len: usize, reason: &'static str },

    #[error("{field} is not numeric: {text:?}")]
    NumericParse { field: &'static str, text: String },
}

#[derive(Debug, Error)]
pub enum GpsError {
    #[error("could not open GPS port {device}: {source}")]
    Open {
        device: String,
        #[source]
        source: serialport::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hemisphere {
    North,
    South,
    East,
    West,
}

impl Hemisphere {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'N' => Some(Hemisphere::North),
            b'S' => Some(Hemisphere::South),
            b'E' => Some(Hemisphere::East),
            b'W' => Some(Hemisphere::West),
            _ => None,
        }
    }

    fn is_latitude(&self) -> bool {
        matches!(self, Hemisphere::North | Hemisphere::South)
    }
}

/// How the hemisphere letter turns a coordinate magnitude into a signed value.
///
/// The receiver has historically been decoded two different ways and it is
/// still open which one downstream consumers expect, so the choice is explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SignPolicy {
    /// South and west are negative, north and east positive
    #[default]
    Hemispheric,
    /// Absolute value for north/south, east/west left as is. Every fix comes
    /// out non-negative, southern and western ones included.
    DashboardLegacy,
}

impl SignPolicy {
    pub fn apply(&self, magnitude: f64, hemisphere: Hemisphere) -> f64 {
        match self {
            SignPolicy::Hemispheric => match hemisphere {
                Hemisphere::South | Hemisphere::West => -magnitude,
                Hemisphere::North | Hemisphere::East => magnitude,
            },
            SignPolicy::DashboardLegacy => match hemisphere {
                Hemisphere::North | Hemisphere::South => magnitude.abs(),
                Hemisphere::East | Hemisphere::West => magnitude,
            },
        }
    }
}

/// One decoded position, decimal degrees
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoFix {
    pub latitude: f64,
    pub longitude: f64,
}

/// degrees + (minutes + fraction/1000) / 60, signed per `policy`
pub fn to_decimal(
    degrees: u32,
    minutes: u32,
    fraction: u32,
    hemisphere: Hemisphere,
    policy: SignPolicy,
) -> f64 {
    let minutes = minutes as f64 + fraction as f64 / 1000.0;
    policy.apply(degrees as f64 + minutes / 60.0, hemisphere)
}

/// Cheap pre-filter, a sentence worth decoding names both a N/S and an E/W hemisphere
pub fn is_candidate(line: &str) -> bool {
    line.contains(['N', 'S']) && line.contains(['E', 'W'])
}

/// Decode the fixed-width coordinate sentence the deployed receiver emits.
///
/// Fields are taken at fixed byte offsets from the start of the line, the
/// sentence's own comma delimiters are not parsed.
pub fn decode(line: &str, policy: SignPolicy) -> Result<GeoFix, DecodeError> {
    let bytes = line.as_bytes();
    if bytes.len() < SENTENCE_MIN_LEN {
        return Err(DecodeError::Malformed {
            len: bytes.len(),
            reason: "shorter than the fixed coordinate layout",
        });
    }

    let lat_hemisphere = Hemisphere::from_byte(bytes[LAT_HEMISPHERE])
        .filter(Hemisphere::is_latitude)
        .ok_or(DecodeError::Malformed {
            len: bytes.len(),
            reason: "no N/S marker after the latitude",
        })?;
    let lon_hemisphere = Hemisphere::from_byte(bytes[LON_HEMISPHERE])
        .filter(|h| !h.is_latitude())
        .ok_or(DecodeError::Malformed {
            len: bytes.len(),
            reason: "no E/W marker after the longitude",
        })?;

    let latitude = to_decimal(
        numeric_field(bytes, LAT_DEGREES, "latitude degrees")?,
        numeric_field(bytes, LAT_MINUTES, "latitude minutes")?,
        numeric_field(bytes, LAT_FRACTION, "latitude fraction")?,
        lat_hemisphere,
        policy,
    );
    let longitude = to_decimal(
        numeric_field(bytes, LON_DEGREES, "longitude degrees")?,
        numeric_field(bytes, LON_MINUTES, "longitude minutes")?,
        numeric_field(bytes, LON_FRACTION, "longitude fraction")?,
        lon_hemisphere,
        policy,
    );

    Ok(GeoFix {
        latitude,
        longitude,
    })
}

fn numeric_field(
    bytes: &[u8],
    range: Range<usize>,
    field: &'static str,
) -> Result<u32, DecodeError> {
    let raw = &bytes[range];
    std::str::from_utf8(raw)
        .ok()
        .and_then(|text| text.trim().parse::<u32>().ok())
        .ok_or_else(|| DecodeError::NumericParse {
            field,
            text: String::from_utf8_lossy(raw).into_owned(),
        })
}

/// A byte stream carrying GPS sentences
pub trait GpsSource: Send {
    /// Bytes that can be read right now without waiting on the device
    fn bytes_available(&mut self) -> io::Result<usize>;

    /// Append one raw line (newline included, if any) to `buf`, returning the byte count
    fn read_raw_line(&mut self, buf: &mut Vec<u8>) -> io::Result<usize>;
}

/// Opens the GPS source for a session
pub trait GpsOpener: Send + Sync {
    fn open(&self) -> Result<Box<dyn GpsSource>, GpsError>;
}

/// Serial port settings for the receiver
#[derive(Debug, Clone)]
pub struct GpsOptions {
    pub device: String,
    pub baud_rate: u32,
    pub read_timeout: Duration,
}

impl Default for GpsOptions {
    fn default() -> Self {
        Self {
            device: "/dev/ttyUSB0".to_string(),
            baud_rate: 4800,
            read_timeout: Duration::from_secs(1),
        }
    }
}

impl GpsOpener for GpsOptions {
    fn open(&self) -> Result<Box<dyn GpsSource>, GpsError> {
        Ok(Box::new(SerialGps::open(self)?))
    }
}

pub struct SerialGps {
    reader: BufReader<Box<dyn SerialPort>>,
}

impl SerialGps {
    pub fn open(opts: &GpsOptions) -> Result<Self, GpsError> {
        let port = serialport::new(opts.device.as_str(), opts.baud_rate)
            .timeout(opts.read_timeout)
            .open()
            .map_err(|source| GpsError::Open {
                device: opts.device.clone(),
                source,
            })?;
        debug!("Opened GPS port {} at {} baud", opts.device, opts.baud_rate);
        Ok(Self {
            reader: BufReader::new(port),
        })
    }
}

impl GpsSource for SerialGps {
    fn bytes_available(&mut self) -> io::Result<usize> {
        let pending = self
            .reader
            .get_ref()
            .bytes_to_read()
            .map_err(io::Error::from)?;
        Ok(self.reader.buffer().len() + pending as usize)
    }

    fn read_raw_line(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        self.reader.read_until(b'\n', buf)
    }
}

/// Splits a [`GpsSource`] into sentences.
///
/// A read that times out halfway through a line leaves the bytes it got in
/// `pending`, the next read completes that line instead of starting a new one.
pub struct GpsReader {
    source: Box<dyn GpsSource>,
    pending: Vec<u8>,
}

impl GpsReader {
    pub fn new(source: Box<dyn GpsSource>) -> Self {
        Self {
            source,
            pending: Vec::with_capacity(82),
        }
    }

    pub fn bytes_available(&mut self) -> io::Result<usize> {
        self.source.bytes_available()
    }

    /// Read one sentence, `None` at end of stream.
    /// Non-ASCII bytes become U+FFFD and surrounding whitespace is dropped.
    pub fn read_sentence(&mut self) -> io::Result<Option<String>> {
        self.source.read_raw_line(&mut self.pending)?;
        if self.pending.is_empty() {
            return Ok(None);
        }
        let line: String = self
            .pending
            .drain(..)
            .map(|b| {
                if b.is_ascii() {
                    b as char
                } else {
                    char::REPLACEMENT_CHARACTER
                }
            })
            .collect();
        Ok(Some(line.trim().to_string()))
    }
}

/// Running counters for one session's GPS activity
#[derive(Debug, Clone, Default)]
pub struct GpsStats {
    lines: Arc<AtomicU64>,
    fixes: Arc<AtomicU64>,
    skipped: Arc<AtomicU64>,
}

impl GpsStats {
    /// Sentences read from the receiver
    pub fn lines(&self) -> u64 {
        self.lines.load(Ordering::Relaxed)
    }

    /// Sentences decoded into a fix
    pub fn fixes(&self) -> u64 {
        self.fixes.load(Ordering::Relaxed)
    }

    /// Candidate sentences that failed to decode
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

/// Result of one poll cycle
#[derive(Debug, Clone, PartialEq)]
pub enum GpsPoll {
    /// nothing waiting on the port
    Idle,
    /// a line without both hemisphere markers
    Ignored,
    Skipped(DecodeError),
    Fix(GeoFix),
}

/// Everything a decoded fix is pushed into
pub struct GpsPipeline {
    pub policy: SignPolicy,
    pub snapshot: Snapshot,
    pub link: Option<Arc<dyn TelemetryLink>>,
    pub topic: String,
    pub stats: GpsStats,
}

impl GpsPipeline {
    /// Check the port and, if anything is waiting, handle one sentence
    pub fn poll_once(&self, reader: &mut GpsReader) -> io::Result<GpsPoll> {
        if reader.bytes_available()? == 0 {
            return Ok(GpsPoll::Idle);
        }
        match reader.read_sentence()? {
            Some(line) => Ok(self.handle_sentence(&line)),
            None => Ok(GpsPoll::Idle),
        }
    }

    pub fn handle_sentence(&self, line: &str) -> GpsPoll {
        self.stats.lines.fetch_add(1, Ordering::Relaxed);
        trace!("Received GPS sentence {line:?}");
        if !is_candidate(line) {
            return GpsPoll::Ignored;
        }

        let fix = match decode(line, self.policy) {
            Ok(fix) => fix,
            Err(err) => {
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                warn!("Skipping GPS sentence {line:?}: {err}");
                return GpsPoll::Skipped(err);
            }
        };
        self.stats.fixes.fetch_add(1, Ordering::Relaxed);
        info!("Latitude: {:.5}, Longitude: {:.5}", fix.latitude, fix.longitude);

        self.snapshot.set_many([
            (LATITUDE_KEY, MetricValue::Scalar(fix.latitude)),
            (LONGITUDE_KEY, MetricValue::Scalar(fix.longitude)),
        ]);

        match &self.link {
            Some(link) => {
                let document = TelemetryDocument::from_fix(fix);
                if let Err(err) = link.publish(&self.topic, &document) {
                    warn!("Could not publish GPS fix: {err}");
                }
            }
            None => trace!("Telemetry channel unavailable, fix not published"),
        }
        GpsPoll::Fix(fix)
    }
}

/// polls the receiver on a fixed period, decodes and publishes fixes
pub async fn gps_manager(
    cancel_token: CancellationToken,
    source: Box<dyn GpsSource>,
    pipeline: GpsPipeline,
    poll_interval: Duration,
) {
    let pipeline = Arc::new(pipeline);
    let mut reader = GpsReader::new(source);
    // a zero period makes tokio's interval panic
    let mut ticker = tokio::time::interval(poll_interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                debug!("Quitting GPS handler");
                break;
            },
            _ = ticker.tick() => {}
        }

        // serial reads block for up to the port timeout, keep them off the async workers
        let worker = pipeline.clone();
        let (returned, res) = match tokio::task::spawn_blocking(move || {
            let res = worker.poll_once(&mut reader);
            (reader, res)
        })
        .await
        {
            Ok(done) => done,
            Err(err) => {
                warn!("GPS read task failed, disabling GPS for this session: {err}");
                break;
            }
        };
        reader = returned;

        match res {
            Ok(_) => {}
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                trace!("GPS read timed out: {err}");
            }
            Err(err) => {
                warn!("Error reading GPS, disabling GPS for this session: {err}");
                break;
            }
        }
    }
    // dropping the reader closes the port
}
