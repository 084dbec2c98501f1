//! Monitoring session lifecycle.
//!
//! `Idle -> Starting -> Running -> Stopping -> Idle`
//!
//! A running session owns three activities: the GPS poll task, the diagnostics
//! sample consumer and the telemetry network loop. The first two only meet at
//! the [`Snapshot`]. Every `start` opens a new log file and a new snapshot,
//! every `stop` joins all of the session's tasks before returning.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use thiserror::Error;
use tokio::sync::mpsc::{self, Receiver};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, trace, warn};

use crate::{
    diagnostics::{DiagnosticResponse, Diagnostics, DiagnosticsError, Metric, SampleSink},
    gps::{gps_manager, GpsOpener, GpsPipeline, GpsStats, SignPolicy},
    logger::{LogClock, LogError, Observation, ObservationLog},
    mqtt_handler::{TelemetryConnector, TelemetryLink},
    snapshot::Snapshot,
    DEFAULT_TOPIC,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("a monitoring session is already running")]
    AlreadyRunning,

    #[error("could not open observation log: {0}")]
    Log(#[from] LogError),

    #[error("could not start diagnostics: {0}")]
    Diagnostics(#[from] DiagnosticsError),
}

/// Session settings, fixed for the life of the loop
#[derive(Debug, Clone)]
pub struct AcquisitionOptions {
    /// folder receiving one CSV file per session
    pub log_dir: PathBuf,
    pub clock: LogClock,
    /// topic fixes are published to
    pub topic: String,
    pub poll_interval: Duration,
    pub sign_policy: SignPolicy,
    /// diagnostics samples that may wait for the consumer before new ones are dropped
    pub sample_queue: usize,
    /// how long `stop` lets the telemetry channel close cleanly
    pub shutdown_grace: Duration,
}

impl Default for AcquisitionOptions {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("vehicle_logs"),
            clock: LogClock::default(),
            topic: DEFAULT_TOPIC.to_string(),
            poll_interval: Duration::from_secs(1),
            sign_policy: SignPolicy::default(),
            sample_queue: 1000,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

struct Session {
    cancel_token: CancellationToken,
    channel_token: CancellationToken,
    tracker: TaskTracker,
    link: Option<Arc<dyn TelemetryLink>>,
    log_path: PathBuf,
}

impl Session {
    /// Cancel and join everything the session spawned
    async fn shutdown(self, grace: Duration) -> PathBuf {
        self.cancel_token.cancel();
        if let Some(link) = &self.link {
            link.disconnect();
        }
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            debug!("Telemetry channel did not close in time, cancelling it");
            self.channel_token.cancel();
            self.tracker.wait().await;
        }
        self.log_path
    }
}

/// Fans GPS fixes and diagnostics samples into one snapshot, a log and the telemetry channel
pub struct AcquisitionLoop<D> {
    opts: AcquisitionOptions,
    diagnostics: D,
    gps: Box<dyn GpsOpener>,
    telemetry: Box<dyn TelemetryConnector>,
    snapshot: Snapshot,
    gps_stats: GpsStats,
    state: LoopState,
    session: Option<Session>,
}

impl<D: Diagnostics> AcquisitionLoop<D> {
    pub fn new(
        opts: AcquisitionOptions,
        diagnostics: D,
        gps: impl GpsOpener + 'static,
        telemetry: impl TelemetryConnector + 'static,
    ) -> Self {
        Self {
            opts,
            diagnostics,
            gps: Box::new(gps),
            telemetry: Box::new(telemetry),
            snapshot: Snapshot::new(),
            gps_stats: GpsStats::default(),
            state: LoopState::Idle,
            session: None,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// The current session's snapshot, replaced on every start
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.clone()
    }

    pub fn gps_stats(&self) -> GpsStats {
        self.gps_stats.clone()
    }

    /// Log file of the running session
    pub fn log_path(&self) -> Option<&Path> {
        self.session.as_ref().map(|s| s.log_path.as_path())
    }

    /// Begin a fresh session.
    ///
    /// GPS and telemetry problems only degrade the session. Failing to open
    /// the log or to start the diagnostics collaborator aborts it.
    pub async fn start(&mut self) -> Result<(), AcquisitionError> {
        if self.state != LoopState::Idle {
            return Err(AcquisitionError::AlreadyRunning);
        }
        info!("Starting monitoring...");
        self.state = LoopState::Starting;
        self.snapshot = Snapshot::new();
        self.gps_stats = GpsStats::default();

        let log = match ObservationLog::open(&self.opts.log_dir, self.opts.clock.now()) {
            Ok(log) => log,
            Err(err) => {
                error!("Could not create observation log: {err}");
                self.state = LoopState::Idle;
                return Err(err.into());
            }
        };

        let gps_source = match self.gps.open() {
            Ok(source) => Some(source),
            Err(err) => {
                warn!("Error initializing GPS, continuing without it: {err}");
                None
            }
        };

        let session = Session {
            cancel_token: CancellationToken::new(),
            channel_token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            link: None,
            log_path: log.path().to_path_buf(),
        };

        let link = match self
            .telemetry
            .connect(session.channel_token.clone(), &session.tracker)
        {
            Ok(link) => Some(link),
            Err(err) => {
                warn!("Could not connect telemetry channel, fixes will not be published: {err}");
                None
            }
        };
        let session = Session { link, ..session };

        let (sample_tx, sample_rx) = mpsc::channel(self.opts.sample_queue);
        let sink = SampleSink::new(sample_tx);
        for metric in Metric::ALL {
            if self.diagnostics.supports(metric) {
                self.diagnostics.watch(metric, sink.clone());
                info!("Watching {}", metric.name());
            } else {
                info!("{} not supported by the vehicle, skipping", metric.name());
            }
        }
        drop(sink);
        session.tracker.spawn(sample_consumer(
            session.cancel_token.clone(),
            sample_rx,
            self.snapshot.clone(),
            log,
            self.opts.clock,
        ));

        if let Err(err) = self.diagnostics.start() {
            error!("Could not start diagnostics, aborting session: {err}");
            self.diagnostics.unwatch_all();
            session.shutdown(self.opts.shutdown_grace).await;
            self.state = LoopState::Idle;
            return Err(err.into());
        }

        if let Some(source) = gps_source {
            session.tracker.spawn(gps_manager(
                session.cancel_token.clone(),
                source,
                GpsPipeline {
                    policy: self.opts.sign_policy,
                    snapshot: self.snapshot.clone(),
                    link: session.link.clone(),
                    topic: self.opts.topic.clone(),
                    stats: self.gps_stats.clone(),
                },
                self.opts.poll_interval,
            ));
        }

        self.session = Some(session);
        self.state = LoopState::Running;
        info!("Monitoring running");
        Ok(())
    }

    /// End the running session and return its log file.
    /// Does nothing, and returns `None`, when no session is running.
    pub async fn stop(&mut self) -> Option<PathBuf> {
        let Some(session) = self.session.take() else {
            debug!("Stop requested with no running session");
            return None;
        };
        info!("Stopping monitoring...");
        self.state = LoopState::Stopping;

        self.diagnostics.stop();
        self.diagnostics.unwatch_all();
        let log_path = session.shutdown(self.opts.shutdown_grace).await;

        self.state = LoopState::Idle;
        info!("Data saved to: {}", log_path.display());
        Some(log_path)
    }

    /// Stop whatever is running and begin a new session
    pub async fn restart(&mut self) -> Result<(), AcquisitionError> {
        self.stop().await;
        self.start().await
    }
}

/// Drains diagnostics samples into the snapshot and the log, in arrival order
async fn sample_consumer(
    cancel_token: CancellationToken,
    mut sample_rx: Receiver<DiagnosticResponse>,
    snapshot: Snapshot,
    log: ObservationLog,
    clock: LogClock,
) {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                // samples already queued were read before the collaborator stopped, keep them
                sample_rx.close();
                while let Ok(response) = sample_rx.try_recv() {
                    record_sample(&snapshot, &log, &clock, response);
                }
                debug!("Quitting diagnostics consumer");
                break;
            },
            response = sample_rx.recv() => match response {
                Some(response) => record_sample(&snapshot, &log, &clock, response),
                None => {
                    debug!("All diagnostics sinks dropped");
                    break;
                }
            },
        }
    }
}

fn record_sample(
    snapshot: &Snapshot,
    log: &ObservationLog,
    clock: &LogClock,
    response: DiagnosticResponse,
) {
    let name = response.command.name();
    let Some(value) = response.value else {
        trace!("Null response for {name}");
        return;
    };

    snapshot.set(name, value.clone());
    let observation = Observation {
        timestamp: clock.now(),
        metric: name.to_string(),
        value,
    };
    if let Err(err) = log.append(&observation) {
        warn!("Could not log {name}: {err}");
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{HashMap, VecDeque},
        fs,
        io::{self, BufRead, Cursor},
        sync::{
            atomic::{AtomicBool, Ordering},
            Mutex,
        },
    };

    use tempfile::TempDir;

    use super::*;
    use crate::{
        gps::{GpsError, GpsSource},
        mqtt_handler::ChannelError,
        snapshot::MetricValue,
        TelemetryDocument, LATITUDE_KEY, LONGITUDE_KEY,
    };

    const VALID: &str = "$GPRMC,123519,1430500N09031200W";
    const TRUNCATED: &str = "$GPRMC,1430500N0903W";

    struct MemoryGps(Cursor<Vec<u8>>);

    impl GpsSource for MemoryGps {
        fn bytes_available(&mut self) -> io::Result<usize> {
            Ok(self.0.get_ref().len() - self.0.position() as usize)
        }

        fn read_raw_line(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
            self.0.read_until(b'\n', buf)
        }
    }

    struct MemoryOpener(Vec<u8>);

    impl GpsOpener for MemoryOpener {
        fn open(&self) -> Result<Box<dyn GpsSource>, GpsError> {
            Ok(Box::new(MemoryGps(Cursor::new(self.0.clone()))))
        }
    }

    /// Receiver the test can keep writing to after the session started
    #[derive(Clone, Default)]
    struct FeedGps(Arc<Mutex<VecDeque<u8>>>);

    impl FeedGps {
        fn push_line(&self, line: &str) {
            let mut bytes = self.0.lock().unwrap();
            bytes.extend(line.as_bytes());
            bytes.push_back(b'\n');
        }
    }

    impl GpsSource for FeedGps {
        fn bytes_available(&mut self) -> io::Result<usize> {
            Ok(self.0.lock().unwrap().len())
        }

        fn read_raw_line(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
            let mut bytes = self.0.lock().unwrap();
            let end = match bytes.iter().position(|&b| b == b'\n') {
                Some(newline) => newline + 1,
                None => bytes.len(),
            };
            buf.extend(bytes.drain(..end));
            Ok(end)
        }
    }

    impl GpsOpener for FeedGps {
        fn open(&self) -> Result<Box<dyn GpsSource>, GpsError> {
            Ok(Box::new(self.clone()))
        }
    }

    struct MissingGps;

    impl GpsOpener for MissingGps {
        fn open(&self) -> Result<Box<dyn GpsSource>, GpsError> {
            Err(GpsError::Open {
                device: "/dev/ttyUSB0".to_string(),
                source: serialport::Error::new(serialport::ErrorKind::NoDevice, "unplugged"),
            })
        }
    }

    #[derive(Default)]
    struct RecordingLink {
        published: Mutex<Vec<(String, TelemetryDocument)>>,
        disconnected: AtomicBool,
    }

    impl TelemetryLink for RecordingLink {
        fn publish(&self, topic: &str, document: &TelemetryDocument) -> Result<(), ChannelError> {
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), *document));
            Ok(())
        }

        fn disconnect(&self) {
            self.disconnected.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Clone, Default)]
    struct RecordingConnector(Arc<RecordingLink>);

    impl TelemetryConnector for RecordingConnector {
        fn connect(
            &self,
            _cancel_token: CancellationToken,
            _tracker: &TaskTracker,
        ) -> Result<Arc<dyn TelemetryLink>, ChannelError> {
            Ok(self.0.clone())
        }
    }

    /// Test double standing in for an OBD interface, samples are pushed by the test
    #[derive(Clone, Default)]
    struct ScriptedDiagnostics {
        supported: Vec<Metric>,
        sinks: Arc<Mutex<HashMap<Metric, SampleSink>>>,
        fail_start: bool,
        running: Arc<AtomicBool>,
    }

    impl ScriptedDiagnostics {
        fn supporting(metrics: &[Metric]) -> Self {
            Self {
                supported: metrics.to_vec(),
                ..Default::default()
            }
        }

        fn emit(&self, response: DiagnosticResponse) -> bool {
            let sinks = self.sinks.lock().unwrap();
            match sinks.get(&response.command) {
                Some(sink) => sink.deliver(response),
                None => false,
            }
        }
    }

    impl Diagnostics for ScriptedDiagnostics {
        fn supports(&self, metric: Metric) -> bool {
            self.supported.contains(&metric)
        }

        fn watch(&mut self, metric: Metric, sink: SampleSink) {
            self.sinks.lock().unwrap().insert(metric, sink);
        }

        fn unwatch_all(&mut self) {
            self.sinks.lock().unwrap().clear();
        }

        fn start(&mut self) -> Result<(), DiagnosticsError> {
            if self.fail_start {
                return Err(DiagnosticsError::Unavailable("/dev/rfcomm0".to_string()));
            }
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&mut self) {
            self.running.store(false, Ordering::SeqCst);
        }
    }

    fn options(dir: &TempDir) -> AcquisitionOptions {
        AcquisitionOptions {
            log_dir: dir.path().to_path_buf(),
            poll_interval: Duration::from_millis(5),
            ..Default::default()
        }
    }

    async fn eventually(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition never became true");
    }

    fn log_lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn valid_then_truncated_sentence_publishes_once() {
        let dir = TempDir::new().unwrap();
        let connector = RecordingConnector::default();
        let gps = FeedGps::default();
        gps.push_line(VALID);
        gps.push_line(TRUNCATED);
        let mut acq = AcquisitionLoop::new(
            options(&dir),
            ScriptedDiagnostics::default(),
            gps.clone(),
            connector.clone(),
        );

        acq.start().await.unwrap();
        let stats = acq.gps_stats();
        eventually(|| stats.lines() == 2).await;

        {
            let published = connector.0.published.lock().unwrap();
            assert_eq!(published.len(), 1);
            let (topic, doc) = &published[0];
            assert_eq!(topic, DEFAULT_TOPIC);
            assert!((doc.latitude - 14.508333).abs() < 1e-6);
            assert!((doc.longitude + 90.52).abs() < 1e-6);
            assert!(doc.timestamp > 0);
        }
        assert_eq!(stats.fixes(), 1);
        assert_eq!(stats.skipped(), 1);
        assert_eq!(acq.state(), LoopState::Running);

        let snapshot = acq.snapshot().get_all();
        assert!(snapshot.contains_key(LATITUDE_KEY));
        assert!(snapshot.contains_key(LONGITUDE_KEY));

        // the skip did not end the GPS task, later sentences are still handled
        gps.push_line("$GPRMC,123520,3352000S15112500E");
        eventually(|| stats.lines() == 3).await;
        assert_eq!(stats.fixes(), 2);
        assert_eq!(connector.0.published.lock().unwrap().len(), 2);
        let lat = acq.snapshot().get(LATITUDE_KEY).unwrap().magnitude();
        assert!(lat < 0.0);

        assert!(acq.stop().await.is_some());
        assert!(connector.0.disconnected.load(Ordering::SeqCst));
        assert_eq!(acq.state(), LoopState::Idle);
    }

    #[tokio::test]
    async fn stop_without_samples_leaves_header_only() {
        let dir = TempDir::new().unwrap();
        let mut acq = AcquisitionLoop::new(
            options(&dir),
            ScriptedDiagnostics::supporting(&[Metric::Rpm]),
            MemoryOpener(Vec::new()),
            RecordingConnector::default(),
        );

        acq.start().await.unwrap();
        let path = acq.stop().await.expect("session log");
        assert_eq!(log_lines(&path), vec!["Timestamp,Command,Value,Units"]);

        assert_eq!(acq.stop().await, None);
        assert_eq!(acq.state(), LoopState::Idle);
    }

    #[tokio::test]
    async fn stop_before_start_is_harmless() {
        let dir = TempDir::new().unwrap();
        let mut acq = AcquisitionLoop::new(
            options(&dir),
            ScriptedDiagnostics::default(),
            MissingGps,
            RecordingConnector::default(),
        );
        assert_eq!(acq.stop().await, None);
        assert_eq!(acq.state(), LoopState::Idle);
    }

    #[tokio::test]
    async fn samples_reach_snapshot_and_log_in_order() {
        let dir = TempDir::new().unwrap();
        let diag = ScriptedDiagnostics::supporting(&[Metric::Rpm, Metric::CoolantTemp]);
        let mut acq = AcquisitionLoop::new(
            options(&dir),
            diag.clone(),
            MissingGps,
            RecordingConnector::default(),
        );

        acq.start().await.unwrap();
        assert!(diag.running.load(Ordering::SeqCst));
        // unsupported metrics never get a sink
        assert!(!diag.emit(DiagnosticResponse::new(Metric::Speed, MetricValue::Scalar(50.0))));

        assert!(diag.emit(DiagnosticResponse::new(
            Metric::Rpm,
            MetricValue::Quantity(800.0, "revolutions_per_minute".into())
        )));
        assert!(diag.emit(DiagnosticResponse::null(Metric::CoolantTemp)));
        assert!(diag.emit(DiagnosticResponse::new(
            Metric::Rpm,
            MetricValue::Quantity(950.0, "revolutions_per_minute".into())
        )));
        assert!(diag.emit(DiagnosticResponse::new(
            Metric::CoolantTemp,
            MetricValue::Quantity(88.0, "degC".into())
        )));

        let snapshot = acq.snapshot();
        eventually(|| snapshot.len() == 2).await;

        let path = acq.stop().await.unwrap();
        assert!(!diag.running.load(Ordering::SeqCst));

        let all = snapshot.get_all();
        assert_eq!(all["RPM"], MetricValue::Quantity(950.0, "revolutions_per_minute".into()));
        assert_eq!(all["COOLANT_TEMP"], MetricValue::Quantity(88.0, "degC".into()));

        let rows: Vec<Vec<String>> = log_lines(&path)
            .into_iter()
            .skip(1)
            .map(|row| row.split(',').skip(1).map(str::to_string).collect())
            .collect();
        assert_eq!(
            rows,
            vec![
                vec!["RPM", "800", "revolutions_per_minute"],
                vec!["RPM", "950", "revolutions_per_minute"],
                vec!["COOLANT_TEMP", "88", "degC"],
            ]
        );
    }

    #[tokio::test]
    async fn missing_gps_does_not_stop_diagnostics() {
        let dir = TempDir::new().unwrap();
        let diag = ScriptedDiagnostics::supporting(&[Metric::Speed]);
        let mut acq = AcquisitionLoop::new(
            options(&dir),
            diag.clone(),
            MissingGps,
            RecordingConnector::default(),
        );

        acq.start().await.unwrap();
        assert_eq!(acq.state(), LoopState::Running);
        diag.emit(DiagnosticResponse::new(Metric::Speed, MetricValue::Scalar(60.0)));

        let snapshot = acq.snapshot();
        eventually(|| snapshot.get("SPEED").is_some()).await;
        assert!(snapshot.get(LATITUDE_KEY).is_none());
        acq.stop().await;
    }

    #[tokio::test]
    async fn diagnostics_start_failure_aborts_the_session() {
        let dir = TempDir::new().unwrap();
        let connector = RecordingConnector::default();
        let diag = ScriptedDiagnostics {
            fail_start: true,
            ..ScriptedDiagnostics::supporting(&[Metric::Rpm])
        };
        let mut acq = AcquisitionLoop::new(
            options(&dir),
            diag.clone(),
            MemoryOpener(VALID.as_bytes().to_vec()),
            connector.clone(),
        );

        assert!(matches!(
            acq.start().await,
            Err(AcquisitionError::Diagnostics(_))
        ));
        assert_eq!(acq.state(), LoopState::Idle);
        assert!(acq.log_path().is_none());
        assert!(connector.0.disconnected.load(Ordering::SeqCst));
        assert!(diag.sinks.lock().unwrap().is_empty());
        assert!(connector.0.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut acq = AcquisitionLoop::new(
            options(&dir),
            ScriptedDiagnostics::default(),
            MissingGps,
            RecordingConnector::default(),
        );
        acq.start().await.unwrap();
        assert!(matches!(
            acq.start().await,
            Err(AcquisitionError::AlreadyRunning)
        ));
        acq.stop().await;
    }

    #[tokio::test]
    async fn restart_begins_a_fresh_session() {
        let dir = TempDir::new().unwrap();
        let diag = ScriptedDiagnostics::supporting(&[Metric::Rpm]);
        let mut acq = AcquisitionLoop::new(
            options(&dir),
            diag.clone(),
            MissingGps,
            RecordingConnector::default(),
        );

        acq.start().await.unwrap();
        let first_log = acq.log_path().unwrap().to_path_buf();
        let first_snapshot = acq.snapshot();
        diag.emit(DiagnosticResponse::new(Metric::Rpm, MetricValue::Scalar(700.0)));
        eventually(|| !first_snapshot.is_empty()).await;

        acq.restart().await.unwrap();
        assert_eq!(acq.state(), LoopState::Running);
        assert_ne!(acq.log_path().unwrap(), first_log);
        assert!(acq.snapshot().is_empty());

        // the old session's sink is gone, the new one is live
        diag.emit(DiagnosticResponse::new(Metric::Rpm, MetricValue::Scalar(720.0)));
        let snapshot = acq.snapshot();
        eventually(|| snapshot.get("RPM") == Some(MetricValue::Scalar(720.0))).await;
        assert_eq!(first_snapshot.get("RPM"), Some(MetricValue::Scalar(700.0)));

        let second_log = acq.stop().await.unwrap();
        assert_eq!(log_lines(&first_log).len(), 2);
        assert_eq!(log_lines(&second_log).len(), 2);
    }
}
