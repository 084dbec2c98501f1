use std::{error::Error, future::Future, io, path::PathBuf, time::Duration};

use chrono::FixedOffset;
use clap::Parser;
use tokio::signal;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};
use vehicle_telemetry::{
    acquisition::{AcquisitionLoop, AcquisitionOptions},
    diagnostics::{Metric, NoDiagnostics},
    gps::{GpsOptions, SignPolicy},
    logger::LogClock,
    mqtt_handler::{ChannelOptions, MqttConnector},
    snapshot::Snapshot,
    DEFAULT_TOPIC, LATITUDE_KEY, LONGITUDE_KEY,
};

/// vehicle-telemetry command line arguments
#[derive(Parser, Debug)]
#[command(version)]
struct TelemetryArgs {
    /// The GPS serial device
    #[arg(
        short = 'g',
        long,
        default_value = "/dev/ttyUSB0",
        env = "VEHICLE_TELEMETRY_GPS_DEVICE"
    )]
    gps_device: String,

    /// The GPS baud rate
    #[arg(long, default_value_t = 4800, env = "VEHICLE_TELEMETRY_GPS_BAUD")]
    gps_baud: u32,

    /// GPS read timeout, in milliseconds
    #[arg(
        long,
        default_value_t = 1000,
        value_parser = clap::value_parser!(u64).range(1..),
        env = "VEHICLE_TELEMETRY_GPS_TIMEOUT_MS"
    )]
    gps_timeout_ms: u64,

    /// How often the GPS port is polled, in milliseconds
    #[arg(
        long,
        default_value_t = 1000,
        value_parser = clap::value_parser!(u64).range(1..),
        env = "VEHICLE_TELEMETRY_POLL_INTERVAL_MS"
    )]
    poll_interval_ms: u64,

    /// The MQTT host of the ingestion endpoint
    #[arg(
        short = 'u',
        long,
        default_value = "thingsboard.cloud",
        env = "VEHICLE_TELEMETRY_MQTT_HOST"
    )]
    mqtt_host: String,

    /// The MQTT port of the ingestion endpoint
    #[arg(short = 'p', long, default_value_t = 8883, env = "VEHICLE_TELEMETRY_MQTT_PORT")]
    mqtt_port: u16,

    /// Device access token
    #[arg(short = 't', long, env = "VEHICLE_TELEMETRY_ACCESS_TOKEN")]
    access_token: String,

    /// The topic fixes are published to
    #[arg(long, default_value = DEFAULT_TOPIC, env = "VEHICLE_TELEMETRY_TOPIC")]
    topic: String,

    /// Connect without TLS, for a local broker only
    #[arg(long, env = "VEHICLE_TELEMETRY_PLAINTEXT")]
    plaintext: bool,

    /// The folder observation logs are written to
    #[arg(
        short = 'f',
        long,
        default_value = "vehicle_logs",
        env = "VEHICLE_TELEMETRY_LOG_DIR"
    )]
    log_dir: PathBuf,

    /// Timestamp logs with this UTC offset instead of the local zone (e.g. -6)
    #[arg(long, allow_hyphen_values = true, env = "VEHICLE_TELEMETRY_UTC_OFFSET_HOURS")]
    utc_offset_hours: Option<i32>,

    /// How hemisphere letters sign coordinates
    #[arg(long, value_enum, default_value_t = SignPolicy::Hemispheric, env = "VEHICLE_TELEMETRY_SIGN_POLICY")]
    sign_policy: SignPolicy,

    /// Print the current readings once a second
    #[arg(short = 'd', long, env = "VEHICLE_TELEMETRY_DASHBOARD")]
    dashboard: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let cli = TelemetryArgs::parse();

    println!("Initializing vehicle telemetry...");
    // construct a subscriber that prints formatted traces to stdout
    // if RUST_LOG is not set, defaults to loglevel INFO
    let subscriber = tracing_subscriber::fmt()
        .with_thread_ids(true)
        .with_ansi(true)
        .with_thread_names(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .finish();
    // use that subscriber to process traces emitted after this point
    tracing::subscriber::set_global_default(subscriber)?;

    let clock = match cli.utc_offset_hours {
        Some(hours) => LogClock::Fixed(
            hours
                .checked_mul(3600)
                .and_then(FixedOffset::east_opt)
                .ok_or("UTC offset out of range")?,
        ),
        None => LogClock::Local,
    };

    let mut acquisition = AcquisitionLoop::new(
        AcquisitionOptions {
            log_dir: cli.log_dir,
            clock,
            topic: cli.topic,
            poll_interval: Duration::from_millis(cli.poll_interval_ms),
            sign_policy: cli.sign_policy,
            ..Default::default()
        },
        // no OBD backend is linked into this binary, run as a GPS relay
        NoDiagnostics,
        GpsOptions {
            device: cli.gps_device,
            baud_rate: cli.gps_baud,
            read_timeout: Duration::from_millis(cli.gps_timeout_ms),
        },
        MqttConnector {
            opts: ChannelOptions {
                host: cli.mqtt_host,
                port: cli.mqtt_port,
                access_token: cli.access_token,
                tls: !cli.plaintext,
                ..Default::default()
            },
        },
    );

    acquisition.start().await?;

    info!("Initialization complete, ready...");
    info!("Use Ctrl+C or SIGINT to exit cleanly!");

    wait_for_shutdown(
        signal::ctrl_c(),
        acquisition.snapshot(),
        cli.dashboard,
        Duration::from_secs(1),
    )
    .await;

    info!("Received exit signal, shutting down!");
    acquisition.stop().await;
    Ok(())
}

/// Run until `shutdown` resolves, printing the readings every `refresh` when `dashboard` is set
async fn wait_for_shutdown(
    shutdown: impl Future<Output = io::Result<()>>,
    snapshot: Snapshot,
    dashboard: bool,
    refresh: Duration,
) {
    tokio::pin!(shutdown);
    let mut refresh = tokio::time::interval(refresh);
    loop {
        tokio::select! {
            res = &mut shutdown => {
                if let Err(err) = res {
                    warn!("Could not read cancellation trigger (ctrl+c): {err}");
                }
                break;
            },
            _ = refresh.tick(), if dashboard => {
                render_dashboard(&snapshot);
            }
        }
    }
}

/// One log line per reading, in the dashboard's panel order
fn render_dashboard(snapshot: &Snapshot) {
    let readings = snapshot.get_all();
    let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");

    let mut line = format!("[{now}]");
    for key in [LATITUDE_KEY, LONGITUDE_KEY] {
        let value = readings.get(key).map(|v| v.display());
        line.push_str(&format!(" {key}={}°", value.as_deref().unwrap_or("--")));
    }
    for metric in Metric::ALL {
        if let Some(value) = readings.get(metric.name()) {
            line.push_str(&format!(
                " {}={}{}",
                metric.name(),
                value.display(),
                metric.display_unit()
            ));
        }
    }
    info!("{line}");
}
