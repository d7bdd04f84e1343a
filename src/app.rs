//! Core application runner for `beacon-gateway-scanner`.
//!
//! This module is intentionally decoupled from process setup (logging, signal
//! handling, exit codes) so it can be tested deterministically with an
//! injected gateway connector, telemetry sink and output stream.

use crate::config::{
    CliConfigProvider, ConfigError, ConfigProvider, ScanConfig, ScanMode, parse_duration,
};
use crate::gateway::GatewayConnector;
use crate::mac_filter::MacFilter;
use crate::orchestrator::{FrameStream, LoopExit, Orchestrator};
use crate::output::Telemetry;
use crate::pipeline::AdvertisementPipeline;
use crate::session::{AccountSession, SessionError};
use crate::shutdown::{DEFAULT_RETRY_COUNT, ShutdownCoordinator};
use clap::Parser;
use std::future::Future;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

/// Exit codes for the application
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_PANIC: i32 = 2;
pub const EXIT_CONFIG: i32 = 3;

/// Where telemetry points go
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SinkKind {
    /// InfluxDB 1.x HTTP API
    #[cfg(feature = "influxdb")]
    Influxdb,
    /// InfluxDB line protocol on stdout, e.g. for Telegraf execd
    LineProtocol,
    /// Do not store telemetry
    None,
}

impl Default for SinkKind {
    fn default() -> Self {
        #[cfg(feature = "influxdb")]
        return SinkKind::Influxdb;
        #[cfg(not(feature = "influxdb"))]
        return SinkKind::LineProtocol;
    }
}

impl std::fmt::Display for SinkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "influxdb")]
            SinkKind::Influxdb => write!(f, "influxdb"),
            SinkKind::LineProtocol => write!(f, "line-protocol"),
            SinkKind::None => write!(f, "none"),
        }
    }
}

/// Configuration for the scanner.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Gateway API account user
    #[arg(long, env = "GATEWAY_USER")]
    pub user: Option<String>,

    /// Gateway API account password
    #[arg(long, env = "GATEWAY_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Gateway API endpoint
    #[arg(long, default_value = "127.0.0.1:5444")]
    pub server: String,

    /// Gateway to scan with. Repeat for several gateways; defaults to every
    /// gateway the account can reach.
    #[arg(long = "gateway", value_name = "ID")]
    pub gateways: Vec<String>,

    /// BLE scan mode
    #[arg(long, default_value_t, value_enum)]
    pub scan_mode: ScanMode,

    /// Scan period in seconds
    #[arg(long, default_value_t = 1)]
    pub scan_period: u32,

    /// JSON file with the allowed MAC addresses: {"devList": ["AA:BB:CC:DD:EE:FF"]}
    #[arg(long)]
    pub mac_filter: Option<PathBuf>,

    /// How long to wait for a gateway to report its version.
    /// Accepts duration with suffix: 3s, 1m, 500ms, 2h.
    /// Without suffix, value is interpreted as seconds.
    #[arg(long, value_parser = parse_duration, default_value = "5000ms")]
    pub version_timeout: Duration,

    /// Upper bound on any single gateway API request
    #[arg(long, value_parser = parse_duration, default_value = "30s")]
    pub request_timeout: Duration,

    /// Retries allowed per gateway while shutting down
    #[arg(long, default_value_t = DEFAULT_RETRY_COUNT)]
    pub retry_count: u32,

    /// Telemetry sink
    #[arg(long, default_value_t, value_enum)]
    pub sink: SinkKind,

    /// InfluxDB server URL
    #[arg(long, default_value = "http://localhost:8086")]
    pub influxdb_url: String,

    /// InfluxDB database; created if missing
    #[arg(long, default_value = "beaconstats")]
    pub influxdb_database: String,

    /// Log every gateway's advertisement rate at this interval
    #[arg(long, value_parser = parse_duration)]
    pub status_interval: Option<Duration>,

    /// Verbose output, log at debug level
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Options {
    pub fn config_provider(&self) -> CliConfigProvider {
        CliConfigProvider {
            user: self.user.clone(),
            password: self.password.clone(),
            gateways: self.gateways.clone(),
            scan: ScanConfig {
                mode: self.scan_mode,
                period: self.scan_period,
            },
            mac_filter: self.mac_filter.clone(),
        }
    }
}

/// Errors returned by the core run loop.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot sign in to the gateway API: {0}")]
    Account(#[source] SessionError),
    #[error("no gateway could be set up")]
    NoActiveSessions,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl RunError {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::Config(_) | RunError::Account(_) => EXIT_CONFIG,
            RunError::NoActiveSessions | RunError::Io(_) => EXIT_ERROR,
        }
    }
}

/// Run the scanner until `interrupt` resolves or every gateway is gone,
/// writing decoded records to `out`.
///
/// Startup failures and the end of the run both go through the same
/// shutdown path, so sessions that were opened are always closed.
pub async fn run_with_io<F>(
    options: &Options,
    provider: &dyn ConfigProvider,
    connector: &dyn GatewayConnector,
    telemetry: Telemetry,
    out: &mut dyn Write,
    interrupt: F,
) -> Result<(), RunError>
where
    F: Future<Output = ()>,
{
    let mut orchestrator = Orchestrator::new(
        connector,
        telemetry,
        ShutdownCoordinator::new(options.retry_count),
    )
    .with_version_timeout(options.version_timeout)
    .with_status_interval(options.status_interval)
    .with_record_echo(options.sink != SinkKind::LineProtocol);

    tokio::pin!(interrupt);
    let started = tokio::select! {
        started = start(&mut orchestrator, provider, connector) => Some(started),
        _ = &mut interrupt => None,
    };

    let result = match started {
        None => {
            info!("interrupt received during startup");
            Ok(())
        }
        Some(Err(e)) => Err(e),
        Some(Ok(frames)) => match orchestrator.run(frames, out, interrupt).await {
            Ok(LoopExit::Interrupted) => Ok(()),
            Ok(LoopExit::AllSessionsEnded) => Err(RunError::NoActiveSessions),
            Err(e) => Err(e.into()),
        },
    };
    if let Err(e) = &result {
        error!(error = %e, "stopping");
    }
    orchestrator.shutdown().await;
    result
}

/// Sign in, pick the gateways and bring their sessions up.
async fn start(
    orchestrator: &mut Orchestrator<'_>,
    provider: &dyn ConfigProvider,
    connector: &dyn GatewayConnector,
) -> Result<FrameStream, RunError> {
    let credential = provider.credentials()?;
    let account = AccountSession::establish(connector, &credential)
        .await
        .map_err(RunError::Account)?;
    let gateways = provider.select_gateways(account.gateway_ids());
    orchestrator.set_account(account);
    let gateways = gateways?;

    let scan = provider.scan_parameters();
    let filter = provider
        .mac_filter_path()
        .map(|path| MacFilter::load(&path))
        .transpose()?;
    if let Some(filter) = &filter {
        info!(macs = filter.len(), "MAC filter active");
    }
    orchestrator.set_pipeline(AdvertisementPipeline::new(filter));

    info!(gateways = ?gateways, mode = %scan.mode, period = scan.period, "starting sessions");
    let frames = orchestrator.start_sessions(&gateways, &credential, scan).await;
    if frames.is_empty() {
        return Err(RunError::NoActiveSessions);
    }
    Ok(frames)
}
