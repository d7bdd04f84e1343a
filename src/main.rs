use beacon_gateway_scanner::app::{
    EXIT_CONFIG, EXIT_PANIC, EXIT_SUCCESS, Options, SinkKind, run_with_io,
};
use beacon_gateway_scanner::gateway::tcp::TcpConnector;
use beacon_gateway_scanner::output::{LineProtocolSink, NullSink, Telemetry, TelemetrySink};
use clap::Parser;
use futures::FutureExt;
use std::panic::{self, PanicHookInfo};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // stdout carries records, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_sink(options: &Options) -> Result<Box<dyn TelemetrySink>, i32> {
    match options.sink {
        #[cfg(feature = "influxdb")]
        SinkKind::Influxdb => {
            use beacon_gateway_scanner::output::influxdb::InfluxDbSink;
            match InfluxDbSink::new(&options.influxdb_url, options.influxdb_database.clone()) {
                Ok(sink) => Ok(Box::new(sink)),
                Err(e) => {
                    error!(error = %e, "cannot create InfluxDB client");
                    Err(EXIT_CONFIG)
                }
            }
        }
        SinkKind::LineProtocol => Ok(Box::new(LineProtocolSink::new(std::io::stdout()))),
        SinkKind::None => Ok(Box::new(NullSink)),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set up panic hook to ensure clean exit codes for process managers
    // (e.g., systemd, Telegraf execd) that monitor exit status
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    let options = Options::parse();
    init_logging(options.verbose);
    info!(version = env!("CARGO_PKG_VERSION"), server = %options.server, sink = %options.sink, "starting");

    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "cannot listen for interrupt");
            std::future::pending::<()>().await;
        }
    };
    tokio::pin!(interrupt);
    // The first poll installs the SIGINT handler, so an interrupt during
    // sign-in or session setup still goes through the shutdown path.
    if (&mut interrupt).now_or_never().is_some() {
        std::process::exit(EXIT_SUCCESS);
    }

    let sink = match build_sink(&options) {
        Ok(sink) => sink,
        Err(code) => std::process::exit(code),
    };
    let telemetry = Telemetry::connect(sink).await;
    let connector =
        TcpConnector::new(options.server.clone()).with_request_timeout(options.request_timeout);
    let provider = options.config_provider();

    let mut stdout = std::io::stdout();
    match run_with_io(&options, &provider, &connector, telemetry, &mut stdout, interrupt).await {
        Ok(()) => std::process::exit(EXIT_SUCCESS),
        Err(why) => {
            error!(error = %why, "exiting");
            std::process::exit(why.exit_code());
        }
    }
}
