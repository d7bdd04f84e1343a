//! Telemetry sinks for decoded beacon records.
//!
//! A sink stores two streams: one point per forwarded advertisement and one
//! rate point per report burst. [`Telemetry`] wraps a sink with the
//! forwarding policy: probe once at startup, disable on probe failure, and
//! never let a write error reach the scanning side.

#[cfg(feature = "influxdb")]
pub mod influxdb;
pub mod line_protocol;

use crate::record::BeaconRecord;
use futures::future::BoxFuture;
use line_protocol::{DataPoint, advertisement_point, rate_point};
use std::io::{self, Write};
use thiserror::Error;
use tracing::{debug, warn};

/// Error type for sink operations.
#[derive(Error, Debug)]
pub enum SinkError {
    #[cfg(feature = "influxdb")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("sink responded with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Storage backend for beacon telemetry.
pub trait TelemetrySink: Send {
    /// Check connectivity and prepare storage.
    fn probe(&mut self) -> BoxFuture<'_, Result<(), SinkError>>;

    /// Store a batch of points.
    fn write_points<'a>(
        &'a mut self,
        points: &'a [DataPoint],
    ) -> BoxFuture<'a, Result<(), SinkError>>;
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn probe(&mut self) -> BoxFuture<'_, Result<(), SinkError>> {
        Box::pin(async { Ok(()) })
    }

    fn write_points<'a>(
        &'a mut self,
        _points: &'a [DataPoint],
    ) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async { Ok(()) })
    }
}

/// Sink printing line protocol to a writer, e.g. stdout for Telegraf `execd`.
pub struct LineProtocolSink<W> {
    out: W,
}

impl<W: Write + Send> LineProtocolSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write + Send> TelemetrySink for LineProtocolSink<W> {
    fn probe(&mut self) -> BoxFuture<'_, Result<(), SinkError>> {
        Box::pin(async move { Ok(self.out.flush()?) })
    }

    fn write_points<'a>(
        &'a mut self,
        points: &'a [DataPoint],
    ) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            for point in points {
                writeln!(self.out, "{point}")?;
            }
            Ok(self.out.flush()?)
        })
    }
}

/// Forwarding policy around a [`TelemetrySink`].
pub struct Telemetry {
    sink: Box<dyn TelemetrySink>,
    enabled: bool,
}

impl Telemetry {
    /// Probe `sink` once. If the probe fails the sink stays disabled for the
    /// lifetime of the process and every later write is skipped.
    pub async fn connect(mut sink: Box<dyn TelemetrySink>) -> Self {
        let enabled = match sink.probe().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "telemetry sink unavailable, disabling writes");
                false
            }
        };
        Self { sink, enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Store the surviving records of one burst plus the burst's size.
    /// Errors are logged and swallowed.
    pub async fn forward_burst(&mut self, gateway_id: &str, records: &[BeaconRecord], burst_len: usize) {
        if !self.enabled {
            return;
        }

        let mut points: Vec<DataPoint> = records.iter().map(advertisement_point).collect();
        points.push(rate_point(gateway_id, burst_len));

        match self.sink.write_points(&points).await {
            Ok(()) => debug!(gateway = %gateway_id, points = points.len(), "telemetry written"),
            Err(e) => warn!(gateway = %gateway_id, error = %e, "failed to write telemetry"),
        }
    }
}
