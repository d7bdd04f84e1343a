//! Drives every gateway session from a single task.
//!
//! The orchestrator owns the session map and the exit flag. Frames from all
//! sessions are merged into one stream and handled one at a time, so a
//! session's reports are processed strictly in arrival order.

use crate::config::{GatewayCredential, ScanConfig};
use crate::gateway::{GatewayConnector, GatewayFrame, REPORT_NOTIFICATION, ReportFrame};
use crate::pipeline::AdvertisementPipeline;
use crate::output::Telemetry;
use crate::scan_cycle::ScanCycleController;
use crate::session::{AccountSession, GatewaySession};
use crate::shutdown::{ExitFlag, ShutdownCoordinator};
use futures::stream::{self, BoxStream, SelectAll, StreamExt};
use std::collections::BTreeMap;
use std::future::Future;
use std::io::{self, Write};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval};
use tracing::{debug, error, info, warn};

/// A frame tagged with its gateway id. `None` marks the end of the
/// gateway's frame channel.
pub type TaggedFrame = (String, Option<GatewayFrame>);

/// Merged frames of all running sessions.
pub type FrameStream = SelectAll<BoxStream<'static, TaggedFrame>>;

fn frame_stream(gateway_id: String, frames: mpsc::UnboundedReceiver<GatewayFrame>) -> BoxStream<'static, TaggedFrame> {
    let end = (gateway_id.clone(), None);
    stream::unfold(frames, |mut frames| async move {
        frames.recv().await.map(|frame| (frame, frames))
    })
    .map(move |frame| (gateway_id.clone(), Some(frame)))
    .chain(stream::once(async move { end }))
    .boxed()
}

/// Why the frame loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    Interrupted,
    AllSessionsEnded,
}

pub struct Orchestrator<'a> {
    connector: &'a dyn GatewayConnector,
    pipeline: AdvertisementPipeline,
    telemetry: Telemetry,
    scan_cycle: ScanCycleController,
    shutdown: ShutdownCoordinator,
    exit: ExitFlag,
    sessions: BTreeMap<String, GatewaySession>,
    account: Option<AccountSession>,
    version_timeout: Duration,
    status_interval: Option<Duration>,
    echo_records: bool,
}

impl<'a> Orchestrator<'a> {
    pub fn new(connector: &'a dyn GatewayConnector, telemetry: Telemetry, shutdown: ShutdownCoordinator) -> Self {
        Self {
            connector,
            pipeline: AdvertisementPipeline::new(None),
            telemetry,
            scan_cycle: ScanCycleController,
            shutdown,
            exit: ExitFlag::new(),
            sessions: BTreeMap::new(),
            account: None,
            version_timeout: Duration::from_millis(5000),
            status_interval: None,
            echo_records: true,
        }
    }

    pub fn with_version_timeout(mut self, timeout: Duration) -> Self {
        self.version_timeout = timeout;
        self
    }

    pub fn with_status_interval(mut self, interval: Option<Duration>) -> Self {
        self.status_interval = interval;
        self
    }

    /// Print each forwarded record to the output writer as a JSON line.
    pub fn with_record_echo(mut self, echo: bool) -> Self {
        self.echo_records = echo;
        self
    }

    pub fn set_pipeline(&mut self, pipeline: AdvertisementPipeline) {
        self.pipeline = pipeline;
    }

    pub fn set_account(&mut self, account: AccountSession) {
        self.account = Some(account);
    }

    pub fn exit_flag(&self) -> &ExitFlag {
        &self.exit
    }

    pub fn sessions(&self) -> impl Iterator<Item = &GatewaySession> {
        self.sessions.values()
    }

    /// Set up one session per gateway concurrently. Sessions that fail are
    /// closed and dropped; the others keep running.
    pub async fn start_sessions(
        &mut self,
        gateway_ids: &[String],
        credential: &GatewayCredential,
        scan: ScanConfig,
    ) -> FrameStream {
        for id in gateway_ids {
            self.sessions
                .insert(id.clone(), GatewaySession::new(id.clone(), credential.clone(), scan));
        }

        let connector = self.connector;
        let version_timeout = self.version_timeout;
        let exit = &self.exit;
        let results = futures::future::join_all(self.sessions.values_mut().map(|session| async move {
            let result = session.setup(connector, version_timeout, exit).await;
            (session.id().to_string(), result)
        }))
        .await;

        let mut frames = FrameStream::default();
        for (id, result) in results {
            match result {
                Ok(receiver) => {
                    info!(gateway = %id, "scanning");
                    frames.push(frame_stream(id, receiver));
                }
                Err(e) => {
                    error!(gateway = %id, error = %e, "gateway setup failed");
                    self.drop_session(&id).await;
                }
            }
        }
        frames
    }

    async fn drop_session(&mut self, gateway_id: &str) {
        if let Some(mut session) = self.sessions.remove(gateway_id) {
            self.shutdown.shutdown_session(&mut session).await;
        }
    }

    /// Handle frames until `interrupt` resolves or every session's channel
    /// has ended. The frame in progress is always finished first.
    pub async fn run<F>(&mut self, mut frames: FrameStream, out: &mut dyn Write, interrupt: F) -> io::Result<LoopExit>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(interrupt);
        let mut status = self
            .status_interval
            .map(|period| tokio::time::interval_at(Instant::now() + period, period));

        loop {
            tokio::select! {
                _ = &mut interrupt => {
                    info!("interrupt received");
                    return Ok(LoopExit::Interrupted);
                }
                next = frames.next() => match next {
                    Some((gateway_id, Some(frame))) => self.dispatch(&gateway_id, frame, out).await?,
                    Some((gateway_id, None)) => {
                        warn!(gateway = %gateway_id, "gateway connection lost");
                        if let Some(session) = self.sessions.get_mut(&gateway_id) {
                            session.mark_lost();
                        }
                        self.drop_session(&gateway_id).await;
                    }
                    None => {
                        warn!("no gateway sessions left");
                        return Ok(LoopExit::AllSessionsEnded);
                    }
                },
                _ = tick(&mut status) => self.log_status(),
            }
        }
    }

    async fn dispatch(&mut self, gateway_id: &str, frame: GatewayFrame, out: &mut dyn Write) -> io::Result<()> {
        let Some(session) = self.sessions.get_mut(gateway_id) else {
            debug!(gateway = %gateway_id, "frame for unknown session");
            return Ok(());
        };

        match frame {
            GatewayFrame::Event(event) => {
                self.scan_cycle.on_event(session, &event, &self.exit).await;
            }
            GatewayFrame::Report(ReportFrame::Advertisements(burst)) => {
                session.record_burst(burst.len());
                let records = self.pipeline.process(gateway_id, &burst);
                debug!(gateway = %gateway_id, burst = burst.len(), forwarded = records.len(), "advertisement report");

                self.telemetry.forward_burst(gateway_id, &records, burst.len()).await;
                if self.echo_records {
                    for record in &records {
                        let line = serde_json::to_string(record).map_err(io::Error::from)?;
                        writeln!(out, "{line}")?;
                    }
                    out.flush()?;
                }
            }
            GatewayFrame::Report(ReportFrame::Notification(body)) => {
                info!(gateway = %gateway_id, code = REPORT_NOTIFICATION, notification = %body, "notification");
            }
            GatewayFrame::Report(ReportFrame::Other { code, body }) => {
                debug!(gateway = %gateway_id, code, report = %body, "unhandled report");
            }
        }
        Ok(())
    }

    fn log_status(&self) {
        for session in self.sessions.values() {
            info!(gateway = %session.id(), adv_rate = session.adv_rate(), alive = session.is_alive(), "status");
        }
    }

    /// Tear everything down. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        self.shutdown
            .shutdown_all(&self.exit, self.sessions.values_mut(), self.account.as_mut())
            .await;
        self.sessions.clear();
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
