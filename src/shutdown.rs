//! Graceful teardown of gateway sessions.

use crate::session::{AccountSession, GatewaySession, ShutdownStep};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Default number of retries shared by all shutdown steps of one session.
pub const DEFAULT_RETRY_COUNT: u32 = 3;
/// Pause between a failed shutdown step and its retry.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Process-wide "we are exiting" flag. Once set it stays set.
#[derive(Debug, Clone, Default)]
pub struct ExitFlag(Arc<AtomicBool>);

impl ExitFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Set the flag. Returns true for the call that actually set it.
    pub fn set(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }
}

/// Stops, disconnects and closes sessions with a bounded number of retries.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownCoordinator {
    retry_count: u32,
    retry_delay: Duration,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_COUNT)
    }
}

impl ShutdownCoordinator {
    pub fn new(retry_count: u32) -> Self {
        Self {
            retry_count,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Run `step`, retrying while the session's budget lasts. An exhausted
    /// budget still allows one attempt.
    async fn run_step(
        &self,
        session: &mut GatewaySession,
        step: ShutdownStep,
        budget: &mut u32,
    ) -> Option<usize> {
        loop {
            match session.shutdown_step(step).await {
                Ok(value) => return Some(value),
                Err(e) => {
                    warn!(gateway = %session.id(), step = step.name(), error = %e, retries_left = *budget, "shutdown step failed");
                    if *budget == 0 {
                        return None;
                    }
                    *budget -= 1;
                    sleep(self.retry_delay).await;
                }
            }
        }
    }

    /// Tear down one session.
    ///
    /// A session that was never opened goes straight to `Closed`. Otherwise
    /// scanning is stopped and connected devices are disconnected (only if the
    /// gateway is alive), then the connection is closed. Once the retry budget
    /// is used up the remaining steps are skipped and the session is closed
    /// regardless.
    pub async fn shutdown_session(&self, session: &mut GatewaySession) {
        if !session.is_open() {
            session.mark_closed();
            return;
        }

        session.begin_shutdown();
        let mut budget = self.retry_count;

        if session.is_alive() {
            self.stop_gateway(session, &mut budget).await;
        }

        if self.run_step(session, ShutdownStep::Close, &mut budget).await.is_some() {
            debug!(gateway = %session.id(), "closed");
        }
        session.mark_closed();
    }

    async fn stop_gateway(&self, session: &mut GatewaySession, budget: &mut u32) {
        if self.run_step(session, ShutdownStep::StopScan, budget).await.is_none() {
            return;
        }
        let Some(connected) = self.run_step(session, ShutdownStep::ListConnected, budget).await else {
            return;
        };
        if connected > 0 {
            self.run_step(session, ShutdownStep::DisconnectAll, budget).await;
        }
    }

    /// Set the exit flag, tear down every session and log out the account if
    /// it was signed in with a login.
    pub async fn shutdown_all<'a>(
        &self,
        exit: &ExitFlag,
        sessions: impl IntoIterator<Item = &'a mut GatewaySession>,
        account: Option<&mut AccountSession>,
    ) {
        if exit.set() {
            info!("shutting down");
        }

        for session in sessions {
            self.shutdown_session(session).await;
        }

        if let Some(account) = account
            && account.needs_logout()
        {
            match account.logout().await {
                Ok(()) => debug!("logged out"),
                Err(e) => warn!(error = %e, "logout failed"),
            }
        }
    }
}
