//! Keeps each gateway scanning: every scan-complete event starts the next
//! scan until the process is exiting.

use crate::gateway::{EVENT_DISCONNECT, EVENT_SCAN_COMPLETE, EventFrame};
use crate::session::GatewaySession;
use crate::shutdown::ExitFlag;
use tracing::{debug, info};

/// Gateway event codes we act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayEvent {
    Disconnect,
    ScanComplete,
    Other(u32),
}

impl From<u32> for GatewayEvent {
    fn from(code: u32) -> Self {
        match code {
            EVENT_DISCONNECT => GatewayEvent::Disconnect,
            EVENT_SCAN_COMPLETE => GatewayEvent::ScanComplete,
            other => GatewayEvent::Other(other),
        }
    }
}

/// Reacts to gateway events on behalf of one session.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScanCycleController;

impl ScanCycleController {
    /// Handle one event. Returns true when a new scan was started.
    pub async fn on_event(&self, session: &mut GatewaySession, event: &EventFrame, exit: &ExitFlag) -> bool {
        match GatewayEvent::from(event.code) {
            GatewayEvent::ScanComplete => {
                if exit.is_set() {
                    debug!(gateway = %session.id(), "scan complete while exiting");
                    return false;
                }
                session.start_scan(exit).await
            }
            GatewayEvent::Disconnect => {
                info!(gateway = %session.id(), event = %event.body, "device disconnected");
                false
            }
            GatewayEvent::Other(code) => {
                info!(gateway = %session.id(), code, "unhandled gateway event");
                false
            }
        }
    }
}
