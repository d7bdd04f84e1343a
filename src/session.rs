//! Per-gateway session lifecycle.
//!
//! A [`GatewaySession`] walks `Init -> Authenticating -> Opening ->
//! VersionCheck -> Clearing -> Scanning` during setup and ends in `Closed`,
//! either directly when setup fails before the connection was opened or via
//! `ShuttingDown` when the shutdown coordinator tears it down.

use crate::config::{GatewayCredential, ScanConfig};
use crate::gateway::{GatewayApi, GatewayConnector, GatewayFrame, ScanRequest, TransportError};
use crate::shutdown::ExitFlag;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Authenticating,
    Opening,
    VersionCheck,
    Clearing,
    Scanning,
    ShuttingDown,
    Closed,
}

/// Setup failures. Any of these ends the session.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("cannot connect to gateway API: {0}")]
    Connection(#[source] TransportError),
    #[error("authentication failed: {0}")]
    Auth(#[source] TransportError),
    #[error("cannot open gateway: {0}")]
    Open(#[source] TransportError),
    #[error("version request failed: {0}")]
    Version(#[source] TransportError),
    #[error("gateway did not report its version within {0:?}")]
    Timeout(Duration),
    #[error("cannot clear connected devices: {0}")]
    Clear(#[source] TransportError),
    #[error("cannot subscribe to gateway frames: {0}")]
    Subscribe(#[source] TransportError),
    #[error("'{operation}' is not valid in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
}

/// Steps the shutdown coordinator drives, each retried on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStep {
    StopScan,
    ListConnected,
    DisconnectAll,
    Close,
}

impl ShutdownStep {
    pub fn name(self) -> &'static str {
        match self {
            ShutdownStep::StopScan => "stop scan",
            ShutdownStep::ListConnected => "list connected devices",
            ShutdownStep::DisconnectAll => "disconnect all devices",
            ShutdownStep::Close => "close",
        }
    }
}

/// One gateway connection and what we know about it.
pub struct GatewaySession {
    id: String,
    credential: GatewayCredential,
    scan: ScanConfig,
    connection: Option<Box<dyn GatewayApi>>,
    state: SessionState,
    is_open: bool,
    is_alive: bool,
    adv_rate: usize,
}

impl GatewaySession {
    pub fn new(id: impl Into<String>, credential: GatewayCredential, scan: ScanConfig) -> Self {
        Self {
            id: id.into(),
            credential,
            scan,
            connection: None,
            state: SessionState::Init,
            is_open: false,
            is_alive: false,
            adv_rate: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The transport is open and has not been closed yet.
    pub fn is_open(&self) -> bool {
        self.is_open
    }

    /// The gateway answered a version request.
    pub fn is_alive(&self) -> bool {
        self.is_alive
    }

    /// Size of the most recent advertisement burst, before filtering.
    pub fn adv_rate(&self) -> usize {
        self.adv_rate
    }

    fn advance(
        &mut self,
        operation: &'static str,
        from: SessionState,
        to: SessionState,
    ) -> Result<(), SessionError> {
        if self.state != from {
            return Err(SessionError::InvalidState {
                operation,
                state: self.state,
            });
        }
        self.state = to;
        Ok(())
    }

    fn connection(
        &mut self,
        operation: &'static str,
    ) -> Result<&mut Box<dyn GatewayApi>, SessionError> {
        let state = self.state;
        match self.connection.as_mut() {
            Some(connection) => Ok(connection),
            None => Err(SessionError::InvalidState { operation, state }),
        }
    }

    /// Connect to the API and authenticate with the stored credential.
    pub async fn authenticate(&mut self, connector: &dyn GatewayConnector) -> Result<(), SessionError> {
        self.advance("authenticate", SessionState::Init, SessionState::Authenticating)?;

        let connection = connector
            .connect(Some(&self.id))
            .await
            .map_err(SessionError::Connection)?;
        let connection = self.connection.insert(connection);
        connection
            .auth(&self.credential)
            .await
            .map_err(SessionError::Auth)?;

        debug!(gateway = %self.id, user = %self.credential.user(), "authenticated");
        Ok(())
    }

    pub async fn open(&mut self) -> Result<(), SessionError> {
        self.advance("open", SessionState::Authenticating, SessionState::Opening)?;
        self.connection("open")?
            .open()
            .await
            .map_err(SessionError::Open)?;
        self.is_open = true;
        debug!(gateway = %self.id, "opened");
        Ok(())
    }

    /// Ask for the firmware version. An answer within `timeout` marks the
    /// gateway alive.
    pub async fn verify_version(&mut self, timeout: Duration) -> Result<String, SessionError> {
        self.advance("verify version", SessionState::Opening, SessionState::VersionCheck)?;
        let connection = self.connection("verify version")?;
        let version = tokio::time::timeout(timeout, connection.version())
            .await
            .map_err(|_| SessionError::Timeout(timeout))?
            .map_err(SessionError::Version)?;

        self.is_alive = true;
        info!(gateway = %self.id, version = %version, "gateway online");
        Ok(version)
    }

    /// Disconnect every device currently connected through the gateway.
    /// Returns how many there were.
    pub async fn clear_connected_devices(&mut self) -> Result<usize, SessionError> {
        self.advance("clear connected devices", SessionState::VersionCheck, SessionState::Clearing)?;
        let id = self.id.clone();
        let connection = self.connection("clear connected devices")?;
        let devices = connection.show().await.map_err(SessionError::Clear)?;
        for device in devices.iter().filter_map(|device| device.device_id) {
            debug!(gateway = %id, device = %device.display_mac(), "connected device");
        }
        if !devices.is_empty() {
            connection
                .disconnect_all()
                .await
                .map_err(SessionError::Clear)?;
            info!(gateway = %self.id, count = devices.len(), "disconnected devices");
        }
        Ok(devices.len())
    }

    /// Subscribe to events and reports for all devices.
    pub async fn register_handlers(
        &mut self,
    ) -> Result<mpsc::UnboundedReceiver<GatewayFrame>, SessionError> {
        self.advance("register handlers", SessionState::Clearing, SessionState::Scanning)?;
        self.connection("register handlers")?
            .subscribe()
            .await
            .map_err(SessionError::Subscribe)
    }

    /// Issue a scan with the configured mode and period.
    ///
    /// Returns whether a command was sent. Nothing is sent once the exit flag
    /// is set or outside the `Scanning` state. Errors are logged only; the
    /// session stays up and waits for the next scan-complete event.
    pub async fn start_scan(&mut self, exit: &ExitFlag) -> bool {
        if exit.is_set() || self.state != SessionState::Scanning {
            debug!(gateway = %self.id, state = ?self.state, "not starting scan");
            return false;
        }
        let request = ScanRequest {
            active: self.scan.mode.is_active(),
            period: self.scan.period,
        };
        let Some(connection) = self.connection.as_mut() else {
            return false;
        };
        match connection.list(request).await {
            Ok(()) => debug!(gateway = %self.id, mode = %self.scan.mode, period = self.scan.period, "scan started"),
            Err(e) => warn!(gateway = %self.id, error = %e, "failed to start scan"),
        }
        true
    }

    /// Record the size of an advertisement burst.
    pub fn record_burst(&mut self, len: usize) {
        self.adv_rate = len;
    }

    /// Full setup sequence: authenticate, open, verify version, clear
    /// connected devices, register handlers and start the first scan.
    pub async fn setup(
        &mut self,
        connector: &dyn GatewayConnector,
        version_timeout: Duration,
        exit: &ExitFlag,
    ) -> Result<mpsc::UnboundedReceiver<GatewayFrame>, SessionError> {
        self.authenticate(connector).await?;
        self.open().await?;
        self.verify_version(version_timeout).await?;
        self.clear_connected_devices().await?;
        let frames = self.register_handlers().await?;
        self.start_scan(exit).await;
        Ok(frames)
    }

    pub(crate) fn begin_shutdown(&mut self) {
        self.state = SessionState::ShuttingDown;
    }

    /// Run one shutdown step. For [`ShutdownStep::ListConnected`] the result
    /// is the number of connected devices, otherwise zero.
    pub(crate) async fn shutdown_step(&mut self, step: ShutdownStep) -> Result<usize, TransportError> {
        let scan = self.scan;
        let connection = self.connection.as_mut().ok_or(TransportError::Closed)?;
        match step {
            ShutdownStep::StopScan => {
                connection
                    .list(ScanRequest {
                        active: scan.mode.is_active(),
                        period: 0,
                    })
                    .await?;
                Ok(0)
            }
            ShutdownStep::ListConnected => Ok(connection.show().await?.len()),
            ShutdownStep::DisconnectAll => {
                connection.disconnect_all().await?;
                Ok(0)
            }
            ShutdownStep::Close => {
                connection.close().await?;
                Ok(0)
            }
        }
    }

    /// Drop the transport and enter the terminal state.
    pub(crate) fn mark_closed(&mut self) {
        self.connection = None;
        self.is_open = false;
        self.is_alive = false;
        self.state = SessionState::Closed;
    }

    /// The push channel ended; the gateway is no longer reachable.
    pub(crate) fn mark_lost(&mut self) {
        self.is_alive = false;
    }
}

/// The account-level connection used for auth/login and the final logout.
pub struct AccountSession {
    connection: Box<dyn GatewayApi>,
    gateway_ids: Vec<String>,
    logged_in: bool,
}

impl AccountSession {
    /// Authenticate, falling back to a full login when the short auth is
    /// refused. A login has to be undone with [`AccountSession::logout`].
    pub async fn establish(
        connector: &dyn GatewayConnector,
        credential: &GatewayCredential,
    ) -> Result<Self, SessionError> {
        let mut connection = connector.connect(None).await.map_err(SessionError::Connection)?;

        let (info, logged_in) = match connection.auth(credential).await {
            Ok(info) => (info, false),
            Err(e) => {
                debug!(error = %e, "auth refused, trying login");
                let info = connection.login(credential).await.map_err(SessionError::Auth)?;
                (info, true)
            }
        };

        info!(user = %credential.user(), gateways = info.gateway_ids.len(), "signed in");
        Ok(Self {
            connection,
            gateway_ids: info.gateway_ids,
            logged_in,
        })
    }

    pub fn gateway_ids(&self) -> &[String] {
        &self.gateway_ids
    }

    pub fn needs_logout(&self) -> bool {
        self.logged_in
    }

    pub async fn logout(&mut self) -> Result<(), TransportError> {
        self.connection.logout().await?;
        self.logged_in = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanMode;
    use crate::test_utils::{ACCOUNT, FakeConnector, credential};

    fn session(id: &str) -> GatewaySession {
        GatewaySession::new(id, credential(), ScanConfig::default())
    }

    #[tokio::test]
    async fn test_setup_walks_states() {
        let connector = FakeConnector::new(&["gw1"]);
        let exit = ExitFlag::new();
        let mut session = session("gw1");
        assert_eq!(session.state(), SessionState::Init);

        session
            .setup(&connector, Duration::from_secs(5), &exit)
            .await
            .unwrap();

        assert_eq!(session.state(), SessionState::Scanning);
        assert!(session.is_open());
        assert!(session.is_alive());
        assert_eq!(
            connector.calls("gw1"),
            vec!["auth", "open", "version", "show", "subscribe", "list"]
        );
        assert_eq!(
            connector.scan_requests("gw1"),
            vec![ScanRequest {
                active: true,
                period: 1
            }]
        );
    }

    #[tokio::test]
    async fn test_clear_disconnects_only_when_needed() {
        let connector = FakeConnector::new(&["gw1", "gw2"]);
        connector.set_connected_devices("gw2", 2);
        let exit = ExitFlag::new();

        let mut idle = session("gw1");
        idle.setup(&connector, Duration::from_secs(5), &exit).await.unwrap();
        assert_eq!(connector.count("gw1", "disconnect"), 0);

        let mut busy = session("gw2");
        busy.authenticate(&connector).await.unwrap();
        busy.open().await.unwrap();
        busy.verify_version(Duration::from_secs(5)).await.unwrap();
        assert_eq!(busy.clear_connected_devices().await.unwrap(), 2);
        assert_eq!(connector.count("gw2", "disconnect"), 1);
    }

    #[tokio::test]
    async fn test_auth_failure() {
        let connector = FakeConnector::new(&["gw1"]);
        connector.fail("gw1", "auth");
        let mut session = session("gw1");

        let err = session
            .setup(&connector, Duration::from_secs(5), &ExitFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Auth(_)));
        assert!(!session.is_open());
        assert_eq!(connector.calls("gw1"), vec!["auth"]);
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let connector = FakeConnector::new(&["gw1"]);
        connector.refuse_connect("gw1");
        let mut session = session("gw1");

        let err = session.authenticate(&connector).await.unwrap_err();
        assert!(matches!(err, SessionError::Connection(TransportError::Closed)));
        assert!(connector.calls("gw1").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_version_timeout() {
        let connector = FakeConnector::new(&["gw1"]);
        connector.hang("gw1", "version");
        let mut session = session("gw1");

        let err = session
            .setup(&connector, Duration::from_millis(5000), &ExitFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout(d) if d == Duration::from_millis(5000)));
        assert!(session.is_open());
        assert!(!session.is_alive());
        assert_eq!(session.state(), SessionState::VersionCheck);
    }

    #[tokio::test]
    async fn test_out_of_order_operation_is_rejected() {
        let mut session = session("gw1");
        assert!(matches!(
            session.open().await,
            Err(SessionError::InvalidState {
                state: SessionState::Init,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_start_scan_respects_exit_flag() {
        let connector = FakeConnector::new(&["gw1"]);
        let exit = ExitFlag::new();
        let mut session = GatewaySession::new(
            "gw1",
            credential(),
            ScanConfig {
                mode: ScanMode::Passive,
                period: 3,
            },
        );
        session.setup(&connector, Duration::from_secs(5), &exit).await.unwrap();

        assert!(session.start_scan(&exit).await);
        exit.set();
        assert!(!session.start_scan(&exit).await);

        assert_eq!(
            connector.scan_requests("gw1"),
            vec![
                ScanRequest {
                    active: false,
                    period: 3
                };
                2
            ]
        );
    }

    #[tokio::test]
    async fn test_start_scan_error_is_swallowed() {
        let connector = FakeConnector::new(&["gw1"]);
        connector.fail("gw1", "list");
        let exit = ExitFlag::new();
        let mut session = session("gw1");

        session.setup(&connector, Duration::from_secs(5), &exit).await.unwrap();
        assert!(session.start_scan(&exit).await);
        assert_eq!(session.state(), SessionState::Scanning);
    }

    #[tokio::test]
    async fn test_account_prefers_auth() {
        let connector = FakeConnector::new(&["gw1", "gw2"]);
        let account = AccountSession::establish(&connector, &credential()).await.unwrap();
        assert_eq!(account.gateway_ids(), ["gw1", "gw2"]);
        assert!(!account.needs_logout());
        assert_eq!(connector.calls(ACCOUNT), vec!["auth"]);
    }

    #[tokio::test]
    async fn test_account_falls_back_to_login() {
        let connector = FakeConnector::new(&["gw1"]);
        connector.fail(ACCOUNT, "auth");
        let mut account = AccountSession::establish(&connector, &credential()).await.unwrap();
        assert!(account.needs_logout());

        account.logout().await.unwrap();
        assert!(!account.needs_logout());
        assert_eq!(connector.calls(ACCOUNT), vec!["auth", "login", "logout"]);
    }

    #[tokio::test]
    async fn test_account_rejected() {
        let connector = FakeConnector::new(&["gw1"]);
        connector.fail(ACCOUNT, "auth");
        connector.fail(ACCOUNT, "login");
        let result = AccountSession::establish(&connector, &credential()).await;
        assert!(matches!(result, Err(SessionError::Auth(_))));
    }
}
