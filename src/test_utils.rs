use crate::advertisement::{AD_TYPE_COMPLETE_NAME, RawAdvertisement, Tlv};
use crate::config::GatewayCredential;
use crate::gateway::{
    AccountInfo, ConnectedDevice, GatewayApi, GatewayConnector, GatewayFrame, ScanRequest,
    TransportError,
};
use crate::output::line_protocol::DataPoint;
use crate::output::{SinkError, TelemetrySink};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Reference iBeacon manufacturer data: Apple, UUID E2C56DB5-..., major 1,
/// minor 2, -59 dBm at 1 m.
pub const IBEACON_HEX: &str = "4C000215E2C56DB5DFFB48D2B060D0F5A71096E000010002C5";

/// Credential used by every fake account.
pub fn credential() -> GatewayCredential {
    GatewayCredential::new("tester", "secret")
}

/// Build an advertisement from `did` with empty payloads.
///
/// Tests can override just the fields they care about.
pub fn advertisement(did: &str) -> RawAdvertisement {
    RawAdvertisement {
        device_id: did.parse().unwrap(),
        device_type: 0,
        event_type: 0,
        rssi: -60,
        seconds: 1,
        microseconds: 0,
        adv_payload: Vec::new(),
        scan_response_payload: Vec::new(),
    }
}

/// Advertisement with flags and a complete local name.
pub fn named_advertisement(did: &str, name: &str) -> RawAdvertisement {
    let mut adv = advertisement(did);
    adv.adv_payload = vec![Tlv::new(0x01, "06"), Tlv::new(AD_TYPE_COMPLETE_NAME, name)];
    adv
}

/// Label used for commands sent on the account connection.
pub const ACCOUNT: &str = "account";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    Always,
    Times(usize),
}

#[derive(Default)]
struct FakeState {
    gateway_ids: Vec<String>,
    calls: Vec<(String, &'static str)>,
    scan_requests: Vec<(String, ScanRequest)>,
    failures: HashMap<(String, &'static str), Failure>,
    hanging: Vec<(String, &'static str)>,
    connected_devices: HashMap<String, usize>,
    frames: HashMap<String, mpsc::UnboundedSender<GatewayFrame>>,
    refuse_connect: Vec<String>,
}

/// Scripted gateway API. Records every command and fails the ones it is told
/// to fail.
#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Arc<Mutex<FakeState>>,
}

impl FakeConnector {
    pub fn new(gateway_ids: &[&str]) -> Self {
        let connector = Self::default();
        connector.state().gateway_ids = gateway_ids.iter().map(|id| id.to_string()).collect();
        connector
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Make `command` on `gateway` fail every time.
    pub fn fail(&self, gateway: &str, command: &'static str) {
        self.state()
            .failures
            .insert((gateway.to_string(), command), Failure::Always);
    }

    /// Make `command` on `gateway` fail the next `times` calls.
    pub fn fail_times(&self, gateway: &str, command: &'static str, times: usize) {
        self.state()
            .failures
            .insert((gateway.to_string(), command), Failure::Times(times));
    }

    /// Make `command` on `gateway` never answer.
    pub fn hang(&self, gateway: &str, command: &'static str) {
        self.state().hanging.push((gateway.to_string(), command));
    }

    pub fn refuse_connect(&self, gateway: &str) {
        self.state().refuse_connect.push(gateway.to_string());
    }

    pub fn set_connected_devices(&self, gateway: &str, count: usize) {
        self.state()
            .connected_devices
            .insert(gateway.to_string(), count);
    }

    /// Commands issued on `gateway`, in order.
    pub fn calls(&self, gateway: &str) -> Vec<&'static str> {
        self.state()
            .calls
            .iter()
            .filter(|(gw, _)| gw == gateway)
            .map(|(_, command)| *command)
            .collect()
    }

    pub fn count(&self, gateway: &str, command: &str) -> usize {
        self.calls(gateway).iter().filter(|c| **c == command).count()
    }

    /// Scan commands issued on `gateway`, including stop requests.
    pub fn scan_requests(&self, gateway: &str) -> Vec<ScanRequest> {
        self.state()
            .scan_requests
            .iter()
            .filter(|(gw, _)| gw == gateway)
            .map(|(_, request)| *request)
            .collect()
    }

    /// Push a frame to `gateway`'s subscriber. Returns false if nobody is
    /// subscribed.
    pub fn push(&self, gateway: &str, frame: GatewayFrame) -> bool {
        self.state()
            .frames
            .get(gateway)
            .is_some_and(|tx| tx.send(frame).is_ok())
    }

    /// Drop the push channel, as if the gateway connection went away.
    pub fn drop_frames(&self, gateway: &str) {
        self.state().frames.remove(gateway);
    }
}

impl GatewayConnector for FakeConnector {
    fn connect<'a>(
        &'a self,
        gateway_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Box<dyn GatewayApi>, TransportError>> {
        Box::pin(async move {
            let label = gateway_id.unwrap_or(ACCOUNT).to_string();
            if self.state().refuse_connect.contains(&label) {
                return Err(TransportError::Closed);
            }
            Ok(Box::new(FakeGateway {
                label,
                state: self.state.clone(),
            }) as Box<dyn GatewayApi>)
        })
    }
}

struct FakeGateway {
    label: String,
    state: Arc<Mutex<FakeState>>,
}

impl FakeGateway {
    /// Record the call and decide its outcome. `None` means hang forever.
    fn call(&self, command: &'static str) -> Option<Result<(), TransportError>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push((self.label.clone(), command));

        let key = (self.label.clone(), command);
        if state.hanging.contains(&key) {
            return None;
        }
        let outcome = match state.failures.get_mut(&key) {
            Some(Failure::Always) => Err(()),
            Some(Failure::Times(n)) if *n > 0 => {
                *n -= 1;
                Err(())
            }
            _ => Ok(()),
        };
        Some(outcome.map_err(|()| TransportError::Rejected {
            command: command.to_string(),
            code: 500,
            message: "scripted failure".to_string(),
        }))
    }

    fn run(&self, command: &'static str) -> BoxFuture<'static, Result<(), TransportError>> {
        let outcome = self.call(command);
        Box::pin(async move {
            match outcome {
                Some(result) => result,
                None => std::future::pending().await,
            }
        })
    }
}

impl GatewayApi for FakeGateway {
    fn auth<'a>(
        &'a mut self,
        _credential: &'a GatewayCredential,
    ) -> BoxFuture<'a, Result<AccountInfo, TransportError>> {
        Box::pin(async move {
            self.run("auth").await?;
            let gateway_ids = self.state.lock().unwrap().gateway_ids.clone();
            Ok(AccountInfo { gateway_ids })
        })
    }

    fn login<'a>(
        &'a mut self,
        _credential: &'a GatewayCredential,
    ) -> BoxFuture<'a, Result<AccountInfo, TransportError>> {
        Box::pin(async move {
            self.run("login").await?;
            let gateway_ids = self.state.lock().unwrap().gateway_ids.clone();
            Ok(AccountInfo { gateway_ids })
        })
    }

    fn logout(&mut self) -> BoxFuture<'_, Result<(), TransportError>> {
        self.run("logout")
    }

    fn open(&mut self) -> BoxFuture<'_, Result<(), TransportError>> {
        self.run("open")
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), TransportError>> {
        self.run("close")
    }

    fn version(&mut self) -> BoxFuture<'_, Result<String, TransportError>> {
        Box::pin(async move {
            self.run("version").await?;
            Ok("2.1.0".to_string())
        })
    }

    fn show(&mut self) -> BoxFuture<'_, Result<Vec<ConnectedDevice>, TransportError>> {
        Box::pin(async move {
            self.run("show").await?;
            let count = self
                .state
                .lock()
                .unwrap()
                .connected_devices
                .get(&self.label)
                .copied()
                .unwrap_or(0);
            Ok(vec![ConnectedDevice::default(); count])
        })
    }

    fn disconnect_all(&mut self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.run("disconnect").await?;
            self.state
                .lock()
                .unwrap()
                .connected_devices
                .remove(&self.label);
            Ok(())
        })
    }

    fn list(&mut self, request: ScanRequest) -> BoxFuture<'_, Result<(), TransportError>> {
        self.state
            .lock()
            .unwrap()
            .scan_requests
            .push((self.label.clone(), request));
        self.run("list")
    }

    fn subscribe(
        &mut self,
    ) -> BoxFuture<'_, Result<mpsc::UnboundedReceiver<GatewayFrame>, TransportError>> {
        Box::pin(async move {
            self.run("subscribe").await?;
            let (tx, rx) = mpsc::unbounded_channel();
            self.state
                .lock()
                .unwrap()
                .frames
                .insert(self.label.clone(), tx);
            Ok(rx)
        })
    }
}

#[derive(Default)]
struct SinkState {
    lines: Vec<String>,
    write_attempts: usize,
    fail_probe: bool,
    fail_writes: bool,
}

/// Telemetry sink that keeps line protocol in memory.
#[derive(Clone, Default)]
pub struct RecordingSink {
    state: Arc<Mutex<SinkState>>,
}

impl RecordingSink {
    pub fn failing_probe() -> Self {
        let sink = Self::default();
        sink.state.lock().unwrap().fail_probe = true;
        sink
    }

    pub fn failing_writes() -> Self {
        let sink = Self::default();
        sink.state.lock().unwrap().fail_writes = true;
        sink
    }

    pub fn lines(&self) -> Vec<String> {
        self.state.lock().unwrap().lines.clone()
    }

    pub fn write_attempts(&self) -> usize {
        self.state.lock().unwrap().write_attempts
    }
}

fn unavailable() -> SinkError {
    SinkError::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionRefused,
        "sink unavailable",
    ))
}

impl TelemetrySink for RecordingSink {
    fn probe(&mut self) -> BoxFuture<'_, Result<(), SinkError>> {
        let fail = self.state.lock().unwrap().fail_probe;
        Box::pin(async move { if fail { Err(unavailable()) } else { Ok(()) } })
    }

    fn write_points<'a>(
        &'a mut self,
        points: &'a [DataPoint],
    ) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.write_attempts += 1;
            if state.fail_writes {
                return Err(unavailable());
            }
            state.lines.extend(points.iter().map(ToString::to_string));
            Ok(())
        })
    }
}
