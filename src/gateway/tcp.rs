//! JSON-lines gateway transport over TCP.
//!
//! Each line is one JSON object. Requests carry an `id` and a `cmd`; replies
//! echo the `id` with either `result` or `error`. Lines without an `id` are
//! push frames: `{"event": CODE, ...}` or `{"report": CODE, "nodes": [...]}`.
//!
//! A background reader task owns the read half of the stream. It completes
//! pending requests through oneshot channels and forwards push frames, in
//! arrival order, to the channel handed out by [`GatewayApi::subscribe`].

use super::{
    AccountInfo, ConnectedDevice, EventFrame, GatewayApi, GatewayConnector, GatewayFrame,
    REPORT_ADVERTISEMENT, REPORT_NOTIFICATION, ReportFrame, ScanRequest, TransportError,
};
use crate::advertisement::RawAdvertisement;
use crate::config::GatewayCredential;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Upper bound on how long any single request waits for its reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct WireError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Clone, PartialEq)]
struct Reply {
    result: Value,
    error: Option<WireError>,
}

#[derive(Debug, Clone, PartialEq)]
enum Incoming {
    Reply(u64, Reply),
    Frame(GatewayFrame),
}

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

fn lock(pending: &PendingReplies) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Reply>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Connects to a gateway API server speaking JSON lines over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
    request_timeout: Duration,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl GatewayConnector for TcpConnector {
    fn connect<'a>(
        &'a self,
        gateway_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Box<dyn GatewayApi>, TransportError>> {
        Box::pin(async move {
            let stream = TcpStream::connect(&self.address).await?;
            stream.set_nodelay(true)?;
            let (reader, writer) = stream.into_split();
            let connection = JsonLineConnection::new(
                reader,
                writer,
                gateway_id.map(str::to_string),
                self.request_timeout,
            );
            Ok(Box::new(connection) as Box<dyn GatewayApi>)
        })
    }
}

/// A [`GatewayApi`] connection over any byte stream.
pub struct JsonLineConnection<W> {
    gateway_id: Option<String>,
    writer: W,
    pending: PendingReplies,
    frames: Option<mpsc::UnboundedReceiver<GatewayFrame>>,
    next_id: u64,
    request_timeout: Duration,
    reader_task: JoinHandle<()>,
}

impl<W> JsonLineConnection<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Wrap the two halves of a stream. Must be called within a tokio runtime.
    pub fn new<R>(
        reader: R,
        writer: W,
        gateway_id: Option<String>,
        request_timeout: Duration,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let pending = PendingReplies::default();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let label = gateway_id.clone().unwrap_or_else(|| "account".to_string());
        let reader_task = tokio::spawn(read_loop(reader, pending.clone(), frame_tx, label));

        Self {
            gateway_id,
            writer,
            pending,
            frames: Some(frame_rx),
            next_id: 1,
            request_timeout,
            reader_task,
        }
    }

    async fn request(&mut self, command: &str, params: Value) -> Result<Value, TransportError> {
        let id = self.next_id;
        self.next_id += 1;

        let mut message = Map::new();
        message.insert("id".into(), id.into());
        message.insert("cmd".into(), command.into());
        if let Some(gateway_id) = &self.gateway_id {
            message.insert("gwid".into(), gateway_id.clone().into());
        }
        if let Value::Object(params) = params {
            message.extend(params);
        }

        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        trace!(id, command, "sending request");

        if let Err(e) = self.send_line(&line).await {
            lock(&self.pending).remove(&id);
            return Err(e.into());
        }

        let reply = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(TransportError::Closed),
            Err(_) => {
                lock(&self.pending).remove(&id);
                return Err(TransportError::Timeout(command.to_string()));
            }
        };

        match reply.error {
            Some(error) => Err(TransportError::Rejected {
                command: command.to_string(),
                code: error.code,
                message: error.message,
            }),
            None => Ok(reply.result),
        }
    }

    async fn send_line(&mut self, line: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(line).await?;
        self.writer.flush().await
    }
}

impl<W> Drop for JsonLineConnection<W> {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

impl<W> GatewayApi for JsonLineConnection<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn auth<'a>(
        &'a mut self,
        credential: &'a GatewayCredential,
    ) -> BoxFuture<'a, Result<AccountInfo, TransportError>> {
        Box::pin(async move {
            let result = self.request("auth", credential_params(credential)).await?;
            Ok(serde_json::from_value(result)?)
        })
    }

    fn login<'a>(
        &'a mut self,
        credential: &'a GatewayCredential,
    ) -> BoxFuture<'a, Result<AccountInfo, TransportError>> {
        Box::pin(async move {
            let result = self.request("login", credential_params(credential)).await?;
            Ok(serde_json::from_value(result)?)
        })
    }

    fn logout(&mut self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move { self.request("logout", json!({})).await.map(drop) })
    }

    fn open(&mut self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move { self.request("open", json!({})).await.map(drop) })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move { self.request("close", json!({})).await.map(drop) })
    }

    fn version(&mut self) -> BoxFuture<'_, Result<String, TransportError>> {
        Box::pin(async move {
            let result = self.request("version", json!({})).await?;
            let version = result
                .as_str()
                .or_else(|| result.get("version").and_then(Value::as_str));
            Ok(version.map_or_else(|| result.to_string(), str::to_string))
        })
    }

    fn show(&mut self) -> BoxFuture<'_, Result<Vec<ConnectedDevice>, TransportError>> {
        Box::pin(async move {
            let mut result = self.request("show", json!({})).await?;
            match result.get_mut("nodes").map(Value::take) {
                Some(nodes) => Ok(serde_json::from_value(nodes)?),
                None => Ok(Vec::new()),
            }
        })
    }

    fn disconnect_all(&mut self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.request("disconnect", json!({"did": "*"}))
                .await
                .map(drop)
        })
    }

    fn list(&mut self, request: ScanRequest) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let params = serde_json::to_value(request)?;
            self.request("list", params).await.map(drop)
        })
    }

    fn subscribe(
        &mut self,
    ) -> BoxFuture<'_, Result<mpsc::UnboundedReceiver<GatewayFrame>, TransportError>> {
        Box::pin(async move {
            if self.frames.is_none() {
                return Err(TransportError::AlreadySubscribed);
            }
            self.request("event", json!({"did": "*"})).await?;
            self.request("report", json!({"did": "*"})).await?;
            self.frames.take().ok_or(TransportError::AlreadySubscribed)
        })
    }
}

fn credential_params(credential: &GatewayCredential) -> Value {
    json!({"user": credential.user(), "pwd": credential.password()})
}

async fn read_loop<R>(
    reader: R,
    pending: PendingReplies,
    frames: mpsc::UnboundedSender<GatewayFrame>,
    label: String,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!(gateway = %label, "gateway connection closed by peer");
                break;
            }
            Err(e) => {
                warn!(gateway = %label, error = %e, "gateway connection read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match decode_message(&line, &label) {
            Ok(Some(Incoming::Reply(id, reply))) => match lock(&pending).remove(&id) {
                Some(waiter) => {
                    let _ = waiter.send(reply);
                }
                None => debug!(gateway = %label, id, "reply for unknown request"),
            },
            Ok(Some(Incoming::Frame(frame))) => {
                // Nobody listening is fine: the connection was never subscribed.
                let _ = frames.send(frame);
            }
            Ok(None) => debug!(gateway = %label, line = %line, "ignoring unrecognised message"),
            Err(e) => warn!(gateway = %label, error = %e, "malformed message from gateway"),
        }
    }

    // Dropping the waiters fails every outstanding request with `Closed`.
    lock(&pending).clear();
}

fn decode_message(line: &str, label: &str) -> Result<Option<Incoming>, serde_json::Error> {
    let mut value: Value = serde_json::from_str(line)?;

    if let Some(id) = value.get("id").and_then(Value::as_u64) {
        let error = match value.get_mut("error").map(Value::take) {
            None | Some(Value::Null) => None,
            Some(error) => Some(serde_json::from_value(error)?),
        };
        let result = value.get_mut("result").map(Value::take).unwrap_or_default();
        return Ok(Some(Incoming::Reply(id, Reply { result, error })));
    }

    // Codes that do not fit a u32 are not gateway codes; treat as unrecognised.
    let code_of = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|code| u32::try_from(code).ok())
    };

    if let Some(code) = code_of("event") {
        return Ok(Some(Incoming::Frame(GatewayFrame::Event(EventFrame {
            code,
            body: value,
        }))));
    }

    if let Some(code) = code_of("report") {
        let report = match code {
            REPORT_ADVERTISEMENT => {
                let nodes = match value.get_mut("nodes").map(Value::take) {
                    Some(Value::Array(nodes)) => nodes,
                    _ => Vec::new(),
                };
                ReportFrame::Advertisements(decode_advertisements(nodes, label))
            }
            REPORT_NOTIFICATION => ReportFrame::Notification(value),
            code => ReportFrame::Other { code, body: value },
        };
        return Ok(Some(Incoming::Frame(GatewayFrame::Report(report))));
    }

    Ok(None)
}

/// Decode each node independently so one bad entry doesn't lose the burst.
fn decode_advertisements(nodes: Vec<Value>, label: &str) -> Vec<RawAdvertisement> {
    nodes
        .into_iter()
        .filter_map(|node| match serde_json::from_value(node) {
            Ok(adv) => Some(adv),
            Err(e) => {
                warn!(gateway = %label, error = %e, "skipping malformed advertisement");
                None
            }
        })
        .collect()
}
