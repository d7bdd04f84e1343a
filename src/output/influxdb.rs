//! InfluxDB 1.x HTTP sink.

use super::line_protocol::DataPoint;
use super::{SinkError, TelemetrySink};
use futures::future::BoxFuture;
use reqwest::{Client, Response};
use std::time::Duration;
use tracing::info;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Writes points to an InfluxDB database through the `/write` endpoint.
pub struct InfluxDbSink {
    client: Client,
    base_url: String,
    database: String,
}

impl InfluxDbSink {
    /// # Arguments
    /// * `base_url` - Server URL, e.g. `http://localhost:8086`
    /// * `database` - Database to write into; created by [`TelemetrySink::probe`]
    pub fn new(base_url: &str, database: impl Into<String>) -> Result<Self, SinkError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            database: database.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

async fn check_status(response: Response) -> Result<(), SinkError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(SinkError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Body of a `/write` request, one point per line.
pub fn write_body(points: &[DataPoint]) -> String {
    points
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

impl TelemetrySink for InfluxDbSink {
    fn probe(&mut self) -> BoxFuture<'_, Result<(), SinkError>> {
        Box::pin(async move {
            let ping = self.client.get(self.url("ping")).send().await?;
            check_status(ping).await?;

            // CREATE DATABASE is a no-op when the database already exists.
            let statement = format!("CREATE DATABASE \"{}\"", self.database.replace('"', "\\\""));
            let create = self
                .client
                .post(self.url("query"))
                .query(&[("q", statement.as_str())])
                .send()
                .await?;
            check_status(create).await?;

            info!(url = %self.base_url, database = %self.database, "connected to InfluxDB");
            Ok(())
        })
    }

    fn write_points<'a>(
        &'a mut self,
        points: &'a [DataPoint],
    ) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            if points.is_empty() {
                return Ok(());
            }
            let response = self
                .client
                .post(self.url("write"))
                .query(&[("db", self.database.as_str()), ("precision", "ns")])
                .body(write_body(points))
                .send()
                .await?;
            check_status(response).await
        })
    }
}
