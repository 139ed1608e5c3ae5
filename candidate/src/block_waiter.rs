//! Receiving side of a validation stream.
//!
//! A validator runs one [`BlockWaiter`] per incoming stream. It recomputes
//! the CID of every block it receives, keeps a running byte count, and
//! finalizes when the sender closes the stream or the overall deadline
//! passes. A `Cancel` frame marks the report but the stream is still drained
//! to its end. A report is always produced and handed to a [`ReportSink`].

use crate::stream::{StreamFrame, codec, read_hello};
use anyhow::Result;
use async_trait::async_trait;
use bytes::BytesMut;
use common::{MAX_VALIDATION_BLOCKS, ValidationReport, cid_of_block};
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::{Instant, timeout, timeout_at};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Where finished validation reports go.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn report(&self, report: ValidationReport) -> Result<()>;
}

/// Posts reports to the scheduler's `/validation-results` route.
#[derive(Clone)]
pub struct HttpReportSink {
    base_url: String,
    client: reqwest::Client,
}

impl HttpReportSink {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ReportSink for HttpReportSink {
    async fn report(&self, report: ValidationReport) -> Result<()> {
        let url = format!("{}/validation-results", self.base_url);
        let resp = self.client.post(&url).json(&report).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("scheduler rejected validation report: {status} {body}");
        }
        Ok(())
    }
}

/// Timing parameters shared by every stream a validator receives.
#[derive(Clone, Copy, Debug)]
pub struct WaiterConfig {
    /// Requested streaming duration; floor for the bandwidth denominator
    pub duration: Duration,
    /// Hard limit on how long one stream may stay open
    pub max_wait: Duration,
    /// How long a new connection has to send its hello
    pub hello_timeout: Duration,
    /// CIDs recorded per report; later blocks are counted but not listed
    pub max_blocks: usize,
}

impl WaiterConfig {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            max_wait: duration + Duration::from_secs(10),
            hello_timeout: Duration::from_secs(5),
            max_blocks: MAX_VALIDATION_BLOCKS,
        }
    }
}

/// `size / max(elapsed, duration)` in bytes per second.
pub fn bandwidth(size: u64, elapsed: Duration, duration: Duration) -> f64 {
    let secs = elapsed.max(duration).as_secs_f64();
    if secs == 0.0 {
        return 0.0;
    }
    size as f64 / secs
}

pub struct BlockWaiter {
    node_id: String,
    round_id: String,
    config: WaiterConfig,
}

impl BlockWaiter {
    pub fn new(node_id: String, round_id: String, config: WaiterConfig) -> Self {
        Self {
            node_id,
            round_id,
            config,
        }
    }

    /// Consume frames until the stream ends and build the report.
    pub async fn wait<S>(self, mut frames: S) -> ValidationReport
    where
        S: Stream<Item = std::io::Result<BytesMut>> + Unpin,
    {
        let start = Instant::now();
        let deadline = start + self.config.max_wait;
        let mut report = ValidationReport {
            round_id: self.round_id,
            node_id: self.node_id,
            ..Default::default()
        };
        let mut size: u64 = 0;

        loop {
            let frame = match timeout_at(deadline, frames.next()).await {
                Err(_) => {
                    report.is_timeout = true;
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    warn!(node = %report.node_id, error = %e, "Validation stream read failed");
                    break;
                }
                Ok(Some(Ok(frame))) => frame,
            };

            match StreamFrame::decode(&frame) {
                Ok(StreamFrame::Block(data)) => {
                    if !data.is_empty() && report.cids.len() < self.config.max_blocks {
                        match cid_of_block(&data) {
                            Ok(cid) => report.cids.push(cid.to_string()),
                            Err(e) => debug!(error = %e, "Could not derive block cid"),
                        }
                    }
                    size += data.len() as u64;
                    report.random_count += 1;
                    trace!(node = %report.node_id, size, "Block received");
                }
                Ok(StreamFrame::Cancel) => report.is_cancel = true,
                Ok(StreamFrame::Hello { .. }) => {
                    debug!(node = %report.node_id, "Ignoring repeated hello");
                }
                Err(e) => {
                    warn!(node = %report.node_id, error = %e, "Malformed validation frame");
                    break;
                }
            }
        }

        let elapsed = start.elapsed();
        report.cost_time_ms = elapsed.as_millis() as u64;
        report.bandwidth = bandwidth(size, elapsed, self.config.duration);

        debug!(
            node = %report.node_id,
            blocks = report.cids.len(),
            bandwidth = report.bandwidth,
            cost_ms = report.cost_time_ms,
            is_timeout = report.is_timeout,
            is_cancel = report.is_cancel,
            size,
            random_count = report.random_count,
            "Validation stream finished"
        );
        report
    }
}

/// Accept validation streams until `shutdown` fires. Each connection gets
/// its own waiter and its report is delivered to `sink`.
pub async fn serve_validation(
    listener: TcpListener,
    sink: Arc<dyn ReportSink>,
    config: WaiterConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "Validation listener started");
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Validation listener shutting down");
                return Ok(());
            }
            accepted = listener.accept() => accepted?,
        };

        let sink = sink.clone();
        tokio::spawn(async move {
            let mut framed = Framed::new(stream, codec());
            let (node_id, round_id) = match timeout(config.hello_timeout, read_hello(&mut framed)).await {
                Ok(Ok(hello)) => hello,
                Ok(Err(e)) => {
                    warn!(peer = %peer, error = %e, "Rejected validation stream");
                    return;
                }
                Err(_) => {
                    warn!(peer = %peer, "Validation stream sent no hello");
                    return;
                }
            };

            let report = BlockWaiter::new(node_id, round_id, config)
                .wait(framed)
                .await;
            let node = report.node_id.clone();
            if let Err(e) = sink.report(report).await {
                error!(node = %node, error = %e, "Failed to deliver validation report");
            }
        });
    }
}
