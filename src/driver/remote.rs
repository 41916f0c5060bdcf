use super::{cancel_requested, DriverControl, DriverHandle, RunDriver, TransportError};
use crate::model::{RunEvent, RunRecord, RunSpecification};
use crate::sse::SseDecoder;
use crate::store::RunStore;
use crate::wire::{decode_event, ErrorBody, StartRunRequest, StartRunResponse, WireRun};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{header, StatusCode};
use std::time::Duration;
use tokio::sync::mpsc;

/// Consecutive stream failures tolerated before giving up on the channel.
const MAX_CONSECUTIVE_ERRORS: u32 = 3;
/// Reconnect delay when the server has not sent a `retry:` field.
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(3);
/// Upper bound on waiting for the executor to take a cancel request.
const CANCEL_TIMEOUT: Duration = Duration::from_secs(2);
/// Whole-request limit for submit and fetch. The event stream has none.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP client for the executor's run API.
#[derive(Clone)]
pub struct ExecutorClient {
    http: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl ExecutorClient {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(format!("veritas-pytest/{}", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            request_timeout: REQUEST_TIMEOUT,
        })
    }

    /// Override the limit for one-shot requests. Cancel never waits past `CANCEL_TIMEOUT`.
    #[cfg(test)]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn run_url(&self, run_id: &str, suffix: &str) -> String {
        format!("{}/runs/{run_id}{suffix}", self.base_url)
    }

    /// `POST /runs`
    pub async fn submit(&self, spec: &RunSpecification) -> Result<String, TransportError> {
        const CONTEXT: &str = "Failed to start run";
        let url = format!("{}/runs", self.base_url);
        tracing::debug!(%url, "submitting run");
        let resp = self
            .http
            .post(&url)
            .timeout(self.request_timeout)
            .json(&StartRunRequest::from(spec))
            .send()
            .await
            .map_err(|source| self.unreachable(source))?;
        if !resp.status().is_success() {
            return Err(status_error(CONTEXT, resp).await);
        }
        let body: StartRunResponse = resp
            .json()
            .await
            .map_err(|source| TransportError::Decode {
                context: CONTEXT,
                source,
            })?;
        Ok(body.run_id)
    }

    /// `GET /runs/{id}`; `Ok(None)` when the executor does not know the run.
    pub async fn fetch(&self, run_id: &str) -> Result<Option<RunRecord>, TransportError> {
        const CONTEXT: &str = "Failed to fetch run";
        let resp = self
            .http
            .get(self.run_url(run_id, ""))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|source| self.unreachable(source))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(status_error(CONTEXT, resp).await);
        }
        let run: WireRun = resp
            .json()
            .await
            .map_err(|source| TransportError::Decode {
                context: CONTEXT,
                source,
            })?;
        Ok(Some(run.into()))
    }

    /// `POST /runs/{id}/cancel`
    pub async fn cancel(&self, run_id: &str) -> Result<(), TransportError> {
        let resp = self
            .http
            .post(self.run_url(run_id, "/cancel"))
            .timeout(self.request_timeout.min(CANCEL_TIMEOUT))
            .send()
            .await
            .map_err(|source| self.unreachable(source))?;
        if !resp.status().is_success() {
            return Err(status_error("Failed to cancel run", resp).await);
        }
        Ok(())
    }

    fn unreachable(&self, source: reqwest::Error) -> TransportError {
        tracing::warn!(endpoint = %self.base_url, "executor unreachable: {source}");
        TransportError::Unreachable {
            endpoint: self.base_url.clone(),
            source,
        }
    }
}

/// Map a non-2xx response: server-provided `detail`/`message` if any, else the status text.
async fn status_error(context: &'static str, resp: reqwest::Response) -> TransportError {
    let status = resp.status();
    let status_text = status
        .canonical_reason()
        .map(str::to_string)
        .unwrap_or_else(|| status.as_str().to_string());
    let detail = resp
        .text()
        .await
        .ok()
        .and_then(|body| serde_json::from_str::<ErrorBody>(&body).ok())
        .and_then(|body| body.best_message())
        .unwrap_or(status_text);
    TransportError::Status { context, detail }
}

/// Streams a run from a remote executor over server-sent events.
pub struct RemoteDriver {
    client: ExecutorClient,
    store: RunStore,
    retry_delay: Duration,
}

impl RemoteDriver {
    pub fn new(client: ExecutorClient, store: RunStore) -> Self {
        Self {
            client,
            store,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Override the reconnect delay used when the server does not send one.
    #[cfg(test)]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

#[async_trait]
impl RunDriver for RemoteDriver {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn submit(&self, spec: &RunSpecification) -> Result<String, TransportError> {
        self.client.submit(spec).await
    }

    async fn fetch(&self, run_id: &str) -> Option<RunRecord> {
        match self.client.fetch(run_id).await {
            Ok(Some(record)) => {
                self.store.save(&record);
                Some(record)
            }
            Ok(None) => {
                tracing::info!(run_id, "executor does not know this run, using local copy");
                self.store.get(run_id)
            }
            Err(e) => {
                tracing::warn!(run_id, "fetch failed, using local copy: {e}");
                self.store.get(run_id)
            }
        }
    }

    fn start(
        &self,
        run_id: &str,
        _spec: &RunSpecification,
        events: mpsc::UnboundedSender<RunEvent>,
    ) -> DriverHandle {
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel::<DriverControl>();
        let stream = EventStream {
            client: self.client.clone(),
            store: self.store.clone(),
            run_id: run_id.to_string(),
            retry_delay: self.retry_delay,
            events,
            ctrl_rx,
        };
        let handle = tokio::spawn(stream.run());
        DriverHandle::new(ctrl_tx, handle)
    }

    async fn cancel_remote(&self, run_id: &str) -> Result<(), TransportError> {
        self.client.cancel(run_id).await
    }
}

enum Flow {
    Continue,
    Finished,
}

enum Disconnect {
    Cancelled,
    Finished,
    Failed(String),
}

struct EventStream {
    client: ExecutorClient,
    store: RunStore,
    run_id: String,
    retry_delay: Duration,
    events: mpsc::UnboundedSender<RunEvent>,
    ctrl_rx: mpsc::UnboundedReceiver<DriverControl>,
}

impl EventStream {
    async fn run(mut self) {
        let url = self.client.run_url(&self.run_id, "/stream");
        let mut decoder = SseDecoder::new();
        // Reset when a message arrives, not when a connection opens.
        let mut consecutive_errors = 0u32;

        loop {
            match self.connect_and_read(&url, &mut decoder, &mut consecutive_errors).await {
                Disconnect::Finished => return,
                Disconnect::Cancelled => {
                    self.send_remote_cancel().await;
                    return;
                }
                Disconnect::Failed(reason) => {
                    consecutive_errors += 1;
                    tracing::warn!(
                        run_id = %self.run_id,
                        attempt = consecutive_errors,
                        "event stream error: {reason}"
                    );
                }
            }

            if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                tracing::error!(run_id = %self.run_id, %url, "too many stream errors, closing");
                let _ = self.events.send(RunEvent::log(format!(
                    "⚠ Event stream failed after {MAX_CONSECUTIVE_ERRORS} attempts. \
                     Falling back to polling: run `veritas-pytest resume {}`.",
                    self.run_id
                )));
                return;
            }

            decoder.reset_partial();
            let delay = decoder.retry().unwrap_or(self.retry_delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel_requested(&mut self.ctrl_rx) => {
                    self.send_remote_cancel().await;
                    return;
                }
            }
        }
    }

    async fn connect_and_read(
        &mut self,
        url: &str,
        decoder: &mut SseDecoder,
        consecutive_errors: &mut u32,
    ) -> Disconnect {
        let mut req = self
            .client
            .http
            .get(url)
            .header(header::ACCEPT, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache");
        if let Some(id) = decoder.last_event_id() {
            req = req.header("Last-Event-ID", id);
        }

        tracing::debug!(%url, "connecting event stream");
        let resp = tokio::select! {
            res = req.send() => res,
            _ = cancel_requested(&mut self.ctrl_rx) => return Disconnect::Cancelled,
        };
        let resp = match resp {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => return Disconnect::Failed(format!("HTTP {}", r.status())),
            Err(e) => return Disconnect::Failed(e.to_string()),
        };
        tracing::info!(run_id = %self.run_id, "event stream open");

        let mut body = resp.bytes_stream();
        loop {
            let chunk = tokio::select! {
                c = body.next() => c,
                _ = cancel_requested(&mut self.ctrl_rx) => return Disconnect::Cancelled,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    for msg in decoder.push(&bytes) {
                        *consecutive_errors = 0;
                        tracing::trace!(event = ?msg.event, id = ?msg.id, "stream message");
                        if let Flow::Finished = self.handle_message(&msg.data) {
                            return Disconnect::Finished;
                        }
                    }
                }
                Some(Err(e)) => return Disconnect::Failed(e.to_string()),
                None => return Disconnect::Failed("stream closed before run_complete".into()),
            }
        }
    }

    fn handle_message(&self, data: &str) -> Flow {
        let decoded = match decode_event(data) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(run_id = %self.run_id, "skipping stream message: {e}");
                return Flow::Continue;
            }
        };
        if let Some(record) = &decoded.full_record {
            self.store.save(record);
        }
        let finished = matches!(decoded.event, RunEvent::RunComplete { .. });
        if self.events.send(decoded.event).is_err() {
            tracing::debug!(run_id = %self.run_id, "event receiver dropped, closing stream");
            return Flow::Finished;
        }
        if finished {
            Flow::Finished
        } else {
            Flow::Continue
        }
    }

    /// Best effort: the outcome is logged and never reported back to the caller.
    async fn send_remote_cancel(&self) {
        let run_id = &self.run_id;
        match tokio::time::timeout(CANCEL_TIMEOUT, self.client.cancel(run_id)).await {
            Ok(Ok(())) => tracing::info!(%run_id, "executor acknowledged cancel"),
            Ok(Err(e)) => tracing::warn!(%run_id, "remote cancel failed: {e}"),
            Err(_) => tracing::warn!(%run_id, "remote cancel timed out"),
        }
    }
}
