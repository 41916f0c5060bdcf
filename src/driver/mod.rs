//! Run drivers: produce the lifecycle event sequence for one run.
//!
//! Two interchangeable implementations sit behind [`RunDriver`]: a local
//! simulation of the pipeline and a client for a remote executor. The choice is
//! made once when the application is composed.

mod remote;
mod simulated;
mod synth;
#[cfg(test)]
pub(crate) mod test_executor;

pub use remote::{ExecutorClient, RemoteDriver};
pub use simulated::{SimulatedDriver, SimulationTiming};

use crate::model::{RunEvent, RunRecord, RunSpecification};
use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum DriverControl {
    /// Stop emitting events for this run.
    Cancel,
}

/// Failures talking to the executor, phrased for the user.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Cannot connect to backend at {endpoint}. Make sure the backend is running and accessible.")]
    Unreachable {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{context}: {detail}")]
    Status {
        context: &'static str,
        detail: String,
    },
    #[error("{context}: unexpected response body")]
    Decode {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
}

/// Handle to a started driver task.
pub struct DriverHandle {
    ctrl_tx: mpsc::UnboundedSender<DriverControl>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl DriverHandle {
    fn new(
        ctrl_tx: mpsc::UnboundedSender<DriverControl>,
        handle: tokio::task::JoinHandle<()>,
    ) -> Self {
        Self {
            ctrl_tx,
            handle: Some(handle),
        }
    }

    /// Ask the driver to stop. Observed at the driver's next suspension point.
    pub fn cancel(&self) {
        let _ = self.ctrl_tx.send(DriverControl::Cancel);
    }

    /// Wait for the driver task to exit.
    pub async fn join(mut self) {
        if let Some(h) = self.handle.take() {
            if let Err(e) = h.await {
                tracing::warn!("driver task ended abnormally: {e}");
            }
        }
    }
}

#[async_trait]
pub trait RunDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Register a new run and return its identifier.
    async fn submit(&self, spec: &RunSpecification) -> Result<String, TransportError>;

    /// Best available copy of a run record.
    async fn fetch(&self, run_id: &str) -> Option<RunRecord>;

    /// Start emitting events for `run_id` into `events`. Returns immediately.
    fn start(
        &self,
        run_id: &str,
        spec: &RunSpecification,
        events: mpsc::UnboundedSender<RunEvent>,
    ) -> DriverHandle;

    /// Ask the executor to stop a run this process is not streaming.
    async fn cancel_remote(&self, run_id: &str) -> Result<(), TransportError>;
}

/// `run_<unix-ms>_<9 base36 chars>`
pub fn new_run_id() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let millis = time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("run_{millis}_{suffix}")
}

/// Resolves once a cancel is requested. A closed control channel never resolves.
async fn cancel_requested(ctrl_rx: &mut mpsc::UnboundedReceiver<DriverControl>) {
    match ctrl_rx.recv().await {
        Some(DriverControl::Cancel) => {}
        None => futures::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_have_expected_shape_and_differ() {
        let a = new_run_id();
        let b = new_run_id();
        assert_ne!(a, b);
        let parts: Vec<_> = a.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "run");
        assert!(parts[1].parse::<u64>().is_ok());
        assert_eq!(parts[2].len(), 9);
        assert!(parts[2].chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }
}
