//! Connection manager: authenticated per-connection delivery with
//! resilience.
//!
//! All sends flow through a bounded job channel consumed by a fixed worker
//! pool; the pool is the sole mutation point for per-connection circuit
//! state. The send protocol: confirm the record exists and is unexpired,
//! consult the breaker, POST through the gateway transport, classify the
//! outcome (success / gone / transient), retry transient failures with
//! jittered exponential backoff, and reap gone connections on observation.

pub mod breaker;
pub mod metrics;

pub use breaker::{CircuitBreaker, CircuitState};
pub use metrics::MetricsSnapshot;

use crate::store::{ConnectionStore, StoreError};
use crate::transport::{GatewayTransport, TransportError};
use dashmap::DashMap;
use metrics::{ActiveGuard, LatencyWindow, SenderCounters};
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use switchconf::SenderConfig;
use switchproto::{now_secs, Frame, RetryConfig};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const JOB_CHANNEL_CAPACITY: usize = 256;

/// Send failures, classified.
#[derive(Debug, Clone, Error)]
pub enum SendError {
    #[error("connection not found: {0}")]
    NotFound(String),

    /// The endpoint reported the peer gone; the record has been reaped.
    #[error("connection stale: {0}")]
    Stale(String),

    /// Retries exhausted on a transient failure class.
    #[error("transient send failure: {0}")]
    Transient(String),

    /// Circuit open for this connection; no I/O was attempted.
    #[error("circuit open for connection {0}")]
    CircuitOpen(String),

    #[error("connection manager is shutting down")]
    ShuttingDown,
}

impl SendError {
    /// Stale-equivalent classes: the connection is not worth retrying.
    pub fn is_stale_class(&self) -> bool {
        matches!(self, Self::Stale(_) | Self::CircuitOpen(_) | Self::NotFound(_))
    }
}

/// Shutdown failure.
#[derive(Debug, Clone, Error)]
pub enum ShutdownError {
    #[error("shutdown deadline exceeded; pending sends were aborted")]
    Timeout,
}

/// Aggregate outcome of a broadcast fan-out.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BroadcastOutcome {
    pub delivered: Vec<String>,
    pub stale: Vec<String>,
    /// (connection_id, reason) for transient and infrastructure failures.
    pub failed: Vec<(String, String)>,
}

impl BroadcastOutcome {
    pub fn successes(&self) -> usize {
        self.delivered.len()
    }

    pub fn is_complete(&self) -> bool {
        self.stale.is_empty() && self.failed.is_empty()
    }
}

/// Tunables, decoupled from the config file shape so tests can use
/// sub-second cool-downs.
#[derive(Debug, Clone)]
pub struct SenderOptions {
    pub pool_size: usize,
    pub retry: RetryConfig,
    pub circuit_trip_after: u32,
    pub circuit_cooldown: Duration,
}

impl From<&SenderConfig> for SenderOptions {
    fn from(config: &SenderConfig) -> Self {
        Self {
            pool_size: config.worker_pool_size,
            retry: RetryConfig::default()
                .with_retries(config.retry_max)
                .with_base(config.retry_base()),
            circuit_trip_after: config.circuit_trip_after,
            circuit_cooldown: config.circuit_cooldown(),
        }
    }
}

struct SendJob {
    connection_id: String,
    payload: Arc<[u8]>,
    reply: oneshot::Sender<Result<(), SendError>>,
}

struct SenderInner {
    connections: Arc<dyn ConnectionStore>,
    transport: Arc<dyn GatewayTransport>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    options: SenderOptions,
    latency: LatencyWindow,
    counters: SenderCounters,
}

/// The connection manager. Cheap to share behind an `Arc`.
pub struct ConnectionManager {
    inner: Arc<SenderInner>,
    job_tx: Mutex<Option<mpsc::Sender<SendJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        connections: Arc<dyn ConnectionStore>,
        transport: Arc<dyn GatewayTransport>,
        options: SenderOptions,
    ) -> Arc<Self> {
        let (job_tx, job_rx) = mpsc::channel(JOB_CHANNEL_CAPACITY);
        let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));
        let cancel = CancellationToken::new();

        let inner = Arc::new(SenderInner {
            connections,
            transport,
            breakers: DashMap::new(),
            options: options.clone(),
            latency: LatencyWindow::default(),
            counters: SenderCounters::default(),
        });

        let workers = (0..options.pool_size.max(1))
            .map(|worker| {
                let inner = Arc::clone(&inner);
                let job_rx = Arc::clone(&job_rx);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    worker_loop(worker, inner, job_rx, cancel).await;
                })
            })
            .collect();

        Arc::new(Self {
            inner,
            job_tx: Mutex::new(Some(job_tx)),
            workers: Mutex::new(workers),
            cancel,
        })
    }

    /// Deliver one frame to one connection.
    pub async fn send(&self, connection_id: &str, frame: &Frame) -> Result<(), SendError> {
        let payload: Arc<[u8]> = frame.to_json().to_string().into_bytes().into();
        self.send_raw(connection_id, payload).await
    }

    async fn send_raw(&self, connection_id: &str, payload: Arc<[u8]>) -> Result<(), SendError> {
        let tx = self
            .job_tx
            .lock()
            .unwrap()
            .clone()
            .ok_or(SendError::ShuttingDown)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(SendJob {
            connection_id: connection_id.to_string(),
            payload,
            reply: reply_tx,
        })
        .await
        .map_err(|_| SendError::ShuttingDown)?;

        reply_rx.await.map_err(|_| SendError::ShuttingDown)?
    }

    /// Fan out one frame to many connections. Never short-circuits on an
    /// individual failure; returns the aggregate outcome.
    pub async fn broadcast(&self, connection_ids: &[String], frame: &Frame) -> BroadcastOutcome {
        let payload: Arc<[u8]> = frame.to_json().to_string().into_bytes().into();

        let sends = connection_ids.iter().map(|connection_id| {
            let payload = Arc::clone(&payload);
            async move {
                let result = self.send_raw(connection_id, payload).await;
                (connection_id.clone(), result)
            }
        });

        let mut outcome = BroadcastOutcome::default();
        for (connection_id, result) in futures::future::join_all(sends).await {
            match result {
                Ok(()) => outcome.delivered.push(connection_id),
                Err(SendError::Stale(_)) | Err(SendError::NotFound(_)) => {
                    outcome.stale.push(connection_id)
                }
                Err(e) => outcome.failed.push((connection_id, e.to_string())),
            }
        }
        outcome
    }

    /// Cheap liveness check: the record exists, is unexpired, and the
    /// circuit is not open.
    pub async fn is_active(&self, connection_id: &str) -> bool {
        let Ok(record) = self.inner.connections.get(connection_id).await else {
            return false;
        };
        if record.is_expired(now_secs()) {
            return false;
        }
        self.inner
            .breakers
            .get(connection_id)
            .map(|b| b.current_state() != CircuitState::Open)
            .unwrap_or(true)
    }

    /// Point-in-time metrics snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        let counters = &self.inner.counters;
        let (p50, p99) = self.inner.latency.percentiles();
        MetricsSnapshot {
            sent: counters.sent.load(Ordering::Relaxed),
            not_found: counters.not_found.load(Ordering::Relaxed),
            stale: counters.stale.load(Ordering::Relaxed),
            transient: counters.transient.load(Ordering::Relaxed),
            circuit_open_rejections: counters.circuit_open.load(Ordering::Relaxed),
            circuit_trips: counters.circuit_trips.load(Ordering::Relaxed),
            active_operations: counters.active.load(Ordering::Relaxed),
            latency_p50_us: p50,
            latency_p99_us: p99,
            circuits: self
                .inner
                .breakers
                .iter()
                .map(|entry| (entry.key().clone(), entry.current_state().as_str().to_string()))
                .collect(),
        }
    }

    /// Drain the pool: refuse new work, let in-flight sends finish within
    /// `deadline`, then abort whatever remains with a drain-abort error.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), ShutdownError> {
        // Closing the channel lets workers drain the backlog and exit.
        self.job_tx.lock().unwrap().take();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());

        let drain = async {
            for handle in workers {
                let _ = handle.await;
            }
        };

        match tokio::time::timeout(deadline, drain).await {
            Ok(()) => {
                tracing::info!("connection manager drained");
                Ok(())
            }
            Err(_) => {
                tracing::warn!("send pool drain exceeded deadline; aborting pending jobs");
                self.cancel.cancel();
                Err(ShutdownError::Timeout)
            }
        }
    }
}

async fn worker_loop(
    worker: usize,
    inner: Arc<SenderInner>,
    job_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<SendJob>>>,
    cancel: CancellationToken,
) {
    loop {
        let maybe_job = {
            let mut rx = job_rx.lock().await;
            rx.recv().await
        };
        let Some(job) = maybe_job else {
            tracing::debug!(worker, "send worker exiting");
            break;
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SendError::ShuttingDown),
            result = inner.execute(&job.connection_id, &job.payload) => result,
        };
        // Caller may have given up waiting; that is fine.
        let _ = job.reply.send(result);
    }
}

impl SenderInner {
    async fn execute(&self, connection_id: &str, payload: &[u8]) -> Result<(), SendError> {
        let _guard = ActiveGuard::enter(&self.counters.active);

        // 1. The record must exist and be unexpired.
        let record = match self.connections.get(connection_id).await {
            Ok(record) => record,
            Err(StoreError::NotFound { .. }) => {
                SenderCounters::bump(&self.counters.not_found);
                return Err(SendError::NotFound(connection_id.to_string()));
            }
            Err(e) => return Err(SendError::Transient(e.to_string())),
        };
        if record.is_expired(now_secs()) {
            if let Err(e) = self.connections.delete(connection_id).await {
                tracing::warn!(connection_id, error = %e, "failed to delete expired connection");
            }
            SenderCounters::bump(&self.counters.not_found);
            return Err(SendError::NotFound(connection_id.to_string()));
        }

        // 2. Circuit breaker short-circuits without I/O.
        let breaker = self
            .breakers
            .entry(connection_id.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    self.options.circuit_trip_after,
                    self.options.circuit_cooldown,
                ))
            })
            .clone();
        if !breaker.acquire() {
            SenderCounters::bump(&self.counters.circuit_open);
            return Err(SendError::CircuitOpen(connection_id.to_string()));
        }

        // 3-4. Attempt the POST, retrying transient classes only.
        let start = Instant::now();
        let mut attempt = 1u32;
        loop {
            match self
                .transport
                .post(connection_id, &record.endpoint, payload)
                .await
            {
                Ok(()) => {
                    breaker.record_success();
                    self.latency.record(start.elapsed());
                    SenderCounters::bump(&self.counters.sent);
                    if let Err(e) = self.connections.record_send(connection_id).await {
                        tracing::warn!(connection_id, error = %e, "failed to bump sent counter");
                    }
                    return Ok(());
                }
                Err(TransportError::Gone) => {
                    // Stale: reap the record synchronously.
                    match self.connections.delete(connection_id).await {
                        Ok(()) | Err(StoreError::NotFound { .. }) => {}
                        Err(e) => {
                            tracing::warn!(connection_id, error = %e, "failed to reap stale connection");
                        }
                    }
                    self.breakers.remove(connection_id);
                    SenderCounters::bump(&self.counters.stale);
                    tracing::info!(connection_id, "connection reported gone; record reaped");
                    return Err(SendError::Stale(connection_id.to_string()));
                }
                Err(TransportError::Transient(reason)) => {
                    if attempt >= self.options.retry.max_retries {
                        if breaker.record_failure() {
                            SenderCounters::bump(&self.counters.circuit_trips);
                            tracing::warn!(
                                connection_id,
                                failures = breaker.failure_count(),
                                "circuit opened"
                            );
                        }
                        SenderCounters::bump(&self.counters.transient);
                        return Err(SendError::Transient(reason));
                    }
                    let backoff = self.options.retry.backoff_with_jitter(attempt);
                    tracing::debug!(
                        connection_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        reason = %reason,
                        "transient send failure; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}
