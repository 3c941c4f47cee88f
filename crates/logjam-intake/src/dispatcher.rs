// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded hand-off of accepted records to the [`Sink`].
//!
//! [`Dispatcher`] is the cheap, cloneable handle used on the request path. It only enqueues.
//! [`DispatcherService`] owns the receiving end of the queue and runs each delivery on its own
//! task, at most `workers` at a time. Failed deliveries are counted and sent to the
//! [`FailureReporter`]; they never reach the caller that dispatched the record.

use hyper::StatusCode;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{AbortHandle, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn, Instrument};

use crate::record::{Batch, LogRecord};
use crate::sink::{Sink, SinkError};

/// What `dispatch` does when the queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    #[default]
    Reject,
    Drop,
    Block,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "reject" => Ok(OverflowPolicy::Reject),
            "drop" => Ok(OverflowPolicy::Drop),
            "block" => Ok(OverflowPolicy::Block),
            other => Err(format!(
                "expected 'reject', 'drop' or 'block', got '{other}'"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Log queue is full, try again later")]
    QueueFull,

    #[error("Log intake is shutting down")]
    Closed,

    #[error("Batch of {records} records exceeds the log queue capacity of {capacity}")]
    BatchTooLarge { records: usize, capacity: usize },
}

impl DispatchError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            DispatchError::QueueFull | DispatchError::Closed => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::BatchTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherSettings {
    pub workers: usize,
    pub queue_size: usize,
    pub overflow: OverflowPolicy,
    pub sink_timeout: Option<Duration>,
    pub drain_timeout: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            workers: 16,
            queue_size: 1024,
            overflow: OverflowPolicy::Reject,
            sink_timeout: None,
            drain_timeout: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
}

impl Counters {
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub accepted: u64,
    pub delivered: u64,
    pub failed: u64,
    pub dropped: u64,
    pub rejected: u64,
}

#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<LogRecord>,
    overflow: OverflowPolicy,
    counters: Arc<Counters>,
}

impl Dispatcher {
    /// Enqueues one record. Returns once the record is queued (or dropped under
    /// [`OverflowPolicy::Drop`]); never waits for the sink.
    pub async fn dispatch(&self, record: LogRecord) -> Result<(), DispatchError> {
        match self.overflow {
            OverflowPolicy::Block => {
                self.tx
                    .send(record)
                    .await
                    .map_err(|_| DispatchError::Closed)?;
            }
            OverflowPolicy::Reject | OverflowPolicy::Drop => match self.tx.try_send(record) {
                Ok(()) => {}
                Err(TrySendError::Closed(_)) => return Err(DispatchError::Closed),
                Err(TrySendError::Full(record)) if self.overflow == OverflowPolicy::Drop => {
                    Counters::incr(&self.counters.dropped);
                    warn!(
                        "Log queue is full, dropping record with fields: {}",
                        record.field_names().join(", ")
                    );
                    return Ok(());
                }
                Err(TrySendError::Full(_)) => {
                    Counters::incr(&self.counters.rejected);
                    return Err(DispatchError::QueueFull);
                }
            },
        }
        Counters::incr(&self.counters.accepted);
        Ok(())
    }

    /// Admits the whole batch or none of it: queue slots for every record are reserved before
    /// the first one is enqueued. Each record is still delivered on its own.
    pub async fn dispatch_batch(&self, batch: Batch) -> Result<(), DispatchError> {
        let count = batch.len();
        if count == 0 {
            return Ok(());
        }
        let capacity = self.tx.max_capacity();
        if count > capacity {
            Counters::add(&self.counters.rejected, count);
            return Err(DispatchError::BatchTooLarge {
                records: count,
                capacity,
            });
        }

        let permits = match self.overflow {
            OverflowPolicy::Block => self
                .tx
                .reserve_many(count)
                .await
                .map_err(|_| DispatchError::Closed)?,
            OverflowPolicy::Reject | OverflowPolicy::Drop => match self.tx.try_reserve_many(count)
            {
                Ok(permits) => permits,
                Err(TrySendError::Closed(())) => return Err(DispatchError::Closed),
                Err(TrySendError::Full(())) if self.overflow == OverflowPolicy::Drop => {
                    Counters::add(&self.counters.dropped, count);
                    warn!("Log queue is full, dropping batch of {count} records");
                    return Ok(());
                }
                Err(TrySendError::Full(())) => {
                    Counters::add(&self.counters.rejected, count);
                    return Err(DispatchError::QueueFull);
                }
            },
        };
        for (permit, record) in permits.zip(batch) {
            permit.send(record);
        }
        Counters::add(&self.counters.accepted, count);
        Ok(())
    }

    /// Records waiting in the queue, not yet picked up by a worker.
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
pub enum FailureReason {
    Sink(SinkError),
    Panicked,
    TimedOut(Duration),
    Aborted,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Sink(e) => write!(f, "{e}"),
            FailureReason::Panicked => f.write_str("sink panicked"),
            FailureReason::TimedOut(limit) => write!(f, "sink timed out after {limit:?}"),
            FailureReason::Aborted => f.write_str("delivery aborted at shutdown"),
        }
    }
}

#[derive(Debug)]
pub struct DeliveryFailure {
    /// Empty when the record was lost together with its task.
    pub field_names: Vec<String>,
    pub reason: FailureReason,
}

/// Surfaces delivery failures as error events, away from the request path.
pub struct FailureReporter {
    rx: mpsc::UnboundedReceiver<DeliveryFailure>,
}

impl FailureReporter {
    pub fn new(rx: mpsc::UnboundedReceiver<DeliveryFailure>) -> Self {
        Self { rx }
    }

    pub async fn run(mut self) {
        while let Some(failure) = self.rx.recv().await {
            Self::report(&failure);
        }
    }

    pub fn report(failure: &DeliveryFailure) {
        error!(
            "Failed to deliver record with fields [{}]: {}",
            failure.field_names.join(", "),
            failure.reason
        );
    }
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Clone)]
struct DeliveryContext {
    sink: Arc<dyn Sink>,
    counters: Arc<Counters>,
    failures: mpsc::UnboundedSender<DeliveryFailure>,
    sink_timeout: Option<Duration>,
}

impl DeliveryContext {
    fn spawn(&self, deliveries: &mut JoinSet<()>, record: LogRecord, permit: OwnedSemaphorePermit) {
        let context = self.clone();
        deliveries.spawn(async move {
            context.deliver(record).await;
            drop(permit);
        });
    }

    /// The sink call runs on a nested task so that a panic or a timeout is observed with the
    /// record's field names still at hand.
    async fn deliver(&self, record: LogRecord) {
        let field_names = record
            .field_names()
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<String>>();
        let sink = Arc::clone(&self.sink);
        let handle = tokio::spawn(async move { sink.deliver(record).await });
        let _abort_on_drop = AbortOnDrop(handle.abort_handle());

        let joined = match self.sink_timeout {
            Some(limit) => match tokio::time::timeout(limit, handle).await {
                Ok(joined) => joined,
                Err(_) => return self.fail(field_names, FailureReason::TimedOut(limit)),
            },
            None => handle.await,
        };

        match joined {
            Ok(Ok(())) => Counters::incr(&self.counters.delivered),
            Ok(Err(e)) => self.fail(field_names, FailureReason::Sink(e)),
            Err(e) if e.is_panic() => self.fail(field_names, FailureReason::Panicked),
            Err(_) => self.fail(field_names, FailureReason::Aborted),
        }
    }

    fn reap(&self, joined: Result<(), JoinError>) {
        match joined {
            Ok(()) => {}
            Err(e) if e.is_panic() => self.fail(Vec::new(), FailureReason::Panicked),
            Err(_) => self.fail(Vec::new(), FailureReason::Aborted),
        }
    }

    fn fail(&self, field_names: Vec<String>, reason: FailureReason) {
        Counters::incr(&self.counters.failed);
        if self
            .failures
            .send(DeliveryFailure {
                field_names,
                reason,
            })
            .is_err()
        {
            debug!("Failure reporter is gone, delivery failure only counted");
        }
    }
}

pub struct DispatcherService {
    rx: mpsc::Receiver<LogRecord>,
    sink: Arc<dyn Sink>,
    settings: DispatcherSettings,
    counters: Arc<Counters>,
}

impl DispatcherService {
    pub fn new(sink: Arc<dyn Sink>, settings: DispatcherSettings) -> (Self, Dispatcher) {
        let (tx, rx) = mpsc::channel(settings.queue_size.max(1));
        let counters = Arc::new(Counters::default());

        let handle = Dispatcher {
            tx,
            overflow: settings.overflow,
            counters: Arc::clone(&counters),
        };
        let service = Self {
            rx,
            sink,
            settings,
            counters,
        };
        (service, handle)
    }

    /// Pulls records off the queue until `cancel` fires or every [`Dispatcher`] is dropped,
    /// then drains.
    pub async fn run(self, cancel: CancellationToken) {
        let DispatcherService {
            mut rx,
            sink,
            settings,
            counters,
        } = self;
        debug!(
            "Dispatcher service started with {} workers and a queue of {}",
            settings.workers, settings.queue_size
        );

        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        let reporter = tokio::spawn(FailureReporter::new(failure_rx).run().in_current_span());
        let context = DeliveryContext {
            sink,
            counters: Arc::clone(&counters),
            failures: failure_tx,
            sink_timeout: settings.sink_timeout,
        };
        let permits = Arc::new(Semaphore::new(settings.workers.max(1)));
        let mut deliveries = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                Some(joined) = deliveries.join_next(), if !deliveries.is_empty() => {
                    context.reap(joined);
                }
                permit = Arc::clone(&permits).acquire_owned() => {
                    let Ok(permit) = permit else { break };
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        record = rx.recv() => match record {
                            Some(record) => context.spawn(&mut deliveries, record, permit),
                            None => break,
                        },
                    }
                }
            }
        }

        rx.close();
        debug!(
            "Dispatcher draining with {} deliveries in flight",
            deliveries.len()
        );
        // A record leaves the queue only once a permit is held, so anything still queued when
        // the drain times out is counted below.
        let drained = tokio::time::timeout(settings.drain_timeout, async {
            loop {
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    break;
                };
                let Some(record) = rx.recv().await else {
                    break;
                };
                context.spawn(&mut deliveries, record, permit);
            }
            while let Some(joined) = deliveries.join_next().await {
                context.reap(joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                "Dispatcher drain timed out after {:?}, aborting {} deliveries",
                settings.drain_timeout,
                deliveries.len()
            );
            deliveries.abort_all();
            while let Some(joined) = deliveries.join_next().await {
                context.reap(joined);
            }
            let mut abandoned = 0;
            while rx.try_recv().is_ok() {
                Counters::incr(&counters.dropped);
                abandoned += 1;
            }
            if abandoned > 0 {
                warn!("Dropped {abandoned} queued records at shutdown");
            }
        }

        drop(context);
        if let Err(e) = reporter.await {
            error!("Failure reporter stopped unexpectedly: {e}");
        }
        debug!("Dispatcher service stopped");
    }
}
