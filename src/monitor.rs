//! Monitor Integration
//!
//! Wraps a transaction in a CPU tracking window:
//!
//! ```text
//!   begin ─► start_tracking ─► body(tx) ─► commit ─► stop_tracking ─► check ─► sink
//! ```
//!
//! CPU accounting is advisory. A missing clock or a failed read is logged
//! and skipped; it never changes whether the transaction commits.

use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cpu::{CpuViolation, ThreadCpuAccounting, ThreadCpuMetrics, ThreadHandle, ViolationDetector};
use crate::engine::Engine;
use crate::error::Result;
use crate::txn::{CommitReceipt, Transaction, TxStatus};

/// What a sink receives when a transaction overruns its CPU budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationEvent {
    pub thread_id: u64,
    pub tx_id: String,
    pub cpu_time_ms: f64,
    pub threshold_ms: f64,
    pub timestamp_ms: u64,
}

/// Destination for violation events
pub trait ViolationSink: Send + Sync {
    fn emit(&self, event: ViolationEvent);
}

impl<F> ViolationSink for F
where
    F: Fn(ViolationEvent) + Send + Sync,
{
    fn emit(&self, event: ViolationEvent) {
        self(event)
    }
}

/// Logs each event at `warn`
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ViolationSink for LogSink {
    fn emit(&self, event: ViolationEvent) {
        warn!(
            thread_id = event.thread_id,
            tx_id = %event.tx_id,
            cpu_time_ms = event.cpu_time_ms,
            threshold_ms = event.threshold_ms,
            "CPU threshold exceeded"
        );
    }
}

/// Forwards events to a channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: Sender<ViolationEvent>,
}

impl ChannelSink {
    /// Unbounded channel; the receiver half goes to the consumer
    pub fn new() -> (Self, Receiver<ViolationEvent>) {
        let (sender, receiver) = channel::unbounded();
        (Self { sender }, receiver)
    }
}

impl ViolationSink for ChannelSink {
    fn emit(&self, event: ViolationEvent) {
        if self.sender.send(event).is_err() {
            debug!("violation receiver dropped, event discarded");
        }
    }
}

/// Result of a monitored commit
#[derive(Debug, Clone)]
pub struct MonitoredCommit {
    pub receipt: CommitReceipt,

    /// `None` when CPU accounting was unavailable for this run
    pub metrics: Option<ThreadCpuMetrics>,

    pub violation: Option<CpuViolation>,
}

/// Runs transactions on an [`Engine`] inside CPU tracking windows
pub struct TransactionMonitor {
    engine: Arc<Engine>,
    accounting: Option<Arc<ThreadCpuAccounting>>,
    detector: ViolationDetector,
    sink: Arc<dyn ViolationSink>,
}

impl TransactionMonitor {
    /// Use the platform clock and the engine's threshold settings.
    ///
    /// Without a platform clock the monitor still commits, it just never
    /// reports.
    pub fn new(engine: Arc<Engine>, sink: Arc<dyn ViolationSink>) -> Self {
        let accounting = match ThreadCpuAccounting::new() {
            Ok(acc) => {
                debug!(clock = acc.clock_name(), "thread CPU accounting enabled");
                Some(Arc::new(acc))
            }
            Err(e) => {
                warn!(error = %e, "thread CPU accounting unavailable, monitoring disabled");
                None
            }
        };
        let detector = ViolationDetector::from_config(engine.config());
        Self {
            engine,
            accounting,
            detector,
            sink,
        }
    }

    pub fn with_accounting(
        engine: Arc<Engine>,
        accounting: Arc<ThreadCpuAccounting>,
        sink: Arc<dyn ViolationSink>,
    ) -> Self {
        let detector = ViolationDetector::from_config(engine.config());
        Self {
            engine,
            accounting: Some(accounting),
            detector,
            sink,
        }
    }

    /// Begin `tx_id`, stage changes with `body`, commit, and measure the
    /// calling thread's CPU across all of it.
    ///
    /// If `body` fails the transaction is rolled back. A violation is
    /// reported whether or not the commit succeeded.
    pub fn run<F>(&self, tx_id: impl Into<String>, body: F) -> Result<MonitoredCommit>
    where
        F: FnOnce(&mut Transaction) -> Result<()>,
    {
        let mut tx = self.engine.begin_transaction(tx_id)?;
        let thread = ThreadHandle::current();

        let context = self
            .accounting
            .as_ref()
            .and_then(|acc| match acc.start_tracking(thread) {
                Ok(ctx) => Some(ctx),
                Err(e) => {
                    warn!(tx_id = %tx.id(), error = %e, "CPU tracking not started");
                    None
                }
            });

        let outcome = match body(&mut tx) {
            Ok(()) => self.engine.commit_transaction(&mut tx),
            Err(e) => {
                if tx.status() == TxStatus::Pending {
                    if let Err(rb) = self.engine.rollback_transaction(&mut tx) {
                        warn!(tx_id = %tx.id(), error = %rb, "rollback after failed body");
                    }
                }
                Err(e)
            }
        };

        let metrics = match (&self.accounting, context) {
            (Some(acc), Some(ctx)) => match acc.stop_tracking(ctx) {
                Ok(m) => Some(m),
                Err(e) => {
                    warn!(tx_id = %tx.id(), error = %e, "CPU measurement skipped");
                    None
                }
            },
            _ => None,
        };

        let violation = metrics.as_ref().and_then(|m| self.detector.observe(m));
        if let Some(v) = &violation {
            self.sink.emit(ViolationEvent {
                thread_id: v.metrics.thread_id,
                tx_id: tx.id().to_string(),
                cpu_time_ms: v.metrics.cpu_time_ms,
                threshold_ms: v.threshold_ms,
                timestamp_ms: v.metrics.measured_at_ms,
            });
        }

        Ok(MonitoredCommit {
            receipt: outcome?,
            metrics,
            violation,
        })
    }
}
