//! Lifecycle telemetry emitted by the dispatcher and the request pipeline.
//!
//! The core only produces events through [`TelemetrySink`]; transport and
//! rendering belong to whoever drains them. [`ChannelTelemetry`] never blocks
//! the producing task: when its bounded queue is full the new event is
//! dropped and counted.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::gateway::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Open,
    Done,
    Error,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Open => "open",
            Status::Done => "done",
            Status::Error => "error",
        })
    }
}

/// Whether an RPC event describes one target or the whole fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcScope {
    Target,
    Dispatch,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcEvent {
    pub request_id: u64,
    pub scope: RpcScope,
    pub status: Status,
    pub method: String,
    /// Stringified route (or adapter id for adapter-wide calls); `*` for
    /// dispatch-scope events.
    pub route: String,
    pub address: String,
    pub results: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Create,
    Search,
    Services,
    Refresh,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RequestKind::Create => "create",
            RequestKind::Search => "search",
            RequestKind::Services => "services",
            RequestKind::Refresh => "refresh",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestEvent {
    pub request_id: u64,
    pub kind: RequestKind,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub area: Option<String>,
    /// Stage the request failed in, for `error` events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<Stage>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TelemetryEvent {
    Rpc(RpcEvent),
    Request(RequestEvent),
}

/// Destination for lifecycle events.
pub trait TelemetrySink: Send + Sync {
    fn send_rpc(&self, event: RpcEvent);
    fn send_request(&self, event: RequestEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn send_rpc(&self, _event: RpcEvent) {}
    fn send_request(&self, _event: RequestEvent) {}
}

/// Writes events to the `tracing` log at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn send_rpc(&self, event: RpcEvent) {
        debug!(
            request_id = event.request_id,
            scope = ?event.scope,
            status = %event.status,
            method = %event.method,
            route = %event.route,
            address = %event.address,
            results = event.results,
            "rpc telemetry"
        );
    }

    fn send_request(&self, event: RequestEvent) {
        debug!(
            request_id = event.request_id,
            kind = %event.kind,
            status = %event.status,
            area = event.area.as_deref().unwrap_or("-"),
            failed_at = ?event.failed_at,
            "request telemetry"
        );
    }
}

/// Bounded, non-blocking queue of events for an external consumer.
#[derive(Debug)]
pub struct ChannelTelemetry {
    tx: mpsc::Sender<TelemetryEvent>,
    dropped: AtomicU64,
}

impl ChannelTelemetry {
    /// Create a sink with room for `capacity` undelivered events and the
    /// receiver the consumer drains.
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<TelemetryEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Events discarded because the queue was full or the consumer was gone.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn push(&self, event: TelemetryEvent) {
        if let Err(err) = self.tx.try_send(event) {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            trace!(dropped_total = total, reason = %err, "telemetry event dropped");
        }
    }
}

impl TelemetrySink for ChannelTelemetry {
    fn send_rpc(&self, event: RpcEvent) {
        self.push(TelemetryEvent::Rpc(event));
    }

    fn send_request(&self, event: RequestEvent) {
        self.push(TelemetryEvent::Request(event));
    }
}
