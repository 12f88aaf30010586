//! Concurrent RPC fan-out with per-target deadlines.
//!
//! [`Dispatcher::run`] opens one task per target, enforces a fixed deadline on
//! each call independently, feeds every decoded reply to a merge callback in
//! arrival order, and returns once every target has answered, failed, or timed
//! out. Slow targets never cancel their siblings.
//!
//! Aggregate policy: the dispatch succeeds if at least one target succeeded.
//! With zero successes the first failure (in arrival order) is returned, so a
//! single-target dispatch such as a report create always surfaces its own error.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::task::JoinSet;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::id::{AdapterId, NRoute};
use crate::routing::RoutingTable;
use crate::rpc::{RpcCall, RpcMethod, RpcResponse, RpcTransport};
use crate::telemetry::{RpcEvent, RpcScope, Status, TelemetrySink};

/// Per-call deadline used when none is configured.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(3);

/// One destination of a dispatch.
///
/// A target without a route addresses the adapter as a whole (catalog queries).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DispatchTarget {
    pub adapter: AdapterId,
    pub route: Option<NRoute>,
}

impl DispatchTarget {
    pub fn route(route: NRoute) -> Self {
        Self {
            adapter: route.adapter.clone(),
            route: Some(route),
        }
    }

    pub fn adapter(adapter: AdapterId) -> Self {
        Self {
            adapter,
            route: None,
        }
    }
}

impl fmt::Display for DispatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.route {
            Some(route) => route.fmt(f),
            None => self.adapter.fmt(f),
        }
    }
}

/// Outcome of a dispatch that had at least one success.
#[derive(Debug, Default)]
pub struct DispatchSummary {
    pub targets: usize,
    pub succeeded: usize,
    pub results: usize,
    /// Per-target failures, each attributed to its target.
    pub failures: Vec<Error>,
}

impl DispatchSummary {
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Fans RPC calls out to adapters resolved through the routing table.
#[derive(Clone)]
pub struct Dispatcher {
    routing: Arc<RoutingTable>,
    transport: Arc<dyn RpcTransport>,
    telemetry: Arc<dyn TelemetrySink>,
    deadline: Duration,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

struct Completed {
    target: DispatchTarget,
    address: String,
    elapsed: Duration,
    outcome: Result<Value>,
}

impl Dispatcher {
    pub fn new(
        routing: Arc<RoutingTable>,
        transport: Arc<dyn RpcTransport>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            routing,
            transport,
            telemetry,
            deadline: DEFAULT_DEADLINE,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    /// Send `call` to every target and merge replies as they arrive.
    ///
    /// Duplicate targets are collapsed. `merge` runs on the calling task, once
    /// per successful target, so it never observes concurrent invocations.
    ///
    /// # Errors
    ///
    /// - [`Error::NoRoute`] when `targets` is empty.
    /// - The first per-target error when no target succeeded.
    pub async fn run<C, F>(
        &self,
        request_id: u64,
        call: &C,
        targets: impl IntoIterator<Item = DispatchTarget>,
        mut merge: F,
    ) -> Result<DispatchSummary>
    where
        C: RpcCall,
        F: FnMut(&DispatchTarget, C::Response),
    {
        let targets: BTreeSet<DispatchTarget> = targets.into_iter().collect();
        let method = C::METHOD;
        if targets.is_empty() {
            return Err(Error::NoRoute {
                area: format!("{method} (no targets)"),
            });
        }

        let params = serde_json::to_value(call)?;
        let mut summary = DispatchSummary {
            targets: targets.len(),
            ..DispatchSummary::default()
        };
        self.emit(request_id, RpcScope::Dispatch, Status::Open, method, "*", "-", 0);

        let mut tasks = JoinSet::new();
        for target in targets {
            let adapter = match self.routing.resolve_adapter(&target.adapter) {
                Ok(adapter) => adapter.clone(),
                Err(err) => {
                    warn!(request_id, target = %target, error = %err, "dispatch target unresolvable");
                    self.emit(request_id, RpcScope::Target, Status::Error, method, &target.to_string(), "-", 0);
                    summary.failures.push(err);
                    continue;
                }
            };
            self.emit(
                request_id,
                RpcScope::Target,
                Status::Open,
                method,
                &target.to_string(),
                &adapter.address,
                0,
            );

            let transport = Arc::clone(&self.transport);
            let params = params.clone();
            let deadline = self.deadline;
            tasks.spawn(async move {
                let started = Instant::now();
                let call = transport.call(&adapter, target.route.as_ref(), method, params);
                let outcome = match timeout(deadline, call).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(err)) => Err(attribute(&target, err)),
                    Err(_) => Err(Error::DispatchTimeout {
                        target: target.to_string(),
                        deadline,
                    }),
                };
                Completed {
                    target,
                    address: adapter.address,
                    elapsed: started.elapsed(),
                    outcome,
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let completed = match joined {
                Ok(completed) => completed,
                Err(join_err) => {
                    warn!(request_id, %method, error = %join_err, "dispatch task aborted");
                    summary.failures.push(Error::DispatchFailed {
                        target: "-".to_string(),
                        message: join_err.to_string(),
                    });
                    continue;
                }
            };
            let label = completed.target.to_string();
            let decoded = completed.outcome.and_then(|value| {
                serde_json::from_value::<C::Response>(value).map_err(|err| Error::DispatchFailed {
                    target: label.clone(),
                    message: format!("undecodable {method} reply: {err}"),
                })
            });

            match decoded {
                Ok(response) => {
                    let count = response.result_count();
                    debug!(
                        request_id,
                        %method,
                        target = %label,
                        results = count,
                        elapsed_ms = completed.elapsed.as_millis() as u64,
                        "dispatch target done"
                    );
                    self.emit(request_id, RpcScope::Target, Status::Done, method, &label, &completed.address, count);
                    summary.succeeded += 1;
                    summary.results += count;
                    merge(&completed.target, response);
                }
                Err(err) => {
                    warn!(
                        request_id,
                        %method,
                        target = %label,
                        elapsed_ms = completed.elapsed.as_millis() as u64,
                        error = %err,
                        "dispatch target failed"
                    );
                    self.emit(request_id, RpcScope::Target, Status::Error, method, &label, &completed.address, 0);
                    summary.failures.push(err);
                }
            }
        }

        if summary.succeeded == 0 {
            self.emit(request_id, RpcScope::Dispatch, Status::Error, method, "*", "-", 0);
            let first = summary.failures.into_iter().next();
            return Err(first.unwrap_or_else(|| Error::NoRoute {
                area: method.to_string(),
            }));
        }

        self.emit(
            request_id,
            RpcScope::Dispatch,
            Status::Done,
            method,
            "*",
            "-",
            summary.results,
        );
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    fn emit(
        &self,
        request_id: u64,
        scope: RpcScope,
        status: Status,
        method: RpcMethod,
        route: &str,
        address: &str,
        results: usize,
    ) {
        self.telemetry.send_rpc(RpcEvent {
            request_id,
            scope,
            status,
            method: method.as_str().to_string(),
            route: route.to_string(),
            address: address.to_string(),
            results,
            timestamp: Utc::now(),
        });
    }
}

/// Re-label a transport error with the dispatch target it belongs to.
fn attribute(target: &DispatchTarget, err: Error) -> Error {
    let target = target.to_string();
    match err {
        Error::DispatchFailed { message, .. } => Error::DispatchFailed { target, message },
        Error::DispatchTimeout { deadline, .. } => Error::DispatchTimeout { target, deadline },
        other => Error::DispatchFailed {
            target,
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{RpcMethod, SearchByLocation, SearchReply};
    use crate::telemetry::TelemetryEvent;
    use crate::test_helpers::{fixture_table, search_reply, Behavior, MockTransport, RecordingTelemetry};

    fn dispatcher(mock: &Arc<MockTransport>, telemetry: &Arc<RecordingTelemetry>) -> Dispatcher {
        Dispatcher::new(
            Arc::new(fixture_table()),
            Arc::clone(mock) as Arc<dyn RpcTransport>,
            Arc::clone(telemetry) as Arc<dyn TelemetrySink>,
        )
    }

    fn search() -> SearchByLocation {
        SearchByLocation {
            lat: 37.33,
            lng: -121.89,
            radius_m: 100,
            max_results: 10,
        }
    }

    fn sj_targets() -> Vec<DispatchTarget> {
        vec![
            DispatchTarget::route("CS1.SJ.3".parse().unwrap()),
            DispatchTarget::route("SC2.SJ.1".parse().unwrap()),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn slow_target_times_out_without_blocking_sibling() {
        let mock = Arc::new(MockTransport::new());
        mock.on("CS1", RpcMethod::ReportSearchLL, search_reply(&["101", "102"]));
        mock.on_any("SC2", Behavior::Hang);
        let telemetry = Arc::new(RecordingTelemetry::default());
        let dispatcher = dispatcher(&mock, &telemetry).with_deadline(Duration::from_millis(500));

        let started = Instant::now();
        let mut merged: Vec<String> = Vec::new();
        let summary = dispatcher
            .run(1, &search(), sj_targets(), |_, reply: SearchReply| {
                merged.extend(reply.reports.into_iter().map(|r| r.id));
            })
            .await
            .expect("one target answered");

        assert!(started.elapsed() < Duration::from_millis(600));
        assert_eq!(summary.targets, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(merged, vec!["101", "102"]);
        assert!(matches!(
            summary.failures.as_slice(),
            [Error::DispatchTimeout { target, .. }] if target == "SC2.SJ.1"
        ));
    }

    #[tokio::test]
    async fn single_target_failure_is_returned() {
        let mock = Arc::new(MockTransport::new());
        mock.on_any("CS1", Behavior::Fail("vendor unavailable".to_string()));
        let telemetry = Arc::new(RecordingTelemetry::default());
        let dispatcher = dispatcher(&mock, &telemetry);

        let mut calls = 0;
        let err = dispatcher
            .run(
                2,
                &search(),
                [DispatchTarget::route("CS1.SJ.3".parse().unwrap())],
                |_, _| calls += 1,
            )
            .await
            .expect_err("single target failed");

        assert_eq!(calls, 0);
        match err {
            Error::DispatchFailed { target, message } => {
                assert_eq!(target, "CS1.SJ.3");
                assert_eq!(message, "vendor unavailable");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_targets_are_called_once() {
        let mock = Arc::new(MockTransport::new());
        mock.on_any("CS1", search_reply(&["1"]));
        let telemetry = Arc::new(RecordingTelemetry::default());
        let dispatcher = dispatcher(&mock, &telemetry);
        let target = DispatchTarget::route("CS1.SJ.3".parse().unwrap());

        let summary = dispatcher
            .run(3, &search(), vec![target.clone(), target], |_, _: SearchReply| {})
            .await
            .unwrap();
        assert_eq!(summary.targets, 1);
        assert_eq!(mock.calls().len(), 1);
    }

    #[tokio::test]
    async fn empty_target_list_is_no_route() {
        let mock = Arc::new(MockTransport::new());
        let telemetry = Arc::new(RecordingTelemetry::default());
        let result = dispatcher(&mock, &telemetry)
            .run(4, &search(), Vec::new(), |_, _: SearchReply| {})
            .await;
        assert!(matches!(result, Err(Error::NoRoute { .. })));
    }

    #[tokio::test]
    async fn unknown_adapter_is_attributed_failure() {
        let mock = Arc::new(MockTransport::new());
        mock.on_any("CS1", search_reply(&["1"]));
        let telemetry = Arc::new(RecordingTelemetry::default());
        let summary = dispatcher(&mock, &telemetry)
            .run(
                5,
                &search(),
                vec![
                    DispatchTarget::route("CS1.SJ.3".parse().unwrap()),
                    DispatchTarget::adapter(AdapterId::new("GHOST").unwrap()),
                ],
                |_, _: SearchReply| {},
            )
            .await
            .unwrap();
        assert_eq!(summary.succeeded, 1);
        assert!(matches!(
            summary.failures.as_slice(),
            [Error::UnknownAdapter { id }] if id == "GHOST"
        ));
    }

    #[tokio::test]
    async fn undecodable_reply_counts_as_failure() {
        let mock = Arc::new(MockTransport::new());
        mock.on_any("CS1", Behavior::Reply(serde_json::json!({"reports": "nope"})));
        let telemetry = Arc::new(RecordingTelemetry::default());
        let err = dispatcher(&mock, &telemetry)
            .run(
                6,
                &search(),
                [DispatchTarget::route("CS1.SJ.3".parse().unwrap())],
                |_, _: SearchReply| {},
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("undecodable"));
    }

    #[tokio::test(start_paused = true)]
    async fn emits_target_and_aggregate_events() {
        let mock = Arc::new(MockTransport::new());
        mock.on_any("CS1", search_reply(&["1", "2"]));
        mock.on_any("SC2", Behavior::Fail("down".to_string()));
        let telemetry = Arc::new(RecordingTelemetry::default());
        dispatcher(&mock, &telemetry)
            .run(9, &search(), sj_targets(), |_, _: SearchReply| {})
            .await
            .unwrap();

        let events: Vec<(RpcScope, Status, String, usize)> = telemetry
            .events()
            .into_iter()
            .filter_map(|event| match event {
                TelemetryEvent::Rpc(e) if e.request_id == 9 => Some((e.scope, e.status, e.route, e.results)),
                _ => None,
            })
            .collect();

        assert_eq!(events.first(), Some(&(RpcScope::Dispatch, Status::Open, "*".to_string(), 0)));
        assert_eq!(events.last(), Some(&(RpcScope::Dispatch, Status::Done, "*".to_string(), 2)));
        assert!(events.contains(&(RpcScope::Target, Status::Done, "CS1.SJ.3".to_string(), 2)));
        assert!(events.contains(&(RpcScope::Target, Status::Error, "SC2.SJ.1".to_string(), 0)));
        let opens = events
            .iter()
            .filter(|(scope, status, _, _)| *scope == RpcScope::Target && *status == Status::Open)
            .count();
        assert_eq!(opens, 2);
    }
}
