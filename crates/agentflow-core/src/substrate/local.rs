//! In-process durable substrate.
//!
//! Activities and child workflows run on the current tokio runtime. Signals
//! go through a bounded mpsc channel whose receiver is handed to the resume
//! worker. Schedules are timer tasks that compute each fire time from their
//! `CalendarSpec` and stop when their `CancellationToken` is cancelled.
//!
//! Nothing here survives a restart: the schedule service re-registers
//! enabled schedules at startup, and suspended executions are resumed from
//! their stored checkpoint when the approval resolves.

use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    Activity, ActivityOptions, BoxFuture, ChildWorkflow, ChildWorkflowOptions, DurableSubstrate,
    RetryPolicy, ScheduleCallback, ScheduleFire, ScheduleRegistration, SubstrateError,
    WorkflowSignal,
};

const SIGNAL_CAPACITY: usize = 256;

/// A signal addressed to a durable run.
#[derive(Debug, Clone)]
pub struct SignalEnvelope {
    pub run_id: String,
    pub signal: WorkflowSignal,
}

pub type SignalReceiver = mpsc::Receiver<SignalEnvelope>;

struct ScheduleEntry {
    registration: ScheduleRegistration,
    callback: ScheduleCallback,
    cancel: CancellationToken,
}

pub struct LocalSubstrate {
    retry: RetryPolicy,
    signals: mpsc::Sender<SignalEnvelope>,
    schedules: DashMap<String, ScheduleEntry>,
    shutdown: CancellationToken,
}

impl LocalSubstrate {
    /// Create the substrate and the receiving end of its signal channel.
    pub fn new(retry: RetryPolicy) -> (Self, SignalReceiver) {
        let (signals, receiver) = mpsc::channel(SIGNAL_CAPACITY);
        let substrate = Self {
            retry,
            signals,
            schedules: DashMap::new(),
            shutdown: CancellationToken::new(),
        };
        (substrate, receiver)
    }

    pub fn schedule_count(&self) -> usize {
        self.schedules.len()
    }

    pub fn is_scheduled(&self, durable_id: &str) -> bool {
        self.schedules.contains_key(durable_id)
    }

    /// Stop every schedule timer.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.schedules.clear();
    }

    fn start_timer(&self, registration: ScheduleRegistration, callback: ScheduleCallback) -> ScheduleEntry {
        let cancel = self.shutdown.child_token();
        tokio::spawn(run_timer(registration.clone(), callback.clone(), cancel.clone()));
        ScheduleEntry {
            registration,
            callback,
            cancel,
        }
    }
}

impl std::fmt::Debug for LocalSubstrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSubstrate")
            .field("retry", &self.retry)
            .field("schedules", &self.schedules.len())
            .finish()
    }
}

async fn run_timer(registration: ScheduleRegistration, callback: ScheduleCallback, cancel: CancellationToken) {
    let tz = registration.timezone;
    let mut after = Utc::now();
    loop {
        let Some(next) = registration.calendar.next_after(after, tz) else {
            tracing::warn!(
                schedule_id = %registration.schedule_id,
                "schedule has no upcoming fire time, stopping timer"
            );
            break;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        tracing::debug!(
            schedule_id = %registration.schedule_id,
            workflow_id = registration.workflow_id.as_str(),
            fired_at = %next,
            "schedule fired"
        );
        let fire = ScheduleFire {
            schedule_id: registration.schedule_id,
            fired_at: next,
            next_run_at: registration.calendar.next_after(next, tz),
        };
        callback(fire).await;

        // Ticks missed while the callback ran are skipped, not replayed.
        after = Utc::now().max(next);
    }
}

impl DurableSubstrate for LocalSubstrate {
    fn name(&self) -> &str {
        "local"
    }

    fn execute_activity(
        &self,
        options: ActivityOptions,
        activity: Activity,
    ) -> BoxFuture<'_, Result<Value, SubstrateError>> {
        Box::pin(async move {
            let max_attempts = options.max_attempts.max(1);
            let attempts = async {
                let mut attempt = 1;
                loop {
                    let message = match activity(attempt).await {
                        Ok(value) => return Ok(value),
                        Err(message) => message,
                    };
                    if !RetryPolicy::should_retry(attempt, max_attempts) {
                        return Err(SubstrateError::ActivityFailed {
                            activity_id: options.activity_id.clone(),
                            attempts: attempt,
                            message,
                        });
                    }

                    let delay = self.retry.backoff(attempt);
                    tracing::warn!(
                        activity_id = options.activity_id.as_str(),
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = message.as_str(),
                        "activity attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            };

            // The deadline covers every attempt and backoff.
            let outcome = tokio::time::timeout(options.timeout, attempts).await;
            outcome.unwrap_or_else(|_| {
                tracing::warn!(
                    activity_id = options.activity_id.as_str(),
                    timeout_ms = options.timeout.as_millis() as u64,
                    "activity deadline exceeded"
                );
                Err(SubstrateError::Timeout {
                    id: options.activity_id.clone(),
                    after: options.timeout,
                })
            })
        })
    }

    fn execute_child_workflow(
        &self,
        options: ChildWorkflowOptions,
        body: ChildWorkflow,
    ) -> BoxFuture<'_, Result<Value, SubstrateError>> {
        Box::pin(async move {
            let handle = tokio::spawn(body);
            let abort = handle.abort_handle();
            match tokio::time::timeout(options.timeout, handle).await {
                Ok(Ok(Ok(value))) => Ok(value),
                Ok(Ok(Err(message))) => Err(SubstrateError::ChildFailed {
                    child_id: options.child_id,
                    message,
                }),
                Ok(Err(join_error)) => Err(SubstrateError::ChildFailed {
                    child_id: options.child_id,
                    message: format!("child task aborted: {join_error}"),
                }),
                Err(_) => {
                    abort.abort();
                    Err(SubstrateError::Timeout {
                        id: options.child_id,
                        after: options.timeout,
                    })
                }
            }
        })
    }

    fn signal(
        &self,
        run_id: &str,
        signal: WorkflowSignal,
    ) -> BoxFuture<'_, Result<(), SubstrateError>> {
        let envelope = SignalEnvelope {
            run_id: run_id.to_string(),
            signal,
        };
        Box::pin(async move {
            self.signals
                .send(envelope)
                .await
                .map_err(|_| SubstrateError::Unavailable("signal channel closed".to_string()))
        })
    }

    fn register_schedule(
        &self,
        registration: ScheduleRegistration,
        callback: ScheduleCallback,
    ) -> BoxFuture<'_, Result<String, SubstrateError>> {
        Box::pin(async move {
            if self.shutdown.is_cancelled() {
                return Err(SubstrateError::Unavailable("substrate is shut down".to_string()));
            }
            if registration
                .calendar
                .next_after(Utc::now(), registration.timezone)
                .is_none()
            {
                return Err(SubstrateError::ScheduleRejected(format!(
                    "calendar for schedule {} never fires",
                    registration.schedule_id
                )));
            }

            let durable_id = registration.durable_id();
            let entry = self.start_timer(registration, callback);
            if let Some(previous) = self.schedules.insert(durable_id.clone(), entry) {
                previous.cancel.cancel();
            }
            tracing::debug!(durable_id = durable_id.as_str(), "registered schedule");
            Ok(durable_id)
        })
    }

    fn update_schedule(
        &self,
        durable_id: &str,
        registration: ScheduleRegistration,
    ) -> BoxFuture<'_, Result<(), SubstrateError>> {
        let durable_id = durable_id.to_string();
        Box::pin(async move {
            let Some(mut entry) = self.schedules.get_mut(&durable_id) else {
                return Err(SubstrateError::NotFound(durable_id));
            };
            let replacement = self.start_timer(registration, entry.callback.clone());
            let previous = std::mem::replace(entry.value_mut(), replacement);
            previous.cancel.cancel();
            tracing::debug!(
                durable_id = durable_id.as_str(),
                workflow_id = entry.registration.workflow_id.as_str(),
                "updated schedule"
            );
            Ok(())
        })
    }

    fn delete_schedule(&self, durable_id: &str) -> BoxFuture<'_, Result<(), SubstrateError>> {
        let durable_id = durable_id.to_string();
        Box::pin(async move {
            match self.schedules.remove(&durable_id) {
                Some((_, entry)) => {
                    entry.cancel.cancel();
                    tracing::debug!(durable_id = durable_id.as_str(), "deleted schedule");
                    Ok(())
                }
                None => Err(SubstrateError::NotFound(durable_id)),
            }
        })
    }
}
