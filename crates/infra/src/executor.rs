//! Run executor: drives one run from PENDING to a terminal status.
//!
//! The PENDING → STARTED compare-and-swap is the only admission check; a
//! redelivered ticket for a run that already left PENDING is a no-op.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde_json::{Map, Number, Value as JsonValue};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use forgejobs_core::{Run, RunStatus, StepStatus, TriggerEvent};
use forgejobs_observability::RunMetrics;
use forgejobs_workflow::{StepContext, StepOutput, StepResult, WorkflowDefinition, WorkflowRuntime, WorkflowStepDefinition};

use crate::dispatch::RunTicket;
use crate::retry::{BackoffPolicy, is_transient_error};
use crate::store::{EngineStore, RunCompletion, StepUpdate, StoreError};

pub const DEFAULT_MAX_RUNTIME: Duration = Duration::from_secs(21_600);
pub const PREVIEW_MAX_CHARS: usize = 2_000;

const PREVIEW_KEYS: [&str; 3] = ["summary", "doc_url", "answer"];
const DEADLINE_STEP_MESSAGE: &str = "Run exceeded max runtime before step start.";
const DEADLINE_RUN_MESSAGE: &str = "Run exceeded max runtime.";
const JOB_MISSING_MESSAGE: &str = "Custom job not found.";
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorConfig {
    pub max_runtime: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_runtime: DEFAULT_MAX_RUNTIME,
            backoff: BackoffPolicy::uncapped(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Another worker owns the run, or it was never PENDING.
    NotPending,
    Finished(RunStatus),
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct RunExecutor<S, W> {
    store: Arc<S>,
    runtime: Arc<W>,
    metrics: Arc<dyn RunMetrics>,
    config: ExecutorConfig,
}

impl<S, W> Clone for RunExecutor<S, W> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            runtime: Arc::clone(&self.runtime),
            metrics: Arc::clone(&self.metrics),
            config: self.config,
        }
    }
}

/// Per-run state threaded through the step loop.
struct RunScope<'a> {
    ticket: &'a RunTicket,
    run: &'a Run,
    definition: &'a WorkflowDefinition,
    trigger_event: Option<&'a TriggerEvent>,
    deadline: Instant,
    started: Instant,
}

impl<S: EngineStore, W: WorkflowRuntime> RunExecutor<S, W> {
    pub fn new(store: Arc<S>, runtime: Arc<W>, metrics: Arc<dyn RunMetrics>, config: ExecutorConfig) -> Self {
        Self {
            store,
            runtime,
            metrics,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    #[instrument(skip(self), fields(run_id = %ticket.run_id, tenant_id = %ticket.tenant_id))]
    pub async fn execute(&self, ticket: &RunTicket) -> Result<RunOutcome, ExecutorError> {
        let started = Instant::now();
        let Some(run) = self.store.transition_run_to_started(ticket.run_id, Utc::now()).await? else {
            info!(run_id = %ticket.run_id, "skipped_non_pending");
            return Ok(RunOutcome::NotPending);
        };

        let Some(job) = self.store.get_job(run.job_id).await? else {
            warn!(run_id = %run.id, job_id = %run.job_id, "job for run no longer exists");
            return self
                .finish(&run, "unknown", RunCompletion::failed(JOB_MISSING_MESSAGE), started)
                .await;
        };
        info!(run_id = %run.id, job_id = %job.id, workflow_key = %job.workflow_key, "run_started");

        // Configs were validated when the job was saved; check again in case the
        // registry changed underneath a stored job.
        let definition = match self.runtime.build_workflow(&job.workflow_key, &job.job_config) {
            Ok(definition) => definition,
            Err(err) => {
                warn!(run_id = %run.id, error = %err, "workflow could not be built");
                return self
                    .finish(&run, &job.workflow_key, RunCompletion::failed(err.to_string()), started)
                    .await;
            }
        };

        let trigger_event = match run.trigger_event_id {
            Some(event_id) => self.store.get_trigger_event(event_id).await?,
            None => None,
        };

        let scope = RunScope {
            ticket,
            run: &run,
            definition: &definition,
            trigger_event: trigger_event.as_ref(),
            deadline: started.checked_add(self.config.max_runtime).unwrap_or(started + FAR_FUTURE),
            started,
        };
        self.run_steps(&scope).await
    }

    async fn run_steps(&self, scope: &RunScope<'_>) -> Result<RunOutcome, ExecutorError> {
        let run = scope.run;
        let workflow_key = scope.definition.workflow_key.as_str();
        let mut outputs = self.store.completed_step_outputs(run.id).await?;

        for (index, step) in scope.definition.steps.iter().enumerate() {
            if outputs.contains_key(&step.step_id) {
                info!(run_id = %run.id, step_id = %step.step_id, "step already completed, resuming past it");
                continue;
            }
            let step_index = index as u32;

            if Instant::now() > scope.deadline {
                let result = StepResult::timeout(DEADLINE_STEP_MESSAGE);
                self.record_step(run, step_index, step, &result).await?;
                let completion = completion(RunStatus::Timeout, Some(DEADLINE_RUN_MESSAGE.into()), scope, &outputs);
                return self.finish(run, workflow_key, completion, scope.started).await;
            }

            if let Some(missing) = step.depends_on.iter().find(|dep| !outputs.contains_key(*dep)) {
                let message = format!("Missing dependency output: {missing}");
                self.record_step(run, step_index, step, &StepResult::failure(message.clone()))
                    .await?;
                self.metrics.step_failed(workflow_key, step.step_key.as_str());
                let completion = completion(RunStatus::Failure, Some(message), scope, &outputs);
                return self.finish(run, workflow_key, completion, scope.started).await;
            }

            let step_started = Instant::now();
            let result = self.run_with_retries(scope, step_index, step, &outputs).await?;
            self.record_step(run, step_index, step, &result).await?;
            info!(
                run_id = %run.id,
                step_id = %step.step_id,
                step_key = step.step_key.as_str(),
                status = %result.status(),
                latency_seconds = step_started.elapsed().as_secs_f64(),
                "step_finished"
            );

            let (status, message) = match result {
                StepResult::Success(output) => {
                    outputs.insert(step.step_id.clone(), output);
                    continue;
                }
                StepResult::Skipped { reason, .. } => (RunStatus::Skipped, reason),
                StepResult::Timeout(message) => (RunStatus::Timeout, message),
                StepResult::Failure(message) => (RunStatus::Failure, message),
            };
            if status != RunStatus::Skipped {
                self.metrics.step_failed(workflow_key, step.step_key.as_str());
                if let Some(api) = step.step_key.external_api() {
                    self.metrics.external_api_error(step.step_key.as_str(), api);
                }
            }
            let completion = completion(status, Some(message), scope, &outputs);
            return self.finish(run, workflow_key, completion, scope.started).await;
        }

        let completion = completion(RunStatus::Success, None, scope, &outputs);
        self.finish(run, workflow_key, completion, scope.started).await
    }

    /// Attempt loop: transient failures are retried with backoff while attempts remain.
    async fn run_with_retries(
        &self,
        scope: &RunScope<'_>,
        step_index: u32,
        step: &WorkflowStepDefinition,
        outputs: &BTreeMap<String, StepOutput>,
    ) -> Result<StepResult, ExecutorError> {
        let run = scope.run;
        let max_attempts = step.max_attempts();
        let mut attempt = 1;
        loop {
            info!(
                run_id = %run.id,
                step_id = %step.step_id,
                step_key = step.step_key.as_str(),
                attempt,
                max_attempts,
                "step_started"
            );
            self.store
                .upsert_run_step(
                    StepUpdate {
                        run_id: run.id,
                        step_index,
                        step_id: step.step_id.clone(),
                        step_key: step.step_key.as_str().to_string(),
                        status: StepStatus::Started,
                        error_message: None,
                        output: None,
                        mark_started: true,
                    },
                    Utc::now(),
                )
                .await?;

            let ctx = StepContext {
                tenant_id: scope.ticket.tenant_id,
                run_id: run.id,
                job_id: run.job_id,
                job_config: &scope.definition.job_config,
                previous_outputs: outputs,
                trigger_event: scope.trigger_event,
                deadline: scope.deadline,
                now: Utc::now(),
            };
            let result = match AssertUnwindSafe(self.runtime.run_step(step, &ctx)).catch_unwind().await {
                Ok(Ok(result)) => result,
                Ok(Err(err)) => StepResult::failure(format!("Step execution error: {err}")),
                Err(panic) => StepResult::failure(format!("Step execution error: {}", panic_message(panic.as_ref()))),
            };

            if let StepResult::Failure(message) = &result {
                if attempt < max_attempts && is_transient_error(Some(message)) {
                    let delay = self.config.backoff.delay_for_attempt(attempt);
                    warn!(
                        run_id = %run.id,
                        step_id = %step.step_id,
                        attempt,
                        max_attempts,
                        backoff_seconds = delay.as_secs(),
                        error = %message,
                        "step_retry"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
            }
            return Ok(result);
        }
    }

    async fn record_step(
        &self,
        run: &Run,
        step_index: u32,
        step: &WorkflowStepDefinition,
        result: &StepResult,
    ) -> Result<(), ExecutorError> {
        self.store
            .upsert_run_step(
                StepUpdate {
                    run_id: run.id,
                    step_index,
                    step_id: step.step_id.clone(),
                    step_key: step.step_key.as_str().to_string(),
                    status: result.status(),
                    error_message: result.error_message().map(str::to_string),
                    output: result.output().cloned().map(JsonValue::Object),
                    mark_started: false,
                },
                Utc::now(),
            )
            .await?;
        Ok(())
    }

    async fn finish(
        &self,
        run: &Run,
        workflow_key: &str,
        completion: RunCompletion,
        started: Instant,
    ) -> Result<RunOutcome, ExecutorError> {
        let status = completion.status;
        let error_message = completion.error_message.clone();
        self.store.finish_run(run.id, completion, Utc::now()).await?;

        let latency = started.elapsed().as_secs_f64();
        info!(
            run_id = %run.id,
            job_id = %run.job_id,
            workflow_key,
            status = %status,
            error = error_message.as_deref().unwrap_or(""),
            latency_seconds = latency,
            "run_finished"
        );
        self.metrics.run_finished(workflow_key, status.as_str(), latency);
        Ok(RunOutcome::Finished(status))
    }
}

fn completion(
    status: RunStatus,
    error_message: Option<String>,
    scope: &RunScope<'_>,
    outputs: &BTreeMap<String, StepOutput>,
) -> RunCompletion {
    let ordered: Vec<&StepOutput> = scope
        .definition
        .steps
        .iter()
        .filter_map(|step| outputs.get(&step.step_id))
        .collect();
    RunCompletion {
        status,
        error_message,
        output_preview: output_preview(ordered.iter().copied()),
        metrics: Some(aggregate_metrics(ordered.iter().copied())),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "step panicked".to_string()
    }
}

/// First non-empty `summary`, else `doc_url`, else `answer`, across outputs in
/// step order. Trimmed and truncated to [`PREVIEW_MAX_CHARS`].
pub fn output_preview<'a, I>(outputs: I) -> Option<String>
where
    I: IntoIterator<Item = &'a StepOutput>,
    I::IntoIter: Clone,
{
    let outputs = outputs.into_iter();
    PREVIEW_KEYS.iter().find_map(|key| {
        outputs.clone().find_map(|output| {
            let text = output.get(*key)?.as_str()?.trim();
            (!text.is_empty()).then(|| text.chars().take(PREVIEW_MAX_CHARS).collect())
        })
    })
}

#[derive(Debug, Clone, Copy)]
enum Counter {
    Int(i64),
    Float(f64),
}

impl Counter {
    fn add(self, value: &Number) -> Self {
        match (self, value.as_i64()) {
            (Counter::Int(total), Some(v)) => match total.checked_add(v) {
                Some(sum) => Counter::Int(sum),
                None => Counter::Float(total as f64 + v as f64),
            },
            (total, _) => Counter::Float(total.as_f64() + value.as_f64().unwrap_or(0.0)),
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Counter::Int(v) => v as f64,
            Counter::Float(v) => v,
        }
    }

    fn into_json(self) -> JsonValue {
        match self {
            Counter::Int(v) => JsonValue::from(v),
            Counter::Float(v) => Number::from_f64(v).map(JsonValue::Number).unwrap_or(JsonValue::Null),
        }
    }
}

/// Sum every top-level numeric `*_tokens` / `*_cost` field across outputs.
/// `input_tokens` and `output_tokens` are always present.
pub fn aggregate_metrics<'a>(outputs: impl IntoIterator<Item = &'a StepOutput>) -> JsonValue {
    let mut totals: BTreeMap<String, Counter> = BTreeMap::from([
        ("input_tokens".to_string(), Counter::Int(0)),
        ("output_tokens".to_string(), Counter::Int(0)),
    ]);
    for output in outputs {
        for (key, value) in output {
            let JsonValue::Number(number) = value else {
                continue;
            };
            if !(key.ends_with("_tokens") || key.ends_with("_cost")) {
                continue;
            }
            let total = totals.entry(key.clone()).or_insert(Counter::Int(0));
            *total = total.add(number);
        }
    }
    JsonValue::Object(
        totals
            .into_iter()
            .map(|(key, total)| (key, total.into_json()))
            .collect::<Map<String, JsonValue>>(),
    )
}
