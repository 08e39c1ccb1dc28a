//! Run workers: drain the run transport and execute each ticket.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use forgejobs_core::RunStatus;
use forgejobs_workflow::WorkflowRuntime;

use crate::dispatch::{DispatchError, RunInbox};
use crate::executor::{RunExecutor, RunOutcome};
use crate::store::EngineStore;

const TRANSPORT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub runs_processed: u64,
    pub runs_succeeded: u64,
    pub runs_failed: u64,
    pub runs_skipped: u64,
    pub runs_not_pending: u64,
    pub errors: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: RunOutcome) {
        match outcome {
            RunOutcome::NotPending => self.runs_not_pending += 1,
            RunOutcome::Finished(status) => {
                self.runs_processed += 1;
                match status {
                    RunStatus::Success => self.runs_succeeded += 1,
                    RunStatus::Skipped => self.runs_skipped += 1,
                    _ => self.runs_failed += 1,
                }
            }
        }
    }
}

/// Handle to stop and join a running pool.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Request graceful shutdown; in-flight runs finish first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            if let Err(err) = join.await {
                error!(error = %err, "run worker task failed");
            }
        }
    }

    /// Wait for the workers to stop on their own (transport closed).
    pub async fn join(self) {
        for join in self.joins {
            if let Err(err) = join.await {
                error!(error = %err, "run worker task failed");
            }
        }
    }

    pub fn stats(&self) -> WorkerStats {
        snapshot(&self.stats)
    }

    /// Shared stats, for reporting after the handle is moved.
    pub fn stats_source(&self) -> Arc<Mutex<WorkerStats>> {
        Arc::clone(&self.stats)
    }
}

pub fn snapshot(stats: &Mutex<WorkerStats>) -> WorkerStats {
    match stats.lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

pub struct WorkerPool<S, W, I> {
    executor: RunExecutor<S, W>,
    inbox: Arc<I>,
    concurrency: usize,
}

impl<S, W, I> WorkerPool<S, W, I>
where
    S: EngineStore,
    W: WorkflowRuntime,
    I: RunInbox,
{
    pub fn new(executor: RunExecutor<S, W>, inbox: Arc<I>, concurrency: usize) -> Self {
        Self {
            executor,
            inbox,
            concurrency: concurrency.max(1),
        }
    }

    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));

        let joins = (0..self.concurrency)
            .map(|index| {
                let worker = Worker {
                    name: format!("run-worker-{index}"),
                    executor: self.executor.clone(),
                    inbox: Arc::clone(&self.inbox),
                    stats: Arc::clone(&stats),
                };
                tokio::spawn(worker.run(shutdown_rx.clone()))
            })
            .collect();

        WorkerHandle {
            shutdown: shutdown_tx,
            joins,
            stats,
        }
    }
}

struct Worker<S, W, I> {
    name: String,
    executor: RunExecutor<S, W>,
    inbox: Arc<I>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl<S, W, I> Worker<S, W, I>
where
    S: EngineStore,
    W: WorkflowRuntime,
    I: RunInbox,
{
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.name, "run worker started");
        loop {
            let received = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                received = self.inbox.receive() => received,
            };

            let delivery = match received {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(DispatchError::Closed) => break,
                Err(err) => {
                    warn!(worker = %self.name, error = %err, "run transport receive failed");
                    self.bump(|s| s.errors += 1);
                    tokio::time::sleep(TRANSPORT_RETRY_DELAY).await;
                    continue;
                }
            };

            match self.executor.execute(&delivery.ticket).await {
                Ok(outcome) => {
                    self.bump(|s| s.record(outcome));
                    if let Err(err) = self.inbox.ack(&delivery).await {
                        warn!(worker = %self.name, run_id = %delivery.ticket.run_id, error = %err, "ack failed");
                    }
                }
                Err(err) => {
                    // Left unacknowledged; the reaper fails the run if it stays STARTED.
                    error!(worker = %self.name, run_id = %delivery.ticket.run_id, error = %err, "run execution failed");
                    self.bump(|s| s.errors += 1);
                }
            }
        }
        info!(worker = %self.name, "run worker stopped");
    }

    fn bump(&self, f: impl FnOnce(&mut WorkerStats)) {
        match self.stats.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    use forgejobs_core::{CustomJob, JobTrigger, NewRun, TenantId, TriggerType};
    use forgejobs_observability::InMemoryMetrics;
    use forgejobs_workflow::{StepRegistry, StepServices};

    use crate::dispatch::{ChannelDispatcher, RunDispatcher, RunTicket};
    use crate::executor::ExecutorConfig;
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn pool_executes_delivered_runs_and_stops_when_transport_closes() {
        let store = Arc::new(InMemoryStore::new());
        let tenant_id = TenantId::new();
        let trigger = JobTrigger::from_fields(TriggerType::Triggered, None, None, None, None, None, None).unwrap();
        let job = CustomJob::new(tenant_id, "mail", "email_crm_processor", json!({}), trigger, Utc::now()).unwrap();
        store.insert_job(&job).await.unwrap();
        let run = NewRun::manual(job.id, None).into_run(Utc::now());
        store.insert_run(&run).await.unwrap();

        let executor = RunExecutor::new(
            Arc::clone(&store),
            Arc::new(StepRegistry::new(StepServices::default())),
            Arc::new(InMemoryMetrics::new()),
            ExecutorConfig::default(),
        );
        let (dispatcher, inbox) = ChannelDispatcher::new(4);
        let handle = WorkerPool::new(executor, Arc::new(inbox), 2).spawn();

        let ticket = RunTicket {
            run_id: run.id,
            tenant_id,
        };
        dispatcher.enqueue(ticket).await.unwrap();
        dispatcher.enqueue(ticket).await.unwrap();
        drop(dispatcher);

        let stats = handle.stats_source();
        handle.join().await;
        let stats = snapshot(&stats);
        assert_eq!(stats.runs_processed, 1);
        assert_eq!(stats.runs_not_pending, 1);
        // No trigger event linked, so the payload step skips.
        assert_eq!(stats.runs_skipped, 1);

        let run = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Skipped);
    }
}
