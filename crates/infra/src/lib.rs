//! Infrastructure layer: persistence, claims, execution, transport, config.
//!
//! **Responsibility:** everything that moves a custom job from "due" to "finished".
//!
//! - [`store`]: the relational model behind an [`EngineStore`] trait (in-memory and Postgres).
//! - [`scheduler`]: due-job and trigger-event claims, the stale-run reaper, retention.
//! - [`executor`]: the run state machine, retries and deadlines.
//! - [`heartbeat`] / [`dispatch`] / [`worker`]: the periodic claimers, the run transport and
//!   the workers draining it.
//! - [`admin`]: the engine-side job administration service.

pub mod admin;
pub mod config;
pub mod dispatch;
pub mod executor;
pub mod heartbeat;
pub mod manual;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use admin::{AdminError, DryRunReport, JobAdmin, JobDraft, JobPatch, ManualTriggerResponse, ManualTriggerStatus};
pub use config::{ConfigError, EngineConfig};
pub use dispatch::{ChannelDispatcher, Delivery, DispatchError, RunDispatcher, RunInbox, RunTicket};
pub use executor::{ExecutorConfig, ExecutorError, RunExecutor, RunOutcome};
pub use heartbeat::{Heartbeat, HeartbeatConfig, HeartbeatLock, InMemoryLocks, LockError};
pub use manual::ManualRun;
pub use retry::{BackoffPolicy, is_transient_error};
pub use scheduler::{AdmissionTracker, Scheduler};
pub use store::{EngineStore, InMemoryStore, PostgresStore, RunCompletion, RunQuery, RunSort, StepUpdate, StoreError};
pub use worker::{WorkerHandle, WorkerPool, WorkerStats};
