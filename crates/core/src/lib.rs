//! `forgejobs-core`: domain foundation for the job orchestration engine.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the data model, and the schedule calculator.

/// String-backed enum helpers (`ALL`, `as_str`, `Display`, `FromStr`).
macro_rules! impl_str_enum {
    ($t:ident, $name:literal, { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $t {
            pub const ALL: &'static [$t] = &[$($t::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($t::$variant => $s),+
                }
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl core::str::FromStr for $t {
            type Err = $crate::error::DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok($t::$variant),)+
                    other => Err($crate::error::DomainError::validation(format!(
                        "unknown {}: {}",
                        $name, other
                    ))),
                }
            }
        }
    };
}

pub mod audit;
pub mod error;
pub mod id;
pub mod job;
pub mod run;
pub mod schedule;
pub mod trigger;

pub use audit::{AuditAction, AuditLogEntry};
pub use error::{DomainError, DomainResult};
pub use id::{JobId, RunId, TenantId, TriggerEventId, UserId};
pub use job::{CustomJob, DEFAULT_RETENTION_DAYS, JobTrigger, MAX_RETENTION_DAYS, TriggerSourceConfig};
pub use run::{NewRun, Run, RunOrigin, RunStatus, RunStep, StepStatus};
pub use schedule::{Cadence, ScheduleSpec, TriggerType, compute_next_run_at};
pub use trigger::{NewTriggerEvent, TriggerEvent, TriggerEventStatus, TriggerState};
