//! `forgejobs-workflow`
//!
//! **Responsibility:** the closed set of workflows and steps a custom job can run.
//!
//! - Workflow and step keys are closed enums; unknown keys are configuration errors.
//! - Step configs are typed and validated whenever a definition is built.
//! - Steps never touch persistence: they read prior outputs from their context and
//!   talk to the outside world through the collaborator traits in [`services`].

pub mod cache;
pub mod catalog;
pub mod config;
pub mod definition;
pub mod error;
pub mod key;
pub mod registry;
pub mod services;
pub mod step;
pub mod steps;

pub use cache::TtlCache;
pub use catalog::{StepCatalogItem, step_catalog, workflow_keys};
pub use config::{JobConfig, StepConfig};
pub use definition::{WorkflowDefinition, WorkflowStepDefinition, build_workflow_definition};
pub use error::{ServiceError, StepError, WorkflowError};
pub use key::{StepKey, WorkflowKey};
pub use registry::{StepRegistry, WorkflowRuntime};
pub use services::StepServices;
pub use step::{Step, StepContext, StepOutput, StepResult};
