//! Custom job worker process: heartbeat, run workers and operational HTTP endpoints.

pub mod app;
pub mod runtime;
