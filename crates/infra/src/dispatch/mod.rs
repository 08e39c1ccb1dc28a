//! Run transport: hands claimed run ids to whichever worker picks them up.
//!
//! Delivery is at-least-once. Duplicates are harmless because the executor's
//! PENDING → STARTED transition is a compare-and-swap.

mod channel;
#[cfg(feature = "redis")]
mod redis_streams;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use forgejobs_core::{RunId, TenantId};

pub use channel::{ChannelDispatcher, ChannelInbox};
#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsDispatcher, RedisStreamsInbox};

/// Work item placed on the transport for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTicket {
    pub run_id: RunId,
    pub tenant_id: TenantId,
}

/// A received ticket plus whatever the transport needs to acknowledge it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub ticket: RunTicket,
    pub receipt: Option<String>,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("run transport closed")]
    Closed,

    #[error("transport connection error: {0}")]
    Connection(String),

    #[error("transport command error: {0}")]
    Command(String),

    #[error("ticket serialization error: {0}")]
    Serialization(String),
}

#[async_trait]
pub trait RunDispatcher: Send + Sync + 'static {
    async fn enqueue(&self, ticket: RunTicket) -> Result<(), DispatchError>;
}

#[async_trait]
pub trait RunInbox: Send + Sync + 'static {
    /// Wait for the next ticket. `Ok(None)` when nothing arrived before the
    /// transport's poll window elapsed; [`DispatchError::Closed`] once no more
    /// tickets can arrive.
    async fn receive(&self) -> Result<Option<Delivery>, DispatchError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), DispatchError>;
}
