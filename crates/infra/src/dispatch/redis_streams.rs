//! Redis Streams transport (XADD / XREADGROUP / XACK).
//!
//! One stream carries every ticket; each worker process joins the same
//! consumer group so a ticket is handed to a single consumer. Unacknowledged
//! entries stay pending in the group and can be reclaimed by an operator.

use std::sync::Arc;

use async_trait::async_trait;
use redis::streams::StreamReadReply;
use tracing::{instrument, warn};

use forgejobs_core::{RunId, TenantId};

use super::{Delivery, DispatchError, RunDispatcher, RunInbox, RunTicket};

pub const DEFAULT_STREAM_KEY: &str = "forgejobs:runs";
pub const DEFAULT_CONSUMER_GROUP: &str = "forgejobs.workers";
const DEFAULT_BLOCK_MS: u64 = 5_000;

fn open_client(redis_url: &str) -> Result<Arc<redis::Client>, DispatchError> {
    redis::Client::open(redis_url)
        .map(Arc::new)
        .map_err(|e| DispatchError::Connection(e.to_string()))
}

fn connect(client: &redis::Client) -> Result<redis::Connection, DispatchError> {
    client
        .get_connection()
        .map_err(|e| DispatchError::Connection(e.to_string()))
}

/// Run a blocking Redis call off the async executor.
async fn blocking<T, F>(f: F) -> Result<T, DispatchError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, DispatchError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DispatchError::Command(format!("blocking redis task failed: {e}")))?
}

#[derive(Debug, Clone)]
pub struct RedisStreamsDispatcher {
    client: Arc<redis::Client>,
    stream_key: String,
}

impl RedisStreamsDispatcher {
    pub fn new(redis_url: impl AsRef<str>, stream_key: Option<String>) -> Result<Self, DispatchError> {
        Ok(Self {
            client: open_client(redis_url.as_ref())?,
            stream_key: stream_key.unwrap_or_else(|| DEFAULT_STREAM_KEY.to_string()),
        })
    }
}

#[async_trait]
impl RunDispatcher for RedisStreamsDispatcher {
    #[instrument(skip(self), fields(stream_key = %self.stream_key, run_id = %ticket.run_id), err)]
    async fn enqueue(&self, ticket: RunTicket) -> Result<(), DispatchError> {
        let client = Arc::clone(&self.client);
        let stream_key = self.stream_key.clone();
        blocking(move || {
            let mut conn = connect(&client)?;
            let _: String = redis::cmd("XADD")
                .arg(&stream_key)
                .arg("*")
                .arg("run_id")
                .arg(ticket.run_id.to_string())
                .arg("tenant_id")
                .arg(ticket.tenant_id.to_string())
                .query(&mut conn)
                .map_err(|e| DispatchError::Command(format!("XADD failed: {e}")))?;
            Ok(())
        })
        .await
    }
}

#[derive(Debug, Clone)]
pub struct RedisStreamsInbox {
    client: Arc<redis::Client>,
    stream_key: String,
    group: String,
    consumer: String,
    block_ms: u64,
}

impl RedisStreamsInbox {
    /// Connect and make sure the consumer group exists.
    pub fn new(
        redis_url: impl AsRef<str>,
        stream_key: Option<String>,
        group: Option<String>,
        consumer: impl Into<String>,
    ) -> Result<Self, DispatchError> {
        let inbox = Self {
            client: open_client(redis_url.as_ref())?,
            stream_key: stream_key.unwrap_or_else(|| DEFAULT_STREAM_KEY.to_string()),
            group: group.unwrap_or_else(|| DEFAULT_CONSUMER_GROUP.to_string()),
            consumer: consumer.into(),
            block_ms: DEFAULT_BLOCK_MS,
        };
        inbox.ensure_consumer_group()?;
        Ok(inbox)
    }

    pub fn with_block_ms(mut self, block_ms: u64) -> Self {
        self.block_ms = block_ms;
        self
    }

    fn ensure_consumer_group(&self) -> Result<(), DispatchError> {
        let mut conn = connect(&self.client)?;
        // BUSYGROUP when the group already exists.
        let _: Result<String, _> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);
        Ok(())
    }
}

fn parse_ticket(entry: &redis::streams::StreamId) -> Result<RunTicket, DispatchError> {
    let field = |name: &str| -> Result<String, DispatchError> {
        entry
            .get::<String>(name)
            .ok_or_else(|| DispatchError::Serialization(format!("stream entry {} missing {name}", entry.id)))
    };
    let run_id: RunId = field("run_id")?
        .parse()
        .map_err(|e| DispatchError::Serialization(format!("bad run_id: {e}")))?;
    let tenant_id: TenantId = field("tenant_id")?
        .parse()
        .map_err(|e| DispatchError::Serialization(format!("bad tenant_id: {e}")))?;
    Ok(RunTicket { run_id, tenant_id })
}

#[async_trait]
impl RunInbox for RedisStreamsInbox {
    async fn receive(&self) -> Result<Option<Delivery>, DispatchError> {
        let inbox = self.clone();
        let reply = blocking(move || {
            let mut conn = connect(&inbox.client)?;
            redis::cmd("XREADGROUP")
                .arg("GROUP")
                .arg(&inbox.group)
                .arg(&inbox.consumer)
                .arg("COUNT")
                .arg(1)
                .arg("BLOCK")
                .arg(inbox.block_ms)
                .arg("STREAMS")
                .arg(&inbox.stream_key)
                .arg(">")
                .query::<Option<StreamReadReply>>(&mut conn)
                .map_err(|e| DispatchError::Command(format!("XREADGROUP failed: {e}")))
        })
        .await?;

        let Some(entry) = reply
            .into_iter()
            .flat_map(|r| r.keys)
            .flat_map(|k| k.ids)
            .next()
        else {
            return Ok(None);
        };

        match parse_ticket(&entry) {
            Ok(ticket) => Ok(Some(Delivery {
                ticket,
                receipt: Some(entry.id),
            })),
            Err(err) => {
                // Poison entry: ack it so it is not redelivered forever.
                warn!(message_id = %entry.id, error = %err, "dropping malformed run ticket");
                self.ack_message(entry.id).await?;
                Ok(None)
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), DispatchError> {
        match &delivery.receipt {
            Some(message_id) => self.ack_message(message_id.clone()).await,
            None => Ok(()),
        }
    }
}

impl RedisStreamsInbox {
    async fn ack_message(&self, message_id: String) -> Result<(), DispatchError> {
        let client = Arc::clone(&self.client);
        let stream_key = self.stream_key.clone();
        let group = self.group.clone();
        blocking(move || {
            let mut conn = connect(&client)?;
            let _: u64 = redis::cmd("XACK")
                .arg(&stream_key)
                .arg(&group)
                .arg(&message_id)
                .query(&mut conn)
                .map_err(|e| DispatchError::Command(format!("XACK failed: {e}")))?;
            Ok(())
        })
        .await
    }
}
