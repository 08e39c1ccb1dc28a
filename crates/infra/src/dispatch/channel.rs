use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use super::{Delivery, DispatchError, RunDispatcher, RunInbox, RunTicket};

/// In-process transport over a bounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::Sender<RunTicket>,
}

/// Receiving half; clones share one queue.
#[derive(Debug, Clone)]
pub struct ChannelInbox {
    rx: Arc<Mutex<mpsc::Receiver<RunTicket>>>,
}

impl ChannelDispatcher {
    pub fn new(capacity: usize) -> (Self, ChannelInbox) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self { tx },
            ChannelInbox {
                rx: Arc::new(Mutex::new(rx)),
            },
        )
    }
}

#[async_trait]
impl RunDispatcher for ChannelDispatcher {
    async fn enqueue(&self, ticket: RunTicket) -> Result<(), DispatchError> {
        self.tx.send(ticket).await.map_err(|_| DispatchError::Closed)
    }
}

#[async_trait]
impl RunInbox for ChannelInbox {
    async fn receive(&self) -> Result<Option<Delivery>, DispatchError> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(ticket) => Ok(Some(Delivery { ticket, receipt: None })),
            None => Err(DispatchError::Closed),
        }
    }

    async fn ack(&self, _delivery: &Delivery) -> Result<(), DispatchError> {
        Ok(())
    }
}
