//! In-process broker implementation.
//!
//! Queues are unbounded channels inside one shared map. The implementation
//! mirrors the AMQP broker's observable contract (publishing to a missing
//! queue is [`BrokerError::NotFound`], deleting a queue ends its consumer's
//! stream) so the dispatch engine behaves identically over either
//! transport. Used by the end-to-end tests and by single-process
//! deployments that have no broker to talk to.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{Broker, BrokerError, BrokerResult, MessageStream};

struct QueueSlot {
    sender: mpsc::UnboundedSender<Vec<u8>>,
    // Taken by the first consumer; the memory broker supports one consumer
    // per queue, which is all the dispatch protocol uses.
    receiver: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
}

/// In-memory [`Broker`] backed by per-queue channels.
///
/// Cheap to clone; clones share the same queues, so a test can hand one
/// clone to a simulated worker and keep another for the distributor.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    queues: Arc<Mutex<HashMap<String, QueueSlot>>>,
}

impl MemoryBroker {
    /// Creates an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queues currently declared.
    pub fn queue_count(&self) -> usize {
        self.queues.lock().unwrap().len()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_queue(&self, queue: &str) -> BrokerResult<()> {
        let mut queues = self.queues.lock().unwrap();
        queues.entry(queue.to_string()).or_insert_with(|| {
            let (sender, receiver) = mpsc::unbounded_channel();
            QueueSlot {
                sender,
                receiver: Some(receiver),
            }
        });
        Ok(())
    }

    async fn queue_exists(&self, queue: &str) -> BrokerResult<bool> {
        Ok(self.queues.lock().unwrap().contains_key(queue))
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> BrokerResult<()> {
        let queues = self.queues.lock().unwrap();
        let slot = queues
            .get(queue)
            .ok_or_else(|| BrokerError::NotFound(queue.to_string()))?;
        slot.sender
            .send(payload.to_vec())
            .map_err(|_| BrokerError::Publish(format!("queue '{queue}' is gone")))?;
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> BrokerResult<MessageStream> {
        let receiver = {
            let mut queues = self.queues.lock().unwrap();
            let slot = queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::NotFound(queue.to_string()))?;
            slot.receiver
                .take()
                .ok_or_else(|| BrokerError::Consume(format!("queue '{queue}' already consumed")))?
        };

        let stream = UnboundedReceiverStream::new(receiver).map(Ok);
        Ok(Box::pin(stream))
    }

    async fn delete_queue(&self, queue: &str) -> BrokerResult<()> {
        self.queues.lock().unwrap().remove(queue);
        Ok(())
    }
}
