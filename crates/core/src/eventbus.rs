use crate::error::{KnowledgeError, StorageError};
use crate::models::{Document, Review, Slice};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, warn};

/// Indexing job carried by the event transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    IndexDocuments {
        knowledge_id: i64,
        documents: Vec<Document>,
    },
    IndexDocument {
        knowledge_id: i64,
        document: Document,
    },
    IndexSlice {
        slice: Slice,
        #[serde(default)]
        document: Option<Document>,
    },
    DeleteKnowledgeData {
        knowledge_id: i64,
        slice_ids: Vec<i64>,
    },
    DocumentReview {
        document: Document,
        review: Review,
    },
}

impl Event {
    pub fn encode(&self) -> Result<Vec<u8>, KnowledgeError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(body: &[u8]) -> Result<Self, KnowledgeError> {
        Ok(serde_json::from_slice(body)?)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::IndexDocuments { .. } => "index_documents",
            Self::IndexDocument { .. } => "index_document",
            Self::IndexSlice { .. } => "index_slice",
            Self::DeleteKnowledgeData { .. } => "delete_knowledge_data",
            Self::DocumentReview { .. } => "document_review",
        }
    }
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn send(&self, body: Vec<u8>, sharding_key: &str) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub body: Vec<u8>,
    pub sharding_key: String,
    pub attempt: u32,
}

/// In-process transport over an unbounded tokio channel.
pub struct ChannelEventBus {
    sender: mpsc::UnboundedSender<Message>,
    receiver: Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl Default for ChannelEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelEventBus {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    fn redeliver(&self, mut message: Message) -> Result<(), StorageError> {
        message.attempt += 1;
        self.sender
            .send(message)
            .map_err(|err| StorageError::Transport(err.to_string()))
    }

    /// Delivers queued messages to `handler` until the queue is empty. Retryable failures are
    /// queued again up to `max_redeliveries` times. Returns the number of delivered messages.
    pub async fn drain<F, Fut>(&self, max_redeliveries: u32, mut handler: F) -> Result<usize, StorageError>
    where
        F: FnMut(Vec<u8>) -> Fut + Send,
        Fut: Future<Output = Result<(), KnowledgeError>> + Send,
    {
        let mut delivered = 0;
        loop {
            let next = self.receiver.lock().await.try_recv();
            let message = match next {
                Ok(message) => message,
                Err(_) => return Ok(delivered),
            };
            delivered += 1;
            self.dispatch(message, max_redeliveries, &mut handler).await?;
        }
    }

    /// Consumes messages until every sender is gone.
    pub async fn run_consumer<F, Fut>(&self, max_redeliveries: u32, mut handler: F) -> Result<(), StorageError>
    where
        F: FnMut(Vec<u8>) -> Fut + Send,
        Fut: Future<Output = Result<(), KnowledgeError>> + Send,
    {
        loop {
            let next = self.receiver.lock().await.recv().await;
            match next {
                Some(message) => self.dispatch(message, max_redeliveries, &mut handler).await?,
                None => return Ok(()),
            }
        }
    }

    async fn dispatch<F, Fut>(
        &self,
        message: Message,
        max_redeliveries: u32,
        handler: &mut F,
    ) -> Result<(), StorageError>
    where
        F: FnMut(Vec<u8>) -> Fut + Send,
        Fut: Future<Output = Result<(), KnowledgeError>> + Send,
    {
        match handler(message.body.clone()).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_retryable() && message.attempt < max_redeliveries => {
                warn!(
                    sharding_key = %message.sharding_key,
                    attempt = message.attempt,
                    error = %err,
                    "event handling failed, redelivering"
                );
                self.redeliver(message)
            }
            Err(err) => {
                error!(
                    sharding_key = %message.sharding_key,
                    attempt = message.attempt,
                    error = %err,
                    "event handling failed, giving up"
                );
                Ok(())
            }
        }
    }
}

#[async_trait]
impl EventBus for ChannelEventBus {
    async fn send(&self, body: Vec<u8>, sharding_key: &str) -> Result<(), StorageError> {
        self.sender
            .send(Message {
                body,
                sharding_key: sharding_key.to_string(),
                attempt: 0,
            })
            .map_err(|err| StorageError::Transport(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn events_are_tagged_by_type() -> Result<(), Box<dyn std::error::Error>> {
        let event = Event::DeleteKnowledgeData {
            knowledge_id: 3,
            slice_ids: vec![1, 2],
        };
        let body = event.encode()?;
        let json: serde_json::Value = serde_json::from_slice(&body)?;
        assert_eq!(json["type"], "delete_knowledge_data");
        assert_eq!(Event::decode(&body)?, event);
        assert!(Event::decode(br#"{"type":"unknown_kind"}"#).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn retryable_failures_are_redelivered_until_the_cap() -> Result<(), Box<dyn std::error::Error>> {
        let bus = ChannelEventBus::new();
        bus.send(b"job".to_vec(), "7").await?;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let delivered = bus
            .drain(2, move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(KnowledgeError::from(StorageError::Transport("down".to_string())))
                }
            })
            .await?;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(delivered, 3);
        Ok(())
    }
}
