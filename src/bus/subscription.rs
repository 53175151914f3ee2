//! Subscriptions, handlers and delivery filters

use super::message::{Message, MessageType};
use crate::error::Result;
use crate::predicate::Predicate;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

/// Receives messages delivered by the bus
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<()>;
}

/// Adapter turning an async closure into a `MessageHandler`
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, message: &Message) -> Result<()> {
        (self.f)(message.clone()).await
    }
}

/// Wrap an async closure as a handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Optional per-subscription delivery filter
#[derive(Clone)]
pub enum MessageFilter {
    /// Structured predicate evaluated against the payload
    Payload(Predicate),
    /// Arbitrary check on the whole message
    Custom(Arc<dyn Fn(&Message) -> bool + Send + Sync>),
}

impl MessageFilter {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        MessageFilter::Custom(Arc::new(f))
    }

    pub fn accepts(&self, message: &Message) -> bool {
        match self {
            MessageFilter::Payload(predicate) => predicate.evaluate(&message.payload),
            MessageFilter::Custom(f) => f(message),
        }
    }
}

impl std::fmt::Debug for MessageFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageFilter::Payload(p) => write!(f, "Payload({p})"),
            MessageFilter::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// A registered subscription
#[derive(Clone)]
pub struct Subscription {
    pub id: String,
    pub subscriber_id: String,
    pub message_types: HashSet<MessageType>,
    pub(crate) handler: Arc<dyn MessageHandler>,
    pub filter: Option<MessageFilter>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    pub(crate) fn new(
        subscriber_id: &str,
        message_types: HashSet<MessageType>,
        handler: Arc<dyn MessageHandler>,
        filter: Option<MessageFilter>,
    ) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            id: format!("{}_{}", subscriber_id, &suffix[..8]),
            subscriber_id: subscriber_id.to_string(),
            message_types,
            handler,
            filter,
            active: true,
            created_at: Utc::now(),
        }
    }

    /// Recipient and filter checks. Breaker state is checked by the bus.
    pub fn wants(&self, message: &Message) -> bool {
        if !self.active || !self.message_types.contains(&message.message_type) {
            return false;
        }
        if let Some(recipient) = &message.recipient_id {
            if recipient != &self.subscriber_id {
                return false;
            }
        }
        self.filter
            .as_ref()
            .map(|filter| filter.accepts(message))
            .unwrap_or(true)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("subscriber_id", &self.subscriber_id)
            .field("message_types", &self.message_types)
            .field("filter", &self.filter)
            .field("active", &self.active)
            .finish()
    }
}
