//! Message bus: typed messages, subscriptions, delivery with retry,
//! dead letters and history

pub mod dead_letter;
pub mod history;
pub mod message;
pub mod message_bus;
pub mod subscription;

pub use dead_letter::{DeadLetterEntry, DeadLetterQueue, ReplayReport, DEFAULT_DEAD_LETTER_CAPACITY};
pub use history::MessageHistory;
pub use message::{Message, MessagePriority, MessageType, DEFAULT_MAX_RETRIES};
pub use message_bus::{BusStatistics, MessageBus, MessageBusConfig, BUS_SENDER_ID};
pub use subscription::{handler_fn, FnHandler, MessageFilter, MessageHandler, Subscription};
