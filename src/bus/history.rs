//! Delivered-message history bounded by size and age

use super::message::{Message, MessageType};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

pub struct MessageHistory {
    max_size: usize,
    ttl: Duration,
    entries: VecDeque<(Instant, Message)>,
}

impl MessageHistory {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            max_size: max_size.max(1),
            ttl,
            entries: VecDeque::new(),
        }
    }

    /// Record a message and trim by size and age
    pub fn push(&mut self, message: Message) {
        self.entries.push_back((Instant::now(), message));
        self.trim();
    }

    fn trim(&mut self) {
        while self.entries.len() > self.max_size {
            self.entries.pop_front();
        }
        while let Some((recorded_at, _)) = self.entries.front() {
            if recorded_at.elapsed() > self.ttl {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most recent matches, oldest first
    pub fn query(
        &self,
        message_type: Option<MessageType>,
        sender_id: Option<&str>,
        limit: usize,
    ) -> Vec<Message> {
        let mut matched: Vec<Message> = self
            .entries
            .iter()
            .rev()
            .filter(|(recorded_at, _)| recorded_at.elapsed() <= self.ttl)
            .map(|(_, m)| m)
            .filter(|m| message_type.map_or(true, |t| m.message_type == t))
            .filter(|m| sender_id.map_or(true, |s| m.sender_id == s))
            .take(limit)
            .cloned()
            .collect();
        matched.reverse();
        matched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(t: MessageType, sender: &str) -> Message {
        Message::new(t, sender, json!({}))
    }

    #[test]
    fn test_size_bound() {
        let mut history = MessageHistory::new(2, Duration::from_secs(60));
        history.push(msg(MessageType::HealthCheck, "a"));
        history.push(msg(MessageType::HealthCheck, "b"));
        history.push(msg(MessageType::HealthCheck, "c"));

        let senders: Vec<String> = history
            .query(None, None, 10)
            .into_iter()
            .map(|m| m.sender_id)
            .collect();
        assert_eq!(senders, vec!["b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_trimmed_on_ingest() {
        let mut history = MessageHistory::new(100, Duration::from_secs(10));
        history.push(msg(MessageType::HealthCheck, "old"));
        tokio::time::advance(Duration::from_secs(11)).await;
        history.push(msg(MessageType::HealthCheck, "new"));

        assert_eq!(history.len(), 1);
        assert_eq!(history.query(None, None, 10)[0].sender_id, "new");
    }

    #[test]
    fn test_query_filters() {
        let mut history = MessageHistory::new(100, Duration::from_secs(60));
        history.push(msg(MessageType::AgentHeartbeat, "a"));
        history.push(msg(MessageType::AgentHeartbeat, "b"));
        history.push(msg(MessageType::EmergencyAlert, "a"));
        history.push(msg(MessageType::AgentHeartbeat, "a"));

        assert_eq!(history.query(Some(MessageType::AgentHeartbeat), Some("a"), 10).len(), 2);
        assert_eq!(history.query(Some(MessageType::AgentHeartbeat), None, 1)[0].sender_id, "a");
        assert_eq!(history.query(None, Some("b"), 10).len(), 1);
    }
}
