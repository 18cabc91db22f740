//! In-memory topic registry and per-turn instruction injection.
//!
//! Topic *files* are parsed by an external collaborator; the core only sees
//! registered topics and activates the one named by a work item's
//! `topic_ref` before the turn runs.

use std::sync::Mutex;

use autopoiesis_protocol::Message;
use tracing::debug;

/// First line of every injected topic message; used to strip stale copies.
pub const TOPIC_MARKER: &str = "[Topic context]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TopicPriority {
    Critical,
    Normal,
    Low,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Topic {
    pub name: String,
    pub priority: TopicPriority,
    pub instructions: String,
    pub active: bool,
}

#[derive(Default)]
pub struct TopicRegistry {
    topics: Mutex<Vec<Topic>>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a topic by name.
    pub fn register(&self, topic: Topic) {
        let mut topics = self.lock_topics();
        if let Some(existing) = topics.iter_mut().find(|t| t.name == topic.name) {
            *existing = topic;
        } else {
            topics.push(topic);
        }
    }

    /// Mark the named topic active; unknown names are logged and ignored so
    /// a stale `topic_ref` cannot block execution.
    pub fn activate(&self, name: &str) -> bool {
        let mut topics = self.lock_topics();
        match topics.iter_mut().find(|t| t.name == name) {
            Some(topic) => {
                topic.active = true;
                true
            }
            None => {
                debug!(topic = name, "topic_ref not found; skipping activation");
                false
            }
        }
    }

    /// Active topics ordered by priority (critical, normal, low), stable
    /// within a priority.
    pub fn active_sorted(&self) -> Vec<Topic> {
        let mut active: Vec<Topic> = self
            .lock_topics()
            .iter()
            .filter(|t| t.active)
            .cloned()
            .collect();
        active.sort_by_key(|t| t.priority);
        active
    }

    // Poisoned mutex means a panic mid-mutation; propagate it.
    #[allow(clippy::unwrap_used)]
    fn lock_topics(&self) -> std::sync::MutexGuard<'_, Vec<Topic>> {
        self.topics.lock().unwrap()
    }
}

/// Strip stale topic messages and prepend one with the concatenated
/// instructions of all active topics, priority-ordered.
pub fn inject_topic_context(messages: Vec<Message>, registry: &TopicRegistry) -> Vec<Message> {
    let mut stripped: Vec<Message> = messages
        .into_iter()
        .filter(|m| !m.starts_with_marker(TOPIC_MARKER))
        .collect();

    let active = registry.active_sorted();
    if active.is_empty() {
        return stripped;
    }

    let mut sections = vec![TOPIC_MARKER.to_string()];
    for topic in &active {
        sections.push(format!("## {}\n{}", topic.name, topic.instructions));
    }
    stripped.insert(0, Message::user(sections.join("\n")));
    stripped
}
