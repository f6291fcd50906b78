//! Per-session conversation memory returned by `remember`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryTime {
    pub datetime: DateTime<Utc>,
    /// Weekday name, e.g. `Monday`.
    pub day: String,
}

impl MemoryTime {
    pub fn now() -> Self {
        Self::at(Utc::now())
    }

    pub fn at(datetime: DateTime<Utc>) -> Self {
        Self {
            datetime,
            day: datetime.format("%A").to_string(),
        }
    }
}

impl Default for MemoryTime {
    fn default() -> Self {
        Self::now()
    }
}

impl fmt::Display for MemoryTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.datetime, self.day)
    }
}

/// What the memory service knows about one chat session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMemory {
    pub id: String,
    #[serde(default)]
    pub time: MemoryTime,
    #[serde(default)]
    pub passages: Vec<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub ner: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub ttl: u64,
}

impl ConversationMemory {
    pub fn new(id: impl Into<String>, ttl: u64) -> Self {
        Self {
            id: id.into(),
            time: MemoryTime::now(),
            passages: Vec::new(),
            topics: Vec::new(),
            entities: Vec::new(),
            ner: Vec::new(),
            summary: None,
            ttl,
        }
    }

    pub fn to_text(&self) -> String {
        self.passages.join("\n")
    }

    pub fn size(&self) -> usize {
        self.to_text().len()
    }

    /// The memory without `id`, `time` and `ttl`, as JSON.
    pub fn context_json(&self) -> serde_json::Value {
        serde_json::json!({
            "passages": self.passages,
            "topics": self.topics,
            "entities": self.entities,
            "ner": self.ner,
            "summary": self.summary,
        })
    }

    /// Prompt-ready rendering: summary, topics, entities, the current
    /// passages and the current time.
    pub fn format(&self) -> String {
        let mut text = String::new();
        if let Some(summary) = &self.summary {
            text.push_str(&format!("Summary of previous chat:\n{summary}"));
        }
        if !self.topics.is_empty() {
            text.push_str(&format!(
                "\n\nTopics of conversation:\n{}",
                self.topics.join(", ")
            ));
        }
        if !self.entities.is_empty() || !self.ner.is_empty() {
            text.push_str("\n\nEntities of conversation:\n");
            if !self.entities.is_empty() {
                text.push_str(&self.entities.join("\n"));
                text.push('\n');
            }
            text.push_str(&self.ner.join("\n"));
        }
        text.push_str(&format!("\n\nCurrent prompt:\n{}", self.passages.join("\n")));
        text.push_str(&format!("\n\nNow:\n{}\n", self.time));
        text
    }
}

/// Conversation memories keyed by session id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemorySessions(BTreeMap<String, ConversationMemory>);

impl MemorySessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, memory: ConversationMemory) {
        self.0.insert(memory.id.clone(), memory);
    }

    pub fn get_chat_memory(&self, session_id: &str) -> Option<&ConversationMemory> {
        self.0.get(session_id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ConversationMemory)> {
        self.0.iter()
    }

    /// [`ConversationMemory::format`] for every session.
    pub fn format_all(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .map(|(id, memory)| (id.clone(), memory.format()))
            .collect()
    }
}

impl FromIterator<ConversationMemory> for MemorySessions {
    fn from_iter<I: IntoIterator<Item = ConversationMemory>>(iter: I) -> Self {
        let mut sessions = Self::new();
        for memory in iter {
            sessions.insert(memory);
        }
        sessions
    }
}
