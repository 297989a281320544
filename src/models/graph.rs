use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Scheduling class of a unit of work. Lower discriminant is served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical = 0,
    Normal = 1,
    Batch = 2,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Normal => "normal",
            Self::Batch => "batch",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(Self::Critical),
            "normal" => Ok(Self::Normal),
            "batch" => Ok(Self::Batch),
            other => Err(format!("unknown priority: {}", other)),
        }
    }
}

/// A graph node, merged by `id` on write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl Entity {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            properties: Map::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }
}

/// A directed graph edge, merged by `(source, kind, target)` on write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub source: String,
    pub target: String,
    pub kind: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl Relationship {
    pub fn new(
        source: impl Into<String>,
        kind: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            kind: kind.into(),
            properties: Map::new(),
        }
    }

    /// Stable merge key.
    pub fn id(&self) -> String {
        format!("{}-[{}]->{}", self.source, self.kind, self.target)
    }
}

/// Everything a parser extracted from one piece of content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParseOutput {
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
}

impl ParseOutput {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty()
    }
}

/// One irrecoverable failure. The JSON shape is read by offline replay
/// tooling, so field names must stay stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub timestamp: DateTime<Utc>,
    pub error: String,
    pub item: Value,
    pub stage: String,
}

impl DeadLetterRecord {
    pub fn new(stage: &str, error: impl fmt::Display, item: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            error: error.to_string(),
            item,
            stage: stage.to_string(),
        }
    }
}
