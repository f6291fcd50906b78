//! Relations (facts): labelled, directed statements between entities.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use ulid::Ulid;

use crate::entity::{render_traits, CollectConsent};
use crate::instance::EntityRef;

/// Optional natural-language rendering of a relation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Semantic {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl Semantic {
    pub fn summary(summary: impl Into<String>) -> Self {
        Self {
            summary: Some(summary.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.summary.is_none() && self.description.is_none() && self.context.is_none()
    }
}

/// Chronological merge key: `(timestamp, order)`. A missing timestamp sorts
/// before every timestamp; a missing order counts as 0.
pub type RelationKey = (Option<DateTime<Utc>>, i64);

/// A directed statement: `actor --label--> objects`.
///
/// Actor and object references must name entities declared in the same
/// observation; [`Observation`](crate::Observation) enforces this when built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    #[serde(default = "new_relation_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i64>,
    #[serde(
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub actor: Vec<EntityRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_label: Option<String>,
    #[serde(rename = "type", default = "default_relation_kind")]
    pub kind: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic: Option<Semantic>,
    #[serde(
        default,
        deserialize_with = "unique_one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub objects: Vec<EntityRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traits: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<EntityRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default = "default_subjective")]
    pub subjective: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consents: Option<CollectConsent>,
}

fn new_relation_id() -> String {
    Ulid::new().to_string()
}

fn default_relation_kind() -> String {
    "fact".to_string()
}

fn default_subjective() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(EntityRef),
    Many(Vec<EntityRef>),
}

pub(crate) fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<EntityRef>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(r)) => vec![r],
        Some(OneOrMany::Many(refs)) => refs,
    })
}

fn unique_one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<EntityRef>, D::Error>
where
    D: Deserializer<'de>,
{
    one_or_many(deserializer).map(unique)
}

fn unique(refs: Vec<EntityRef>) -> Vec<EntityRef> {
    let mut out: Vec<EntityRef> = Vec::with_capacity(refs.len());
    for r in refs {
        if !out.contains(&r) {
            out.push(r);
        }
    }
    out
}

impl Relation {
    /// A `fact` relation with a fresh id and no endpoints.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            id: new_relation_id(),
            ts: None,
            order: None,
            actor: Vec::new(),
            actor_label: None,
            kind: default_relation_kind(),
            label: label.into(),
            semantic: None,
            objects: Vec::new(),
            traits: None,
            context: Vec::new(),
            tags: Vec::new(),
            subjective: true,
            consents: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn actor(mut self, reference: EntityRef) -> Self {
        self.actor.push(reference);
        self
    }

    /// Add an object; duplicates are ignored.
    pub fn object(mut self, reference: EntityRef) -> Self {
        if !self.objects.contains(&reference) {
            self.objects.push(reference);
        }
        self
    }

    pub fn at(mut self, ts: DateTime<Utc>) -> Self {
        self.ts = Some(ts);
        self
    }

    pub fn order(mut self, order: i64) -> Self {
        self.order = Some(order);
        self
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn with_traits(mut self, traits: Map<String, Value>) -> Self {
        self.traits = Some(traits);
        self
    }

    pub fn semantic(mut self, semantic: Semantic) -> Self {
        self.semantic = Some(semantic);
        self
    }

    pub fn context(mut self, reference: EntityRef) -> Self {
        self.context.push(reference);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn consent(mut self, allow: bool) -> Self {
        self.consents = Some(CollectConsent { allow });
        self
    }

    pub fn sort_key(&self) -> RelationKey {
        (self.ts, self.order.unwrap_or(0))
    }

    /// Absent consent counts as granted.
    pub fn is_consent_granted(&self) -> bool {
        self.consents.is_none_or(|c| c.allow)
    }

    pub fn has_semantic_part(&self) -> bool {
        self.semantic.as_ref().is_some_and(|s| !s.is_empty())
    }

    /// Printable lines describing the semantic part, empty without one.
    pub fn semantic_summary(&self) -> Vec<String> {
        let Some(semantic) = &self.semantic else {
            return Vec::new();
        };
        let mut lines = Vec::new();
        match self.ts {
            Some(ts) => lines.push(format!("Time: {}", ts.to_rfc3339())),
            None => lines.push("Time: unknown".to_string()),
        }
        if let Some(summary) = &semantic.summary {
            lines.push(format!("Summary: {}", clean(summary)));
        }
        if let Some(description) = &semantic.description {
            lines.push(format!("Description: {}", clean(description)));
        }
        if let Some(context) = &semantic.context {
            lines.push(format!("Context: {}", clean(context)));
        }
        lines
    }
}

// Collapse runs of whitespace (including newlines) into single spaces.
fn clean(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.traits {
            Some(traits) if !traits.is_empty() => {
                write!(f, "{}:{} ({})", self.label, self.kind, render_traits(traits))
            }
            _ => f.write_str(&self.label),
        }
    }
}
