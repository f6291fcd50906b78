//! The transport contract between the client and a memory backend, and the
//! embedded implementation over [`ObservationStore`].

use std::collections::BTreeMap;
use std::fmt;

use airembr::flat::FactRecord;
use airembr::store::{FactPage, FactQuery, ObservationStore};
use airembr::Observation;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conversation::{ConversationMemory, MemorySessions};
use crate::Result;

/// Status code reported by a transport, HTTP style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryStatus(pub u16);

impl QueryStatus {
    pub const OK: QueryStatus = QueryStatus(200);

    pub fn is_ok(self) -> bool {
        (200..300).contains(&self.0)
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-request options of `remember`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RememberOptions {
    /// Realtime processing hint passed through to the backend.
    pub realtime: Option<String>,
    /// Processing stages the backend should skip.
    pub skip: Option<String>,
    /// Whether conversation memory should be returned.
    pub response: bool,
    pub context: Option<String>,
    pub tenant: Option<String>,
    /// Retrying with the same key stores nothing new.
    pub idempotency_key: Option<String>,
}

impl Default for RememberOptions {
    fn default() -> Self {
        Self {
            realtime: None,
            skip: None,
            response: true,
            context: None,
            tenant: None,
            idempotency_key: None,
        }
    }
}

/// Records in which one entity takes part.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityPage {
    pub total: usize,
    pub result: Vec<FactRecord>,
}

/// A memory backend.
///
/// `remember` takes observations in their JSON form; the client serializes
/// them. Implementations report backend-level outcomes through
/// [`QueryStatus`] and reserve `Err` for failures to talk to the backend or
/// to interpret its payload.
pub trait Transport: Send + Sync {
    fn remember(
        &self,
        payload: &[Value],
        options: &RememberOptions,
    ) -> Result<(QueryStatus, MemorySessions)>;

    fn query_facts(&self, query: &FactQuery) -> Result<(QueryStatus, FactPage)>;

    fn query_entity(&self, id: &str, page: usize, limit: usize)
        -> Result<(QueryStatus, EntityPage)>;
}

/// Embedded transport storing everything in a local redb file.
pub struct LocalTransport {
    store: ObservationStore,
}

impl LocalTransport {
    pub fn new(store: ObservationStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &ObservationStore {
        &self.store
    }
}

impl Transport for LocalTransport {
    fn remember(
        &self,
        payload: &[Value],
        options: &RememberOptions,
    ) -> Result<(QueryStatus, MemorySessions)> {
        let observations = payload
            .iter()
            .cloned()
            .map(serde_json::from_value::<Observation>)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        tracing::debug!(
            observations = observations.len(),
            context = options.context.as_deref().unwrap_or_default(),
            tenant = options.tenant.as_deref().unwrap_or_default(),
            realtime = options.realtime.as_deref().unwrap_or_default(),
            skip = options.skip.as_deref().unwrap_or_default(),
            "remember"
        );

        self.store
            .remember(&observations, options.idempotency_key.as_deref())?;

        if !options.response {
            return Ok((QueryStatus::OK, MemorySessions::new()));
        }
        Ok((QueryStatus::OK, session_memories(&observations)))
    }

    fn query_facts(&self, query: &FactQuery) -> Result<(QueryStatus, FactPage)> {
        Ok((QueryStatus::OK, self.store.query_facts(query)?))
    }

    fn query_entity(
        &self,
        id: &str,
        page: usize,
        limit: usize,
    ) -> Result<(QueryStatus, EntityPage)> {
        let records = self.store.query_entity(id)?;
        let total = records.len();
        let result = records
            .into_iter()
            .skip(page.saturating_mul(limit))
            .take(limit)
            .collect();
        Ok((QueryStatus::OK, EntityPage { total, result }))
    }
}

fn push_unique(items: &mut Vec<String>, item: String) {
    if !items.contains(&item) {
        items.push(item);
    }
}

/// One conversation memory per session: relation descriptions as passages,
/// relation labels as topics, declared entities as entities.
fn session_memories(observations: &[Observation]) -> MemorySessions {
    let mut by_session: BTreeMap<&str, ConversationMemory> = BTreeMap::new();
    for observation in observations {
        let memory = by_session
            .entry(observation.session_id())
            .or_insert_with(|| {
                ConversationMemory::new(observation.session_id(), observation.session().chat_ttl())
            });

        for relation in observation.relations() {
            let passage = if relation.has_semantic_part() {
                relation.semantic_summary().join("\n")
            } else {
                describe_relation(observation, &relation.actor, &relation.label, &relation.objects)
            };
            push_unique(&mut memory.passages, passage);
            push_unique(&mut memory.topics, relation.label.clone());
        }
        for entity in observation.entities().values() {
            push_unique(&mut memory.entities, entity.to_string());
        }
    }
    by_session.into_values().collect()
}

fn describe_relation(
    observation: &Observation,
    actor: &[airembr::EntityRef],
    label: &str,
    objects: &[airembr::EntityRef],
) -> String {
    let name = |refs: &[airembr::EntityRef]| {
        refs.iter()
            .filter_map(|r| observation.entity(r))
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    };
    let actor = name(actor);
    let objects = name(objects);
    match (actor.is_empty(), objects.is_empty()) {
        (false, false) => format!("{actor} {label} {objects}"),
        (false, true) => format!("{actor} {label}"),
        (true, false) => format!("{label} {objects}"),
        (true, true) => label.to_string(),
    }
}
