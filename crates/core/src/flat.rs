//! Flat fact records: the row shape observations travel in once stored.
//!
//! One [`FactRecord`] is produced per relation and object (or per relation
//! when it has no objects). Keys are dotted paths such as `actor.id`,
//! `rel.label` or `metadata.time.create`; the map itself is not nested.
//! [`record_to_observation`] turns a record back into a one-relation
//! observation so stored facts can be re-merged with
//! [`merge_observations`](crate::merge_observations).

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::dot_path;
use crate::entity::ObservedEntity;
use crate::instance::{EntityRef, Instance};
use crate::metadata::MetaContext;
use crate::{AirembrError, Observation, Relation, Result, Semantic, Session, Source};

/// md5 of `"{kind}-{id}"` with the kind lower-cased: the storage key of an
/// entity across observations.
pub fn generate_pk(kind: &str, id: &str) -> String {
    format!("{:x}", md5::compute(format!("{}-{id}", kind.to_lowercase())))
}

/// md5 of `"{actor_pk}-{label}-{object_pk}"`.
pub fn generate_triplet_id(actor_pk: &str, label: &str, object_pk: &str) -> String {
    format!("{:x}", md5::compute(format!("{actor_pk}-{label}-{object_pk}")))
}

/// One stored fact: a flat map from dotted path to value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FactRecord(Map<String, Value>);

impl FactRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        self.0.get(path).filter(|v| !v.is_null())
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str).filter(|s| !s.is_empty())
    }

    pub fn insert(&mut self, path: impl Into<String>, value: impl Into<Value>) {
        let value = value.into();
        if !value.is_null() {
            self.0.insert(path.into(), value);
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// The record's own id (`rel.id`).
    pub fn id(&self) -> Option<&str> {
        self.get_str("rel.id")
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    fn insert_opt(&mut self, path: &str, value: Option<&str>) {
        if let Some(value) = value {
            self.insert(path, value);
        }
    }

    /// Store a struct flattened under `prefix.`.
    fn insert_flattened<T: Serialize>(&mut self, prefix: &str, value: &T) -> Result<()> {
        if let Value::Object(map) = serde_json::to_value(value)? {
            for (path, leaf) in dot_path::flatten(&map) {
                self.insert(format!("{prefix}.{path}"), leaf);
            }
        }
        Ok(())
    }

    /// Rebuild a struct stored under `prefix.`; `None` when no key carries it.
    fn extract<T: DeserializeOwned>(&self, prefix: &str) -> Result<Option<T>> {
        let lead = format!("{prefix}.");
        let pairs: Vec<(String, Value)> = self
            .0
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(&lead)
                    .map(|rest| (rest.to_string(), v.clone()))
            })
            .collect();
        if pairs.is_empty() {
            return Ok(None);
        }
        let tree = Value::Object(dot_path::unflatten(pairs));
        Ok(Some(serde_json::from_value(tree)?))
    }
}

impl From<Map<String, Value>> for FactRecord {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

// ---------------------------------------------------------------------------
// Observation -> records
// ---------------------------------------------------------------------------

/// Flatten an observation into one record per relation and object.
pub fn flatten_observation(observation: &Observation) -> Result<Vec<FactRecord>> {
    let mut base = FactRecord::new();
    base.insert("observation.id", observation.id());
    base.insert_opt("observation.name", observation.name());
    base.insert_opt("aspect", observation.aspect());
    base.insert("source.id", observation.source().id.as_str());
    base.insert("session.id", observation.session_id());

    if let Some(consents) = observation.consents() {
        base.insert("consents.allow", consents.allow);
        base.insert(
            "consents.granted",
            consents.granted.iter().cloned().collect::<Vec<_>>(),
        );
    }
    if let Some(metadata) = observation.metadata() {
        if let Some(trace_id) = &metadata.trace_id {
            base.insert("metadata.trace_id", trace_id.as_str());
        }
        if let Some(app) = &metadata.application {
            base.insert_flattened("app", app)?;
        }
        if let Some(os) = &metadata.os {
            base.insert_flattened("os", os)?;
        }
        if let Some(device) = &metadata.device {
            base.insert_flattened("device", device)?;
        }
        if let Some(location) = &metadata.location {
            base.insert_flattened("location", location)?;
        }
    }

    let mut records = Vec::new();
    for relation in observation.relations() {
        let actor = relation
            .actor
            .first()
            .and_then(|r| observation.entity(r))
            .or_else(|| observation.observer_entity());

        let mut shared = base.clone();
        let actor_pk = actor.and_then(|a| write_entity(&mut shared, "actor", a));
        write_relation(&mut shared, observation, relation);

        let objects: Vec<Option<&ObservedEntity>> = if relation.objects.is_empty() {
            vec![None]
        } else {
            relation
                .objects
                .iter()
                .map(|r| observation.entity(r))
                .collect()
        };

        for object in objects {
            let mut record = shared.clone();
            let object_pk = object.and_then(|o| write_entity(&mut record, "object", o));
            record.insert(
                "rel.pk",
                generate_triplet_id(
                    actor_pk.as_deref().unwrap_or_default(),
                    &relation.label,
                    object_pk.as_deref().unwrap_or_default(),
                ),
            );
            records.push(record);
        }
    }
    Ok(records)
}

fn write_entity(record: &mut FactRecord, prefix: &str, entity: &ObservedEntity) -> Option<String> {
    let instance = &entity.instance;
    record.insert(format!("{prefix}.type"), instance.kind());
    record.insert_opt(&format!("{prefix}.role"), instance.role());
    if !entity.traits.is_empty() {
        record.insert(format!("{prefix}.traits"), Value::Object(entity.traits.clone()));
    }
    for (link, target) in [("part_of", &entity.part_of), ("is_a", &entity.is_a)] {
        if let Some(target) = target {
            record.insert(format!("{prefix}.{link}.kind"), target.kind());
            record.insert_opt(&format!("{prefix}.{link}.id"), target.id());
        }
    }

    let id = instance.id()?;
    let pk = generate_pk(instance.kind(), id);
    record.insert(format!("{prefix}.id"), id);
    record.insert(format!("{prefix}.pk"), pk.as_str());
    Some(pk)
}

fn write_relation(record: &mut FactRecord, observation: &Observation, relation: &Relation) {
    record.insert("rel.id", relation.id.as_str());
    record.insert("rel.label", relation.label.as_str());
    record.insert("rel.type", relation.kind.as_str());
    if let Some(traits) = relation.traits.as_ref().filter(|t| !t.is_empty()) {
        record.insert("rel.traits", Value::Object(traits.clone()));
    }
    if let Some(semantic) = &relation.semantic {
        record.insert_opt("semantic.summary", semantic.summary.as_deref());
        record.insert_opt("semantic.description", semantic.description.as_deref());
        record.insert_opt("semantic.context", semantic.context.as_deref());
    }
    if let Some(ts) = relation.ts {
        record.insert("metadata.time.create", ts.to_rfc3339());
    }
    if let Some(order) = relation.order {
        record.insert("metadata.order", order);
    }

    let context: Vec<String> = relation
        .context
        .iter()
        .chain(observation.context())
        .filter_map(|r| observation.entity(r))
        .map(|e| e.instance.to_string())
        .collect();
    if !context.is_empty() {
        record.insert("context", context);
    }
}

// ---------------------------------------------------------------------------
// Records -> observations
// ---------------------------------------------------------------------------

/// Reference token of a stored endpoint; stable per `(kind, id)` across records.
fn record_ref(kind: &str, id: &str) -> Result<EntityRef> {
    EntityRef::parse(&format!("ref-{}", generate_pk(kind, id)))
}

fn json_field(record: &FactRecord, path: &str) -> Option<Map<String, Value>> {
    match record.get(path)? {
        Value::Object(map) => Some(map.clone()),
        Value::String(text) if text.starts_with('{') => serde_json::from_str(text).ok(),
        _ => None,
    }
}

fn read_entity(record: &FactRecord, prefix: &str) -> Result<Option<(EntityRef, ObservedEntity)>> {
    // Endpoints stored without an id cannot be re-identified; skip them.
    let Some(id) = record.get_str(&format!("{prefix}.id")) else {
        return Ok(None);
    };
    let kind = record.get_str(&format!("{prefix}.type")).ok_or_else(|| {
        AirembrError::Format(format!("record has {prefix}.id but no {prefix}.type"))
    })?;

    let mut instance = Instance::typed(kind, id)?;
    if let Some(role) = record.get_str(&format!("{prefix}.role")) {
        instance = instance.with_role(role)?;
    }
    if prefix == "actor" {
        instance = instance.as_actor();
    }

    let mut builder = ObservedEntity::builder(instance);
    if let Some(traits) = json_field(record, &format!("{prefix}.traits")) {
        builder = builder.traits(Value::Object(traits));
    }
    for link in ["part_of", "is_a"] {
        let kind = record.get_str(&format!("{prefix}.{link}.kind"));
        let id = record.get_str(&format!("{prefix}.{link}.id"));
        if let (Some(kind), Some(id)) = (kind, id) {
            let target = Instance::typed(kind, id)?;
            builder = match link {
                "part_of" => builder.part_of(target),
                _ => builder.is_a(target),
            };
        }
    }
    Ok(Some((record_ref(kind, id)?, builder.build()?)))
}

/// Rebuild a single-relation observation from a stored record.
///
/// Endpoints without an id are left out. A record with no identified endpoint
/// at all, or without `rel.label`, is a [`AirembrError::Format`] error.
pub fn record_to_observation(record: &FactRecord) -> Result<Observation> {
    let actor = read_entity(record, "actor")?;
    let object = read_entity(record, "object")?;

    let label = record
        .get_str("rel.label")
        .ok_or_else(|| AirembrError::Format("record has no rel.label".to_string()))?;
    let mut relation = Relation::new(label).kind(record.get_str("rel.type").unwrap_or("event"));
    if let Some(id) = record.get_str("rel.id") {
        relation = relation.with_id(id);
    }
    if let Some(traits) = json_field(record, "rel.traits") {
        relation = relation.with_traits(traits);
    }
    let semantic = Semantic {
        summary: record.get_str("semantic.summary").map(str::to_string),
        description: record.get_str("semantic.description").map(str::to_string),
        context: record.get_str("semantic.context").map(str::to_string),
    };
    if !semantic.is_empty() {
        relation = relation.semantic(semantic);
    }
    // No stored time keeps the relation untimed, so it sorts as the earliest.
    if let Some(text) = record.get_str("metadata.time.create") {
        let ts = DateTime::parse_from_rfc3339(text)
            .map_err(|e| AirembrError::Format(format!("bad metadata.time.create {text:?}: {e}")))?
            .with_timezone(&Utc);
        relation = relation.at(ts);
    }
    if let Some(order) = record.get("metadata.order").and_then(Value::as_i64) {
        relation = relation.order(order);
    }

    let observer = match (&actor, &object) {
        (Some((reference, _)), _) | (None, Some((reference, _))) => reference.clone(),
        (None, None) => {
            return Err(AirembrError::Format(
                "record has neither actor.id nor object.id".to_string(),
            ))
        }
    };

    let source = Source::new(record.get_str("source.id").unwrap_or("unknown"));
    let mut builder = Observation::builder(observer, source);
    if let Some(id) = record.get_str("observation.id") {
        builder = builder.id(id);
    }
    if let Some(name) = record.get_str("observation.name") {
        builder = builder.name(name);
    }
    if let Some(aspect) = record.get_str("aspect") {
        builder = builder.aspect(aspect);
    }
    if let Some(session) = record.get_str("session.id") {
        builder = builder.session(Session::new(session));
    }

    if let Some((reference, entity)) = actor {
        relation = relation.actor(reference.clone());
        builder = builder.entity_as(reference, entity);
    }
    if let Some((reference, entity)) = object {
        relation = relation.object(reference.clone());
        builder = builder.entity_as(reference, entity);
    }

    let metadata = MetaContext {
        application: record.extract("app")?,
        os: record.extract("os")?,
        device: record.extract("device")?,
        location: record.extract("location")?,
        trace_id: record.get_str("metadata.trace_id").map(str::to_string),
    };
    if metadata != MetaContext::default() {
        builder = builder.metadata(metadata);
    }

    if let Some(allow) = record.get("consents.allow").and_then(Value::as_bool) {
        let granted: Vec<String> = record
            .get("consents.granted")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        builder = builder.consents(allow, granted);
    }

    builder.relation(relation).build()
}

/// Convert records, skipping (and logging) the ones that cannot be converted.
pub fn records_to_observations<'a, I>(records: I) -> Vec<Observation>
where
    I: IntoIterator<Item = &'a FactRecord>,
{
    records
        .into_iter()
        .filter_map(|record| match record_to_observation(record) {
            Ok(observation) => Some(observation),
            Err(e) => {
                tracing::warn!(
                    record = record.id().unwrap_or("?"),
                    error = %e,
                    "skipping record that cannot be converted to an observation"
                );
                None
            }
        })
        .collect()
}
