//! AiRembr: observation model, entity identity and observation merging.
//!
//! The core primitive is an [`Observation`]: one submission unit bundling the
//! [`ObservedEntity`]s that took part in something and the [`Relation`]s
//! (facts) describing what happened between them.
//!
//! Three pieces of logic sit on top of the model:
//!
//! - **Identity resolution** ([`identification::resolve`]): a deterministic
//!   hash of selected trait values, so independent submissions about the same
//!   person land on the same instance id.
//! - **Integrity validation**: an observation cannot be built when its observer
//!   or any relation endpoint names an entity it does not declare.
//! - **Merging** ([`merge::merge_entities`], [`merge_observations`]): several
//!   observations sharing `(id, session)` fold into one, oldest to newest,
//!   newest wins at the leaf.
//!
//! # Quick start
//!
//! ```rust
//! use airembr::{EntityRef, Instance, Observation, ObservedEntity, Relation, Source};
//! use serde_json::json;
//!
//! let person = ObservedEntity::builder(Instance::of("person").unwrap())
//!     .traits(json!({"email": "a@b.com", "age": 30}))
//!     .identified_by(["email"])
//!     .build()
//!     .unwrap();
//! let shop = ObservedEntity::builder(Instance::typed("shop", "s-1").unwrap())
//!     .build()
//!     .unwrap();
//!
//! let p = EntityRef::parse("person").unwrap();
//! let s = EntityRef::parse("shop").unwrap();
//!
//! let observation = Observation::builder(p.clone(), Source::new("web"))
//!     .entity_as(p.clone(), person)
//!     .entity_as(s.clone(), shop)
//!     .relation(Relation::new("visited").actor(p).object(s))
//!     .build()
//!     .unwrap();
//! assert_eq!(observation.relations().len(), 1);
//! ```

mod aggregate;
pub mod dot_path;
mod entity;
pub mod flat;
pub mod identification;
mod instance;
pub mod merge;
pub mod metadata;
mod relation;
pub mod store;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ulid::Ulid;

pub use aggregate::merge_observations;
pub use entity::{CollectConsent, EntityBuilder, Measurement, ObservedEntity};
pub use identification::{IdentificationId, IdentificationPolicy};
pub use instance::{EntityRef, Instance};
pub use metadata::MetaContext;
pub use relation::{Relation, RelationKey, Semantic};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AirembrError {
    /// An observer or relation endpoint names an undeclared entity.
    #[error("integrity error: entity reference `{reference}` is not declared in the observation but is referenced {context}")]
    Integrity { reference: String, context: String },
    /// A malformed instance or reference token, or a non-object trait tree.
    #[error("format error: {0}")]
    Format(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
}

impl From<redb::DatabaseError> for AirembrError {
    fn from(e: redb::DatabaseError) -> Self {
        AirembrError::Storage(e.to_string())
    }
}
impl From<redb::TransactionError> for AirembrError {
    fn from(e: redb::TransactionError) -> Self {
        AirembrError::Storage(e.to_string())
    }
}
impl From<redb::TableError> for AirembrError {
    fn from(e: redb::TableError) -> Self {
        AirembrError::Storage(e.to_string())
    }
}
impl From<redb::StorageError> for AirembrError {
    fn from(e: redb::StorageError) -> Self {
        AirembrError::Storage(e.to_string())
    }
}
impl From<redb::CommitError> for AirembrError {
    fn from(e: redb::CommitError) -> Self {
        AirembrError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AirembrError>;

// ---------------------------------------------------------------------------
// Observation parts
// ---------------------------------------------------------------------------

/// The system or channel an observation came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
}

impl Source {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Chat-specific session settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSession {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compress_after: Option<u64>,
}

/// One month, the chat memory lifetime when none is configured.
pub const DEFAULT_CHAT_TTL_SECS: u64 = 2_629_746;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    #[serde(default = "new_session_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat: Option<ChatSession>,
}

fn new_session_id() -> String {
    Ulid::new().to_string()
}

impl Default for Session {
    fn default() -> Self {
        Self {
            id: new_session_id(),
            chat: None,
        }
    }
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            chat: None,
        }
    }

    pub fn is_chat(&self) -> bool {
        self.chat.is_some()
    }

    pub fn chat_ttl(&self) -> u64 {
        self.chat
            .as_ref()
            .and_then(|c| c.ttl)
            .unwrap_or(DEFAULT_CHAT_TTL_SECS)
    }
}

/// Top-level consent of an observation: collection allowed, plus the
/// explicitly granted permission scopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationConsents {
    pub allow: bool,
    #[serde(default)]
    pub granted: BTreeSet<String>,
}

// ---------------------------------------------------------------------------
// Observation
// ---------------------------------------------------------------------------

/// One submission unit: declared entities (keyed by reference token) and
/// the relations between them.
///
/// Always valid once constructed: the observer and every relation actor and
/// object resolve to a declared entity. Built with [`Observation::builder`] or
/// deserialized; both paths run the same validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ObservationDraft")]
pub struct Observation {
    pub(crate) id: String,
    pub(crate) observer: EntityRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) aspect: Option<String>,
    pub(crate) source: Source,
    pub(crate) session: Session,
    pub(crate) entities: BTreeMap<EntityRef, ObservedEntity>,
    #[serde(rename = "relation")]
    pub(crate) relations: Vec<Relation>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub(crate) context: Vec<EntityRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) metadata: Option<MetaContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) consents: Option<ObservationConsents>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) aux: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct ObservationDraft {
    #[serde(default)]
    id: Option<String>,
    observer: EntityRef,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    aspect: Option<String>,
    source: Source,
    #[serde(default)]
    session: Option<Session>,
    #[serde(default)]
    entities: BTreeMap<EntityRef, ObservedEntity>,
    #[serde(rename = "relation", default)]
    relations: Vec<Relation>,
    #[serde(default, deserialize_with = "relation::one_or_many")]
    context: Vec<EntityRef>,
    #[serde(default)]
    metadata: Option<MetaContext>,
    #[serde(default)]
    consents: Option<ObservationConsents>,
    #[serde(default)]
    aux: Option<Map<String, Value>>,
}

impl TryFrom<ObservationDraft> for Observation {
    type Error = AirembrError;

    fn try_from(draft: ObservationDraft) -> Result<Self> {
        let mut builder = Observation::builder(draft.observer, draft.source);
        builder.id = draft.id;
        builder.name = draft.name;
        builder.aspect = draft.aspect;
        builder.session = draft.session;
        builder.context = draft.context;
        builder.metadata = draft.metadata;
        builder.consents = draft.consents;
        builder.aux = draft.aux;
        builder.relations = draft.relations;
        for (reference, entity) in draft.entities {
            builder = builder.entity_as(reference, entity);
        }
        builder.build()
    }
}

/// Builder for [`Observation`]; [`build`](ObservationBuilder::build) validates.
#[derive(Debug, Clone)]
pub struct ObservationBuilder {
    id: Option<String>,
    observer: EntityRef,
    name: Option<String>,
    aspect: Option<String>,
    source: Source,
    session: Option<Session>,
    entities: BTreeMap<EntityRef, ObservedEntity>,
    relations: Vec<Relation>,
    context: Vec<EntityRef>,
    metadata: Option<MetaContext>,
    consents: Option<ObservationConsents>,
    aux: Option<Map<String, Value>>,
}

impl ObservationBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn aspect(mut self, aspect: impl Into<String>) -> Self {
        self.aspect = Some(aspect.into());
        self
    }

    pub fn session(mut self, session: Session) -> Self {
        self.session = Some(session);
        self
    }

    /// Declare an entity under its own generated reference.
    pub fn entity(self, entity: ObservedEntity) -> Self {
        let reference = entity.reference().clone();
        self.entity_as(reference, entity)
    }

    /// Declare an entity under an explicit reference token.
    pub fn entity_as(mut self, reference: EntityRef, mut entity: ObservedEntity) -> Self {
        entity.set_reference(reference.clone());
        self.entities.insert(reference, entity);
        self
    }

    pub fn relation(mut self, relation: Relation) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn context(mut self, reference: EntityRef) -> Self {
        if !self.context.contains(&reference) {
            self.context.push(reference);
        }
        self
    }

    pub fn metadata(mut self, metadata: MetaContext) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn consents<I, S>(mut self, allow: bool, granted: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.consents = Some(ObservationConsents {
            allow,
            granted: granted.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn aux(mut self, aux: Map<String, Value>) -> Self {
        self.aux = Some(aux);
        self
    }

    /// Validate references and produce the observation.
    ///
    /// Fails with [`AirembrError::Integrity`] when the observer or any
    /// relation actor/object is not a declared entity. There is no partial
    /// result: fix the input and build again.
    pub fn build(self) -> Result<Observation> {
        let observation = Observation {
            id: self
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| format!("anon-{}", Ulid::new())),
            observer: self.observer,
            name: self.name,
            aspect: self.aspect,
            source: self.source,
            session: self.session.unwrap_or_default(),
            entities: self.entities,
            relations: self.relations,
            context: self.context,
            metadata: self.metadata,
            consents: self.consents,
            aux: self.aux,
        };
        observation.validate_links()?;
        Ok(observation)
    }
}

impl Observation {
    pub fn builder(observer: EntityRef, source: Source) -> ObservationBuilder {
        ObservationBuilder {
            id: None,
            observer,
            name: None,
            aspect: None,
            source,
            session: None,
            entities: BTreeMap::new(),
            relations: Vec::new(),
            context: Vec::new(),
            metadata: None,
            consents: None,
            aux: None,
        }
    }

    fn validate_links(&self) -> Result<()> {
        if !self.entities.contains_key(&self.observer) {
            return Err(AirembrError::Integrity {
                reference: self.observer.to_string(),
                context: "as observer".to_string(),
            });
        }

        for relation in &self.relations {
            for (side, refs) in [("actor", &relation.actor), ("object", &relation.objects)] {
                if let Some(missing) = refs.iter().find(|r| !self.entities.contains_key(*r)) {
                    return Err(AirembrError::Integrity {
                        reference: missing.to_string(),
                        context: format!("as {side} of relation (label: {})", relation.label),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn observer(&self) -> &EntityRef {
        &self.observer
    }

    pub fn observer_entity(&self) -> Option<&ObservedEntity> {
        self.entities.get(&self.observer)
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn aspect(&self) -> Option<&str> {
        self.aspect.as_deref()
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_id(&self) -> &str {
        &self.session.id
    }

    /// Grouping key used when merging: `(observation id, session id)`.
    pub fn key(&self) -> (&str, &str) {
        (&self.id, &self.session.id)
    }

    pub fn entities(&self) -> &BTreeMap<EntityRef, ObservedEntity> {
        &self.entities
    }

    pub fn entity(&self, reference: &EntityRef) -> Option<&ObservedEntity> {
        self.entities.get(reference)
    }

    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    pub fn context(&self) -> &[EntityRef] {
        &self.context
    }

    pub fn metadata(&self) -> Option<&MetaContext> {
        self.metadata.as_ref()
    }

    pub fn consents(&self) -> Option<&ObservationConsents> {
        self.consents.as_ref()
    }

    pub fn granted_consents(&self) -> Option<&BTreeSet<String>> {
        self.consents.as_ref().map(|c| &c.granted)
    }

    pub fn aux(&self) -> Option<&Map<String, Value>> {
        self.aux.as_ref()
    }

    /// Absent consent counts as granted.
    pub fn is_consent_granted(&self) -> bool {
        self.consents.as_ref().is_none_or(|c| c.allow)
    }

    pub fn device(&self) -> Option<&metadata::Device> {
        self.metadata.as_ref()?.device.as_ref()
    }

    pub fn application(&self) -> Option<&metadata::Application> {
        self.metadata.as_ref()?.application.as_ref()
    }

    pub fn os(&self) -> Option<&metadata::Os> {
        self.metadata.as_ref()?.os.as_ref()
    }

    pub fn location(&self) -> Option<&metadata::Location> {
        self.metadata.as_ref()?.location.as_ref()
    }

    /// Earliest `(timestamp, order)` over the relations; `(None, 0)` when
    /// there are none.
    pub fn earliest_key(&self) -> RelationKey {
        self.relations
            .iter()
            .map(Relation::sort_key)
            .min()
            .unwrap_or((None, 0))
    }

    /// `"reference -> entity"` lines, one per declared entity.
    pub fn describe_entities(&self) -> Vec<String> {
        self.entities
            .iter()
            .map(|(reference, entity)| format!("{reference} -> {entity}"))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
