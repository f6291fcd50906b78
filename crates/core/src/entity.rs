//! Entities as observed inside one observation.
//!
//! An [`ObservedEntity`] is finalised exactly once, when it is built or
//! deserialized: its identity is resolved from the declared policy and, for
//! abstract instances (no external id), the instance id is filled in with the
//! resolved hash or a random ULID.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ulid::Ulid;

use crate::dot_path;
use crate::identification::{self, IdentificationId, IdentificationPolicy};
use crate::instance::{EntityRef, Instance};
use crate::{AirembrError, Result};

/// Consent to collect data about an entity or from a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectConsent {
    pub allow: bool,
}

/// A named numeric measurement attached to an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub value: f64,
}

/// A participant (person, location, product, ...) described by one observation.
///
/// Equality compares content and resolved identity, not the local reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "EntityDraft")]
pub struct ObservedEntity {
    pub instance: Instance,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identification: Option<IdentificationPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub part_of: Option<Instance>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_a: Option<Instance>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub has_a: Vec<Instance>,
    pub traits: Map<String, Value>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub state: Map<String, Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub measurements: Vec<Measurement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consents: Option<CollectConsent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aux: Option<Map<String, Value>>,
    #[serde(skip)]
    reference: EntityRef,
    #[serde(skip)]
    iid: IdentificationId,
}

/// Wire shape of an entity before identity resolution.
#[derive(Debug, Clone, Deserialize)]
struct EntityDraft {
    instance: Instance,
    #[serde(default)]
    identification: Option<IdentificationPolicy>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    part_of: Option<Instance>,
    #[serde(default)]
    is_a: Option<Instance>,
    #[serde(default)]
    has_a: Option<Vec<Instance>>,
    #[serde(default)]
    traits: Option<Map<String, Value>>,
    #[serde(default)]
    state: Option<Map<String, Value>>,
    #[serde(default)]
    measurements: Option<Vec<Measurement>>,
    #[serde(default)]
    consents: Option<CollectConsent>,
    #[serde(default)]
    aux: Option<Map<String, Value>>,
}

impl PartialEq for ObservedEntity {
    fn eq(&self, other: &Self) -> bool {
        self.instance == other.instance
            && self.identification == other.identification
            && self.label == other.label
            && self.part_of == other.part_of
            && self.is_a == other.is_a
            && self.has_a == other.has_a
            && self.traits == other.traits
            && self.state == other.state
            && self.measurements == other.measurements
            && self.consents == other.consents
            && self.aux == other.aux
            && self.iid == other.iid
    }
}

impl From<EntityDraft> for ObservedEntity {
    fn from(draft: EntityDraft) -> Self {
        Self::finalize(draft)
    }
}

impl ObservedEntity {
    /// Start building an entity of the given instance.
    pub fn builder(instance: Instance) -> EntityBuilder {
        EntityBuilder::new(instance)
    }

    fn finalize(draft: EntityDraft) -> Self {
        let traits = draft.traits.unwrap_or_default();
        let iid = identification::resolve(
            draft.instance.kind(),
            draft.identification.as_ref(),
            Some(&traits),
        );

        let mut instance = draft.instance;
        if instance.is_abstract() {
            let id = match (&draft.identification, iid.hash()) {
                (Some(_), Some(hash)) => hash.to_string(),
                (Some(policy), None) => {
                    tracing::debug!(
                        kind = instance.kind(),
                        policy = %policy.descriptor(),
                        "identification declared but unresolved, assigning random id"
                    );
                    Ulid::new().to_string()
                }
                (None, _) => Ulid::new().to_string(),
            };
            instance = instance.identified(id);
        }

        Self {
            instance,
            identification: draft.identification,
            label: draft.label,
            part_of: draft.part_of,
            is_a: draft.is_a,
            has_a: draft.has_a.unwrap_or_default(),
            traits,
            state: draft.state.unwrap_or_default(),
            measurements: draft.measurements.unwrap_or_default(),
            consents: draft.consents,
            aux: draft.aux,
            reference: EntityRef::generate(),
            iid,
        }
    }

    /// The local handle of this entity within its observation.
    pub fn reference(&self) -> &EntityRef {
        &self.reference
    }

    pub(crate) fn set_reference(&mut self, reference: EntityRef) {
        self.reference = reference;
    }

    /// Identity resolved at construction. Empty when unresolved.
    pub fn iid(&self) -> &IdentificationId {
        &self.iid
    }

    pub(crate) fn set_iid(&mut self, iid: IdentificationId) {
        self.iid = iid;
    }

    pub fn has_iid(&self) -> bool {
        !self.iid.is_empty()
    }

    /// Absent consent counts as granted.
    pub fn is_consent_granted(&self) -> bool {
        self.consents.is_none_or(|c| c.allow)
    }

    pub fn trait_value(&self, path: &str) -> Option<&Value> {
        dot_path::get(&self.traits, path)
    }
}

pub(crate) fn render_leaf(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn render_traits(traits: &Map<String, Value>) -> String {
    dot_path::flatten(traits)
        .iter()
        .map(|(path, value)| format!("{path}: {}", render_leaf(value)))
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for ObservedEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.traits.is_empty() {
            return f.write_str(&self.instance.label());
        }
        let traits = render_traits(&self.traits);
        match self.instance.id() {
            Some(id) => write!(f, "{} (id={id}, {traits})", self.instance.kind()),
            None => write!(f, "{} ({traits})", self.instance.kind()),
        }
    }
}

/// Builder for [`ObservedEntity`].
///
/// ```
/// use airembr::{Instance, ObservedEntity};
/// use serde_json::json;
///
/// let person = ObservedEntity::builder(Instance::of("person").unwrap())
///     .traits(json!({"email": "a@b.com", "age": 30}))
///     .identified_by(["email"])
///     .build()
///     .unwrap();
/// assert!(person.has_iid());
/// assert_eq!(person.instance.id(), person.iid().hash());
/// ```
#[derive(Debug, Clone)]
pub struct EntityBuilder {
    draft: EntityDraft,
    traits: Option<Value>,
    id_from_trait: Option<(String, bool)>,
}

impl EntityBuilder {
    fn new(instance: Instance) -> Self {
        Self {
            draft: EntityDraft {
                instance,
                identification: None,
                label: None,
                part_of: None,
                is_a: None,
                has_a: None,
                traits: None,
                state: None,
                measurements: None,
                consents: None,
                aux: None,
            },
            traits: None,
            id_from_trait: None,
        }
    }

    /// Trait tree; must be a JSON object.
    pub fn traits(mut self, traits: Value) -> Self {
        self.traits = Some(traits);
        self
    }

    pub fn state(mut self, slot: impl Into<String>, value: impl Into<Value>) -> Self {
        self.draft
            .state
            .get_or_insert_with(Map::new)
            .insert(slot.into(), value.into());
        self
    }

    /// Strict, key-aware or any other explicit policy.
    pub fn identification(mut self, policy: IdentificationPolicy) -> Self {
        self.draft.identification = Some(policy);
        self
    }

    /// Loose values-only identification over `paths`.
    pub fn identified_by<I, S>(self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.identification(IdentificationPolicy::by(paths))
    }

    /// Take the instance id from the trait at `path`: md5 hex when `hashed`,
    /// otherwise lower-cased with spaces turned into `-`.
    pub fn id_from_trait(mut self, path: impl Into<String>, hashed: bool) -> Self {
        self.id_from_trait = Some((path.into(), hashed));
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.draft.label = Some(label.into());
        self
    }

    pub fn part_of(mut self, instance: Instance) -> Self {
        self.draft.part_of = Some(instance);
        self
    }

    pub fn is_a(mut self, instance: Instance) -> Self {
        self.draft.is_a = Some(instance);
        self
    }

    pub fn has_a(mut self, instance: Instance) -> Self {
        self.draft.has_a.get_or_insert_with(Vec::new).push(instance);
        self
    }

    pub fn measurement(mut self, name: impl Into<String>, value: f64) -> Self {
        self.draft
            .measurements
            .get_or_insert_with(Vec::new)
            .push(Measurement {
                id: None,
                name: name.into(),
                value,
            });
        self
    }

    pub fn consent(mut self, allow: bool) -> Self {
        self.draft.consents = Some(CollectConsent { allow });
        self
    }

    pub fn aux(mut self, aux: Map<String, Value>) -> Self {
        self.draft.aux = Some(aux);
        self
    }

    /// Resolve identity and produce the entity.
    ///
    /// Fails with [`AirembrError::Format`] when the traits are not a JSON
    /// object or the derived id is not usable.
    pub fn build(mut self) -> Result<ObservedEntity> {
        if let Some(traits) = self.traits.take() {
            match traits {
                Value::Object(map) => self.draft.traits = Some(map),
                Value::Null => {}
                other => {
                    return Err(AirembrError::Format(format!(
                        "entity traits must be an object, got {other}"
                    )))
                }
            }
        }

        if let Some((path, hashed)) = &self.id_from_trait {
            let value = self
                .draft
                .traits
                .as_ref()
                .and_then(|t| dot_path::get(t, path))
                .map(render_leaf);
            if let Some(value) = value.filter(|v| !v.is_empty()) {
                let id = if *hashed {
                    format!("{:x}", md5::compute(value.as_bytes()))
                } else {
                    value.replace(' ', "-").to_lowercase()
                };
                self.draft.instance = self.draft.instance.with_id(id)?;
            }
        }

        Ok(ObservedEntity::finalize(self.draft))
    }
}
