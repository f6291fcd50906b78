//! Deterministic entity identity derived from trait values.
//!
//! An [`IdentificationPolicy`] names the trait paths that identify an entity.
//! [`resolve`] hashes the values found at those paths, namespaced by the
//! instance kind, into an [`IdentificationId`]. Identical `(kind, policy,
//! traits)` inputs always produce the identical hash; the aggregator relies on
//! this to recognise one logical entity across independent submissions.
//!
//! Each value is rendered as canonical JSON before hashing, so the number `30`
//! and the string `"30"` identify different entities.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::dot_path;

/// Which trait paths participate in an entity's derived identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentificationPolicy {
    /// Dotted trait paths, an ordered set.
    #[serde(rename = "properties", deserialize_with = "dedup_paths")]
    paths: Vec<String>,
    /// All paths must be present, otherwise the entity is unresolved.
    #[serde(default = "default_strict")]
    pub strict: bool,
    /// Hash only the values, ignoring which path they came from.
    #[serde(default)]
    pub values_only: bool,
}

fn default_strict() -> bool {
    true
}

fn dedup<I: IntoIterator<Item = String>>(paths: I) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for path in paths {
        if !out.contains(&path) {
            out.push(path);
        }
    }
    out
}

fn dedup_paths<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Vec::<String>::deserialize(deserializer).map(dedup)
}

impl IdentificationPolicy {
    /// Strict, key-aware policy over `paths`.
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: dedup(paths.into_iter().map(Into::into)),
            strict: true,
            values_only: false,
        }
    }

    /// Loose grouping policy: non-strict and values only.
    pub fn by<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            strict: false,
            values_only: true,
            ..Self::new(paths)
        }
    }

    /// Accept partial identification (any subset of the paths).
    pub fn lenient(mut self) -> Self {
        self.strict = false;
        self
    }

    pub fn values_only(mut self, values_only: bool) -> Self {
        self.values_only = values_only;
        self
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    /// Descriptor stored next to a resolved hash: the paths joined by commas.
    pub fn descriptor(&self) -> String {
        self.paths.join(",")
    }
}

/// Result of identity resolution: empty, or a content hash plus the
/// descriptor of the policy that produced it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentificationId {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iid: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<String>,
}

impl IdentificationId {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.iid.is_none()
    }

    pub fn hash(&self) -> Option<&str> {
        self.iid.as_deref()
    }
}

/// Resolve the identity of an entity of `kind` with the given traits.
///
/// Returns an empty id when no policy is declared, the policy has no paths,
/// none of the paths are present, or (strict policies) any path is missing.
pub fn resolve(
    kind: &str,
    policy: Option<&IdentificationPolicy>,
    traits: Option<&Map<String, Value>>,
) -> IdentificationId {
    let Some(policy) = policy else {
        return IdentificationId::empty();
    };
    if policy.paths.is_empty() {
        return IdentificationId::empty();
    }

    let empty = Map::new();
    let flat = dot_path::flatten(traits.unwrap_or(&empty));

    let mut items: Vec<String> = Vec::with_capacity(policy.paths.len());
    for path in &policy.paths {
        let Some((_, value)) = flat.iter().find(|(p, _)| p == path) else {
            continue;
        };
        let rendered = canonical(value);
        if policy.values_only {
            items.push(rendered);
        } else {
            items.push(format!("{path}={rendered}"));
        }
    }

    if items.is_empty() {
        return IdentificationId::empty();
    }
    if policy.strict && items.len() != policy.paths.len() {
        return IdentificationId::empty();
    }

    items.sort();
    let hash_base = format!("{kind}:[{}]", items.join(","));

    IdentificationId {
        iid: Some(format!("{:x}", md5::compute(hash_base.as_bytes()))),
        descriptor: Some(policy.descriptor()),
    }
}

fn canonical(value: &Value) -> String {
    // Map key order is insertion order; sort nested maps so logically equal
    // values render identically.
    fn sorted(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                Value::Object(
                    keys.into_iter()
                        .map(|k| (k.clone(), sorted(&map[k])))
                        .collect(),
                )
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    sorted(value).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn traits(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn no_policy_is_unresolved() {
        let t = traits(json!({"email": "a@b.com"}));
        assert!(resolve("person", None, Some(&t)).is_empty());
    }

    #[test]
    fn policy_without_paths_is_unresolved() {
        let t = traits(json!({"email": "a@b.com"}));
        let policy = IdentificationPolicy::new(Vec::<String>::new());
        assert!(resolve("person", Some(&policy), Some(&t)).is_empty());
    }

    #[test]
    fn strict_requires_every_path() {
        let policy = IdentificationPolicy::new(["email"]);
        assert!(resolve("person", Some(&policy), Some(&Map::new())).is_empty());
        assert!(resolve("person", Some(&policy), None).is_empty());

        let t = traits(json!({"email": "a@b.com"}));
        let id = resolve("person", Some(&policy), Some(&t));
        assert!(!id.is_empty());
        assert_eq!(id.descriptor.as_deref(), Some("email"));

        let two = IdentificationPolicy::new(["email", "phone"]);
        assert!(resolve("person", Some(&two), Some(&t)).is_empty());
    }

    #[test]
    fn lenient_accepts_partial_match() {
        let policy = IdentificationPolicy::new(["email", "phone"]).lenient();
        let t = traits(json!({"email": "a@b.com"}));
        let id = resolve("person", Some(&policy), Some(&t));
        assert!(!id.is_empty());
        assert_eq!(id.descriptor.as_deref(), Some("email,phone"));

        assert!(resolve("person", Some(&policy), Some(&Map::new())).is_empty());
    }

    #[test]
    fn nested_paths_are_looked_up_flattened() {
        let policy = IdentificationPolicy::new(["contact.email"]);
        let t = traits(json!({"contact": {"email": "a@b.com"}}));
        assert!(!resolve("person", Some(&policy), Some(&t)).is_empty());
    }

    #[test]
    fn kind_namespaces_the_hash() {
        let policy = IdentificationPolicy::new(["email"]);
        let t = traits(json!({"email": "a@b.com"}));
        assert_ne!(
            resolve("person", Some(&policy), Some(&t)),
            resolve("company", Some(&policy), Some(&t))
        );
    }

    #[test]
    fn values_only_ignores_labels() {
        let by_email = IdentificationPolicy::by(["email"]);
        let by_login = IdentificationPolicy::by(["login"]);
        let a = resolve("person", Some(&by_email), Some(&traits(json!({"email": "x"}))));
        let b = resolve("person", Some(&by_login), Some(&traits(json!({"login": "x"}))));
        assert_eq!(a.iid, b.iid);

        let keyed_email = IdentificationPolicy::new(["email"]);
        let keyed_login = IdentificationPolicy::new(["login"]);
        let c = resolve("person", Some(&keyed_email), Some(&traits(json!({"email": "x"}))));
        let d = resolve("person", Some(&keyed_login), Some(&traits(json!({"login": "x"}))));
        assert_ne!(c.iid, d.iid);
    }

    #[test]
    fn number_and_string_hash_differently() {
        let policy = IdentificationPolicy::new(["age"]);
        let number = resolve("person", Some(&policy), Some(&traits(json!({"age": 30}))));
        let text = resolve("person", Some(&policy), Some(&traits(json!({"age": "30"}))));
        assert!(!number.is_empty() && !text.is_empty());
        assert_ne!(number.iid, text.iid);
    }

    #[test]
    fn duplicate_paths_collapse() {
        let policy = IdentificationPolicy::new(["email", "email"]);
        assert_eq!(policy.paths(), ["email".to_string()]);
        let t = traits(json!({"email": "a@b.com"}));
        assert!(!resolve("person", Some(&policy), Some(&t)).is_empty());
    }

    #[test]
    fn policy_deserializes_with_defaults() {
        let policy: IdentificationPolicy =
            serde_json::from_value(json!({"properties": ["email", "email", "phone"]})).unwrap();
        assert!(policy.strict);
        assert!(!policy.values_only);
        assert_eq!(policy.paths().len(), 2);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Property: resolution is a pure function of its inputs.
        #[test]
        fn prop_resolution_is_deterministic(
            email in "[a-z]{1,8}@[a-z]{1,8}\\.com",
            age in 0u32..120,
        ) {
            let policy = IdentificationPolicy::new(["email", "age"]);
            let t = traits(json!({"email": email, "age": age}));
            let first = resolve("person", Some(&policy), Some(&t));
            let second = resolve("person", Some(&policy), Some(&t.clone()));
            prop_assert!(!first.is_empty());
            prop_assert_eq!(first, second);
        }

        /// Property: trait key order does not change the identity.
        #[test]
        fn prop_trait_order_is_irrelevant(
            email in "[a-z]{1,8}",
            phone in "[0-9]{3,9}",
            city in "[A-Z][a-z]{2,8}",
        ) {
            let policy = IdentificationPolicy::new(["email", "phone", "address.city"]);
            let forward = traits(json!({"email": email, "phone": phone, "address": {"city": city}}));

            let mut reversed = Map::new();
            let mut address = Map::new();
            address.insert("city".into(), json!(city));
            reversed.insert("address".into(), Value::Object(address));
            reversed.insert("phone".into(), json!(phone));
            reversed.insert("email".into(), json!(email));

            prop_assert_eq!(
                resolve("person", Some(&policy), Some(&forward)),
                resolve("person", Some(&policy), Some(&reversed))
            );
        }

        /// Property: policy path order does not change the identity either.
        #[test]
        fn prop_policy_path_order_is_irrelevant(email in "[a-z]{1,8}", phone in "[0-9]{3,9}") {
            let t = traits(json!({"email": email, "phone": phone}));
            let ab = IdentificationPolicy::new(["email", "phone"]);
            let ba = IdentificationPolicy::new(["phone", "email"]);
            prop_assert_eq!(
                resolve("person", Some(&ab), Some(&t)).iid,
                resolve("person", Some(&ba), Some(&t)).iid
            );
        }
    }
}
