//! Field-by-field merge of two versions of the same entity.
//!
//! [`merge_entities`] is pure: it reads both inputs and returns a new entity.
//! Folding a chronologically sorted list pairwise, oldest first, gives the
//! newest-wins-at-the-leaf view of an entity that the aggregator exposes.

use serde_json::{Map, Value};

use crate::dot_path;
use crate::entity::{CollectConsent, ObservedEntity};

/// Merge `new` over `old`.
///
/// - `instance`: taken from `new`.
/// - `identification`, `label`, `part_of`, `is_a`: `new` when set, else `old`.
/// - `has_a`: union, old first, no duplicates.
/// - `traits`, `aux`: leaf-level deep merge, `new` wins on collision.
/// - `state`: slot by slot; two maps are deep merged, otherwise `new` wins.
/// - `measurements`: concatenated, old first.
/// - `consents`: any deny wins, then any allow, else none.
///
/// The result keeps `old`'s reference token. Its resolved identity is `new`'s
/// when `new` has one, else `old`'s.
pub fn merge_entities(old: &ObservedEntity, new: &ObservedEntity) -> ObservedEntity {
    let mut merged = new.clone();

    merged.identification = new.identification.clone().or_else(|| old.identification.clone());
    merged.label = new.label.clone().or_else(|| old.label.clone());
    merged.part_of = new.part_of.clone().or_else(|| old.part_of.clone());
    merged.is_a = new.is_a.clone().or_else(|| old.is_a.clone());

    let mut has_a = old.has_a.clone();
    for instance in &new.has_a {
        if !has_a.contains(instance) {
            has_a.push(instance.clone());
        }
    }
    merged.has_a = has_a;

    merged.traits = dot_path::deep_merge(&old.traits, &new.traits);
    merged.state = merge_state(&old.state, &new.state);

    merged.measurements = old
        .measurements
        .iter()
        .chain(new.measurements.iter())
        .cloned()
        .collect();

    merged.consents = merge_consents(old.consents, new.consents);
    merged.aux = merge_aux(old.aux.as_ref(), new.aux.as_ref());

    if !new.has_iid() {
        merged.set_iid(old.iid().clone());
    }
    merged.set_reference(old.reference().clone());
    merged
}

fn merge_state(old: &Map<String, Value>, new: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = old.clone();
    for (slot, value) in new {
        let combined = match (old.get(slot), value) {
            (Some(Value::Object(before)), Value::Object(after)) => {
                Value::Object(dot_path::deep_merge(before, after))
            }
            (Some(before), after) => {
                if before.is_object() != after.is_object() {
                    tracing::debug!(slot = %slot, "state slot changed shape, keeping newer value");
                }
                after.clone()
            }
            (None, after) => after.clone(),
        };
        merged.insert(slot.clone(), combined);
    }
    merged
}

/// Deny dominates allow; no consent on either side stays undetermined.
pub fn merge_consents(
    old: Option<CollectConsent>,
    new: Option<CollectConsent>,
) -> Option<CollectConsent> {
    match (old, new) {
        (None, None) => None,
        (old, new) => {
            let denied = [old, new].into_iter().flatten().any(|c| !c.allow);
            Some(CollectConsent { allow: !denied })
        }
    }
}

pub(crate) fn merge_aux(
    old: Option<&Map<String, Value>>,
    new: Option<&Map<String, Value>>,
) -> Option<Map<String, Value>> {
    match (old, new) {
        (Some(old), Some(new)) => Some(dot_path::deep_merge(old, new)),
        (Some(only), None) | (None, Some(only)) => Some(only.clone()),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Instance;
    use proptest::prelude::*;
    use serde_json::json;

    fn entity(traits: Value) -> ObservedEntity {
        ObservedEntity::builder(Instance::typed("person", "p-1").unwrap())
            .traits(traits)
            .build()
            .unwrap()
    }

    #[test]
    fn traits_merge_at_leaf_level() {
        let old = entity(json!({"a": {"x": 1}, "b": 2}));
        let new = entity(json!({"a": {"y": 2}}));
        let merged = merge_entities(&old, &new);
        assert_eq!(Value::Object(merged.traits), json!({"a": {"x": 1, "y": 2}, "b": 2}));
    }

    #[test]
    fn inputs_are_untouched() {
        let old = entity(json!({"age": 30}));
        let new = entity(json!({"age": 31}));
        let (old_copy, new_copy) = (old.clone(), new.clone());
        let _ = merge_entities(&old, &new);
        assert_eq!(old, old_copy);
        assert_eq!(new, new_copy);
    }

    #[test]
    fn optional_links_fall_back_to_old() {
        let old = ObservedEntity::builder(Instance::typed("product", "1").unwrap())
            .part_of(Instance::typed("catalog", "c").unwrap())
            .is_a(Instance::of("lamp").unwrap())
            .label("old")
            .build()
            .unwrap();
        let new = ObservedEntity::builder(Instance::typed("product", "1").unwrap())
            .is_a(Instance::of("desk-lamp").unwrap())
            .build()
            .unwrap();
        let merged = merge_entities(&old, &new);
        assert_eq!(merged.part_of, old.part_of);
        assert_eq!(merged.is_a, new.is_a);
        assert_eq!(merged.label.as_deref(), Some("old"));
    }

    #[test]
    fn has_a_is_union_and_measurements_concatenate() {
        let wheel = Instance::of("wheel").unwrap();
        let seat = Instance::of("seat").unwrap();
        let old = ObservedEntity::builder(Instance::typed("bike", "1").unwrap())
            .has_a(wheel.clone())
            .measurement("weight", 9.5)
            .build()
            .unwrap();
        let new = ObservedEntity::builder(Instance::typed("bike", "1").unwrap())
            .has_a(seat.clone())
            .has_a(wheel.clone())
            .measurement("weight", 9.5)
            .build()
            .unwrap();
        let merged = merge_entities(&old, &new);
        assert_eq!(merged.has_a, vec![wheel, seat]);
        assert_eq!(merged.measurements.len(), 2);
    }

    #[test]
    fn state_slots_deep_merge_or_override() {
        let old = ObservedEntity::builder(Instance::typed("person", "1").unwrap())
            .state("cart", json!({"items": 1, "currency": "EUR"}))
            .state("mood", "calm")
            .state("status", json!({"online": true}))
            .build()
            .unwrap();
        let new = ObservedEntity::builder(Instance::typed("person", "1").unwrap())
            .state("cart", json!({"items": 2}))
            .state("mood", json!({"level": 3}))
            .state("status", "away")
            .build()
            .unwrap();
        let merged = merge_entities(&old, &new);
        assert_eq!(
            Value::Object(merged.state),
            json!({
                "cart": {"items": 2, "currency": "EUR"},
                "mood": {"level": 3},
                "status": "away"
            })
        );
    }

    #[test]
    fn consents_deny_dominates() {
        let allow = Some(CollectConsent { allow: true });
        let deny = Some(CollectConsent { allow: false });
        assert_eq!(merge_consents(None, None), None);
        assert_eq!(merge_consents(allow, None), allow);
        assert_eq!(merge_consents(None, deny), deny);
        assert_eq!(merge_consents(allow, deny), deny);
        assert_eq!(merge_consents(deny, allow), deny);
    }

    #[test]
    fn aux_is_deep_merged() {
        let old = ObservedEntity::builder(Instance::typed("person", "1").unwrap())
            .aux(json!({"crm": {"id": 1}}).as_object().cloned().unwrap())
            .build()
            .unwrap();
        let new = ObservedEntity::builder(Instance::typed("person", "1").unwrap())
            .aux(json!({"crm": {"tier": "gold"}}).as_object().cloned().unwrap())
            .build()
            .unwrap();
        let merged = merge_entities(&old, &new);
        assert_eq!(
            merged.aux.map(Value::Object),
            Some(json!({"crm": {"id": 1, "tier": "gold"}}))
        );
    }

    #[test]
    fn keeps_old_reference_and_best_identity() {
        let old = ObservedEntity::builder(Instance::typed("person", "1").unwrap())
            .traits(json!({"email": "a@b.com"}))
            .identified_by(["email"])
            .build()
            .unwrap();
        let new = entity(json!({"age": 31}));
        let merged = merge_entities(&old, &new);
        assert_eq!(merged.reference(), old.reference());
        assert_eq!(merged.iid(), old.iid());
        assert_eq!(merged.identification, old.identification);
    }

    #[test]
    fn pairwise_fold_is_associative_for_compatible_shapes() {
        let a = ObservedEntity::builder(Instance::typed("person", "1").unwrap())
            .traits(json!({"name": "Ada", "address": {"city": "Oslo"}}))
            .state("cart", json!({"items": 1}))
            .consent(true)
            .build()
            .unwrap();
        let b = ObservedEntity::builder(Instance::typed("person", "1").unwrap())
            .traits(json!({"address": {"zip": "0150"}, "age": 30}))
            .state("cart", json!({"currency": "EUR"}))
            .measurement("visits", 1.0)
            .build()
            .unwrap();
        let c = ObservedEntity::builder(Instance::typed("person", "1").unwrap())
            .traits(json!({"age": 31, "address": {"city": "Bergen"}}))
            .state("cart", json!({"items": 3}))
            .consent(false)
            .build()
            .unwrap();

        let left = merge_entities(&merge_entities(&a, &b), &c);
        let right = merge_entities(&a, &merge_entities(&b, &c));
        assert_eq!(left, right);
        assert_eq!(
            Value::Object(left.traits.clone()),
            json!({"name": "Ada", "address": {"city": "Bergen", "zip": "0150"}, "age": 31})
        );
        assert_eq!(left.consents, Some(CollectConsent { allow: false }));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Property: one deny anywhere in a fold sequence denies the result.
        #[test]
        fn prop_single_deny_dominates_fold(
            before in 0usize..6,
            after in 0usize..6,
            undecided in proptest::collection::vec(any::<bool>(), 0..4),
        ) {
            let mut sequence: Vec<Option<CollectConsent>> = Vec::new();
            sequence.extend(std::iter::repeat(Some(CollectConsent { allow: true })).take(before));
            sequence.push(Some(CollectConsent { allow: false }));
            sequence.extend(std::iter::repeat(Some(CollectConsent { allow: true })).take(after));
            for flag in undecided {
                if flag {
                    sequence.push(None);
                }
            }

            let folded = sequence.into_iter().fold(None, merge_consents);
            prop_assert_eq!(folded, Some(CollectConsent { allow: false }));
        }
    }
}
