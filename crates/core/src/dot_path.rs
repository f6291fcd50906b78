//! Dotted-path access over JSON trees.
//!
//! Traits, state and aux maps are arbitrary nested `serde_json` maps. Merging
//! works on their flattened form: every leaf is addressed by a dotted path
//! (`address.city`), lists and scalars are leaves, and an empty map is kept as
//! a leaf so it survives a flatten/unflatten round trip.
//!
//! Keys that themselves contain a `.` cannot be told apart from nesting once
//! flattened; they are re-nested on the way back.

use serde_json::{Map, Value};

/// Flatten `map` into `(dotted path, leaf)` pairs, in insertion order.
pub fn flatten(map: &Map<String, Value>) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    flatten_into(map, None, &mut out);
    out
}

fn flatten_into(map: &Map<String, Value>, prefix: Option<&str>, out: &mut Vec<(String, Value)>) {
    for (key, value) in map {
        let path = match prefix {
            Some(p) => format!("{p}.{key}"),
            None => key.clone(),
        };
        match value {
            Value::Object(inner) if !inner.is_empty() => flatten_into(inner, Some(&path), out),
            leaf => out.push((path, leaf.clone())),
        }
    }
}

/// Re-nest flattened pairs. A later pair wins over an earlier one, including
/// when the shape changes between a leaf and a subtree.
pub fn unflatten<I>(pairs: I) -> Map<String, Value>
where
    I: IntoIterator<Item = (String, Value)>,
{
    let mut root = Map::new();
    for (path, value) in pairs {
        set(&mut root, &path, value);
    }
    root
}

/// Look up the value stored at `path`.
pub fn get<'a>(map: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = map.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Store `value` at `path`, creating intermediate maps. A non-map value in the
/// way is replaced by a map.
pub fn set(map: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            map.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let slot = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                tracing::debug!(path = head, "replacing leaf with subtree during merge");
                *slot = Value::Object(Map::new());
            }
            if let Value::Object(inner) = slot {
                set(inner, rest, value);
            }
        }
    }
}

/// Leaf-level deep merge: entries of `new` override entries of `old` on path
/// collision, paths only present in `old` are kept.
///
/// `{"a":{"x":1}}` merged with `{"a":{"y":2}}` is `{"a":{"x":1,"y":2}}`.
pub fn deep_merge(old: &Map<String, Value>, new: &Map<String, Value>) -> Map<String, Value> {
    let mut leaves = flatten(old);
    for (path, value) in flatten(new) {
        match leaves.iter_mut().find(|(p, _)| *p == path) {
            Some(existing) => existing.1 = value,
            None => leaves.push((path, value)),
        }
    }
    unflatten(leaves)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn flatten_produces_dotted_leaves() {
        let flat = flatten(&obj(json!({"a": {"x": 1, "y": {"z": [1, 2]}}, "b": "s", "e": {}})));
        let paths: Vec<&str> = flat.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec!["a.x", "a.y.z", "b", "e"]);
        assert_eq!(flat[1].1, json!([1, 2]));
        assert_eq!(flat[3].1, json!({}));
    }

    #[test]
    fn unflatten_restores_tree() {
        let tree = obj(json!({"a": {"x": 1, "y": {"z": true}}, "b": null}));
        assert_eq!(unflatten(flatten(&tree)), tree);
    }

    #[test]
    fn get_and_set_paths() {
        let mut map = obj(json!({"address": {"city": "Oslo"}}));
        assert_eq!(get(&map, "address.city"), Some(&json!("Oslo")));
        assert_eq!(get(&map, "address.zip"), None);
        assert_eq!(get(&map, "address.city.more"), None);

        set(&mut map, "address.zip", json!("0150"));
        set(&mut map, "name.first", json!("Ada"));
        assert_eq!(
            Value::Object(map),
            json!({"address": {"city": "Oslo", "zip": "0150"}, "name": {"first": "Ada"}})
        );
    }

    #[test]
    fn deep_merge_is_leaf_level() {
        let merged = deep_merge(&obj(json!({"a": {"x": 1}, "b": 2})), &obj(json!({"a": {"y": 2}})));
        assert_eq!(Value::Object(merged), json!({"a": {"x": 1, "y": 2}, "b": 2}));
    }

    #[test]
    fn deep_merge_new_overrides_on_collision() {
        let merged = deep_merge(&obj(json!({"a": {"x": 1}})), &obj(json!({"a": {"x": 5}})));
        assert_eq!(Value::Object(merged), json!({"a": {"x": 5}}));
    }

    #[test]
    fn deep_merge_shape_change_prefers_newer() {
        let to_scalar = deep_merge(&obj(json!({"a": {"x": 1}})), &obj(json!({"a": 5})));
        assert_eq!(Value::Object(to_scalar), json!({"a": 5}));

        let to_map = deep_merge(&obj(json!({"a": 5})), &obj(json!({"a": {"x": 1}})));
        assert_eq!(Value::Object(to_map), json!({"a": {"x": 1}}));
    }
}
