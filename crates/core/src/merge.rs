//! Deep merge over JSON-like extension trees.
//!
//! Objects merge recursively; arrays and scalars are replaced; a `null` on the
//! overriding side means "not specified" and keeps the base value.

use serde_json::Value as Json;

use crate::Extensions;

/// Merge `over` onto `base`; `over` wins on key collision.
pub fn deep_merge(base: Json, over: Json) -> Json {
    match (base, over) {
        (Json::Object(mut base_map), Json::Object(over_map)) => {
            for (key, over_value) in over_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => deep_merge(base_value, over_value),
                    None => over_value,
                };
                base_map.insert(key, merged);
            }
            Json::Object(base_map)
        }
        (base, Json::Null) => base,
        (_, over) => over,
    }
}

/// [`deep_merge`] for extension maps.
pub fn merge_extensions(base: &Extensions, over: &Extensions) -> Extensions {
    match deep_merge(Json::Object(base.clone()), Json::Object(over.clone())) {
        Json::Object(map) => map,
        _ => Extensions::new(),
    }
}

/// Copy keys from `defaults` that `target` lacks, recursing into nested
/// objects present on both sides. Existing values are never overwritten.
pub fn fill_gaps(target: &mut Extensions, defaults: &Extensions) {
    for (key, default) in defaults {
        match target.get_mut(key) {
            None => { target.insert(key.clone(), default.clone()); }
            Some(Json::Object(inner)) => {
                if let Json::Object(default_inner) = default { fill_gaps(inner, default_inner); }
            }
            Some(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Json) -> Extensions { v.as_object().unwrap().clone() }

    #[test]
    fn deep_merge_prefers_override_and_keeps_base_on_null() {
        let base = json!({ "workload": { "replicas": 1, "type": "Deployment" }, "ports": [1, 2] });
        let over = json!({ "workload": { "replicas": 3, "type": null }, "ports": [9] });
        let merged = deep_merge(base, over);
        assert_eq!(merged, json!({ "workload": { "replicas": 3, "type": "Deployment" }, "ports": [9] }));
    }

    #[test]
    fn fill_gaps_never_overwrites() {
        let mut target = obj(json!({ "workload": { "replicas": 3 }, "service": "custom" }));
        let defaults = obj(json!({ "workload": { "replicas": 1, "type": "Deployment" }, "service": { "type": "None" } }));
        fill_gaps(&mut target, &defaults);
        assert_eq!(Json::Object(target), json!({ "workload": { "replicas": 3, "type": "Deployment" }, "service": "custom" }));
    }
}
