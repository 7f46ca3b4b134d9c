//! Overlay projections used to make two overlays comparable before diffing,
//! or to prime an environment overlay with source defaults before rendering.

use rustc_hash::FxHashSet;

use crate::merge::fill_gaps;
use crate::{Labels, Overlay};

fn retain_keys(labels: &mut Labels, allowed: impl Fn(&str) -> bool) {
    labels.retain(|k, _| allowed(k.as_str()));
}

fn fill_label_gaps(labels: &mut Labels, from: &Labels) {
    for (k, v) in from {
        labels.entry(k.clone()).or_insert_with(|| v.clone());
    }
}

impl Overlay {
    /// Drop every service and volume label whose key is not in `allowed`.
    pub fn condense_to_keys(&self, allowed: &FxHashSet<&str>) -> Overlay {
        let mut out = self.clone();
        for svc in out.services.iter_mut() {
            retain_keys(&mut svc.labels, |k| allowed.contains(k));
        }
        for vol in out.volumes.values_mut() {
            retain_keys(&mut vol.labels, |k| allowed.contains(k));
        }
        out
    }

    /// Restrict each entity's labels to the key set of the matching entity in
    /// `other`. Entities `other` does not have pass through unchanged.
    pub fn project_onto_keys_of(&self, other: &Overlay) -> Overlay {
        let mut out = self.clone();
        for svc in out.services.iter_mut() {
            if let Some(theirs) = other.service(&svc.name) {
                retain_keys(&mut svc.labels, |k| theirs.labels.contains_key(k));
            }
        }
        for (name, vol) in out.volumes.iter_mut() {
            if let Some(theirs) = other.volumes.get(name) {
                retain_keys(&mut vol.labels, |k| theirs.labels.contains_key(k));
            }
        }
        out
    }

    /// Copy label and extension keys from the matching entity in `other`
    /// wherever this overlay has none. Existing values always win.
    pub fn expand_gaps_from(&self, other: &Overlay) -> Overlay {
        let mut out = self.clone();
        for svc in out.services.iter_mut() {
            if let Some(theirs) = other.service(&svc.name) {
                fill_label_gaps(&mut svc.labels, &theirs.labels);
                fill_gaps(&mut svc.extensions, &theirs.extensions);
            }
        }
        for (name, vol) in out.volumes.iter_mut() {
            if let Some(theirs) = other.volumes.get(name) {
                fill_label_gaps(&mut vol.labels, &theirs.labels);
                fill_gaps(&mut vol.extensions, &theirs.extensions);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ServiceOverride, VolumeOverride};
    use serde_json::json;

    fn overlay(services: Vec<ServiceOverride>, volumes: Vec<VolumeOverride>) -> Overlay {
        let mut o = Overlay::new("3.8");
        o.services = services;
        for v in volumes { o.insert_volume(v); }
        o
    }

    #[test]
    fn condense_drops_unknown_labels() {
        let o = overlay(
            vec![ServiceOverride::new("web").with_label("keep", "1").with_label("drop", "2")],
            vec![VolumeOverride::new("data").with_label("drop", "x")],
        );
        let allowed: FxHashSet<&str> = ["keep"].into_iter().collect();
        let c = o.condense_to_keys(&allowed);
        assert_eq!(c.service("web").unwrap().labels.len(), 1);
        assert!(c.service("web").unwrap().labels.contains_key("keep"));
        assert!(c.volumes["data"].labels.is_empty());
    }

    #[test]
    fn project_onto_keys_matches_other_entities_only() {
        let src = overlay(
            vec![
                ServiceOverride::new("web").with_label("a", "1").with_label("b", "2"),
                ServiceOverride::new("new").with_label("a", "1").with_label("b", "2"),
            ],
            vec![],
        );
        let env = overlay(vec![ServiceOverride::new("web").with_label("b", "custom")], vec![]);
        let p = src.project_onto_keys_of(&env);
        let web = &p.service("web").unwrap().labels;
        assert_eq!(web.keys().collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(web["b"], "2");
        assert_eq!(p.service("new").unwrap().labels.len(), 2);
    }

    #[test]
    fn expand_gaps_copies_missing_keys_only() {
        let mut env_web = ServiceOverride::new("web").with_label("a", "mine");
        env_web.extensions = json!({ "workload": { "replicas": 3 } }).as_object().unwrap().clone();
        let env = overlay(vec![env_web], vec![VolumeOverride::new("data")]);

        let mut src_web = ServiceOverride::new("web").with_label("a", "theirs").with_label("b", "theirs");
        src_web.extensions = json!({ "workload": { "replicas": 1, "type": "Deployment" } }).as_object().unwrap().clone();
        let mut src_vol = VolumeOverride::new("data").with_label("komp.volume.size", "1Gi");
        src_vol.extensions = json!({ "size": "100Mi" }).as_object().unwrap().clone();
        let src = overlay(vec![src_web, ServiceOverride::new("other")], vec![src_vol]);

        let e = env.expand_gaps_from(&src);
        let web = e.service("web").unwrap();
        assert_eq!(web.labels["a"], "mine");
        assert_eq!(web.labels["b"], "theirs");
        assert_eq!(web.extensions["workload"], json!({ "replicas": 3, "type": "Deployment" }));
        assert!(e.service("other").is_none());
        assert_eq!(e.volumes["data"].labels["komp.volume.size"], "1Gi");
        assert_eq!(e.volumes["data"].extensions["size"], json!("100Mi"));
    }
}
