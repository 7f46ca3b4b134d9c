//! Merge a reconciled environment overlay into a live compose project.

use komp_core::merge::merge_extensions;
use komp_core::{ComposeProject, Environment, Extensions, Labels, Overlay};
use metrics::counter;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    #[error("service `{0}` from the overlay is not defined in the compose project")]
    ServiceNotFound(String),
    #[error("volume `{0}` from the overlay is not defined in the compose project")]
    VolumeNotFound(String),
}

/// Lay `overlay` over `project`. Overlay values win on collision.
///
/// A missing service or volume means the overlay is stale relative to its
/// sources; the merge fails as a whole.
pub fn merge_into(overlay: &Overlay, mut project: ComposeProject) -> Result<ComposeProject, MergeError> {
    let result = merge_entities(overlay, &mut project);
    match result {
        Ok(()) => {
            debug!(services = overlay.services.len(), volumes = overlay.volumes.len(), "merged overlay into project");
            Ok(project)
        }
        Err(e) => {
            counter!("merge_err_total", 1u64);
            warn!(error = %e, "merge into project failed");
            Err(e)
        }
    }
}

fn merge_entities(overlay: &Overlay, project: &mut ComposeProject) -> Result<(), MergeError> {
    for ovr in &overlay.services {
        let live = project.service_mut(&ovr.name).ok_or_else(|| MergeError::ServiceNotFound(ovr.name.clone()))?;
        merge_labels(&mut live.labels, &ovr.labels, false);
        if !ovr.extensions.is_empty() {
            let merged = merge_extensions(&live.extension().cloned().unwrap_or_default(), &ovr.extensions);
            *live.extension_mut() = merged;
        }
        merge_environment(&mut live.environment, &ovr.environment);
    }
    for (name, ovr) in &overlay.volumes {
        let live = project.volumes.get_mut(name).ok_or_else(|| MergeError::VolumeNotFound(name.clone()))?;
        merge_labels(&mut live.labels, &ovr.labels, true);
        if !ovr.extensions.is_empty() {
            let merged: Extensions = merge_extensions(&live.extension().cloned().unwrap_or_default(), &ovr.extensions);
            *live.extension_mut() = merged;
        }
    }
    Ok(())
}

/// Services skip blank override values; volumes let a blank value clear a label.
fn merge_labels(live: &mut Labels, over: &Labels, keep_blank: bool) {
    for (k, v) in over {
        if v.is_empty() && !keep_blank { continue; }
        live.insert(k.clone(), v.clone());
    }
}

/// Unset variables interpolate to an empty string, so a declared-but-unset
/// variable becomes blank instead of disappearing.
fn merge_environment(live: &mut Environment, over: &Environment) {
    for v in live.values_mut() {
        if v.is_none() { *v = Some(String::new()); }
    }
    for (k, v) in over {
        match v {
            Some(value) => { live.insert(k.clone(), Some(value.clone())); }
            None => { live.entry(k.clone()).or_insert_with(|| Some(String::new())); }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use komp_core::{ServiceConfig, ServiceOverride, VolumeConfig, VolumeOverride};
    use serde_json::json;

    fn project() -> ComposeProject {
        let mut web = ServiceConfig::new("web");
        web.labels.insert("a".into(), "0".into());
        web.labels.insert("b".into(), "2".into());
        web.environment.insert("UNSET".into(), None);
        web.environment.insert("FOO".into(), Some("live".into()));
        *web.extension_mut() = json!({ "workload": { "replicas": 1, "type": "Deployment" } }).as_object().unwrap().clone();
        let mut data = VolumeConfig::new("data");
        data.labels.insert("komp.volume.size".into(), "1Gi".into());
        let mut p = ComposeProject::default();
        p.services.push(web);
        p.volumes.insert("data".into(), data);
        p
    }

    #[test]
    fn service_labels_override_wins_and_blank_is_skipped() {
        let mut o = Overlay::new("3.8");
        o.services.push(ServiceOverride::new("web").with_label("a", "1").with_label("b", ""));
        let merged = merge_into(&o, project()).unwrap();
        let labels = &merged.service("web").unwrap().labels;
        assert_eq!(labels["a"], "1");
        assert_eq!(labels["b"], "2");
    }

    #[test]
    fn volume_blank_label_clears_value() {
        let mut o = Overlay::new("3.8");
        o.insert_volume(VolumeOverride::new("data").with_label("komp.volume.size", ""));
        let merged = merge_into(&o, project()).unwrap();
        assert_eq!(merged.volumes["data"].labels["komp.volume.size"], "");
    }

    #[test]
    fn environment_blanks_unset_and_override_wins() {
        let mut o = Overlay::new("3.8");
        o.services.push(ServiceOverride::new("web").with_env("FOO", Some("custom")).with_env("NEW", None));
        let merged = merge_into(&o, project()).unwrap();
        let env = &merged.service("web").unwrap().environment;
        assert_eq!(env["UNSET"], Some(String::new()));
        assert_eq!(env["FOO"], Some("custom".to_string()));
        assert_eq!(env["NEW"], Some(String::new()));
    }

    #[test]
    fn extensions_deep_merge_with_override_precedence() {
        let mut o = Overlay::new("3.8");
        let over = json!({ "workload": { "replicas": 3 }, "service": { "type": "NodePort" } });
        o.services.push(ServiceOverride::new("web").with_extensions(over.as_object().unwrap().clone()));
        let merged = merge_into(&o, project()).unwrap();
        let ext = merged.service("web").unwrap().extension().unwrap();
        assert_eq!(ext["workload"], json!({ "replicas": 3, "type": "Deployment" }));
        assert_eq!(ext["service"]["type"], json!("NodePort"));
    }

    #[test]
    fn missing_entities_are_fatal() {
        let mut o = Overlay::new("3.8");
        o.services.push(ServiceOverride::new("ghost"));
        assert_eq!(merge_into(&o, project()).unwrap_err(), MergeError::ServiceNotFound("ghost".into()));

        let mut o = Overlay::new("3.8");
        o.insert_volume(VolumeOverride::new("nowhere"));
        assert_eq!(merge_into(&o, project()).unwrap_err(), MergeError::VolumeNotFound("nowhere".into()));
    }
}
