//! Minimal compose loader: multiple files deep-merged in order.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use komp_core::merge::deep_merge;
use komp_core::{environment_as_map, labels_as_map, ComposeProject};
use serde_json::Value as Json;
use tracing::debug;

use crate::read_bounded;

fn read_tree(path: &Path) -> Result<Json> {
    let text = read_bounded(path)?;
    if text.trim().is_empty() { return Ok(Json::Object(Default::default())); }
    let yaml: serde_yaml::Value = serde_yaml::from_str(&text).with_context(|| format!("parsing compose file {}", path.display()))?;
    let mut tree = serde_json::to_value(yaml).with_context(|| format!("converting compose file {}", path.display()))?;
    normalize_lists(&mut tree).with_context(|| format!("normalizing compose file {}", path.display()))?;
    Ok(tree)
}

/// Put `environment` and `labels` in map form so files merge them key by key.
fn normalize_lists(tree: &mut Json) -> Result<()> {
    for (section, keys) in [("services", &["environment", "labels"][..]), ("volumes", &["labels"][..])] {
        let Some(entities) = tree.get_mut(section).and_then(Json::as_object_mut) else { continue };
        for entity in entities.values_mut().filter_map(Json::as_object_mut) {
            for key in keys {
                let Some(value) = entity.remove(*key) else { continue };
                let value = match *key {
                    "environment" => environment_as_map(value)?,
                    _ => labels_as_map(value)?,
                };
                entity.insert(key.to_string(), value);
            }
        }
    }
    Ok(())
}

/// Load and merge `paths`; later files win, arrays other than
/// `environment`/`labels` are replaced whole.
/// Services come out ordered by name.
pub fn load_compose(paths: &[PathBuf]) -> Result<ComposeProject> {
    if paths.is_empty() { return Err(anyhow!("no compose files given")); }
    let mut merged = Json::Object(Default::default());
    for path in paths {
        merged = deep_merge(merged, read_tree(path)?);
    }
    let project: ComposeProject = serde_json::from_value(merged).with_context(|| {
        let names: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
        format!("decoding compose project from {}", names.join(", "))
    })?;
    debug!(files = paths.len(), services = project.services.len(), volumes = project.volumes.len(), "loaded compose project");
    Ok(project)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(dir: &Path, name: &str, body: &str) -> PathBuf {
        std::fs::create_dir_all(dir).unwrap();
        let p = dir.join(name);
        std::fs::write(&p, body).unwrap();
        p
    }

    fn temp_dir() -> PathBuf {
        let nanos = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos();
        std::env::temp_dir().join(format!("komp-compose-{}", nanos))
    }

    #[test]
    fn later_files_override_earlier_ones() {
        let dir = temp_dir();
        let base = write_temp(&dir, "docker-compose.yaml", r#"
version: "3.7"
services:
  web:
    image: nginx
    ports: ["8080:80", "443"]
    environment: [FOO=1, BAR]
    deploy:
      resources:
        limits: { memory: 512m, cpus: "0.5" }
volumes:
  data: {}
"#);
        let over = write_temp(&dir, "docker-compose.override.yaml", r#"
services:
  web:
    ports: ["9090:80"]
    environment: { FOO: "2" }
  db:
    image: postgres
    volumes: ["data:/var/lib/postgresql/data"]
"#);
        let p = load_compose(&[base, over]).unwrap();
        assert_eq!(p.version.as_deref(), Some("3.7"));
        assert_eq!(p.services.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(), vec!["db", "web"]);
        let web = p.service("web").unwrap();
        assert_eq!(web.ports.len(), 1);
        assert_eq!(web.ports[0].published.as_deref(), Some("9090"));
        assert_eq!(web.environment.get("FOO"), Some(&Some("2".to_string())));
        let limits = web.deploy.as_ref().unwrap().resources.as_ref().unwrap().limits.as_ref().unwrap();
        assert_eq!(limits.memory, Some(512 * 1024 * 1024));
        assert_eq!(limits.cpus, Some(0.5));
        assert!(p.volumes.contains_key("data"));
    }

    #[test]
    fn list_and_map_forms_merge_key_by_key() {
        let dir = temp_dir();
        let base = write_temp(&dir, "a.yaml", r#"
services:
  web:
    image: nginx
    environment: [FOO=1, BAR=2]
    labels: [komp.service.expose=web.local]
volumes:
  data:
    labels: [tier=storage]
"#);
        let over = write_temp(&dir, "b.yaml", r#"
services:
  web:
    environment: [FOO=3]
    labels: { com.example.team: a }
volumes:
  data:
    labels: [backup=daily]
"#);
        let p = load_compose(&[base, over]).unwrap();
        let web = p.service("web").unwrap();
        assert_eq!(web.environment.get("FOO"), Some(&Some("3".to_string())));
        assert_eq!(web.environment.get("BAR"), Some(&Some("2".to_string())));
        assert_eq!(web.labels["komp.service.expose"], "web.local");
        assert_eq!(web.labels["com.example.team"], "a");
        assert_eq!(p.volumes["data"].labels["tier"], "storage");
        assert_eq!(p.volumes["data"].labels["backup"], "daily");
    }

    #[test]
    fn no_files_is_an_error() {
        assert!(load_compose(&[]).is_err());
    }
}
