use std::path::{Path, PathBuf};

use komp_api::{init_workspace, InProcApi, KompApi, KompError};
use komp_persist::{load_overlay, save_overlay};

fn temp_dir() -> PathBuf {
    let nanos = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos();
    let dir = std::env::temp_dir().join(format!("komp-ws-{}", nanos));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
    let p = dir.join(name);
    std::fs::write(&p, body).unwrap();
    p
}

const DB_ONLY: &str = r#"
version: "3.8"
services:
  db:
    image: postgres
    environment:
      FOO: default
    volumes: ["data:/var/lib/postgresql/data"]
volumes:
  data: {}
"#;

const DB_AND_WEB: &str = r#"
version: "3.8"
services:
  db:
    image: postgres
    environment:
      FOO: default
    volumes: ["data:/var/lib/postgresql/data"]
  web:
    image: nginx
    ports: ["8080:80"]
volumes:
  data: {}
"#;

fn workspace(body: &str, envs: &[&str]) -> (PathBuf, PathBuf) {
    let dir = temp_dir();
    let compose = write(&dir, "docker-compose.yaml", body);
    let manifest = dir.join("komp.yaml");
    let envs: Vec<String> = envs.iter().map(|e| e.to_string()).collect();
    init_workspace(&manifest, &[compose.clone()], &envs, false).unwrap();
    (manifest, compose)
}

#[test]
fn fresh_environments_are_already_in_sync() {
    let (manifest, _) = workspace(DB_ONLY, &["dev", "prod"]);
    let api = InProcApi::open(&manifest).unwrap();
    let outcomes = api.plan(&[]).unwrap();
    assert_eq!(outcomes.len(), 2);
    for o in outcomes {
        assert!(!o.failed());
        assert!(o.applied.is_empty(), "{}: {:?}", o.env, o.applied);
        assert_eq!(o.report.len(), 7);
    }
}

#[test]
fn extract_save_load_reconcile_round_trip() {
    let (manifest, _) = workspace(DB_ONLY, &["dev"]);
    let api = InProcApi::open(&manifest).unwrap();
    let source = api.extract().unwrap();
    let path = manifest.parent().unwrap().join("raw.yaml");
    save_overlay(&path, &source).unwrap();
    let loaded = load_overlay(&path).unwrap();
    let r = komp_apply::reconcile(&source, loaded).unwrap();
    assert!(r.changeset.is_empty(), "{:?}", r.applied);
}

#[test]
fn init_refuses_to_clobber_without_force() {
    let (manifest, compose) = workspace(DB_ONLY, &["dev"]);
    let err = init_workspace(&manifest, &[compose.clone()], &["dev".to_string()], false).unwrap_err();
    assert!(matches!(err, KompError::Conflict(_)), "{:?}", err);
    init_workspace(&manifest, &[compose], &["dev".to_string()], true).unwrap();
}

#[test]
fn plan_does_not_save_but_reconcile_does() {
    let (manifest, compose) = workspace(DB_ONLY, &["dev"]);
    std::fs::write(&compose, DB_AND_WEB).unwrap();
    let api = InProcApi::open(&manifest).unwrap();

    let planned = api.plan(&["dev".to_string()]).unwrap();
    assert!(planned[0].applied.iter().any(|m| m.contains("web") && m.contains("added")), "{:?}", planned[0].applied);
    assert!(!planned[0].saved);

    let done = api.reconcile(&[]).unwrap();
    assert!(done[0].saved);
    let again = api.reconcile(&[]).unwrap();
    assert!(again[0].applied.is_empty());
    assert!(!again[0].saved);

    let rendered = api.render("dev").unwrap();
    let web = rendered.service("web").unwrap();
    assert_eq!(web.extension().unwrap()["workload"]["type"], serde_json::json!("Deployment"));
    assert_eq!(rendered.service("db").unwrap().environment.get("FOO"), Some(&Some("default".to_string())));
}

#[test]
fn one_broken_environment_does_not_block_others() {
    let (manifest, _) = workspace(DB_ONLY, &["dev", "prod"]);
    let dir = manifest.parent().unwrap();
    let prod = dir.join("docker-compose.komp.prod.yaml");
    let text = std::fs::read_to_string(&prod).unwrap().replace("type: StatefulSet", "type: Pod");
    std::fs::write(&prod, &text).unwrap();

    let api = InProcApi::open(&manifest).unwrap();
    let outcomes = api.reconcile(&[]).unwrap();
    let dev = outcomes.iter().find(|o| o.env == "dev").unwrap();
    let prod_outcome = outcomes.iter().find(|o| o.env == "prod").unwrap();
    assert!(!dev.failed());
    assert!(prod_outcome.failed());
    assert!(prod_outcome.error.as_deref().unwrap().contains("db"));
    assert_eq!(std::fs::read_to_string(&prod).unwrap(), text);
}

#[test]
fn unknown_environment_is_not_found() {
    let (manifest, _) = workspace(DB_ONLY, &["dev"]);
    let api = InProcApi::open(&manifest).unwrap();
    assert!(matches!(api.render("staging"), Err(KompError::NotFound(_))));
    assert!(matches!(api.plan(&["staging".to_string()]), Err(KompError::NotFound(_))));
}
