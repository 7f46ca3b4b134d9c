//! komp public API façade (in-process).
//!
//! Frontends (the CLI today) talk to a workspace through [`KompApi`]. A
//! workspace is a `komp.yaml` manifest naming the compose sources and one
//! overlay file per deployment environment.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use komp_apply::{merge_into, reconcile, PassReport};
use komp_core::labels::known_keys;
use komp_core::{ComposeProject, Overlay};
use komp_persist::{load_compose, write_atomic, FileStore, Store};
use komp_schema::{canonical_service, canonical_volume};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const DEFAULT_MANIFEST: &str = "komp.yaml";

/// Manifest path from `KOMP_MANIFEST`, else `komp.yaml` in the working directory.
pub fn default_manifest_path() -> PathBuf {
    std::env::var_os("KOMP_MANIFEST").map(PathBuf::from).unwrap_or_else(|| PathBuf::from(DEFAULT_MANIFEST))
}

/// Overlay file name used for a freshly minted environment.
pub fn default_overlay_file(env: &str) -> String {
    format!("docker-compose.komp.{}.yaml", env)
}

/// API errors, with enough context to print without a backtrace.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum KompError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type KompResult<T> = Result<T, KompError>;

impl From<anyhow::Error> for KompError {
    fn from(e: anyhow::Error) -> Self { KompError::Internal(format!("{:#}", e)) }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Compose files, merged in order.
    #[serde(default)]
    pub compose: Vec<PathBuf>,
    /// Environment name to overlay file.
    #[serde(default)]
    pub environments: BTreeMap<String, PathBuf>,
}

impl Manifest {
    pub fn load(path: &Path) -> KompResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| KompError::NotFound(format!("manifest {}: {}", path.display(), e)))?;
        serde_yaml::from_str(&text).map_err(|e| KompError::Validation(format!("manifest {}: {}", path.display(), e)))
    }

    pub fn save(&self, path: &Path) -> KompResult<()> {
        let yaml = serde_yaml::to_string(self).map_err(|e| KompError::Internal(format!("serializing manifest: {}", e)))?;
        write_atomic(path, yaml.as_bytes())?;
        Ok(())
    }
}

/// Per-environment result of a plan or reconcile run.
#[derive(Debug, Clone, Serialize)]
pub struct EnvOutcome {
    pub env: String,
    pub path: PathBuf,
    pub saved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub applied: Vec<String>,
    pub report: Vec<PassReport>,
}

impl EnvOutcome {
    pub fn failed(&self) -> bool { self.error.is_some() }

    fn failure(env: &str, path: &Path, error: String) -> Self {
        Self { env: env.to_string(), path: path.to_path_buf(), saved: false, error: Some(error), applied: vec![], report: vec![] }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MintedEnv {
    pub env: String,
    pub path: PathBuf,
}

/// Workspace operations.
pub trait KompApi {
    /// The source overlay derived from the current compose files.
    fn extract(&self) -> KompResult<Overlay>;

    /// Reconcile the selected environments (all when empty) in memory only.
    fn plan(&self, envs: &[String]) -> KompResult<Vec<EnvOutcome>>;

    /// Reconcile and persist the selected environments (all when empty).
    /// A failing environment is reported and left on disk as it was.
    fn reconcile(&self, envs: &[String]) -> KompResult<Vec<EnvOutcome>>;

    /// The compose project with `env`'s overlay merged in.
    fn render(&self, env: &str) -> KompResult<ComposeProject>;
}

/// Condensed copy of `source` used as a new environment's starting point:
/// known labels only, no environment variables, canonical extensions.
pub fn mint_environment(source: &Overlay) -> KompResult<Overlay> {
    let mut env = source.condense_to_keys(&known_keys()).without_environment();
    for svc in env.services.iter_mut() {
        svc.extensions = canonical_service(&svc.extensions)
            .map_err(|e| KompError::Validation(format!("service `{}`: {}", svc.name, e)))?;
    }
    for vol in env.volumes.values_mut() {
        vol.extensions = canonical_volume(&vol.extensions)
            .map_err(|e| KompError::Validation(format!("volume `{}`: {}", vol.name, e)))?;
    }
    Ok(env)
}

/// Write a manifest and one overlay per environment. Existing overlay files
/// are only replaced when `force` is set.
pub fn init_workspace(manifest_path: &Path, compose: &[PathBuf], envs: &[String], force: bool) -> KompResult<Vec<MintedEnv>> {
    if compose.is_empty() { return Err(KompError::Validation("at least one compose file is required".into())); }
    if envs.is_empty() { return Err(KompError::Validation("at least one environment is required".into())); }
    let base = base_dir(manifest_path);
    let cwd = std::env::current_dir().map_err(|e| KompError::Internal(format!("current dir: {}", e)))?;
    let abs_base = cwd.join(&base);

    let mut manifest = if manifest_path.exists() { Manifest::load(manifest_path)? } else { Manifest::default() };
    manifest.compose = compose.iter().map(|p| relative_to(&cwd.join(p), &abs_base)).collect();
    for env in envs {
        manifest.environments.entry(env.clone()).or_insert_with(|| PathBuf::from(default_overlay_file(env)));
    }

    let ws = InProcApi { base: base.clone(), manifest: manifest.clone() };
    let env_overlay = mint_environment(&ws.extract()?)?;
    let stores = envs.iter().map(|env| ws.store(env)).collect::<KompResult<Vec<_>>>()?;
    if let Some(taken) = stores.iter().find(|s| s.exists()).filter(|_| !force) {
        return Err(KompError::Conflict(format!("{} already exists; pass --force to overwrite", taken.path().display())));
    }
    let mut minted = Vec::with_capacity(envs.len());
    for (env, store) in envs.iter().zip(stores) {
        store.save(&env_overlay)?;
        info!(env = %env, path = %store.path().display(), "minted environment");
        minted.push(MintedEnv { env: env.clone(), path: store.path().to_path_buf() });
    }
    manifest.save(manifest_path)?;
    Ok(minted)
}

fn base_dir(manifest_path: &Path) -> PathBuf {
    match manifest_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn relative_to(path: &Path, base: &Path) -> PathBuf {
    path.strip_prefix(base).map(Path::to_path_buf).unwrap_or_else(|_| path.to_path_buf())
}

/// In-process implementation over the local filesystem.
#[derive(Debug, Clone)]
pub struct InProcApi {
    base: PathBuf,
    manifest: Manifest,
}

impl InProcApi {
    pub fn open(manifest_path: &Path) -> KompResult<Self> {
        Ok(Self { base: base_dir(manifest_path), manifest: Manifest::load(manifest_path)? })
    }

    pub fn manifest(&self) -> &Manifest { &self.manifest }

    fn resolve(&self, p: &Path) -> PathBuf {
        if p.is_absolute() { p.to_path_buf() } else { self.base.join(p) }
    }

    fn store(&self, env: &str) -> KompResult<FileStore> {
        let rel = self
            .manifest
            .environments
            .get(env)
            .ok_or_else(|| KompError::NotFound(format!("environment `{}` is not in the manifest", env)))?;
        Ok(FileStore::new(self.resolve(rel)))
    }

    fn project(&self) -> KompResult<ComposeProject> {
        let paths: Vec<PathBuf> = self.manifest.compose.iter().map(|p| self.resolve(p)).collect();
        Ok(load_compose(&paths)?)
    }

    fn selected(&self, envs: &[String]) -> KompResult<Vec<String>> {
        if envs.is_empty() { return Ok(self.manifest.environments.keys().cloned().collect()); }
        for env in envs {
            if !self.manifest.environments.contains_key(env) {
                return Err(KompError::NotFound(format!("environment `{}` is not in the manifest", env)));
            }
        }
        Ok(envs.to_vec())
    }

    fn run(&self, envs: &[String], persist: bool) -> KompResult<Vec<EnvOutcome>> {
        let t0 = Instant::now();
        let source = self.extract()?;
        let mut outcomes = Vec::new();
        for env in self.selected(envs)? {
            let store = self.store(&env)?;
            outcomes.push(reconcile_one(&env, &store, &source, persist));
        }
        let failed = outcomes.iter().filter(|o| o.failed()).count();
        info!(envs = outcomes.len(), failed, persist, took_ms = %t0.elapsed().as_millis(), "api: reconcile done");
        Ok(outcomes)
    }
}

/// Environments are independent: errors become part of the outcome.
fn reconcile_one(env: &str, store: &FileStore, source: &Overlay, persist: bool) -> EnvOutcome {
    let target = match store.load() {
        Ok(o) => o,
        Err(e) => {
            warn!(env = %env, error = %format!("{:#}", e), "loading environment failed");
            return EnvOutcome::failure(env, store.path(), format!("{:#}", e));
        }
    };
    let done = match reconcile(source, target) {
        Ok(done) => done,
        Err(e) => {
            warn!(env = %env, error = %e, "environment not reconciled");
            return EnvOutcome::failure(env, store.path(), e.to_string());
        }
    };
    let mut saved = false;
    if persist && !done.changeset.is_empty() {
        if let Err(e) = store.save(&done.overlay) {
            warn!(env = %env, error = %format!("{:#}", e), "saving environment failed");
            return EnvOutcome::failure(env, store.path(), format!("{:#}", e));
        }
        saved = true;
    }
    info!(env = %env, changes = done.applied.len(), saved, "environment reconciled");
    EnvOutcome { env: env.to_string(), path: store.path().to_path_buf(), saved, error: None, applied: done.applied, report: done.report }
}

impl KompApi for InProcApi {
    fn extract(&self) -> KompResult<Overlay> {
        Ok(komp_extract::extract(&self.project()?))
    }

    fn plan(&self, envs: &[String]) -> KompResult<Vec<EnvOutcome>> { self.run(envs, false) }

    fn reconcile(&self, envs: &[String]) -> KompResult<Vec<EnvOutcome>> { self.run(envs, true) }

    fn render(&self, env: &str) -> KompResult<ComposeProject> {
        let store = self.store(env)?;
        let project = self.project()?;
        let source = komp_extract::extract(&project);
        let overlay = store.load()?.expand_gaps_from(&source);
        merge_into(&overlay, project).map_err(|e| KompError::NotFound(format!("environment `{}`: {}", env, e)))
    }
}
