//! Reconciliation of one environment overlay against the source overlay.
//!
//! The passes run in a fixed order. Each one detects changes against the
//! target as patched by the passes before it, applies them immediately and
//! reports what it did. Only extension normalization can fail; a failure
//! aborts the whole run and leaves the caller's overlay untouched.

use std::time::Instant;

use komp_core::{Changeset, Overlay, ServiceChange, VersionChange, VolumeChange};
use komp_schema::{normalize_service, SchemaError};
use metrics::{counter, histogram};
use serde::Serialize;
use serde_json::Value as Json;
use tracing::{debug, info, warn};

use crate::diff_summary;

/// Pass names, in execution order.
pub const PASSES: [&str; 7] = [
    "version",
    "service-create",
    "service-extensions",
    "service-delete",
    "service-env-delete",
    "volume-create",
    "volume-delete",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub pass: &'static str,
    /// Never empty; a pass without changes says so.
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Reconciled {
    pub overlay: Overlay,
    pub changeset: Changeset,
    /// One line per applied change, in application order.
    pub applied: Vec<String>,
    pub report: Vec<PassReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    #[error("service `{service}` has an invalid x-komp extension: {message}")]
    InvalidExtension { service: String, message: String },
}

impl ReconcileError {
    fn invalid(service: &str, err: SchemaError) -> Self {
        ReconcileError::InvalidExtension { service: service.to_string(), message: err.to_string() }
    }
}

/// Bring `target` in line with `source` without clobbering its customizations.
pub fn reconcile(source: &Overlay, target: Overlay) -> Result<Reconciled, ReconcileError> {
    let t0 = Instant::now();
    counter!("reconcile_runs_total", 1u64);
    match run_passes(source, target) {
        Ok(done) => {
            histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
            counter!("reconcile_changes_total", done.changeset.len() as u64);
            info!(changes = done.changeset.len(), "reconciled overlay");
            Ok(done)
        }
        Err(e) => {
            counter!("reconcile_err_total", 1u64);
            warn!(error = %e, "reconciliation aborted");
            Err(e)
        }
    }
}

struct Run {
    target: Overlay,
    changeset: Changeset,
    report: Vec<PassReport>,
}

impl Run {
    /// Apply `cs` to the target and record the pass, using `idle` when nothing changed.
    fn commit(&mut self, pass: &'static str, cs: Changeset, detail: Vec<String>, idle: &str) {
        let messages = if cs.is_empty() {
            vec![idle.to_string()]
        } else if detail.is_empty() {
            cs.describe()
        } else {
            detail
        };
        debug!(pass, changes = cs.len(), "pass complete");
        self.target = cs.apply(std::mem::take(&mut self.target));
        self.changeset.extend(cs);
        self.report.push(PassReport { pass, messages });
    }
}

fn run_passes(source: &Overlay, target: Overlay) -> Result<Reconciled, ReconcileError> {
    let source = source.project_onto_keys_of(&target);
    let mut run = Run { target, changeset: Changeset::default(), report: Vec::with_capacity(PASSES.len()) };

    let cs = detect_version(&source, &run.target);
    run.commit(PASSES[0], cs, vec![], "No version update detected");

    let cs = detect_service_creates(&source, &run.target);
    run.commit(PASSES[1], cs, vec![], "No new services detected");

    let (cs, detail) = detect_extension_updates(&source, &run.target)?;
    run.commit(PASSES[2], cs, detail, "No service extension updates detected");

    let cs = detect_service_deletes(&source, &run.target);
    run.commit(PASSES[3], cs, vec![], "No removed services detected");

    let cs = detect_env_deletes(&source, &run.target);
    run.commit(PASSES[4], cs, vec![], "No removed environment variables detected");

    let cs = detect_volume_creates(&source, &run.target);
    run.commit(PASSES[5], cs, vec![], "No new volumes detected");

    let cs = detect_volume_deletes(&source, &run.target);
    run.commit(PASSES[6], cs, vec![], "No removed volumes detected");

    let applied = run.changeset.describe();
    Ok(Reconciled { overlay: run.target, changeset: run.changeset, applied, report: run.report })
}

fn detect_version(source: &Overlay, target: &Overlay) -> Changeset {
    let mut cs = Changeset::default();
    if source.version != target.version {
        cs.version = Some(VersionChange { from: target.version.clone(), to: source.version.clone() });
    }
    cs
}

fn detect_service_creates(source: &Overlay, target: &Overlay) -> Changeset {
    let mut cs = Changeset::default();
    let mut index = target.services.len();
    for svc in source.services.iter().filter(|s| target.service(&s.name).is_none()) {
        cs.push_service(ServiceChange::create(index, svc.without_environment()));
        index += 1;
    }
    cs
}

fn detect_extension_updates(source: &Overlay, target: &Overlay) -> Result<(Changeset, Vec<String>), ReconcileError> {
    let mut cs = Changeset::default();
    let mut detail = Vec::new();
    for theirs in &target.services {
        let Some(ours) = source.service(&theirs.name) else { continue };
        let canonical = normalize_service(&ours.extensions, &theirs.extensions)
            .map_err(|e| ReconcileError::invalid(&theirs.name, e))?;
        if canonical == theirs.extensions { continue; }
        let delta = diff_summary(&Json::Object(canonical.clone()), &Json::Object(theirs.extensions.clone()));
        let change = ServiceChange::UpdateExtensions { name: theirs.name.clone(), extensions: canonical };
        detail.push(format!("{} ({})", change, delta));
        cs.push_service(change);
    }
    Ok((cs, detail))
}

fn detect_service_deletes(source: &Overlay, target: &Overlay) -> Changeset {
    let mut cs = Changeset::default();
    for (index, svc) in target.services.iter().enumerate() {
        if source.service(&svc.name).is_none() {
            cs.push_service(ServiceChange::Delete { index, name: svc.name.clone() });
        }
    }
    cs
}

/// Variables are only ever removed here: values in an environment overlay
/// belong to the user once the environment exists.
fn detect_env_deletes(source: &Overlay, target: &Overlay) -> Changeset {
    let mut cs = Changeset::default();
    for theirs in &target.services {
        let Some(ours) = source.service(&theirs.name) else { continue };
        for var in theirs.environment.keys().filter(|k| !ours.environment.contains_key(*k)) {
            cs.push_service(ServiceChange::DeleteEnv { name: theirs.name.clone(), var: var.clone() });
        }
    }
    cs
}

fn detect_volume_creates(source: &Overlay, target: &Overlay) -> Changeset {
    let mut cs = Changeset::default();
    for (name, vol) in source.volumes.iter().filter(|(n, _)| !target.volumes.contains_key(*n)) {
        cs.push_volume(VolumeChange::Create { name: name.clone(), volume: vol.clone() });
    }
    cs
}

fn detect_volume_deletes(source: &Overlay, target: &Overlay) -> Changeset {
    let mut cs = Changeset::default();
    for name in target.volumes.keys().filter(|n| !source.volumes.contains_key(*n)) {
        cs.push_volume(VolumeChange::Delete { name: name.clone() });
    }
    cs
}
