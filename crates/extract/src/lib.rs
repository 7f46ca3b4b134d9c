//! komp extract: derive the source overlay from a compose project.
//!
//! Every service and volume gets a complete `x-komp` extension populated with
//! defaults, so that diffs against an environment overlay only show values
//! that actually diverge. Recognized labels are carried over and feed a few
//! extension fields; the entity's own `x-komp` block is applied last.

#![forbid(unsafe_code)]

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use komp_core::labels::{self, known_keys};
use komp_core::merge::merge_extensions;
use komp_core::{
    ComposeProject, Extensions, HealthCheckConfig, Labels, Overlay, ServiceConfig, ServiceOverride, VolumeConfig,
    VolumeOverride, DEFAULT_VERSION,
};
use komp_schema::defaults::*;
use komp_schema::{
    canonical_service, canonical_volume, Expose, Probe, RestartPolicy, SchemaError, ServiceExtension, ServiceSpec,
    ServiceType, VolumeExtension, Workload, WorkloadType,
};
use rustc_hash::FxHashSet;
use tracing::{debug, warn};

pub mod units;

use units::{format_memory, millicores, normalize_duration};

const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

/// Build the source overlay for `project`. Pure; never fails.
pub fn extract(project: &ComposeProject) -> Overlay {
    let allowed = known_keys();
    let mut overlay = Overlay::new(project.version.clone().unwrap_or_else(|| DEFAULT_VERSION.to_string()));
    for svc in &project.services {
        overlay.upsert_service(extract_service(svc, &allowed));
    }
    for vol in project.volumes.values() {
        overlay.insert_volume(extract_volume(vol, &allowed));
    }
    debug!(services = overlay.services.len(), volumes = overlay.volumes.len(), "extracted source overlay");
    overlay
}

fn condensed(labels: &Labels, allowed: &FxHashSet<&str>) -> Labels {
    labels.iter().filter(|(k, _)| allowed.contains(k.as_str())).map(|(k, v)| (k.clone(), v.clone())).collect()
}

fn extract_service(svc: &ServiceConfig, allowed: &FxHashSet<&str>) -> ServiceOverride {
    let derived = ServiceExtension { workload: workload_of(svc), service: service_spec_of(svc) };
    let extensions = finish(&svc.name, derived.to_extensions(), svc.extension(), canonical_service);
    ServiceOverride {
        name: svc.name.clone(),
        labels: condensed(&svc.labels, allowed),
        environment: svc.environment.clone(),
        extensions,
    }
}

fn extract_volume(vol: &VolumeConfig, allowed: &FxHashSet<&str>) -> VolumeOverride {
    let mut derived = VolumeExtension::default();
    if let Some(size) = non_empty(vol.labels.get(labels::VOLUME_SIZE)) { derived.size = Quantity(size); }
    if let Some(class) = non_empty(vol.labels.get(labels::VOLUME_STORAGE_CLASS)) { derived.storage_class = class; }
    derived.selector = non_empty(vol.labels.get(labels::VOLUME_SELECTOR));
    let extensions = finish(&vol.name, derived.to_extensions(), vol.extension(), canonical_volume);
    VolumeOverride { name: vol.name.clone(), labels: condensed(&vol.labels, allowed), extensions }
}

/// Lay the compose-declared extension over the derived one and canonicalize.
/// An invalid declared extension is kept as merged; reconciliation reports it.
fn finish(
    name: &str,
    derived: Result<Extensions, SchemaError>,
    declared: Option<&Extensions>,
    canonical: fn(&Extensions) -> Result<Extensions, SchemaError>,
) -> Extensions {
    let derived = derived.unwrap_or_else(|e| {
        warn!(entity = %name, error = %e, "encoding derived extension failed");
        Extensions::new()
    });
    let merged = match declared {
        Some(own) => merge_extensions(&derived, own),
        None => return derived,
    };
    match canonical(&merged) {
        Ok(c) => c,
        Err(e) => {
            warn!(entity = %name, error = %e, "declared x-komp extension is invalid; keeping it as written");
            merged
        }
    }
}

fn non_empty(v: Option<&String>) -> Option<String> {
    v.filter(|s| !s.trim().is_empty()).cloned()
}

fn workload_of(svc: &ServiceConfig) -> Workload {
    let mut w = Workload::default();
    w.kind = if svc.is_global() {
        WorkloadType::DaemonSet
    } else if !svc.volumes.is_empty() {
        WorkloadType::StatefulSet
    } else {
        WorkloadType::Deployment
    };

    let deploy = svc.deploy.as_ref();
    w.replicas = deploy.and_then(|d| d.replicas).unwrap_or(DEFAULT_REPLICAS);
    w.restart_policy = restart_policy_of(svc);
    w.rolling_update_max_surge = deploy
        .and_then(|d| d.update_config.as_ref())
        .and_then(|u| u.parallelism)
        .map(|p| IntOrString::Int(p.min(i32::MAX as u64) as i32));

    if let Some(res) = deploy.and_then(|d| d.resources.as_ref()) {
        if let Some(req) = res.reservations.as_ref() {
            if let Some(cpus) = req.cpus { w.resource.cpu = Some(Quantity(millicores(cpus))); }
            if let Some(mem) = req.memory { w.resource.memory = Some(Quantity(format_memory(mem))); }
        }
        if let Some(lim) = res.limits.as_ref() {
            if let Some(cpus) = lim.cpus { w.resource.max_cpu = Some(Quantity(millicores(cpus))); }
            if let Some(mem) = lim.memory { w.resource.max_memory = Some(Quantity(format_memory(mem))); }
        }
    }

    if let Some(account) = non_empty(svc.labels.get(labels::WORKLOAD_SERVICE_ACCOUNT)) { w.service_account_name = account; }
    w.image_pull.secret = non_empty(svc.labels.get(labels::WORKLOAD_IMAGE_PULL_SECRET));
    w.liveness_probe = liveness_probe_of(&svc.name, svc.healthcheck.as_ref());
    w.readiness_probe = Probe::none();
    w
}

fn restart_policy_of(svc: &ServiceConfig) -> RestartPolicy {
    let condition = svc.deploy.as_ref().and_then(|d| d.restart_policy.as_ref()).and_then(|r| r.condition.as_deref());
    match condition {
        Some("any") => return RestartPolicy::Always,
        Some("on-failure") => return RestartPolicy::OnFailure,
        Some("none") => return RestartPolicy::Never,
        _ => {}
    }
    match svc.restart.as_deref() {
        Some("no") => RestartPolicy::Never,
        Some("on-failure") => RestartPolicy::OnFailure,
        _ => RestartPolicy::Always,
    }
}

fn default_command(service: &str) -> Vec<String> {
    let mut cmd: Vec<String> = DEFAULT_PROBE_COMMAND.iter().map(|s| s.to_string()).collect();
    if let Some(last) = cmd.last_mut() {
        last.push(' ');
        last.push_str(service);
    }
    cmd
}

fn duration_or(value: Option<&str>, default: &str, service: &str, field: &str) -> String {
    match value {
        None => default.to_string(),
        Some(raw) => normalize_duration(raw).unwrap_or_else(|| {
            debug!(service = %service, field, value = %raw, "unparseable healthcheck duration; using default");
            default.to_string()
        }),
    }
}

fn liveness_probe_of(service: &str, hc: Option<&HealthCheckConfig>) -> Probe {
    let Some(hc) = hc else {
        let mut p = Probe::default_liveness();
        if let Some(exec) = p.exec.as_mut() { exec.command = default_command(service); }
        return p;
    };
    if hc.disable || hc.test.first().map(String::as_str) == Some("NONE") {
        return Probe::none();
    }
    let mut command: Vec<String> = match hc.test.first().map(String::as_str) {
        Some("CMD") | Some("CMD-SHELL") => hc.test[1..].to_vec(),
        _ => hc.test.clone(),
    };
    if command.is_empty() { command = default_command(service); }
    let retries = hc.retries.map(|r| r.clamp(1, u32::MAX as u64) as u32).unwrap_or(DEFAULT_PROBE_RETRIES);
    Probe::exec(
        command,
        &duration_or(hc.start_period.as_deref(), DEFAULT_PROBE_INITIAL_DELAY, service, "start_period"),
        &duration_or(hc.interval.as_deref(), DEFAULT_PROBE_INTERVAL, service, "interval"),
        &duration_or(hc.timeout.as_deref(), DEFAULT_PROBE_TIMEOUT, service, "timeout"),
        retries,
    )
}

fn service_spec_of(svc: &ServiceConfig) -> ServiceSpec {
    let mut spec = ServiceSpec::default();
    if let Some(port) = svc.ports.first() {
        spec.kind = match (port.published.as_deref(), port.mode.as_deref()) {
            (Some(_), Some("host")) => ServiceType::NodePort,
            (Some(_), Some("ingress")) | (Some(_), None) => ServiceType::LoadBalancer,
            _ => ServiceType::ClusterIp,
        };
        if spec.kind == ServiceType::NodePort {
            spec.node_port = port.published.as_deref().and_then(|p| p.parse().ok());
        }
    }
    if let Some(domain) = non_empty(svc.labels.get(labels::SERVICE_EXPOSE)).filter(|d| d != "false") {
        let mut expose = Expose { domain, ..Default::default() };
        expose.tls_secret = non_empty(svc.labels.get(labels::SERVICE_EXPOSE_TLS_SECRET));
        if let Some(class) = non_empty(svc.labels.get(labels::SERVICE_EXPOSE_INGRESS_CLASS)) {
            expose.ingress_annotations.insert(INGRESS_CLASS_ANNOTATION.to_string(), class);
        }
        spec.expose = Some(expose);
    }
    spec
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const COMPOSE: &str = r#"
version: "3.7"
services:
  web:
    image: nginx
    labels:
      komp.service.expose: "web.example.com"
      com.example.unrelated: "x"
    ports: ["8080:80"]
    environment:
      FOO: bar
    deploy:
      replicas: 2
      update_config:
        parallelism: 2
      resources:
        reservations: { cpus: "0.25", memory: 10M }
        limits: { cpus: 1, memory: 1468006 }
    healthcheck:
      test: ["CMD", "curl", "-f", "http://localhost"]
      interval: 90s
      retries: 5
  agent:
    image: agent
    deploy: { mode: global, restart_policy: { condition: on-failure } }
    ports:
      - target: 9100
        published: 9100
        mode: host
  db:
    image: postgres
    restart: "no"
    volumes: ["data:/var/lib/postgresql/data"]
    ports: ["5432"]
    healthcheck:
      disable: true
    x-komp:
      workload:
        replicas: 3
volumes:
  data:
    labels:
      komp.volume.size: 5Gi
"#;

    fn extracted() -> Overlay {
        extract(&ComposeProject::from_yaml(COMPOSE).unwrap())
    }

    #[test]
    fn workload_types_follow_mode_and_volumes() {
        let o = extracted();
        assert_eq!(o.version, "3.7");
        assert_eq!(o.service("web").unwrap().extensions["workload"]["type"], json!("Deployment"));
        assert_eq!(o.service("agent").unwrap().extensions["workload"]["type"], json!("DaemonSet"));
        assert_eq!(o.service("db").unwrap().extensions["workload"]["type"], json!("StatefulSet"));
    }

    #[test]
    fn service_type_from_first_port() {
        let o = extracted();
        assert_eq!(o.service("web").unwrap().extensions["service"], json!({ "type": "LoadBalancer", "expose": { "domain": "web.example.com" } }));
        assert_eq!(o.service("agent").unwrap().extensions["service"], json!({ "type": "NodePort", "nodePort": 9100 }));
        assert_eq!(o.service("db").unwrap().extensions["service"], json!({ "type": "ClusterIP" }));
    }

    #[test]
    fn resources_surge_and_replicas() {
        let o = extracted();
        let w = &o.service("web").unwrap().extensions["workload"];
        assert_eq!(w["replicas"], json!(2));
        assert_eq!(w["rollingUpdateMaxSurge"], json!(2));
        assert_eq!(w["resource"]["cpu"], json!("250m"));
        assert_eq!(w["resource"]["memory"], json!("10Mi"));
        assert_eq!(w["resource"]["maxCpu"], json!("1000m"));
        assert_eq!(w["resource"]["maxMemory"], json!("1.4Mi"));
        assert_eq!(w["restartPolicy"], json!("Always"));
    }

    #[test]
    fn healthcheck_mapping_and_defaults() {
        let o = extracted();
        let web = &o.service("web").unwrap().extensions["workload"]["livenessProbe"];
        assert_eq!(web["exec"]["command"], json!(["curl", "-f", "http://localhost"]));
        assert_eq!(web["period"], json!("1m30s"));
        assert_eq!(web["failureThreshold"], json!(5));
        assert_eq!(web["timeout"], json!("10s"));

        let agent = &o.service("agent").unwrap().extensions["workload"];
        assert_eq!(agent["livenessProbe"]["exec"]["command"], json!(["echo", "Define healthcheck command for service agent"]));
        assert_eq!(agent["livenessProbe"]["initialDelay"], json!("1m0s"));
        assert_eq!(agent["restartPolicy"], json!("OnFailure"));
        assert_eq!(agent["readinessProbe"], json!({ "type": "none" }));

        let db = &o.service("db").unwrap().extensions["workload"];
        assert_eq!(db["livenessProbe"], json!({ "type": "none" }));
        assert_eq!(db["restartPolicy"], json!("Never"));
    }

    #[test]
    fn declared_extension_wins_and_labels_are_condensed() {
        let o = extracted();
        let db = o.service("db").unwrap();
        assert_eq!(db.extensions["workload"]["replicas"], json!(3));
        assert_eq!(db.extensions["workload"]["serviceAccountName"], json!("default"));
        let web = o.service("web").unwrap();
        assert_eq!(web.labels.keys().collect::<Vec<_>>(), vec!["komp.service.expose"]);
        assert_eq!(web.environment.get("FOO"), Some(&Some("bar".to_string())));
    }

    #[test]
    fn volumes_get_defaults_and_label_values() {
        let o = extracted();
        let data = &o.volumes["data"];
        assert_eq!(serde_json::Value::Object(data.extensions.clone()), json!({ "size": "5Gi", "storageClass": "standard" }));
        assert_eq!(data.labels["komp.volume.size"], "5Gi");
    }

    #[test]
    fn extraction_is_canonical() {
        for svc in extracted().services {
            assert_eq!(canonical_service(&svc.extensions).unwrap(), svc.extensions, "service {}", svc.name);
        }
    }
}
