//! komp schema: the typed `x-komp` extension model, its defaults, and
//! normalization with validation.
//!
//! Extension maps travel through overlays as loosely typed JSON objects. Every
//! write path goes through [`normalize_service`] / [`canonical_service`] (and
//! their volume counterparts), which validate the map against a JSON Schema and
//! round-trip it through the typed model. The result is a canonical map: equal
//! inputs produce equal outputs, so deep equality is a reliable change test.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use komp_core::merge::merge_extensions;
use komp_core::Extensions;
use serde::{Deserialize, Serialize};

pub mod defaults;
mod validate;

pub use validate::{validate_service, validate_volume};

use defaults::*;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    /// `path` is dotted (`workload.type`), empty for the extension root.
    #[error("{}: {message}", if path.is_empty() { "(root)" } else { path.as_str() })]
    Invalid { path: String, message: String },
    #[error("decoding extension: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadType {
    #[default]
    Deployment,
    StatefulSet,
    DaemonSet,
    Job,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestartPolicy {
    #[default]
    Always,
    OnFailure,
    Never,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PullPolicy {
    #[default]
    IfNotPresent,
    Always,
    Never,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeType {
    Exec,
    Http,
    Tcp,
    #[default]
    None,
}

/// Kubernetes Service flavour; `None` renders no Service object at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceType {
    #[default]
    None,
    Headless,
    #[serde(rename = "ClusterIP")]
    ClusterIp,
    NodePort,
    LoadBalancer,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecProbe {
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpProbe {
    pub port: u32,
    #[serde(default = "root_path")]
    pub path: String,
}

fn root_path() -> String { "/".to_string() }

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TcpProbe {
    pub port: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Probe {
    #[serde(rename = "type")]
    pub kind: ProbeType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecProbe>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpProbe>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpProbe>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_delay: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<u32>,
}

impl Probe {
    pub fn none() -> Self { Probe::default() }

    /// Exec probe with all timing fields set.
    pub fn exec(command: Vec<String>, initial_delay: &str, period: &str, timeout: &str, failure_threshold: u32) -> Self {
        Probe {
            kind: ProbeType::Exec,
            exec: Some(ExecProbe { command }),
            initial_delay: Some(initial_delay.to_string()),
            period: Some(period.to_string()),
            timeout: Some(timeout.to_string()),
            failure_threshold: Some(failure_threshold),
            success_threshold: Some(DEFAULT_PROBE_SUCCESS_THRESHOLD),
            ..Default::default()
        }
    }

    /// Liveness probe used when compose declares no healthcheck.
    pub fn default_liveness() -> Self {
        let mut p = Probe::exec(
            DEFAULT_PROBE_COMMAND.iter().map(|s| s.to_string()).collect(),
            DEFAULT_PROBE_INITIAL_DELAY,
            DEFAULT_PROBE_INTERVAL,
            DEFAULT_PROBE_TIMEOUT,
            DEFAULT_PROBE_RETRIES,
        );
        if DEFAULT_PROBE_DISABLE { p.kind = ProbeType::None; }
        p
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagePull {
    pub policy: PullPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Resource {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<Quantity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cpu: Option<Quantity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<Quantity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_memory: Option<Quantity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<Quantity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_storage: Option<Quantity>,
}

impl Default for Resource {
    fn default() -> Self {
        Self {
            cpu: Some(Quantity(DEFAULT_CPU_REQUEST.to_string())),
            max_cpu: Some(Quantity(DEFAULT_CPU_LIMIT.to_string())),
            memory: Some(Quantity(DEFAULT_MEMORY_REQUEST.to_string())),
            max_memory: Some(Quantity(DEFAULT_MEMORY_LIMIT.to_string())),
            storage: None,
            max_storage: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Autoscale {
    pub max_replicas: u32,
    pub cpu_threshold: u32,
    pub mem_threshold: u32,
}

impl Default for Autoscale {
    fn default() -> Self {
        Self {
            max_replicas: DEFAULT_AUTOSCALE_MAX_REPLICAS,
            cpu_threshold: DEFAULT_AUTOSCALE_CPU_THRESHOLD,
            mem_threshold: DEFAULT_AUTOSCALE_MEM_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Workload {
    #[serde(rename = "type")]
    pub kind: WorkloadType,
    pub replicas: u32,
    pub restart_policy: RestartPolicy,
    pub service_account_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rolling_update_max_surge: Option<IntOrString>,
    pub image_pull: ImagePull,
    pub liveness_probe: Probe,
    pub readiness_probe: Probe,
    pub resource: Resource,
    pub autoscale: Autoscale,
}

impl Default for Workload {
    fn default() -> Self {
        Self {
            kind: WorkloadType::default(),
            replicas: DEFAULT_REPLICAS,
            restart_policy: RestartPolicy::default(),
            service_account_name: DEFAULT_SERVICE_ACCOUNT.to_string(),
            rolling_update_max_surge: None,
            image_pull: ImagePull::default(),
            liveness_probe: Probe::default_liveness(),
            readiness_probe: Probe::none(),
            resource: Resource::default(),
            autoscale: Autoscale::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Expose {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_secret: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub ingress_annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServiceSpec {
    #[serde(rename = "type")]
    pub kind: ServiceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_port: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expose: Option<Expose>,
}

/// Content of a service's `x-komp` namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceExtension {
    pub workload: Workload,
    pub service: ServiceSpec,
}

/// Content of a volume's `x-komp` namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VolumeExtension {
    pub size: Quantity,
    pub storage_class: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
}

impl Default for VolumeExtension {
    fn default() -> Self {
        Self {
            size: Quantity(DEFAULT_VOLUME_SIZE.to_string()),
            storage_class: DEFAULT_VOLUME_STORAGE_CLASS.to_string(),
            selector: None,
        }
    }
}

fn to_extensions<T: Serialize>(v: &T) -> Result<Extensions, SchemaError> {
    match serde_json::to_value(v) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(other) => Err(SchemaError::Decode(format!("expected an object, got {}", other))),
        Err(e) => Err(SchemaError::Decode(e.to_string())),
    }
}

fn from_extensions<T: for<'de> Deserialize<'de>>(ext: &Extensions) -> Result<T, SchemaError> {
    serde_json::from_value(serde_json::Value::Object(ext.clone())).map_err(|e| SchemaError::Decode(e.to_string()))
}

impl ServiceExtension {
    pub fn to_extensions(&self) -> Result<Extensions, SchemaError> { to_extensions(self) }

    /// Validate and decode. Missing keys take their defaults.
    pub fn from_extensions(ext: &Extensions) -> Result<Self, SchemaError> {
        validate_service(ext)?;
        from_extensions(ext)
    }
}

impl VolumeExtension {
    pub fn to_extensions(&self) -> Result<Extensions, SchemaError> { to_extensions(self) }

    pub fn from_extensions(ext: &Extensions) -> Result<Self, SchemaError> {
        validate_volume(ext)?;
        from_extensions(ext)
    }
}

/// Validate `ext` and rewrite it in canonical form, filling structural defaults.
pub fn canonical_service(ext: &Extensions) -> Result<Extensions, SchemaError> {
    ServiceExtension::from_extensions(ext)?.to_extensions()
}

pub fn canonical_volume(ext: &Extensions) -> Result<Extensions, SchemaError> {
    VolumeExtension::from_extensions(ext)?.to_extensions()
}

/// Deep-merge `overrides` onto `base` (overrides win) and canonicalize.
pub fn normalize_service(base: &Extensions, overrides: &Extensions) -> Result<Extensions, SchemaError> {
    canonical_service(&merge_extensions(base, overrides))
}

pub fn normalize_volume(base: &Extensions, overrides: &Extensions) -> Result<Extensions, SchemaError> {
    canonical_volume(&merge_extensions(base, overrides))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn obj(v: serde_json::Value) -> Extensions { v.as_object().unwrap().clone() }

    #[test]
    fn default_extension_is_canonical() {
        let ext = ServiceExtension::default().to_extensions().unwrap();
        assert_eq!(canonical_service(&ext).unwrap(), ext);
        assert_eq!(ext["workload"]["type"], json!("Deployment"));
        assert_eq!(ext["workload"]["livenessProbe"]["period"], json!("1m0s"));
        assert_eq!(ext["workload"]["readinessProbe"], json!({ "type": "none" }));
        assert_eq!(ext["service"], json!({ "type": "None" }));
        assert!(ext["workload"].get("rollingUpdateMaxSurge").is_none());
    }

    #[test]
    fn partial_extension_fills_defaults_and_keeps_overrides() {
        let partial = obj(json!({ "workload": { "type": "StatefulSet", "replicas": 3 } }));
        let c = canonical_service(&partial).unwrap();
        assert_eq!(c["workload"]["replicas"], json!(3));
        assert_eq!(c["workload"]["type"], json!("StatefulSet"));
        assert_eq!(c["workload"]["resource"]["maxMemory"], json!("500Mi"));
        assert_eq!(c["service"]["type"], json!("None"));
    }

    #[test]
    fn normalize_lets_overrides_win() {
        let base = ServiceExtension::default().to_extensions().unwrap();
        let over = obj(json!({ "service": { "type": "NodePort", "nodePort": 30080 } }));
        let n = normalize_service(&base, &over).unwrap();
        assert_eq!(n["service"], json!({ "type": "NodePort", "nodePort": 30080 }));
        assert_eq!(n["workload"], base["workload"]);
    }

    #[test]
    fn max_surge_accepts_int_or_percentage() {
        let int = obj(json!({ "workload": { "type": "Deployment", "replicas": 1, "rollingUpdateMaxSurge": 2 } }));
        assert_eq!(canonical_service(&int).unwrap()["workload"]["rollingUpdateMaxSurge"], json!(2));
        let pct = obj(json!({ "workload": { "type": "Deployment", "replicas": 1, "rollingUpdateMaxSurge": "25%" } }));
        assert_eq!(canonical_service(&pct).unwrap()["workload"]["rollingUpdateMaxSurge"], json!("25%"));
    }

    #[test]
    fn volume_defaults_and_overrides() {
        let c = canonical_volume(&Extensions::new()).unwrap();
        assert_eq!(Value::Object(c), json!({ "size": "100Mi", "storageClass": "standard" }));
        let n = normalize_volume(&VolumeExtension::default().to_extensions().unwrap(), &obj(json!({ "size": "1Gi" }))).unwrap();
        assert_eq!(n["size"], json!("1Gi"));
    }
}
