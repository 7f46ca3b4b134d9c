//! komp core types: overlays, the compose project model and changesets.
//!
//! An [`Overlay`] is the Kubernetes-facing configuration derived from compose
//! sources. The same shape is used for the freshly extracted *source* overlay
//! and for each persisted *environment* overlay.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub mod changeset;
pub mod labels;
pub mod merge;
pub mod project;
mod projection;
mod serde_util;

pub use changeset::{
    Change, ChangeKey, ChangeKind, ChangeTarget, Changeset, ServiceChange, VersionChange, VolumeChange,
};
pub use serde_util::{environment_as_map, labels_as_map};
pub use project::{
    ComposeProject, DeployConfig, HealthCheckConfig, PortConfig, ResourceConfig, ResourcesConfig,
    RestartPolicyConfig, ServiceConfig, ServiceVolumeConfig, UpdateConfig, VolumeConfig,
};

/// Content of the single `x-komp` vendor extension namespace.
pub type Extensions = serde_json::Map<String, serde_json::Value>;
/// Environment variables; `None` means declared without a value.
pub type Environment = BTreeMap<String, Option<String>>;
pub type Labels = BTreeMap<String, String>;

/// Key under which the extension namespace lives in compose and overlay files.
pub const EXTENSION_KEY: &str = "x-komp";
/// Compose file format version assumed when the sources do not declare one.
pub const DEFAULT_VERSION: &str = "3.8";

/// Entities that are stored in a name-keyed mapping on disk but carry their
/// name as a field in memory.
pub trait Named {
    fn name(&self) -> &str;
    fn set_name(&mut self, name: String);
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Overlay {
    #[serde(default)]
    pub version: String,
    /// Ordered, unique by name.
    #[serde(default, with = "serde_util::named_list", skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceOverride>,
    #[serde(default, with = "serde_util::named_map", skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, VolumeOverride>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceOverride {
    #[serde(skip)]
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty", deserialize_with = "serde_util::labels")]
    pub labels: Labels,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty", deserialize_with = "serde_util::environment")]
    pub environment: Environment,
    #[serde(rename = "x-komp", default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extensions: Extensions,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeOverride {
    #[serde(skip)]
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty", deserialize_with = "serde_util::labels")]
    pub labels: Labels,
    #[serde(rename = "x-komp", default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extensions: Extensions,
}

impl Named for ServiceOverride {
    fn name(&self) -> &str { &self.name }
    fn set_name(&mut self, name: String) { self.name = name; }
}

impl Named for VolumeOverride {
    fn name(&self) -> &str { &self.name }
    fn set_name(&mut self, name: String) { self.name = name; }
}

impl ServiceOverride {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: Option<&str>) -> Self {
        self.environment.insert(key.into(), value.map(|v| v.to_string()));
        self
    }

    pub fn with_extensions(mut self, extensions: Extensions) -> Self {
        self.extensions = extensions;
        self
    }

    /// Copy of this override without any environment variables.
    pub fn without_environment(&self) -> Self {
        Self { environment: Environment::new(), ..self.clone() }
    }
}

impl VolumeOverride {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

impl Overlay {
    pub fn new(version: impl Into<String>) -> Self {
        Self { version: version.into(), ..Default::default() }
    }

    pub fn service(&self, name: &str) -> Option<&ServiceOverride> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn service_mut(&mut self, name: &str) -> Option<&mut ServiceOverride> {
        self.services.iter_mut().find(|s| s.name == name)
    }

    pub fn service_index(&self, name: &str) -> Option<usize> {
        self.services.iter().position(|s| s.name == name)
    }

    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.iter().map(|s| s.name.as_str())
    }

    /// Insert or replace by name; new services are appended to keep ordering stable.
    pub fn upsert_service(&mut self, svc: ServiceOverride) {
        match self.service_mut(&svc.name) {
            Some(existing) => *existing = svc,
            None => self.services.push(svc),
        }
    }

    pub fn insert_volume(&mut self, vol: VolumeOverride) {
        self.volumes.insert(vol.name.clone(), vol);
    }

    /// Copy of this overlay with every service's environment removed.
    pub fn without_environment(&self) -> Self {
        Self {
            version: self.version.clone(),
            services: self.services.iter().map(ServiceOverride::without_environment).collect(),
            volumes: self.volumes.clone(),
        }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        if yaml.trim().is_empty() { return Ok(Self::default()); }
        serde_yaml::from_str(yaml)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}
