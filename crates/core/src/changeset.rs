//! Typed create/update/delete operations against an [`Overlay`].
//!
//! Each entity kind has its own change type with concrete payloads; [`Change`]
//! is a borrowed view over all of them for reporting.

use std::fmt;

use rustc_hash::FxHashSet;
use serde::Serialize;

use crate::{Extensions, Overlay, ServiceOverride, VolumeOverride};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

/// Which attribute of an entity a change touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeTarget {
    Version,
    /// The whole entity.
    Entity,
    Labels,
    Extensions,
    Environment,
}

/// Identifies the affected entry: a service ordinal, a volume name or an env var name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum ChangeKey<'a> {
    None,
    Index(usize),
    Name(&'a str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionChange {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServiceChange {
    /// `index` is the position the service takes in the target.
    Create { index: usize, name: String, service: ServiceOverride },
    UpdateExtensions { name: String, extensions: Extensions },
    /// `index` is the position the service had when the deletion was detected.
    Delete { index: usize, name: String },
    DeleteEnv { name: String, var: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum VolumeChange {
    Create { name: String, volume: VolumeOverride },
    Delete { name: String },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Change<'a> {
    Version(&'a VersionChange),
    Service(&'a ServiceChange),
    Volume(&'a VolumeChange),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Changeset {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<VersionChange>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceChange>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeChange>,
}

impl ServiceChange {
    pub fn create(index: usize, service: ServiceOverride) -> Self {
        ServiceChange::Create { index, name: service.name.clone(), service }
    }

    pub fn service_name(&self) -> &str {
        match self {
            ServiceChange::Create { name, .. }
            | ServiceChange::UpdateExtensions { name, .. }
            | ServiceChange::Delete { name, .. }
            | ServiceChange::DeleteEnv { name, .. } => name,
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            ServiceChange::Create { .. } => ChangeKind::Create,
            ServiceChange::UpdateExtensions { .. } => ChangeKind::Update,
            ServiceChange::Delete { .. } | ServiceChange::DeleteEnv { .. } => ChangeKind::Delete,
        }
    }

    pub fn target(&self) -> ChangeTarget {
        match self {
            ServiceChange::Create { .. } | ServiceChange::Delete { .. } => ChangeTarget::Entity,
            ServiceChange::UpdateExtensions { .. } => ChangeTarget::Extensions,
            ServiceChange::DeleteEnv { .. } => ChangeTarget::Environment,
        }
    }

    pub fn key(&self) -> ChangeKey<'_> {
        match self {
            ServiceChange::Create { index, .. } | ServiceChange::Delete { index, .. } => ChangeKey::Index(*index),
            ServiceChange::UpdateExtensions { name, .. } => ChangeKey::Name(name),
            ServiceChange::DeleteEnv { var, .. } => ChangeKey::Name(var),
        }
    }

    fn is_whole_delete(&self) -> bool {
        matches!(self, ServiceChange::Delete { .. })
    }
}

impl VolumeChange {
    pub fn volume_name(&self) -> &str {
        match self {
            VolumeChange::Create { name, .. } | VolumeChange::Delete { name } => name,
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            VolumeChange::Create { .. } => ChangeKind::Create,
            VolumeChange::Delete { .. } => ChangeKind::Delete,
        }
    }
}

impl Change<'_> {
    pub fn kind(&self) -> ChangeKind {
        match self {
            Change::Version(_) => ChangeKind::Update,
            Change::Service(c) => c.kind(),
            Change::Volume(c) => c.kind(),
        }
    }

    pub fn target(&self) -> ChangeTarget {
        match self {
            Change::Version(_) => ChangeTarget::Version,
            Change::Service(c) => c.target(),
            Change::Volume(_) => ChangeTarget::Entity,
        }
    }

    pub fn key(&self) -> ChangeKey<'_> {
        match self {
            Change::Version(_) => ChangeKey::None,
            Change::Service(c) => c.key(),
            Change::Volume(c) => ChangeKey::Name(c.volume_name()),
        }
    }
}

impl fmt::Display for VersionChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.from.is_empty() {
            write!(f, "version set to `{}`", self.to)
        } else {
            write!(f, "version updated from `{}` to `{}`", self.from, self.to)
        }
    }
}

impl fmt::Display for ServiceChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceChange::Create { name, .. } => write!(f, "service `{}` added", name),
            ServiceChange::UpdateExtensions { name, .. } => write!(f, "service `{}` extensions updated", name),
            ServiceChange::Delete { name, .. } => write!(f, "service `{}` removed", name),
            ServiceChange::DeleteEnv { name, var } => write!(f, "service `{}` env var `{}` removed", name, var),
        }
    }
}

impl fmt::Display for VolumeChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeChange::Create { name, .. } => write!(f, "volume `{}` added", name),
            VolumeChange::Delete { name } => write!(f, "volume `{}` removed", name),
        }
    }
}

impl fmt::Display for Change<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::Version(c) => c.fmt(f),
            Change::Service(c) => c.fmt(f),
            Change::Volume(c) => c.fmt(f),
        }
    }
}

impl Changeset {
    pub fn is_empty(&self) -> bool {
        self.version.is_none() && self.services.is_empty() && self.volumes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.version.iter().count() + self.services.len() + self.volumes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Change<'_>> {
        self.version
            .iter()
            .map(Change::Version)
            .chain(self.services.iter().map(Change::Service))
            .chain(self.volumes.iter().map(Change::Volume))
    }

    /// Queue a service change. A whole-service delete drops any attribute
    /// changes already queued for that service and blocks later ones; a second
    /// delete for the same service is ignored.
    pub fn push_service(&mut self, change: ServiceChange) {
        let name = change.service_name().to_string();
        let already_deleted = self.services.iter().any(|c| c.is_whole_delete() && c.service_name() == name);
        if already_deleted { return; }
        if change.is_whole_delete() {
            self.services.retain(|c| c.service_name() != name || matches!(c, ServiceChange::Create { .. }));
        }
        self.services.push(change);
    }

    pub fn push_volume(&mut self, change: VolumeChange) {
        if self.volumes.iter().any(|c| c == &change) { return; }
        self.volumes.push(change);
    }

    /// Append every change from `other`, keeping the queueing rules.
    pub fn extend(&mut self, other: Changeset) {
        if other.version.is_some() { self.version = other.version; }
        for c in other.services { self.push_service(c); }
        for c in other.volumes { self.push_volume(c); }
    }

    pub fn describe(&self) -> Vec<String> {
        self.iter().map(|c| c.to_string()).collect()
    }

    /// Apply onto `overlay`, returning the patched overlay. Creates never
    /// overwrite an existing entity and deletes of absent entities are no-ops,
    /// so applying the same changeset twice equals applying it once.
    pub fn apply(&self, mut overlay: Overlay) -> Overlay {
        if let Some(v) = &self.version {
            overlay.version = v.to.clone();
        }

        let deleted: FxHashSet<&str> = self
            .services
            .iter()
            .filter(|c| c.is_whole_delete())
            .map(|c| c.service_name())
            .collect();

        for change in &self.services {
            match change {
                ServiceChange::Delete { name, .. } => overlay.services.retain(|s| &s.name != name),
                _ if deleted.contains(change.service_name()) => {}
                ServiceChange::Create { name, service, .. } => {
                    if overlay.service(name).is_none() {
                        let mut svc = service.clone();
                        svc.name = name.clone();
                        overlay.services.push(svc);
                    }
                }
                ServiceChange::UpdateExtensions { name, extensions } => {
                    if let Some(svc) = overlay.service_mut(name) { svc.extensions = extensions.clone(); }
                }
                ServiceChange::DeleteEnv { name, var } => {
                    if let Some(svc) = overlay.service_mut(name) { svc.environment.remove(var); }
                }
            }
        }

        for change in &self.volumes {
            match change {
                VolumeChange::Create { name, volume } => {
                    if !overlay.volumes.contains_key(name) {
                        let mut vol = volume.clone();
                        vol.name = name.clone();
                        overlay.volumes.insert(name.clone(), vol);
                    }
                }
                VolumeChange::Delete { name } => { overlay.volumes.remove(name); }
            }
        }
        overlay
    }
}
