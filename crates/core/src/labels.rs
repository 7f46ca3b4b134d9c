//! Label keys komp tracks in overlays. Anything else on a compose entity is
//! ignored when building or diffing overlays.

use rustc_hash::FxHashSet;

pub const SERVICE_EXPOSE: &str = "komp.service.expose";
pub const SERVICE_EXPOSE_TLS_SECRET: &str = "komp.service.expose.tls-secret";
pub const SERVICE_EXPOSE_INGRESS_CLASS: &str = "komp.service.expose.ingress-class";
pub const WORKLOAD_IMAGE_PULL_SECRET: &str = "komp.workload.image-pull-secret";
pub const WORKLOAD_SERVICE_ACCOUNT: &str = "komp.workload.service-account-name";

pub const VOLUME_SIZE: &str = "komp.volume.size";
pub const VOLUME_STORAGE_CLASS: &str = "komp.volume.storage-class";
pub const VOLUME_SELECTOR: &str = "komp.volume.selector";

pub const SERVICE_KEYS: &[&str] = &[
    SERVICE_EXPOSE,
    SERVICE_EXPOSE_TLS_SECRET,
    SERVICE_EXPOSE_INGRESS_CLASS,
    WORKLOAD_IMAGE_PULL_SECRET,
    WORKLOAD_SERVICE_ACCOUNT,
];

pub const VOLUME_KEYS: &[&str] = &[VOLUME_SIZE, VOLUME_STORAGE_CLASS, VOLUME_SELECTOR];

/// Every recognized label key (services and volumes).
pub fn known_keys() -> FxHashSet<&'static str> {
    SERVICE_KEYS.iter().chain(VOLUME_KEYS.iter()).copied().collect()
}
