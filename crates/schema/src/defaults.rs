//! Default values written into every extracted overlay, so that diffs only
//! surface meaningful divergence.

pub const DEFAULT_REPLICAS: u32 = 1;
pub const DEFAULT_SERVICE_ACCOUNT: &str = "default";

// Liveness probe, used when compose declares no healthcheck
pub const DEFAULT_PROBE_INTERVAL: &str = "1m0s";
pub const DEFAULT_PROBE_RETRIES: u32 = 3;
pub const DEFAULT_PROBE_INITIAL_DELAY: &str = "1m0s";
pub const DEFAULT_PROBE_TIMEOUT: &str = "10s";
pub const DEFAULT_PROBE_DISABLE: bool = false;
pub const DEFAULT_PROBE_COMMAND: &[&str] = &["echo", "Define healthcheck command for service"];
pub const DEFAULT_PROBE_SUCCESS_THRESHOLD: u32 = 1;

pub const DEFAULT_CPU_REQUEST: &str = "100m";
pub const DEFAULT_CPU_LIMIT: &str = "500m";
pub const DEFAULT_MEMORY_REQUEST: &str = "10Mi";
pub const DEFAULT_MEMORY_LIMIT: &str = "500Mi";

pub const DEFAULT_AUTOSCALE_MAX_REPLICAS: u32 = 0;
pub const DEFAULT_AUTOSCALE_CPU_THRESHOLD: u32 = 70;
pub const DEFAULT_AUTOSCALE_MEM_THRESHOLD: u32 = 70;

pub const DEFAULT_VOLUME_SIZE: &str = "100Mi";
pub const DEFAULT_VOLUME_STORAGE_CLASS: &str = "standard";
