//! komp persistence: environment overlay files and compose sources.
//! Whole-file reads and writes only; no locking.

#![forbid(unsafe_code)]

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use komp_core::Overlay;
use metrics::{counter, histogram};
use tracing::debug;

mod compose;

pub use compose::load_compose;

pub(crate) fn max_yaml_bytes() -> u64 {
    std::env::var("KOMP_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(4_000_000)
}

/// Read a file fully, refusing anything over `KOMP_MAX_YAML_BYTES`.
pub(crate) fn read_bounded(path: &Path) -> Result<String> {
    let len = std::fs::metadata(path).with_context(|| format!("reading {}", path.display()))?.len();
    let max = max_yaml_bytes();
    if len > max {
        return Err(anyhow!("{} is {} bytes, over the {} byte limit (KOMP_MAX_YAML_BYTES)", path.display(), len, max));
    }
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

pub trait Store {
    fn load(&self) -> Result<Overlay>;
    fn save(&self, overlay: &Overlay) -> Result<()>;
}

/// One environment overlay stored as a YAML file.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self { Self { path: path.into() } }

    pub fn path(&self) -> &Path { &self.path }

    pub fn exists(&self) -> bool { self.path.exists() }
}

impl Store for FileStore {
    fn load(&self) -> Result<Overlay> { load_overlay(&self.path) }

    fn save(&self, overlay: &Overlay) -> Result<()> { save_overlay(&self.path, overlay) }
}

pub fn load_overlay(path: &Path) -> Result<Overlay> {
    let started = std::time::Instant::now();
    let text = read_bounded(path)?;
    let overlay = Overlay::from_yaml(&text).with_context(|| format!("parsing overlay {}", path.display()))?;
    histogram!("overlay_load_ms", started.elapsed().as_secs_f64() * 1000.0);
    debug!(path = %path.display(), services = overlay.services.len(), "loaded overlay");
    Ok(overlay)
}

pub fn save_overlay(path: &Path, overlay: &Overlay) -> Result<()> {
    let yaml = overlay.to_yaml().context("serializing overlay")?;
    write_atomic(path, yaml.as_bytes())?;
    counter!("overlay_save_total", 1u64);
    debug!(path = %path.display(), bytes = yaml.len(), "saved overlay");
    Ok(())
}

/// Write through a temp file in the target's directory, then rename it over
/// the target, so readers see either the old or the new file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir).with_context(|| format!("creating temp file in {}", dir.display()))?;
    tmp.write_all(bytes).with_context(|| format!("writing {}", path.display()))?;
    tmp.as_file().sync_all().with_context(|| format!("syncing {}", path.display()))?;
    tmp.persist(path).map_err(|e| e.error).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}
