//! Persistent instance id.
//!
//! A node keeps its id in `instance.dat` inside the data directory so it
//! registers under the same id across restarts.

use anyhow::{Context, Result};
use cluster_core::InstanceId;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const INSTANCE_FILE: &str = "instance.dat";

pub fn instance_file(data_dir: &Path) -> PathBuf {
    data_dir.join(INSTANCE_FILE)
}

/// Read the stored instance id, or generate and store a new one.
///
/// Unreadable or invalid content is replaced with a fresh id.
pub fn load_or_create(data_dir: &Path) -> Result<InstanceId> {
    let path = instance_file(data_dir);

    match fs::read_to_string(&path) {
        Ok(contents) => match contents.trim().parse::<InstanceId>() {
            Ok(id) => return Ok(id),
            Err(e) => warn!("Discarding {}: {}", path.display(), e),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to read {}: {}", path.display(), e),
    }

    let id = InstanceId::generate();
    fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;
    fs::write(&path, id.as_str()).with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Generated instance id {}", id);
    Ok(id)
}
