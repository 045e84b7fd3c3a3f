// =============================================================================
// Atomic JSON persistence helpers
// =============================================================================
//
// All on-disk state (runtime config, sensor stats, bot state) goes through the
// same tmp + rename pattern so a crash mid-write never leaves a torn file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

/// Serialize `value` as pretty JSON and write it to `path` atomically.
///
/// Parent directories are created as needed. The content is written to a
/// `.tmp` sibling first, then renamed over the target.
pub fn atomic_write_json<T: Serialize>(path: impl AsRef<Path>, value: &T) -> Result<()> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
    }

    let content = serde_json::to_string_pretty(value).context("failed to serialise state to JSON")?;

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &content)
        .with_context(|| format!("failed to write tmp state to {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename tmp state to {}", path.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Probe {
        a: u32,
        b: String,
    }

    #[test]
    fn write_then_read_roundtrip() {
        let dir = std::env::temp_dir().join(format!("vega-persist-{}", std::process::id()));
        let path = dir.join("probe.json");
        let value = Probe { a: 7, b: "x".into() };

        atomic_write_json(&path, &value).unwrap();
        let loaded: Probe = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, value);

        // No tmp file left behind.
        assert!(!path.with_extension("json.tmp").exists());
        std::fs::remove_dir_all(&dir).ok();
    }
}
