//! Persisted item list.
//!
//! The configured pairs live in a single JSON document under the user's
//! config directory. A document that fails to load is not an error anywhere
//! upstream: the list resets to empty and the failure goes to the log.

use directories::{BaseDirs, ProjectDirs};
use eyre::{eyre, Context, Result};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::fs;
use std::path::{Path, PathBuf};

use crate::item::ItemPair;

const ITEMS_FILE: &str = "items.json";

static CONFIG_DIR_OVERRIDE: Lazy<RwLock<Option<PathBuf>>> = Lazy::new(|| RwLock::new(None));

/// Override the configuration directory for the current process.
/// Subsequent calls replace the previous override.
pub fn set_config_dir<P: AsRef<Path>>(path: P) {
    *CONFIG_DIR_OVERRIDE.write() = Some(path.as_ref().to_path_buf());
}

/// Clear any previously configured override.
pub fn clear_config_dir_override() {
    CONFIG_DIR_OVERRIDE.write().take();
}

/// Resolve the configuration directory.
/// Priority: explicit override -> platform standard -> ~/.config/convoy
pub fn config_dir() -> Result<PathBuf> {
    if let Some(path) = CONFIG_DIR_OVERRIDE.read().clone() {
        return Ok(path);
    }

    if let Some(proj) = ProjectDirs::from("dev", "Convoy", "Convoy") {
        return Ok(proj.config_dir().to_path_buf());
    }

    if let Some(base) = BaseDirs::new() {
        return Ok(base.home_dir().join(".config").join("convoy"));
    }

    Err(eyre!(
        "unable to determine configuration directory for convoy (no override and no platform default)"
    ))
}

fn items_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(ITEMS_FILE))
}

/// Load the persisted item list. Any failure (missing file, unreadable
/// contents, schema mismatch) yields an empty list plus a log line.
pub fn load_items() -> Vec<ItemPair> {
    let path = match items_path() {
        Ok(path) => path,
        Err(err) => {
            log::warn!("item store unavailable: {err}");
            return Vec::new();
        }
    };

    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(err) => {
            log::warn!("failed to read item store {}: {err}", path.display());
            return Vec::new();
        }
    };

    match serde_json::from_str::<Vec<ItemPair>>(&contents) {
        Ok(items) => items,
        Err(err) => {
            log::warn!(
                "item store {} did not decode (resetting to empty): {err}",
                path.display()
            );
            Vec::new()
        }
    }
}

/// Rewrite the whole item document.
pub fn save_items(items: &[ItemPair]) -> Result<()> {
    let path = items_path()?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory {}", parent.display()))?;
    }
    let contents = serde_json::to_string_pretty(items).context("serialize item list")?;
    fs::write(&path, contents)
        .with_context(|| format!("failed to write item store {}", path.display()))
}
