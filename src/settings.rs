//! Persistent application settings.
//!
//! Settings live behind the `ConfigStore` trait and are handed to whoever
//! needs them. Keys are slash-separated:
//!
//! | key | value |
//! |---|---|
//! | `window/geometry` | `"<width>x<height>"` |
//! | `window/viewMode` | `"light"` or `"dark"` |
//! | `params/currentProfile` | profile shown in the form |
//! | `params/defaultProfile` | profile loaded at startup |
//! | `plot/downsample` | downsample factor, default 1000 |
//! | `plot/rows`, `plot/cols` | results grid size, default 2x2 |
//! | `export/dir` | directory for CSV output |

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use log::{debug, warn};

pub const WINDOW_GEOMETRY: &str = "window/geometry";
pub const WINDOW_VIEW_MODE: &str = "window/viewMode";
pub const CURRENT_PROFILE: &str = "params/currentProfile";
pub const DEFAULT_PROFILE: &str = "params/defaultProfile";
pub const DOWNSAMPLE: &str = "plot/downsample";
pub const PLOT_ROWS: &str = "plot/rows";
pub const PLOT_COLS: &str = "plot/cols";
pub const EXPORT_DIR: &str = "export/dir";

pub const DEFAULT_DOWNSAMPLE: usize = 1000;

pub trait ConfigStore {
    fn value(&self, key: &str) -> Option<String>;
    fn set_value(&mut self, key: &str, value: String);
    fn remove(&mut self, key: &str);

    /// Persist pending changes. Stores without backing storage do nothing.
    fn save(&self) -> Result<()> {
        Ok(())
    }
}

/// Parse `key` as `T`, falling back to `default` when unset or unparsable.
pub fn get_parsed<T: FromStr>(store: &dyn ConfigStore, key: &str, default: T) -> T {
    match store.value(key) {
        Some(text) => text.parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid setting {} = {:?}", key, text);
            default
        }),
        None => default,
    }
}

pub fn set_display<T: ToString>(store: &mut dyn ConfigStore, key: &str, value: T) {
    store.set_value(key, value.to_string());
}

#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    values: BTreeMap<String, String>,
}

impl ConfigStore for MemoryStore {
    fn value(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set_value(&mut self, key: &str, value: String) {
        self.values.insert(key.to_string(), value);
    }

    fn remove(&mut self, key: &str) {
        self.values.remove(key);
    }
}

/// Settings kept in a TOML file; changes are written on `save`.
#[derive(Clone, Debug)]
pub struct FileStore {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl FileStore {
    /// `<config dir>/detbank-gui/settings.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("detbank-gui").join("settings.toml"))
    }

    /// Open the store at `path`. A missing or unreadable file gives an empty store.
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let values = match std::fs::read_to_string(&path) {
            Ok(text) => toml::from_str(&text).unwrap_or_else(|e| {
                warn!("Failed to parse settings {:?}, using defaults: {}", path, e);
                BTreeMap::new()
            }),
            Err(e) => {
                debug!("No settings at {:?}: {}", path, e);
                BTreeMap::new()
            }
        };
        Self { path, values }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for FileStore {
    fn value(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set_value(&mut self, key: &str, value: String) {
        self.values.insert(key.to_string(), value);
    }

    fn remove(&mut self, key: &str) {
        self.values.remove(key);
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {:?}", parent))?;
        }
        let text = toml::to_string(&self.values).context("failed to serialize settings")?;
        std::fs::write(&self.path, text).with_context(|| format!("failed to write {:?}", self.path))?;
        debug!("Saved settings to {:?}", self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_parsed_falls_back() {
        let mut store = MemoryStore::default();
        assert_eq!(get_parsed(&store, DOWNSAMPLE, DEFAULT_DOWNSAMPLE), 1000);
        set_display(&mut store, DOWNSAMPLE, 250);
        assert_eq!(get_parsed(&store, DOWNSAMPLE, DEFAULT_DOWNSAMPLE), 250);
        store.set_value(PLOT_ROWS, "two".into());
        assert_eq!(get_parsed(&store, PLOT_ROWS, 2usize), 2);
        store.remove(DOWNSAMPLE);
        assert_eq!(store.value(DOWNSAMPLE), None);
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.toml");

        let mut store = FileStore::open(&path);
        assert_eq!(store.value(CURRENT_PROFILE), None);
        store.set_value(CURRENT_PROFILE, "piano".into());
        store.set_value(EXPORT_DIR, "/tmp/out".into());
        store.save().unwrap();

        let store = FileStore::open(&path);
        assert_eq!(store.value(CURRENT_PROFILE).as_deref(), Some("piano"));
        assert_eq!(store.value(EXPORT_DIR).as_deref(), Some("/tmp/out"));
    }

    #[test]
    fn test_corrupt_file_gives_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "not = [valid").unwrap();
        let store = FileStore::open(&path);
        assert_eq!(store.value(DOWNSAMPLE), None);
    }
}
