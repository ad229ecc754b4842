//! Named detection profiles, stored together in one TOML file.

use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};

use crate::params::{DetectorChar, DetectorParams, Features};

pub const DEFAULT_PROFILE_NAME: &str = "default";

#[derive(Clone, Debug, Serialize, Deserialize)]
struct DetectorRecord {
    /// Angular frequency, 2πf
    w_in: f64,
    bw: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileRecord {
    sr: f64,
    num_threads: usize,
    damping: f64,
    gain: f64,
    features: String,
    detectors: Vec<DetectorRecord>,
}

impl ProfileRecord {
    fn from_params(params: &DetectorParams) -> Self {
        Self {
            sr: params.sample_rate,
            num_threads: params.num_threads,
            damping: params.damping,
            gain: params.gain,
            features: params.features.to_feature_set(),
            detectors: params
                .det_chars
                .iter()
                .map(|c| DetectorRecord {
                    w_in: 2.0 * PI * c.freq,
                    bw: c.bandwidth,
                })
                .collect(),
        }
    }

    fn to_params(&self) -> Result<DetectorParams> {
        Ok(DetectorParams {
            sample_rate: self.sr,
            num_threads: self.num_threads,
            det_chars: self
                .detectors
                .iter()
                .map(|d| DetectorChar::new(d.w_in / (2.0 * PI), d.bw))
                .collect(),
            damping: self.damping,
            gain: self.gain,
            features: Features::parse_feature_set(&self.features)?,
        })
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProfileFile {
    #[serde(default)]
    profiles: BTreeMap<String, ProfileRecord>,
}

pub struct ProfileManager {
    path: PathBuf,
    file: ProfileFile,
}

impl ProfileManager {
    /// `<config dir>/detbank-gui/profiles.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("detbank-gui").join("profiles.toml"))
    }

    /// Open the profile file at `path`; a missing file starts empty.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = if path.exists() {
            let text = std::fs::read_to_string(&path).with_context(|| format!("failed to read {:?}", path))?;
            toml::from_str(&text).with_context(|| format!("failed to parse profiles in {:?}", path))?
        } else {
            ProfileFile::default()
        };
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Profile names, sorted.
    pub fn profiles(&self) -> Vec<String> {
        self.file.profiles.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.file.profiles.contains_key(name)
    }

    pub fn load(&self, name: &str) -> Result<DetectorParams> {
        let record = self
            .file
            .profiles
            .get(name)
            .with_context(|| format!("no profile named '{}'", name))?;
        let params = record
            .to_params()
            .with_context(|| format!("profile '{}' is malformed", name))?;
        info!("Loaded profile '{}' ({} detectors)", name, params.det_chars.len());
        Ok(params)
    }

    /// Save `params` as `name`, replacing any existing profile of that name.
    pub fn save(&mut self, name: &str, params: &DetectorParams) -> Result<()> {
        anyhow::ensure!(!name.trim().is_empty(), "profile name must not be empty");
        self.file
            .profiles
            .insert(name.to_string(), ProfileRecord::from_params(params));
        self.write()?;
        info!("Saved profile '{}'", name);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<bool> {
        let removed = self.file.profiles.remove(name).is_some();
        if removed {
            self.write()?;
            info!("Removed profile '{}'", name);
        }
        Ok(removed)
    }

    /// Create the default profile from default parameters if it is missing.
    pub fn ensure_default(&mut self) -> Result<()> {
        if !self.contains(DEFAULT_PROFILE_NAME) {
            self.save(DEFAULT_PROFILE_NAME, &DetectorParams::default())?;
        }
        Ok(())
    }

    fn write(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("failed to create {:?}", parent))?;
        }
        let text = toml::to_string_pretty(&self.file).context("failed to serialize profiles")?;
        std::fs::write(&self.path, text).with_context(|| format!("failed to write {:?}", self.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{AmpNorm, NumericalMethod};

    #[test]
    fn test_save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles.toml");

        let mut params = DetectorParams {
            sample_rate: 44100.0,
            num_threads: 3,
            det_chars: vec![DetectorChar::new(27.5, 0.0), DetectorChar::new(440.0, 0.0), DetectorChar::new(4186.01, 0.0)],
            damping: 0.0005,
            gain: 12.5,
            features: Features::default(),
        };
        params.features.method = NumericalMethod::CentralDifference;
        params.features.amp_norm = AmpNorm::Normalized;

        let mut manager = ProfileManager::open(&path).unwrap();
        manager.save("piano", &params).unwrap();

        let reopened = ProfileManager::open(&path).unwrap();
        let loaded = reopened.load("piano").unwrap();
        assert_eq!(loaded.sample_rate, params.sample_rate);
        assert_eq!(loaded.num_threads, params.num_threads);
        assert_eq!(loaded.damping, params.damping);
        assert_eq!(loaded.gain, params.gain);
        assert_eq!(loaded.features, params.features);
        assert_eq!(loaded.det_chars.len(), 3);
        for (a, b) in loaded.det_chars.iter().zip(&params.det_chars) {
            assert!((a.freq - b.freq).abs() < 1e-9);
            assert_eq!(a.bandwidth, b.bandwidth);
        }
    }

    #[test]
    fn test_ensure_default_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = ProfileManager::open(dir.path().join("p.toml")).unwrap();
        assert!(manager.profiles().is_empty());
        manager.ensure_default().unwrap();
        manager.save("alto", &DetectorParams::default()).unwrap();
        assert_eq!(manager.profiles(), vec!["alto".to_string(), "default".to_string()]);
        assert!(manager.remove("alto").unwrap());
        assert!(!manager.remove("alto").unwrap());
        assert!(manager.load("alto").is_err());
        assert_eq!(manager.load(DEFAULT_PROFILE_NAME).unwrap().det_chars.len(), 88);
    }
}
