//! Preset library: saved stations, persisted as a JSON list.
//!
//! Presets keep their insertion order. Storage that is missing, unreadable
//! or corrupt loads as an empty library rather than failing startup.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
#[cfg(not(target_arch = "wasm32"))]
use directories::ProjectDirs;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::LibraryError;
use crate::model::Composition;
use crate::orchestrator::AgenticConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedPreset {
    pub id: String,
    pub name: String,
    pub config: AgenticConfig,
    pub composition: Composition,
    pub date: DateTime<Utc>,
}

#[derive(Debug)]
pub struct PresetLibrary {
    path: PathBuf,
    presets: Vec<SavedPreset>,
}

/// `presets.json` in the platform data directory.
#[cfg(not(target_arch = "wasm32"))]
pub fn default_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "lullaby").map(|dirs| dirs.data_dir().join("presets.json"))
}

impl PresetLibrary {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let presets = load(&path);
        PresetLibrary { path, presets }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn list(&self) -> &[SavedPreset] {
        &self.presets
    }

    pub fn get(&self, id: &str) -> Option<&SavedPreset> {
        self.presets.iter().find(|p| p.id == id)
    }

    /// Append a preset and write the library back.
    pub fn save(
        &mut self,
        name: impl Into<String>,
        config: AgenticConfig,
        composition: Composition,
    ) -> Result<SavedPreset, LibraryError> {
        let preset = SavedPreset {
            id: format!("{:016x}", rand::thread_rng().r#gen::<u64>()),
            name: name.into(),
            config,
            composition,
            date: Utc::now(),
        };
        self.presets.push(preset.clone());
        if let Err(e) = self.persist() {
            self.presets.pop();
            return Err(e);
        }
        info!(id = %preset.id, name = %preset.name, "preset saved");
        Ok(preset)
    }

    pub fn remove(&mut self, id: &str) -> Result<Option<SavedPreset>, LibraryError> {
        let Some(idx) = self.presets.iter().position(|p| p.id == id) else {
            return Ok(None);
        };
        let removed = self.presets.remove(idx);
        if let Err(e) = self.persist() {
            self.presets.insert(idx, removed);
            return Err(e);
        }
        Ok(Some(removed))
    }

    fn persist(&self) -> Result<(), LibraryError> {
        let io = |source| LibraryError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io)?;
        }
        let json = serde_json::to_vec_pretty(&self.presets)?;
        std::fs::write(&self.path, json).map_err(io)
    }
}

fn load(path: &Path) -> Vec<SavedPreset> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!(path = %path.display(), "preset library unreadable: {e}");
            return Vec::new();
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(presets) => presets,
        Err(e) => {
            warn!(path = %path.display(), "preset library corrupt, starting empty: {e}");
            Vec::new()
        }
    }
}
