// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Bounded model version history with optional on-disk snapshots.
//!
//! Each version is written to `model-v{version}.json` in the model directory.
//! On startup the directory is scanned and the newest version becomes the
//! current model.

use fedlytics_core::EsgModel;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{FederatedError, FederatedResult};

const FILE_PREFIX: &str = "model-v";

pub struct ModelStore {
    versions: BTreeMap<u64, EsgModel>,
    max_versions: usize,
    dir: Option<PathBuf>,
}

impl ModelStore {
    pub fn in_memory(max_versions: usize) -> Self {
        Self {
            versions: BTreeMap::new(),
            max_versions,
            dir: None,
        }
    }

    /// Open (or create) a snapshot directory and load every version in it.
    pub fn open(dir: impl AsRef<Path>, max_versions: usize) -> FederatedResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut versions = BTreeMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let is_snapshot = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(FILE_PREFIX) && n.ends_with(".json"))
                .unwrap_or(false);
            if !is_snapshot {
                continue;
            }

            match fs::read(&path)
                .map_err(FederatedError::from)
                .and_then(|bytes| Ok(serde_json::from_slice::<EsgModel>(&bytes)?))
            {
                Ok(model) => {
                    versions.insert(model.version, model);
                }
                Err(e) => warn!("Skipping unreadable model snapshot {:?}: {}", path, e),
            }
        }

        if let Some(latest) = versions.keys().next_back() {
            info!(
                "Loaded {} model versions from {:?} (latest v{})",
                versions.len(),
                dir,
                latest
            );
        }

        let mut store = Self {
            versions,
            max_versions,
            dir: Some(dir),
        };
        store.prune();
        Ok(store)
    }

    /// Record a version and write its snapshot immediately.
    pub fn record(&mut self, model: &EsgModel) -> FederatedResult<()> {
        match self.stage(model) {
            Some(pending) => pending.write(),
            None => Ok(()),
        }
    }

    /// Record a version in memory only. The returned snapshot carries the
    /// file work (new snapshot plus evicted versions) so callers can run it
    /// after releasing whatever lock guards the store.
    pub fn stage(&mut self, model: &EsgModel) -> Option<PendingSnapshot> {
        self.versions.insert(model.version, model.clone());
        let evicted = self.evict();
        self.dir.as_ref().map(|dir| PendingSnapshot {
            dir: dir.clone(),
            model: model.clone(),
            evicted,
        })
    }

    pub fn latest(&self) -> Option<&EsgModel> {
        self.versions.values().next_back()
    }

    pub fn get(&self, version: u64) -> Option<&EsgModel> {
        self.versions.get(&version)
    }

    pub fn versions(&self) -> Vec<u64> {
        self.versions.keys().copied().collect()
    }

    pub fn models(&self) -> impl Iterator<Item = &EsgModel> {
        self.versions.values()
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    fn prune(&mut self) {
        let evicted = self.evict();
        if let Some(dir) = &self.dir {
            remove_snapshots(dir, &evicted);
        }
    }

    fn evict(&mut self) -> Vec<u64> {
        let mut evicted = Vec::new();
        if self.max_versions == 0 {
            return evicted;
        }
        while self.versions.len() > self.max_versions {
            let Some((version, _)) = self.versions.pop_first() else {
                break;
            };
            evicted.push(version);
        }
        evicted
    }
}

/// Disk writes owed by a [`ModelStore::stage`] call.
#[must_use]
#[derive(Debug)]
pub struct PendingSnapshot {
    dir: PathBuf,
    model: EsgModel,
    evicted: Vec<u64>,
}

impl PendingSnapshot {
    pub fn version(&self) -> u64 {
        self.model.version
    }

    /// Write the snapshot through a temp file and rename, then drop the
    /// files of evicted versions.
    pub fn write(self) -> FederatedResult<()> {
        let path = self.dir.join(file_name(self.model.version));
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&self.model)?)?;
        fs::rename(&tmp, &path)?;
        remove_snapshots(&self.dir, &self.evicted);
        Ok(())
    }
}

fn remove_snapshots(dir: &Path, versions: &[u64]) {
    for version in versions {
        if let Err(e) = fs::remove_file(dir.join(file_name(*version))) {
            warn!("Failed to remove pruned model v{}: {}", version, e);
        }
    }
}

fn file_name(version: u64) -> String {
    format!("{}{}.json", FILE_PREFIX, version)
}
