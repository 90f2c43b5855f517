//! Agents stored as descriptor files in a directory.
//!
//! Each agent is a `<id>.json` file holding its fitness and the parameters of a built-in agent:
//!
//! ```json
//! { "fitness": 412.5, "kind": "tracker", "dead_zone": 8.0, "lookahead": 3.0 }
//! ```
//!
//! Ghost opponents also carry the rating they play at, e.g. `"ghost": true, "rating": 1600.0`.
//!
//! [`AgentDirectory`] is both the [`AgentProvider`] used by the workers and the
//! [`PopulationProvider`] used by the scheduler.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::agent::{AgentHandle, AgentProvider, AgentSpec};
use crate::error::EngineError;
use crate::population::{PopulationEntry, PopulationProvider};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    #[serde(default)]
    pub fitness: f64,
    #[serde(default)]
    pub ghost: bool,
    /// Fixed rating of a ghost. Rated agents take theirs from the rating registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    #[serde(flatten)]
    pub spec: AgentSpec,
}

impl AgentDescriptor {
    pub fn new(fitness: f64, spec: AgentSpec) -> AgentDescriptor {
        AgentDescriptor {
            fitness,
            ghost: false,
            rating: None,
            spec,
        }
    }

    pub fn ghost(rating: f64, spec: AgentSpec) -> AgentDescriptor {
        AgentDescriptor {
            fitness: 0.0,
            ghost: true,
            rating: Some(rating),
            spec,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentDirectory {
    directory: PathBuf,
}

impl AgentDirectory {
    #[instrument]
    pub fn open(directory: impl AsRef<Path> + std::fmt::Debug) -> anyhow::Result<AgentDirectory> {
        let directory = directory.as_ref();
        if !Path::is_dir(directory) {
            bail!("'{directory:?}' is not a valid directory");
        }
        Ok(AgentDirectory {
            directory: directory.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.directory
    }

    fn descriptor_path(&self, agent_id: &str) -> PathBuf {
        self.directory.join(format!("{agent_id}.json"))
    }

    pub fn read(&self, agent_id: &str) -> anyhow::Result<AgentDescriptor> {
        let path = self.descriptor_path(agent_id);
        let content =
            fs::read_to_string(&path).with_context(|| format!("could not read {path:?}"))?;
        serde_json::from_str(&content).with_context(|| format!("invalid agent descriptor {path:?}"))
    }

    pub fn write(&self, agent_id: &str, descriptor: &AgentDescriptor) -> anyhow::Result<()> {
        let path = self.descriptor_path(agent_id);
        let content = serde_json::to_string_pretty(descriptor)?;
        fs::write(&path, content).with_context(|| format!("could not write {path:?}"))
    }
}

impl AgentProvider for AgentDirectory {
    fn load(&self, id: &str) -> Result<AgentHandle, EngineError> {
        match self.read(id) {
            Ok(descriptor) => Ok(descriptor.spec.build()),
            Err(e) => {
                debug!("agent '{id}' not loaded: {e:#}");
                Err(EngineError::AgentNotFound(id.to_string()))
            }
        }
    }
}

impl PopulationProvider for AgentDirectory {
    fn enumerate(&self) -> anyhow::Result<Vec<PopulationEntry>> {
        let mut entries = Vec::new();
        let dir = fs::read_dir(&self.directory)
            .with_context(|| format!("could not list {:?}", self.directory))?;
        for item in dir {
            let Ok(item) = item else {
                warn!("one entry cannot be read in {:?}", self.directory);
                continue;
            };
            let path = item.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let Some(agent_id) = path.file_stem().and_then(|s| s.to_str()) else {
                warn!("name error: {:?}", item.file_name());
                continue;
            };
            match self.read(agent_id) {
                Ok(descriptor) => {
                    let mut entry = PopulationEntry::new(agent_id, descriptor.fitness);
                    entry.ghost = descriptor.ghost;
                    if let Some(rating) = descriptor.rating {
                        entry.rating = rating;
                    }
                    entries.push(entry);
                }
                Err(e) => warn!("skipping agent '{agent_id}': {e:#}"),
            }
        }
        entries.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(entries)
    }

    fn delete(&self, agent_id: &str) -> anyhow::Result<()> {
        let path = self.descriptor_path(agent_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("'{agent_id}' already gone");
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("could not delete {path:?}")),
        }
    }
}
