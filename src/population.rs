//! The agent population a tournament works on.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::rating::DEFAULT_INITIAL_RATING;

/// One agent of the population, as seen by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopulationEntry {
    pub agent_id: String,
    /// Fitness stored by the training loop that produced the agent.
    pub fitness: f64,
    /// Current Elo rating. For rated agents the scheduler overwrites it from its
    /// [`RatingRegistry`](crate::rating::RatingRegistry); ghosts play at the rating given here.
    pub rating: f64,
    /// Whether the agent's descriptor is still on disk.
    pub file_present: bool,
    /// Ghost opponents play matches but are never rated nor deleted.
    pub ghost: bool,
}

impl PopulationEntry {
    pub fn new(agent_id: impl Into<String>, fitness: f64) -> PopulationEntry {
        PopulationEntry {
            agent_id: agent_id.into(),
            fitness,
            rating: DEFAULT_INITIAL_RATING,
            file_present: true,
            ghost: false,
        }
    }

    pub fn with_rating(mut self, rating: f64) -> Self {
        self.rating = rating;
        self
    }

    pub fn as_ghost(mut self) -> Self {
        self.ghost = true;
        self
    }
}

/// Source of the population and sink of its deletions.
pub trait PopulationProvider: Send + Sync {
    fn enumerate(&self) -> anyhow::Result<Vec<PopulationEntry>>;

    /// Removes an agent from the on-disk inventory. Deleting an unknown agent is not an error.
    fn delete(&self, agent_id: &str) -> anyhow::Result<()>;
}

/// Population held in memory.
#[derive(Debug, Default)]
pub struct StaticPopulation {
    entries: Mutex<Vec<PopulationEntry>>,
}

impl StaticPopulation {
    pub fn new(entries: Vec<PopulationEntry>) -> StaticPopulation {
        StaticPopulation {
            entries: Mutex::new(entries),
        }
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|e| e.agent_id.clone())
            .collect()
    }
}

impl PopulationProvider for StaticPopulation {
    fn enumerate(&self) -> anyhow::Result<Vec<PopulationEntry>> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }

    fn delete(&self, agent_id: &str) -> anyhow::Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|e| e.agent_id != agent_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_population_deletes() {
        let population = StaticPopulation::new(vec![
            PopulationEntry::new("a", 1.0),
            PopulationEntry::new("b", 2.0).as_ghost(),
        ]);
        population.delete("a").unwrap();
        population.delete("missing").unwrap();
        let entries = population.enumerate().unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].ghost);
        assert_eq!(population.ids(), vec!["b".to_string()]);
    }
}
