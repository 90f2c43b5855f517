//! Elo ratings.
//!
//! The functions here are pure. [`RatingRegistry`] is the persistent agent → rating map; it is
//! only ever mutated from the scheduler thread.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use tracing::{debug, warn};

pub const DEFAULT_K_FACTOR: f64 = 32.0;
pub const DEFAULT_INITIAL_RATING: f64 = 1200.0;

/// Probability that a player rated `a` beats a player rated `b`.
pub fn expected(a: f64, b: f64) -> f64 {
    1.0 / (1.0 + 10f64.powf((b - a) / 400.0))
}

/// Result of a match from the left player's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Win,
    Loss,
    Draw,
}

impl Outcome {
    pub fn from_scores(left: u32, right: u32) -> Outcome {
        match left.cmp(&right) {
            std::cmp::Ordering::Greater => Outcome::Win,
            std::cmp::Ordering::Less => Outcome::Loss,
            std::cmp::Ordering::Equal => Outcome::Draw,
        }
    }

    pub fn actual(self) -> f64 {
        match self {
            Outcome::Win => 1.0,
            Outcome::Loss => 0.0,
            Outcome::Draw => 0.5,
        }
    }

    pub fn reversed(self) -> Outcome {
        match self {
            Outcome::Win => Outcome::Loss,
            Outcome::Loss => Outcome::Win,
            Outcome::Draw => Outcome::Draw,
        }
    }
}

/// New ratings of both players after one match.
pub fn exchange(left: f64, right: f64, outcome: Outcome, k: f64) -> (f64, f64) {
    let new_left = left + k * (outcome.actual() - expected(left, right));
    let new_right = right + k * (outcome.reversed().actual() - expected(right, left));
    (new_left, new_right)
}

/// Persistent map of agent id → rating, stored as pretty JSON.
#[derive(Debug, Default)]
pub struct RatingRegistry {
    path: Option<PathBuf>,
    initial: f64,
    ratings: BTreeMap<String, f64>,
}

impl RatingRegistry {
    pub fn in_memory() -> RatingRegistry {
        RatingRegistry {
            path: None,
            initial: DEFAULT_INITIAL_RATING,
            ratings: BTreeMap::new(),
        }
    }

    /// Loads the registry stored at `path`. A missing or unreadable file gives an empty
    /// registry that will be written back on [`save`](Self::save). A corrupt file is first moved
    /// to `<path>.corrupt`.
    pub fn load(path: impl AsRef<Path>) -> RatingRegistry {
        let path = path.as_ref();
        let ratings = match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                let backup = corrupt_backup(path);
                match fs::rename(path, &backup) {
                    Ok(()) => warn!(
                        "corrupt rating file {} moved to {}, starting empty: {e}",
                        path.display(),
                        backup.display()
                    ),
                    Err(io) => warn!(
                        "corrupt rating file {} could not be set aside ({io}), starting empty: {e}",
                        path.display()
                    ),
                }
                BTreeMap::new()
            }),
            Err(_) => {
                debug!("no rating file at {}", path.display());
                BTreeMap::new()
            }
        };
        RatingRegistry {
            path: Some(path.to_path_buf()),
            initial: DEFAULT_INITIAL_RATING,
            ratings,
        }
    }

    pub fn with_initial_rating(mut self, initial: f64) -> Self {
        self.initial = initial;
        self
    }

    pub fn initial_rating(&self) -> f64 {
        self.initial
    }

    /// Rating of `agent_id`, or the initial rating for unknown agents.
    pub fn get(&self, agent_id: &str) -> f64 {
        self.ratings.get(agent_id).copied().unwrap_or(self.initial)
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.ratings.contains_key(agent_id)
    }

    pub fn set(&mut self, agent_id: impl Into<String>, rating: f64) {
        self.ratings.insert(agent_id.into(), rating);
    }

    pub fn remove(&mut self, agent_id: &str) -> Option<f64> {
        self.ratings.remove(agent_id)
    }

    pub fn len(&self) -> usize {
        self.ratings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ratings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.ratings.iter().map(|(id, r)| (id.as_str(), *r))
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&self.ratings)?;
        fs::write(path, content)
            .with_context(|| format!("could not write ratings to {}", path.display()))
    }
}

fn corrupt_backup(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".corrupt");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_ratings_win() {
        let (a, b) = exchange(1200.0, 1200.0, Outcome::Win, 32.0);
        assert_eq!(a, 1216.0);
        assert_eq!(b, 1184.0);
    }

    #[test]
    fn exchange_is_conserved() {
        for (l, r, outcome) in [
            (1500.0, 1100.0, Outcome::Loss),
            (1000.0, 1800.0, Outcome::Win),
            (1340.5, 1290.25, Outcome::Draw),
        ] {
            let (nl, nr) = exchange(l, r, outcome, DEFAULT_K_FACTOR);
            assert!((nl + nr - (l + r)).abs() < 1e-9);
        }
    }

    #[test]
    fn draw_moves_ratings_together() {
        let (a, b) = exchange(1400.0, 1200.0, Outcome::Draw, 32.0);
        assert!(a < 1400.0);
        assert!(b > 1200.0);
        assert!((expected(1300.0, 1300.0) - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn registry_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("elo_ratings.json");

        let mut registry = RatingRegistry::load(&path);
        assert!(registry.is_empty());
        assert_eq!(registry.get("a"), DEFAULT_INITIAL_RATING);
        registry.set("a", 1250.5);
        registry.set("b", 1100.0);
        registry.remove("b");
        registry.save().unwrap();

        let registry = RatingRegistry::load(&path);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("a"), 1250.5);
    }

    #[test]
    fn corrupt_file_is_set_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("elo_ratings.json");
        fs::write(&path, "{not json").unwrap();
        let mut registry = RatingRegistry::load(&path);
        assert!(registry.is_empty());

        registry.set("a", 1300.0);
        registry.save().unwrap();
        let backup = dir.path().join("elo_ratings.json.corrupt");
        assert_eq!(fs::read_to_string(backup).unwrap(), "{not json");
        assert_eq!(RatingRegistry::load(&path).get("a"), 1300.0);
    }
}
