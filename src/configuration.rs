//! Config for the league behaviors
//!
//! Two layers exist:
//! - [`Configuration`] controls how the engine runs (output, logging, directories, worker pool,
//!   timeouts). It is created programmatically with [`Configuration::new()`] or read from
//!   environment variables with [`Configuration::from_env()`].
//! - [`TournamentSettings`] controls what a tournament does (filtering, retention, Elo). It is
//!   persisted in the versioned `settings.json` file handled by [`LeagueSettings`].
//!
//! # Environment Variables
//!
//! All values are optional. Flags are case-insensitive, set them to `"true"` to enable.
//!
//! - `LEAGUE_VERBOSE` — Print match progress to stdout (default: `true`)
//! - `LEAGUE_LOG` — Enable logging to a file (default: `false`)
//! - `LEAGUE_DATA_DIR` — Directory holding ratings, index, recordings and history (default: `league_data`)
//! - `LEAGUE_AGENTS_DIR` — Directory of agent descriptors (default: `<data dir>/agents`)
//! - `LEAGUE_WORKERS` — Number of concurrent matches (default: number of CPUs minus one)
//! - `LEAGUE_STARTUP_TIMEOUT_MS`, `LEAGUE_MATCH_TIMEOUT_MS`, `LEAGUE_STOP_GRACE_MS` — Worker timeouts
//! - `LEAGUE_CACHE_CAPACITY` — Agents cached per worker (default: `50`)

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::agent::AgentCache;
use crate::rating::{DEFAULT_INITIAL_RATING, DEFAULT_K_FACTOR};
use crate::worker::{WorkerMode, WorkerSettings};

/// Runtime configuration of the league.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub(crate) verbose: bool,
    pub(crate) log: bool,
    pub(crate) data_dir: PathBuf,
    pub(crate) agents_dir: Option<PathBuf>,
    pub(crate) workers: usize,
    pub(crate) startup_timeout: Duration,
    pub(crate) match_timeout: Duration,
    pub(crate) stop_grace: Duration,
    pub(crate) cache_capacity: usize,
}

fn default_workers() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}

impl Configuration {
    /// Create a new configuration with default parameters.
    ///
    /// By default:
    /// - Match progress is printed to stdout.
    /// - Logging to file is disabled.
    /// - Data lives in `./league_data`, agents in `./league_data/agents`.
    /// - One worker per CPU is used, keeping one CPU for the scheduler.
    pub fn new() -> Self {
        Self {
            verbose: true,
            log: false,
            data_dir: PathBuf::from("league_data"),
            agents_dir: None,
            workers: default_workers(),
            startup_timeout: WorkerSettings::DEFAULT_STARTUP_TIMEOUT,
            match_timeout: WorkerSettings::DEFAULT_MATCH_TIMEOUT,
            stop_grace: WorkerSettings::DEFAULT_STOP_GRACE,
            cache_capacity: AgentCache::DEFAULT_CAPACITY,
        }
    }

    /// Create configuration from environment variables (see module documentation).
    ///
    /// Unset or unparsable variables keep their default value.
    pub fn from_env() -> Self {
        fn get_env_flag(var: &str, default: bool) -> bool {
            match std::env::var(var) {
                Ok(val) => val.eq_ignore_ascii_case("true"),
                Err(_) => default,
            }
        }

        fn get_env_number(var: &str, default: u64) -> u64 {
            std::env::var(var)
                .ok()
                .and_then(|val| val.trim().parse().ok())
                .unwrap_or(default)
        }

        fn get_env_millis(var: &str, default: Duration) -> Duration {
            Duration::from_millis(get_env_number(var, default.as_millis() as u64))
        }

        let defaults = Self::new();
        Self {
            verbose: get_env_flag("LEAGUE_VERBOSE", true),
            log: get_env_flag("LEAGUE_LOG", false),
            data_dir: std::env::var_os("LEAGUE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            agents_dir: std::env::var_os("LEAGUE_AGENTS_DIR").map(PathBuf::from),
            workers: (get_env_number("LEAGUE_WORKERS", defaults.workers as u64) as usize).max(1),
            startup_timeout: get_env_millis("LEAGUE_STARTUP_TIMEOUT_MS", defaults.startup_timeout),
            match_timeout: get_env_millis("LEAGUE_MATCH_TIMEOUT_MS", defaults.match_timeout),
            stop_grace: get_env_millis("LEAGUE_STOP_GRACE_MS", defaults.stop_grace),
            cache_capacity: get_env_number("LEAGUE_CACHE_CAPACITY", defaults.cache_capacity as u64)
                as usize,
        }
    }

    /// Enable or disable silent mode.
    pub fn with_verbose(mut self, value: bool) -> Self {
        self.verbose = value;
        self
    }

    /// Enable or disable logging to file.
    pub fn with_log(mut self, value: bool) -> Self {
        self.log = value;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_agents_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.agents_dir = Some(dir.into());
        self
    }

    /// Number of matches played concurrently, at least one.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_match_timeout(mut self, timeout: Duration) -> Self {
        self.match_timeout = timeout;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn log(&self) -> bool {
        self.log
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.agents_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("agents"))
    }

    pub fn ratings_path(&self) -> PathBuf {
        self.data_dir.join("elo_ratings.json")
    }

    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join("match_index.json")
    }

    pub fn matches_dir(&self) -> PathBuf {
        self.data_dir.join("matches")
    }

    pub fn deletions_path(&self) -> PathBuf {
        self.data_dir.join("deletions.jsonl")
    }

    pub fn history_path(&self) -> PathBuf {
        self.data_dir.join("league_history.json")
    }

    pub fn last_session_path(&self) -> PathBuf {
        self.data_dir.join("last_session.json")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join("settings.json")
    }

    /// Settings of the batch workers used by the scheduler.
    pub fn worker_settings(&self, tournament: &TournamentSettings) -> WorkerSettings {
        let settings = WorkerSettings::new(WorkerMode::Batch)
            .with_startup_timeout(self.startup_timeout)
            .with_match_timeout(self.match_timeout)
            .with_stop_grace(self.stop_grace)
            .with_cache_capacity(self.cache_capacity)
            .with_target_score(tournament.target_score)
            .with_seed(tournament.seed);
        if tournament.record_matches {
            settings.with_recordings_dir(self.matches_dir())
        } else {
            settings
        }
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}

/// What a tournament does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TournamentSettings {
    /// Agents below this stored fitness are deleted before pairing.
    pub min_fitness_threshold: f64,
    /// Width of the rating buckets used by similarity pruning. `0` disables it.
    pub similarity_threshold: f64,
    pub delete_on_shutout: bool,
    /// Minimum score gap for a shutout to trigger a deletion.
    pub shutout_score_gap: u32,
    /// Survivors kept after pruning. `0` keeps everyone.
    pub retain_top_n: usize,
    pub target_score: u32,
    pub k_factor: f64,
    pub initial_rating: f64,
    pub record_matches: bool,
    pub early_termination: bool,
    pub seed: u64,
}

impl Default for TournamentSettings {
    fn default() -> Self {
        TournamentSettings {
            min_fitness_threshold: 0.0,
            similarity_threshold: 10.0,
            delete_on_shutout: true,
            shutout_score_gap: 5,
            retain_top_n: 10,
            target_score: 5,
            k_factor: DEFAULT_K_FACTOR,
            initial_rating: DEFAULT_INITIAL_RATING,
            record_matches: false,
            early_termination: true,
            seed: 0,
        }
    }
}

impl TournamentSettings {
    pub fn with_min_fitness(mut self, threshold: f64) -> Self {
        self.min_fitness_threshold = threshold;
        self
    }

    pub fn with_similarity_threshold(mut self, similarity: f64) -> Self {
        self.similarity_threshold = similarity;
        self
    }

    pub fn with_delete_on_shutout(mut self, value: bool) -> Self {
        self.delete_on_shutout = value;
        self
    }

    pub fn with_retain_top_n(mut self, n: usize) -> Self {
        self.retain_top_n = n;
        self
    }

    pub fn with_target_score(mut self, target_score: u32) -> Self {
        self.target_score = target_score.max(1);
        self
    }

    pub fn with_k_factor(mut self, k: f64) -> Self {
        self.k_factor = k;
        self
    }

    pub fn with_record_matches(mut self, value: bool) -> Self {
        self.record_matches = value;
        self
    }

    pub fn with_early_termination(mut self, value: bool) -> Self {
        self.early_termination = value;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// The `settings.json` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeagueSettings {
    pub version: u32,
    #[serde(default)]
    pub tournament: TournamentSettings,
}

impl LeagueSettings {
    pub const VERSION: u32 = 1;

    /// Loads the settings file. A missing file gives the defaults, an unknown version is an error.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<LeagueSettings> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("no settings file at {}, using defaults", path.display());
            return Ok(LeagueSettings::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("could not read {}", path.display()))?;
        let settings: LeagueSettings = serde_json::from_str(&content)
            .with_context(|| format!("invalid settings file {}", path.display()))?;
        if settings.version != Self::VERSION {
            bail!(
                "unsupported settings version {} in {} (expected {})",
                settings.version,
                path.display(),
                Self::VERSION
            );
        }
        info!("settings loaded from {}", path.display());
        Ok(settings)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("could not write {}", path.display()))
    }
}

impl Default for LeagueSettings {
    fn default() -> Self {
        LeagueSettings {
            version: Self::VERSION,
            tournament: TournamentSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Configuration::new();
        assert!(config.workers() >= 1);
        assert_eq!(config.agents_dir(), PathBuf::from("league_data/agents"));

        let settings = TournamentSettings::default();
        assert_eq!(settings.retain_top_n, 10);
        assert_eq!(settings.k_factor, 32.0);
        assert_eq!(settings.initial_rating, 1200.0);
    }

    #[test]
    fn settings_round_trip_and_partial_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        assert_eq!(LeagueSettings::load(&path).unwrap(), LeagueSettings::default());

        fs::write(
            &path,
            r#"{"version": 1, "tournament": {"retain_top_n": 3, "min_fitness_threshold": 200}}"#,
        )
        .unwrap();
        let settings = LeagueSettings::load(&path).unwrap();
        assert_eq!(settings.tournament.retain_top_n, 3);
        assert_eq!(settings.tournament.min_fitness_threshold, 200.0);
        assert_eq!(settings.tournament.similarity_threshold, 10.0);

        settings.save(&path).unwrap();
        assert_eq!(LeagueSettings::load(&path).unwrap(), settings);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"version": 2}"#).unwrap();
        let err = LeagueSettings::load(&path).unwrap_err();
        assert!(err.to_string().contains("unsupported settings version 2"));
    }

    #[test]
    fn worker_settings_follow_the_tournament() {
        let config = Configuration::new().with_data_dir("/tmp/league");
        let settings = TournamentSettings::default()
            .with_record_matches(true)
            .with_target_score(7);
        let worker = config.worker_settings(&settings);
        assert_eq!(worker.target_score, 7);
        assert_eq!(worker.mode, WorkerMode::Batch);
        assert_eq!(
            worker.recordings_dir,
            Some(PathBuf::from("/tmp/league/matches"))
        );
    }
}
