//! What a tournament leaves behind: its summary, the deletion log and the league history.

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::tournament_strategy::{DeletionReason, Standing, TournamentRecord};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionOutcome {
    Completed,
    Cancelled,
    /// The match queue was abandoned after repeated worker crashes.
    Aborted { reason: String },
}

/// An agent removed from the population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletionRecord {
    pub agent_id: String,
    #[serde(flatten)]
    pub reason: DeletionReason,
    pub timestamp: i64,
}

impl DeletionRecord {
    pub fn now(agent_id: impl Into<String>, reason: DeletionReason) -> DeletionRecord {
        DeletionRecord {
            agent_id: agent_id.into(),
            reason,
            timestamp: OffsetDateTime::now_utc().unix_timestamp(),
        }
    }
}

/// Summary of one tournament.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TournamentSession {
    pub started: i64,
    pub finished: i64,
    pub outcome: SessionOutcome,
    pub participants: usize,
    pub matches_scheduled: usize,
    pub matches_played: usize,
    /// Pairings dropped because an agent was missing or had been deleted.
    pub matches_skipped: usize,
    /// Matches that timed out, counted as 0-0 without rating change.
    pub matches_inconclusive: usize,
    pub deletions: Vec<DeletionRecord>,
    /// Survivors, best rating first.
    pub rankings: Vec<Standing>,
}

impl TournamentSession {
    pub fn cancelled(&self) -> bool {
        self.outcome == SessionOutcome::Cancelled
    }

    /// Best rated survivor that is not a ghost.
    pub fn champion(&self) -> Option<&Standing> {
        self.rankings.iter().find(|s| !s.ghost)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        write_json(path, self)
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(value)?)
        .with_context(|| format!("could not write {}", path.display()))
}

/// Append-only JSON-lines log of deletions.
#[derive(Debug, Clone)]
pub struct DeletionLog {
    path: PathBuf,
}

impl DeletionLog {
    pub fn new(path: impl Into<PathBuf>) -> DeletionLog {
        DeletionLog { path: path.into() }
    }

    pub fn append(&self, record: &DeletionRecord) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("could not open {}", self.path.display()))?;
        writeln!(file, "{}", serde_json::to_string(record)?)?;
        Ok(())
    }

    /// Every readable record, oldest first. Malformed lines are skipped.
    pub fn read_all(&self) -> anyhow::Result<Vec<DeletionRecord>> {
        if !self.path.exists() {
            return Ok(vec![]);
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("could not read {}", self.path.display()))?;
        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("malformed deletion record skipped: {e}");
                    None
                }
            })
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChampionRecord {
    pub agent_id: String,
    pub rating: f64,
    pub timestamp: i64,
    pub record: TournamentRecord,
}

/// Champions of every completed tournament and the best rating ever reached.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeagueHistory {
    pub all_time_leader: Option<ChampionRecord>,
    pub champions: Vec<ChampionRecord>,
}

impl LeagueHistory {
    /// Loads the history, starting fresh when the file is missing or corrupt.
    pub fn load(path: impl AsRef<Path>) -> LeagueHistory {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("corrupt league history {}, starting fresh: {e}", path.display());
                LeagueHistory::default()
            }),
            Err(_) => LeagueHistory::default(),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        write_json(path.as_ref(), self)
    }

    /// Adds the champion of a completed session. Returns `true` when it is a new all-time leader.
    pub fn record_session(&mut self, session: &TournamentSession) -> bool {
        if session.outcome != SessionOutcome::Completed {
            return false;
        }
        let Some(champion) = session.champion() else {
            return false;
        };
        let entry = ChampionRecord {
            agent_id: champion.agent_id.clone(),
            rating: champion.rating,
            timestamp: session.finished,
            record: champion.record,
        };
        self.champions.push(entry.clone());

        let new_leader = self
            .all_time_leader
            .as_ref()
            .map_or(true, |leader| entry.rating > leader.rating);
        if new_leader {
            info!(
                "new all-time leader: {} ({:.1})",
                entry.agent_id, entry.rating
            );
            self.all_time_leader = Some(entry);
        }
        new_leader
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(outcome: SessionOutcome, champion: (&str, f64)) -> TournamentSession {
        TournamentSession {
            started: 0,
            finished: 10,
            outcome,
            participants: 2,
            matches_scheduled: 1,
            matches_played: 1,
            matches_skipped: 0,
            matches_inconclusive: 0,
            deletions: vec![],
            rankings: vec![Standing {
                agent_id: champion.0.to_string(),
                rating: champion.1,
                fitness: 0.0,
                ghost: false,
                record: TournamentRecord::default(),
            }],
        }
    }

    #[test]
    fn deletion_log_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = DeletionLog::new(dir.path().join("deletions.jsonl"));
        assert!(log.read_all().unwrap().is_empty());

        log.append(&DeletionRecord::now(
            "a",
            DeletionReason::NotInTopN { rank: 11, n: 10 },
        ))
        .unwrap();
        log.append(&DeletionRecord::now(
            "b",
            DeletionReason::LowFitness {
                fitness: 1.0,
                threshold: 2.0,
            },
        ))
        .unwrap();

        let content = fs::read_to_string(dir.path().join("deletions.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.lines().next().unwrap().contains(r#""reason":"not_in_top_n""#));

        let records = log.read_all().unwrap();
        assert_eq!(records[1].agent_id, "b");
        assert!(matches!(records[1].reason, DeletionReason::LowFitness { .. }));
    }

    #[test]
    fn history_tracks_the_all_time_leader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("league_history.json");

        let mut history = LeagueHistory::load(&path);
        assert!(history.record_session(&session(SessionOutcome::Completed, ("a", 1300.0))));
        assert!(!history.record_session(&session(SessionOutcome::Completed, ("b", 1250.0))));
        assert!(!history.record_session(&session(SessionOutcome::Cancelled, ("c", 2000.0))));
        history.save(&path).unwrap();

        let history = LeagueHistory::load(&path);
        assert_eq!(history.champions.len(), 2);
        assert_eq!(history.all_time_leader.unwrap().agent_id, "a");
    }
}
