//! Durable, queryable record of completed matches.
//!
//! The index is a single JSON document (`{version, matches}`) rewritten atomically after each
//! insertion. Raw per-match recordings (see [`crate::recorder`]) stay the source of truth:
//! [`MatchIndex::rebuild`] re-derives the whole index from them when the index file is lost or
//! corrupted.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument, trace, warn};

use crate::recorder::RawMatchRecord;
use crate::simulation::Side;

const INDEX_VERSION: &str = "1.0";

/// One indexed match, keyed by `match_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub match_id: String,
    /// Unix timestamp (seconds) of the start of the match.
    pub timestamp: i64,
    pub p1: String,
    pub p2: String,
    pub match_type: String,
    /// `None` for a draw.
    pub winner: Option<Side>,
    pub final_score: (u32, u32),
    pub duration_frames: u64,
    #[serde(default)]
    pub file_path: Option<PathBuf>,
    #[serde(flatten)]
    pub metadata: BTreeMap<String, Value>,
}

impl IndexEntry {
    pub fn involves(&self, agent_id: &str) -> bool {
        self.p1 == agent_id || self.p2 == agent_id
    }

    /// Name of the winning agent, if any.
    pub fn winner_id(&self) -> Option<&str> {
        match self.winner? {
            Side::Left => Some(&self.p1),
            Side::Right => Some(&self.p2),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    version: String,
    matches: Vec<IndexEntry>,
}

impl Default for IndexFile {
    fn default() -> Self {
        IndexFile {
            version: INDEX_VERSION.to_string(),
            matches: vec![],
        }
    }
}

/// Filters for [`MatchIndex::search`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct MatchQuery {
    pub match_type: Option<String>,
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub winner: Option<String>,
    pub participant: Option<String>,
}

impl MatchQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_match_type(mut self, match_type: impl Into<String>) -> Self {
        self.match_type = Some(match_type.into());
        self
    }

    /// Inclusive time range, in unix seconds.
    pub fn between(mut self, from: i64, to: i64) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn with_winner(mut self, agent_id: impl Into<String>) -> Self {
        self.winner = Some(agent_id.into());
        self
    }

    pub fn with_participant(mut self, agent_id: impl Into<String>) -> Self {
        self.participant = Some(agent_id.into());
        self
    }

    fn matches(&self, entry: &IndexEntry) -> bool {
        self.match_type
            .as_ref()
            .map_or(true, |t| &entry.match_type == t)
            && self.from.map_or(true, |from| entry.timestamp >= from)
            && self.to.map_or(true, |to| entry.timestamp <= to)
            && self
                .winner
                .as_ref()
                .map_or(true, |w| entry.winner_id() == Some(w.as_str()))
            && self
                .participant
                .as_ref()
                .map_or(true, |p| entry.involves(p))
    }
}

/// Aggregate over every indexed match between two agents.
#[derive(Debug, Clone, PartialEq)]
pub struct HeadToHead {
    pub agent_a: String,
    pub agent_b: String,
    pub total_matches: usize,
    pub a_wins: usize,
    pub b_wins: usize,
    pub draws: usize,
    pub matches: Vec<IndexEntry>,
}

#[derive(Debug)]
pub struct MatchIndex {
    path: Option<PathBuf>,
    file: IndexFile,
}

impl MatchIndex {
    /// Index that is never written to disk.
    pub fn in_memory() -> MatchIndex {
        MatchIndex {
            path: None,
            file: IndexFile::default(),
        }
    }

    /// Opens the index at `path`. A missing or unreadable file yields an empty index.
    #[instrument]
    pub fn open(path: impl AsRef<Path> + std::fmt::Debug) -> MatchIndex {
        let path = path.as_ref().to_path_buf();
        let file = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("match index {path:?} is corrupted ({e}), starting empty");
                IndexFile::default()
            }),
            Err(_) => IndexFile::default(),
        };
        MatchIndex {
            path: Some(path),
            file,
        }
    }

    fn save(&self) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("could not create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(&self.file)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).with_context(|| format!("could not write {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("could not replace {}", path.display()))?;
        Ok(())
    }

    /// Adds `entry` unless its match id is already indexed. Returns whether it was inserted.
    pub fn index(&mut self, entry: IndexEntry) -> anyhow::Result<bool> {
        if self.contains(&entry.match_id) {
            trace!(match_id = %entry.match_id, "already indexed");
            return Ok(false);
        }
        trace!(match_id = %entry.match_id, "indexing match");
        self.file.matches.push(entry);
        self.save()?;
        Ok(true)
    }

    pub fn contains(&self, match_id: &str) -> bool {
        self.file.matches.iter().any(|m| m.match_id == match_id)
    }

    pub fn get(&self, match_id: &str) -> Option<&IndexEntry> {
        self.file.matches.iter().find(|m| m.match_id == match_id)
    }

    pub fn len(&self) -> usize {
        self.file.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.file.matches.is_empty()
    }

    /// Matches involving `agent_id`, most recent first.
    pub fn by_participant(&self, agent_id: &str) -> Vec<IndexEntry> {
        self.search(&MatchQuery::new().with_participant(agent_id))
    }

    /// Matches satisfying every filter of `query`, most recent first.
    pub fn search(&self, query: &MatchQuery) -> Vec<IndexEntry> {
        let mut found: Vec<_> = self
            .file
            .matches
            .iter()
            .filter(|m| query.matches(m))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        found
    }

    /// The `limit` most recent matches, optionally of one type.
    pub fn recent(&self, limit: usize, match_type: Option<&str>) -> Vec<IndexEntry> {
        let mut query = MatchQuery::new();
        if let Some(t) = match_type {
            query = query.with_match_type(t);
        }
        let mut found = self.search(&query);
        found.truncate(limit);
        found
    }

    pub fn head_to_head(&self, agent_a: &str, agent_b: &str) -> HeadToHead {
        let matches: Vec<_> = self
            .file
            .matches
            .iter()
            .filter(|m| {
                (m.p1 == agent_a && m.p2 == agent_b) || (m.p1 == agent_b && m.p2 == agent_a)
            })
            .cloned()
            .collect();

        let (mut a_wins, mut b_wins, mut draws) = (0, 0, 0);
        for m in &matches {
            match m.winner_id() {
                Some(w) if w == agent_a => a_wins += 1,
                Some(_) => b_wins += 1,
                None => draws += 1,
            }
        }

        HeadToHead {
            agent_a: agent_a.to_string(),
            agent_b: agent_b.to_string(),
            total_matches: matches.len(),
            a_wins,
            b_wins,
            draws,
            matches,
        }
    }

    /// Re-derives the index from the raw match records found in `matches_dir`.
    ///
    /// Unreadable records are skipped with a warning. Returns the number of indexed matches.
    #[instrument(skip(self))]
    pub fn rebuild(&mut self, matches_dir: &Path) -> anyhow::Result<usize> {
        let mut file = IndexFile::default();

        if matches_dir.is_dir() {
            let mut paths: Vec<_> = fs::read_dir(matches_dir)
                .with_context(|| format!("could not read {}", matches_dir.display()))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                .collect();
            paths.sort();

            for path in paths {
                let record = fs::read_to_string(&path)
                    .map_err(anyhow::Error::from)
                    .and_then(|s| Ok(serde_json::from_str::<RawMatchRecord>(&s)?));
                match record {
                    Ok(record) => {
                        let entry = record.index_entry(&path);
                        if !file.matches.iter().any(|m| m.match_id == entry.match_id) {
                            file.matches.push(entry);
                        }
                    }
                    Err(e) => warn!("skipping match record {}: {e}", path.display()),
                }
            }
        }

        self.file = file;
        self.save()?;
        info!("match index rebuilt with {} matches", self.len());
        Ok(self.len())
    }
}
