//! Frame-by-frame match recordings.
//!
//! Each recorded match is written to its own JSON file in the matches directory. Those files are
//! the raw records the [`MatchIndex`](crate::match_index::MatchIndex) is derived from.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::info;

use crate::match_index::IndexEntry;
use crate::match_runner::FrameObserver;
use crate::simulation::{FrameState, Side};

/// Compact frame, rounded to keep recordings small.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecordedFrame {
    pub f: u64,
    pub bx: f32,
    pub by: f32,
    pub bvx: f32,
    pub bvy: f32,
    pub ply: f32,
    pub pry: f32,
    pub sl: u32,
    pub sr: u32,
}

fn round_to(value: f32, decimals: i32) -> f32 {
    let factor = 10f32.powi(decimals);
    (value * factor).round() / factor
}

impl From<&FrameState> for RecordedFrame {
    fn from(frame: &FrameState) -> Self {
        RecordedFrame {
            f: frame.frame,
            bx: round_to(frame.ball_x, 1),
            by: round_to(frame.ball_y, 1),
            bvx: round_to(frame.ball_vel_x, 2),
            bvy: round_to(frame.ball_vel_y, 2),
            ply: round_to(frame.paddle_left_y, 1),
            pry: round_to(frame.paddle_right_y, 1),
            sl: frame.score_left,
            sr: frame.score_right,
        }
    }
}

/// On-disk layout of a recorded match. Every field is optional when reading so that partial or
/// older records can still be indexed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawMatchRecord {
    pub match_id: Option<String>,
    pub p1: String,
    pub p2: String,
    pub match_type: Option<String>,
    pub timestamp: i64,
    pub total_frames: u64,
    pub winner: Option<Side>,
    pub final_score: (u32, u32),
    pub metadata: BTreeMap<String, Value>,
    pub frames: Vec<RecordedFrame>,
}

impl RawMatchRecord {
    /// Index entry for this record. Records without a match id are keyed by file name.
    pub fn index_entry(&self, path: &Path) -> IndexEntry {
        let match_id = self.match_id.clone().unwrap_or_else(|| {
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        });
        IndexEntry {
            match_id,
            timestamp: self.timestamp,
            p1: self.p1.clone(),
            p2: self.p2.clone(),
            match_type: self
                .match_type
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            winner: self.winner,
            final_score: self.final_score,
            duration_frames: self.total_frames,
            file_path: Some(path.to_path_buf()),
            metadata: self.metadata.clone(),
        }
    }
}

/// Observer collecting frames for one match.
#[derive(Debug)]
pub struct MatchRecorder {
    match_id: String,
    p1: String,
    p2: String,
    match_type: String,
    metadata: BTreeMap<String, Value>,
    started: OffsetDateTime,
    frames: Vec<RecordedFrame>,
}

/// Short random match id: 8 lowercase hex characters.
pub fn new_match_id() -> String {
    format!("{:08x}", rand::rng().random::<u32>())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '_' | '-'))
        .take(30)
        .collect::<String>()
        .trim()
        .to_string()
}

impl MatchRecorder {
    pub fn new(
        p1: impl Into<String>,
        p2: impl Into<String>,
        match_type: impl Into<String>,
        metadata: BTreeMap<String, Value>,
    ) -> MatchRecorder {
        MatchRecorder {
            match_id: new_match_id(),
            p1: p1.into(),
            p2: p2.into(),
            match_type: match_type.into(),
            metadata,
            started: OffsetDateTime::now_utc(),
            frames: vec![],
        }
    }

    pub fn match_id(&self) -> &str {
        &self.match_id
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    fn file_name(&self) -> String {
        format!(
            "match_{}_{}_{}_vs_{}.json",
            self.started.unix_timestamp(),
            self.match_id,
            sanitize(&self.p1),
            sanitize(&self.p2)
        )
    }

    /// Writes the recording into `dir` and returns its index entry.
    ///
    /// Returns `Ok(None)` when no frame was recorded.
    pub fn save(self, dir: &Path, final_score: (u32, u32)) -> anyhow::Result<Option<IndexEntry>> {
        if self.frames.is_empty() {
            return Ok(None);
        }
        fs::create_dir_all(dir).with_context(|| format!("could not create {}", dir.display()))?;
        let path: PathBuf = dir.join(self.file_name());

        let winner = match final_score.0.cmp(&final_score.1) {
            std::cmp::Ordering::Greater => Some(Side::Left),
            std::cmp::Ordering::Less => Some(Side::Right),
            std::cmp::Ordering::Equal => None,
        };
        let record = RawMatchRecord {
            match_id: Some(self.match_id),
            p1: self.p1,
            p2: self.p2,
            match_type: Some(self.match_type),
            timestamp: self.started.unix_timestamp(),
            total_frames: self.frames.len() as u64,
            winner,
            final_score,
            metadata: self.metadata,
            frames: self.frames,
        };
        let content = serde_json::to_string(&record)?;
        fs::write(&path, content)
            .with_context(|| format!("could not write match recording {}", path.display()))?;
        info!("match recording saved: {}", path.display());

        Ok(Some(record.index_entry(&path)))
    }
}

impl FrameObserver for MatchRecorder {
    fn observe(&mut self, frame: &FrameState) {
        self.frames.push(RecordedFrame::from(frame));
    }
}
