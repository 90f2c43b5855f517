//! Runs one complete match between two agents.
//!
//! [`run_match`] is the frame loop itself: snapshot, observers, agent decisions, simulation step.
//! [`run_fast_match`] is what a worker executes for a `PlayMatch` command: it resolves both agents
//! through the worker's [`AgentCache`], wires the analytics and recording observers in, and
//! always produces a [`MatchResult`], with `error` set when the match could not be played.

use std::{
    collections::BTreeMap,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{instrument, trace, warn};

use crate::agent::{Agent, AgentCache, AgentProvider};
use crate::analytics::{MatchAnalytics, MatchAnalyzer};
use crate::error::EngineError;
use crate::match_index::IndexEntry;
use crate::recorder::MatchRecorder;
use crate::simulation::{FrameState, Side, Simulation};

/// Read-only per-frame hook. Observers see each frame before the agents decide.
pub trait FrameObserver {
    fn observe(&mut self, frame: &FrameState);
}

impl<F: FnMut(&FrameState)> FrameObserver for F {
    fn observe(&mut self, frame: &FrameState) {
        self(frame)
    }
}

/// Cooperative cancellation flag shared between a tournament, its matches and their controllers.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl PartialEq for CancellationToken {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Parameters of one scheduled match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchConfig {
    pub left: String,
    pub right: String,
    pub target_score: u32,
    pub record_match: bool,
    pub seed: u64,
    /// Allows ending a decided match before the target score is reached.
    pub early_termination: bool,
    pub match_type: String,
    pub metadata: BTreeMap<String, Value>,
    /// Checked once per frame. A cancelled match ends without a result.
    #[serde(skip)]
    pub cancel: Option<CancellationToken>,
}

impl MatchConfig {
    pub const DEFAULT_TARGET_SCORE: u32 = 5;

    pub fn new(left: impl Into<String>, right: impl Into<String>) -> MatchConfig {
        MatchConfig {
            left: left.into(),
            right: right.into(),
            target_score: Self::DEFAULT_TARGET_SCORE,
            record_match: false,
            seed: 0,
            early_termination: true,
            match_type: "tournament".to_string(),
            metadata: BTreeMap::new(),
            cancel: None,
        }
    }

    pub fn with_target_score(mut self, target_score: u32) -> Self {
        self.target_score = target_score.max(1);
        self
    }

    pub fn with_record_match(mut self, value: bool) -> Self {
        self.record_match = value;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_early_termination(mut self, value: bool) -> Self {
        self.early_termination = value;
        self
    }

    pub fn with_match_type(mut self, match_type: impl Into<String>) -> Self {
        self.match_type = match_type.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// Safety cap on the number of simulated frames.
    pub fn max_frames(&self) -> u64 {
        u64::from(self.target_score) * 1000
    }
}

/// Outcome of a `PlayMatch` command. Always populated; on failure `error` is set and both scores
/// are zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub score_left: u32,
    pub score_right: u32,
    pub frames: u64,
    pub analytics: MatchAnalytics,
    /// Index entry of the saved recording, when the match was recorded.
    pub recorded: Option<IndexEntry>,
    #[serde(skip)]
    pub error: Option<EngineError>,
}

impl MatchResult {
    pub fn failed(error: EngineError) -> MatchResult {
        MatchResult {
            score_left: 0,
            score_right: 0,
            frames: 0,
            analytics: MatchAnalytics::default(),
            recorded: None,
            error: Some(error),
        }
    }

    pub fn score(&self, side: Side) -> u32 {
        match side {
            Side::Left => self.score_left,
            Side::Right => self.score_right,
        }
    }

    /// `None` on a draw.
    pub fn winner(&self) -> Option<Side> {
        match self.score_left.cmp(&self.score_right) {
            std::cmp::Ordering::Greater => Some(Side::Left),
            std::cmp::Ordering::Less => Some(Side::Right),
            std::cmp::Ordering::Equal => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    TargetReached,
    FrameCap,
    EarlyTermination,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchOutcome {
    pub score_left: u32,
    pub score_right: u32,
    pub frames: u64,
    pub end: EndReason,
}

/// Plays `left` against `right` until a side reaches the target score, the frame cap is hit or,
/// when enabled, the early-termination heuristic fires. A cancelled config stops the loop before
/// the next frame.
pub fn run_match(
    left: &dyn Agent,
    right: &dyn Agent,
    config: &MatchConfig,
    observers: &mut [&mut dyn FrameObserver],
) -> MatchOutcome {
    let target = config.target_score.max(1);
    let max_frames = config.max_frames();
    let mut sim = Simulation::new(target, config.seed);
    let mut end = EndReason::FrameCap;

    while sim.frame() < max_frames {
        if config.is_cancelled() {
            end = EndReason::Cancelled;
            break;
        }
        let state = sim.snapshot();
        for observer in observers.iter_mut() {
            observer.observe(&state);
        }

        let left_move = left.decide(&state, Side::Left);
        let right_move = right.decide(&state, Side::Right);
        sim.step(left_move, right_move);

        if sim.is_finished() {
            end = EndReason::TargetReached;
            break;
        }

        if config.early_termination {
            let (l, r) = sim.scores();
            let gap = l.abs_diff(r);
            // one side is a point away from an unreachable lead with more than half the time gone
            if gap > 0 && gap >= target - 1 && sim.frame() > u64::from(target) * 500 {
                end = EndReason::EarlyTermination;
                break;
            }
        }
    }

    let (score_left, score_right) = sim.scores();
    trace!(score_left, score_right, frames = sim.frame(), ?end, "match finished");
    MatchOutcome {
        score_left,
        score_right,
        frames: sim.frame(),
        end,
    }
}

/// Executes a `PlayMatch` command inside a worker.
#[instrument(skip_all, fields(left = %config.left, right = %config.right))]
pub fn run_fast_match(
    config: &MatchConfig,
    cache: &mut AgentCache,
    provider: &dyn AgentProvider,
    recordings_dir: Option<&Path>,
) -> MatchResult {
    let resolve = |cache: &mut AgentCache| -> Result<_, EngineError> {
        let left = cache.get_or_load(&config.left, provider)?;
        let right = cache.get_or_load(&config.right, provider)?;
        Ok((left, right))
    };
    let (left, right) = match resolve(cache) {
        Ok(agents) => agents,
        Err(e) => {
            warn!("match not played: {e}");
            return MatchResult::failed(e);
        }
    };

    let mut analyzer = MatchAnalyzer::new();
    let mut recorder = (config.record_match && recordings_dir.is_some()).then(|| {
        MatchRecorder::new(
            &config.left,
            &config.right,
            &config.match_type,
            config.metadata.clone(),
        )
    });

    let outcome = {
        let mut observers: Vec<&mut dyn FrameObserver> = vec![&mut analyzer];
        if let Some(recorder) = recorder.as_mut() {
            observers.push(recorder);
        }
        run_match(left.as_ref(), right.as_ref(), config, &mut observers)
    };

    if outcome.end == EndReason::Cancelled {
        trace!(frames = outcome.frames, "match cancelled");
        return MatchResult::failed(EngineError::MatchCancelled);
    }

    let final_score = (outcome.score_left, outcome.score_right);
    let recorded = match (recorder, recordings_dir) {
        (Some(recorder), Some(dir)) => recorder.save(dir, final_score).unwrap_or_else(|e| {
            warn!("could not save match recording: {e:#}");
            None
        }),
        _ => None,
    };

    MatchResult {
        score_left: outcome.score_left,
        score_right: outcome.score_right,
        frames: outcome.frames,
        analytics: analyzer.finish(),
        recorded,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentRoster, IdleAgent, TrackerAgent};
    use crate::simulation::Move;

    fn tracker() -> TrackerAgent {
        TrackerAgent {
            dead_zone: 5.0,
            lookahead: 0.0,
        }
    }

    #[test]
    fn match_ends_at_target_or_cap() {
        let config = MatchConfig::new("t", "i").with_early_termination(false);
        let outcome = run_match(&tracker(), &IdleAgent, &config, &mut []);
        match outcome.end {
            EndReason::TargetReached => {
                assert!(outcome.score_left.max(outcome.score_right) >= config.target_score)
            }
            EndReason::FrameCap => assert_eq!(outcome.frames, config.max_frames()),
            EndReason::EarlyTermination => panic!("early termination was disabled"),
            EndReason::Cancelled => panic!("nothing cancelled the match"),
        }
    }

    #[test]
    fn replay_is_deterministic() {
        let config = MatchConfig::new("a", "b")
            .with_seed(1234)
            .with_early_termination(false);
        let mut first = vec![];
        let mut second = vec![];
        let a = run_match(
            &tracker(),
            &IdleAgent,
            &config,
            &mut [&mut |f: &FrameState| first.push(*f)],
        );
        let b = run_match(
            &tracker(),
            &IdleAgent,
            &config,
            &mut [&mut |f: &FrameState| second.push(*f)],
        );
        assert_eq!(a, b);
        assert_eq!(first, second);
    }

    #[test]
    fn frame_cap_stops_endless_matches() {
        // a wall on both sides never concedes: both paddles shadow the ball perfectly
        let config = MatchConfig::new("a", "b")
            .with_target_score(1)
            .with_early_termination(false);
        let wall = TrackerAgent {
            dead_zone: 0.0,
            lookahead: 0.0,
        };
        let outcome = run_match(&wall, &wall, &config, &mut []);
        assert!(outcome.frames <= config.max_frames());
        if outcome.end == EndReason::FrameCap {
            assert_eq!((outcome.score_left, outcome.score_right), (0, 0));
        }
    }

    #[test]
    fn cancellation_stops_the_frame_loop() {
        let token = CancellationToken::new();
        let config = MatchConfig::new("t", "i")
            .with_early_termination(false)
            .with_cancellation(token.clone());
        let mut seen = 0;
        let mut cancel_at_ten = |_: &FrameState| {
            seen += 1;
            if seen == 10 {
                token.cancel();
            }
        };
        let outcome = run_match(&tracker(), &IdleAgent, &config, &mut [&mut cancel_at_ten]);
        assert_eq!(outcome.end, EndReason::Cancelled);
        assert_eq!(outcome.frames, 10);
    }

    #[test]
    fn cancelled_fast_match_has_no_result() {
        let dir = tempfile::tempdir().unwrap();
        let roster = AgentRoster::new()
            .with_agent("a", tracker())
            .with_agent("b", IdleAgent);
        let token = CancellationToken::new();
        token.cancel();
        let config = MatchConfig::new("a", "b")
            .with_record_match(true)
            .with_cancellation(token);
        let result = run_fast_match(&config, &mut AgentCache::new(4), &roster, Some(dir.path()));
        assert_eq!(result.error, Some(EngineError::MatchCancelled));
        assert!(result.recorded.is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn missing_agent_gives_failed_result() {
        let roster = AgentRoster::new().with_agent("a", IdleAgent);
        let mut cache = AgentCache::new(4);
        let result = run_fast_match(&MatchConfig::new("a", "nobody"), &mut cache, &roster, None);
        assert_eq!(result.error, Some(EngineError::AgentNotFound("nobody".into())));
        assert_eq!((result.score_left, result.score_right), (0, 0));
    }

    #[test]
    fn fast_match_collects_analytics_and_recording() {
        let dir = tempfile::tempdir().unwrap();
        let roster = AgentRoster::new()
            .with_agent("tracker", tracker())
            .with_agent("up", |_: &FrameState, _: Side| Move::Up);
        let mut cache = AgentCache::new(4);
        let config = MatchConfig::new("tracker", "up")
            .with_record_match(true)
            .with_seed(5);
        let result = run_fast_match(&config, &mut cache, &roster, Some(dir.path()));

        assert!(result.error.is_none());
        let entry = result.recorded.expect("match was recorded");
        assert_eq!(entry.p1, "tracker");
        assert_eq!(entry.final_score, (result.score_left, result.score_right));
        assert_eq!(entry.duration_frames, result.frames);
        assert!(result.analytics.left.distance > 0.0);
    }
}
