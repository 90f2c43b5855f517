//! Per-match play statistics gathered by observing frames.

use serde::{Deserialize, Serialize};

use crate::match_runner::FrameObserver;
use crate::simulation::{FrameState, Side};

/// Paddle movement below this many pixels per frame does not count as a reaction.
const REACTION_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SideStats {
    pub hits: u32,
    pub distance: f32,
    pub reaction_sum: u64,
    pub reaction_count: u32,
}

impl SideStats {
    pub fn average_reaction(&self) -> Option<f32> {
        (self.reaction_count > 0).then(|| self.reaction_sum as f32 / self.reaction_count as f32)
    }

    pub fn absorb(&mut self, other: &SideStats) {
        self.hits += other.hits;
        self.distance += other.distance;
        self.reaction_sum += other.reaction_sum;
        self.reaction_count += other.reaction_count;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchAnalytics {
    pub left: SideStats,
    pub right: SideStats,
    /// Paddle hits in each finished exchange, in order.
    pub rallies: Vec<u32>,
}

impl MatchAnalytics {
    pub fn side(&self, side: Side) -> &SideStats {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }
}

#[derive(Debug, Default)]
struct Tracking {
    last_paddle_y: f32,
    /// Frame at which the ball turned toward this side and no reaction was seen yet.
    bounce_frame: Option<u64>,
}

/// Observer deriving [`MatchAnalytics`] from the frame stream.
#[derive(Debug, Default)]
pub struct MatchAnalyzer {
    stats: MatchAnalytics,
    left: Tracking,
    right: Tracking,
    last_vel_x: f32,
    frames: u64,
    rally_hits: u32,
    last_total_score: u32,
}

impl MatchAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finish(self) -> MatchAnalytics {
        self.stats
    }
}

impl FrameObserver for MatchAnalyzer {
    fn observe(&mut self, frame: &FrameState) {
        self.frames += 1;
        if self.frames == 1 {
            self.left.last_paddle_y = frame.paddle_left_y;
            self.right.last_paddle_y = frame.paddle_right_y;
            self.last_total_score = frame.score_left + frame.score_right;
        }

        let moved_left = (frame.paddle_left_y - self.left.last_paddle_y).abs();
        let moved_right = (frame.paddle_right_y - self.right.last_paddle_y).abs();
        self.stats.left.distance += moved_left;
        self.stats.right.distance += moved_right;
        self.left.last_paddle_y = frame.paddle_left_y;
        self.right.last_paddle_y = frame.paddle_right_y;

        let total_score = frame.score_left + frame.score_right;
        if total_score > self.last_total_score {
            self.stats.rallies.push(self.rally_hits);
            self.rally_hits = 0;
            self.last_total_score = total_score;
            // a serve is not a hit
            self.last_vel_x = frame.ball_vel_x;
        }

        if frame.ball_vel_x > 0.0 && self.last_vel_x < 0.0 {
            self.stats.left.hits += 1;
            self.rally_hits += 1;
            self.right.bounce_frame = Some(self.frames);
        } else if frame.ball_vel_x < 0.0 && self.last_vel_x > 0.0 {
            self.stats.right.hits += 1;
            self.rally_hits += 1;
            self.left.bounce_frame = Some(self.frames);
        }
        self.last_vel_x = frame.ball_vel_x;

        if frame.ball_vel_x < 0.0 && moved_left > REACTION_THRESHOLD {
            if let Some(bounce) = self.left.bounce_frame.take() {
                self.stats.left.reaction_sum += self.frames - bounce;
                self.stats.left.reaction_count += 1;
            }
        }
        if frame.ball_vel_x > 0.0 && moved_right > REACTION_THRESHOLD {
            if let Some(bounce) = self.right.bounce_frame.take() {
                self.stats.right.reaction_sum += self.frames - bounce;
                self.stats.right.reaction_count += 1;
            }
        }
    }
}
