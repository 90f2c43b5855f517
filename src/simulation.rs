//! Headless paddle-game simulation.
//!
//! [`Simulation`] is a pure, deterministic stepper: given the same seed and the same sequence of
//! moves it produces the same sequence of [`FrameState`]s. It performs no I/O and knows nothing
//! about agents or workers.

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

pub const COURT_WIDTH: f32 = 800.0;
pub const COURT_HEIGHT: f32 = 600.0;
pub const PADDLE_WIDTH: f32 = 15.0;
pub const PADDLE_HEIGHT: f32 = 100.0;
pub const PADDLE_MARGIN: f32 = 10.0;
pub const PADDLE_SPEED: f32 = 6.0;
pub const PADDLE_MAX_SPEED: f32 = 12.0;
pub const BALL_RADIUS: f32 = 7.0;
pub const BALL_SPEED: f32 = 5.0;
pub const BALL_SPEED_INCREMENT: f32 = 1.1;
pub const BALL_MAX_SPEED: f32 = 15.0;

/// Direction requested by an agent for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Move {
    Up,
    Down,
    #[default]
    None,
}

/// Which paddle an agent controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn opponent(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Left => write!(f, "left"),
            Side::Right => write!(f, "right"),
        }
    }
}

/// Snapshot of the court after a frame. Never mutated once produced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameState {
    pub frame: u64,
    pub ball_x: f32,
    pub ball_y: f32,
    pub ball_vel_x: f32,
    pub ball_vel_y: f32,
    pub paddle_left_y: f32,
    pub paddle_right_y: f32,
    pub score_left: u32,
    pub score_right: u32,
    /// Side that scored during this frame, if any.
    pub scored: Option<Side>,
    pub hit_left: bool,
    pub hit_right: bool,
    pub game_over: bool,
}

impl FrameState {
    pub fn paddle_y(&self, side: Side) -> f32 {
        match side {
            Side::Left => self.paddle_left_y,
            Side::Right => self.paddle_right_y,
        }
    }

    pub fn score(&self, side: Side) -> u32 {
        match side {
            Side::Left => self.score_left,
            Side::Right => self.score_right,
        }
    }

    /// True when something worth reporting happened (point, paddle hit or end of game).
    pub fn has_event(&self) -> bool {
        self.scored.is_some() || self.hit_left || self.hit_right || self.game_over
    }
}

#[derive(Debug, Clone, Copy)]
struct Rect {
    x: f32,
    y: f32,
    w: f32,
    h: f32,
}

impl Rect {
    fn right(&self) -> f32 {
        self.x + self.w
    }

    fn bottom(&self) -> f32 {
        self.y + self.h
    }

    fn overlaps(&self, other: &Rect) -> bool {
        self.x < other.right()
            && self.right() > other.x
            && self.y < other.bottom()
            && self.bottom() > other.y
    }
}

#[derive(Debug, Clone)]
struct Paddle {
    rect: Rect,
    speed: f32,
}

impl Paddle {
    fn new(x: f32) -> Paddle {
        Paddle {
            rect: Rect {
                x,
                y: COURT_HEIGHT / 2.0 - PADDLE_HEIGHT / 2.0,
                w: PADDLE_WIDTH,
                h: PADDLE_HEIGHT,
            },
            speed: PADDLE_SPEED,
        }
    }

    fn apply(&mut self, mv: Move) {
        match mv {
            Move::Up => self.rect.y -= self.speed,
            Move::Down => self.rect.y += self.speed,
            Move::None => return,
        }
        self.rect.y = self.rect.y.clamp(0.0, COURT_HEIGHT - PADDLE_HEIGHT);
    }
}

#[derive(Debug, Clone)]
struct Ball {
    rect: Rect,
    vel_x: f32,
    vel_y: f32,
}

impl Ball {
    fn serve(rng: &mut StdRng) -> Ball {
        let mut ball = Ball {
            rect: Rect {
                x: 0.0,
                y: 0.0,
                w: BALL_RADIUS * 2.0,
                h: BALL_RADIUS * 2.0,
            },
            vel_x: 0.0,
            vel_y: 0.0,
        };
        ball.reset(rng);
        ball
    }

    fn reset(&mut self, rng: &mut StdRng) {
        self.rect.x = COURT_WIDTH / 2.0 - BALL_RADIUS;
        self.rect.y = COURT_HEIGHT / 2.0 - BALL_RADIUS;
        self.vel_x = BALL_SPEED * random_sign(rng);
        self.vel_y = BALL_SPEED * random_sign(rng);
    }

    fn bounce_off(&mut self, paddle: &Paddle, side: Side) -> bool {
        if !self.rect.overlaps(&paddle.rect) {
            return false;
        }
        self.vel_x = (self.vel_x * -BALL_SPEED_INCREMENT).clamp(-BALL_MAX_SPEED, BALL_MAX_SPEED);
        self.vel_y = (self.vel_y * BALL_SPEED_INCREMENT).clamp(-BALL_MAX_SPEED, BALL_MAX_SPEED);
        match side {
            Side::Left => self.rect.x = paddle.rect.right(),
            Side::Right => self.rect.x = paddle.rect.x - self.rect.w,
        }
        true
    }
}

fn random_sign(rng: &mut StdRng) -> f32 {
    if rng.random_bool(0.5) {
        1.0
    } else {
        -1.0
    }
}

/// Deterministic two-paddle simulation.
#[derive(Debug, Clone)]
pub struct Simulation {
    left: Paddle,
    right: Paddle,
    ball: Ball,
    score_left: u32,
    score_right: u32,
    target_score: u32,
    frame: u64,
    rng: StdRng,
}

impl Simulation {
    pub fn new(target_score: u32, seed: u64) -> Simulation {
        let mut rng = StdRng::seed_from_u64(seed);
        let ball = Ball::serve(&mut rng);
        Simulation {
            left: Paddle::new(PADDLE_MARGIN),
            right: Paddle::new(COURT_WIDTH - PADDLE_MARGIN - PADDLE_WIDTH),
            ball,
            score_left: 0,
            score_right: 0,
            target_score,
            frame: 0,
            rng,
        }
    }

    pub fn target_score(&self) -> u32 {
        self.target_score
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn scores(&self) -> (u32, u32) {
        (self.score_left, self.score_right)
    }

    pub fn is_finished(&self) -> bool {
        self.score_left >= self.target_score || self.score_right >= self.target_score
    }

    /// Current court state, without any per-frame event flags.
    pub fn snapshot(&self) -> FrameState {
        FrameState {
            frame: self.frame,
            ball_x: self.ball.rect.x,
            ball_y: self.ball.rect.y,
            ball_vel_x: self.ball.vel_x,
            ball_vel_y: self.ball.vel_y,
            paddle_left_y: self.left.rect.y,
            paddle_right_y: self.right.rect.y,
            score_left: self.score_left,
            score_right: self.score_right,
            scored: None,
            hit_left: false,
            hit_right: false,
            game_over: self.is_finished(),
        }
    }

    /// Advance one frame. Each move is consumed exactly once.
    pub fn step(&mut self, left: Move, right: Move) -> FrameState {
        self.frame += 1;

        let ratio = self.ball.vel_x.abs() / BALL_SPEED;
        let paddle_speed = (PADDLE_SPEED * ratio).min(PADDLE_MAX_SPEED);
        self.left.speed = paddle_speed;
        self.right.speed = paddle_speed;
        self.left.apply(left);
        self.right.apply(right);

        self.ball.rect.x += self.ball.vel_x;
        self.ball.rect.y += self.ball.vel_y;

        let hit_left = self.ball.bounce_off(&self.left, Side::Left);
        let hit_right = self.ball.bounce_off(&self.right, Side::Right);

        if self.ball.rect.y <= 0.0 {
            self.ball.rect.y = 0.0;
            self.ball.vel_y = self.ball.vel_y.abs();
        } else if self.ball.rect.bottom() >= COURT_HEIGHT {
            self.ball.rect.y = COURT_HEIGHT - self.ball.rect.h;
            self.ball.vel_y = -self.ball.vel_y.abs();
        }

        let scored = if self.ball.rect.x <= 0.0 {
            Some(Side::Right)
        } else if self.ball.rect.right() >= COURT_WIDTH {
            Some(Side::Left)
        } else {
            None
        };
        match scored {
            Some(Side::Left) => self.score_left += 1,
            Some(Side::Right) => self.score_right += 1,
            None => {}
        }
        if scored.is_some() {
            self.ball.reset(&mut self.rng);
        }

        FrameState {
            scored,
            hit_left,
            hit_right,
            ..self.snapshot()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(seed: u64, frames: usize) -> Vec<FrameState> {
        let mut sim = Simulation::new(5, seed);
        (0..frames)
            .map(|i| {
                let mv = if i % 3 == 0 { Move::Up } else { Move::Down };
                sim.step(mv, Move::None)
            })
            .collect()
    }

    #[test]
    fn same_seed_same_frames() {
        assert_eq!(run(7, 2_000), run(7, 2_000));
    }

    #[test]
    fn paddles_stay_on_court() {
        let mut sim = Simulation::new(5, 1);
        for _ in 0..500 {
            let state = sim.step(Move::Up, Move::Down);
            assert!(state.paddle_left_y >= 0.0);
            assert!(state.paddle_right_y <= COURT_HEIGHT - PADDLE_HEIGHT);
        }
        let state = sim.snapshot();
        assert_eq!(state.paddle_left_y, 0.0);
        assert_eq!(state.paddle_right_y, COURT_HEIGHT - PADDLE_HEIGHT);
    }

    #[test]
    fn point_scored_past_right_edge() {
        let mut sim = Simulation::new(1, 9);
        sim.ball.rect.x = COURT_WIDTH - 2.0 * BALL_RADIUS - 1.0;
        sim.ball.rect.y = 20.0;
        sim.ball.vel_x = BALL_SPEED;
        sim.ball.vel_y = BALL_SPEED;

        let state = sim.step(Move::None, Move::None);
        assert_eq!(state.scored, Some(Side::Left));
        assert_eq!((state.score_left, state.score_right), (1, 0));
        assert!(state.game_over);
        assert_eq!(state.ball_x, COURT_WIDTH / 2.0 - BALL_RADIUS);
    }

    #[test]
    fn paddle_hit_reverses_and_speeds_up() {
        let mut sim = Simulation::new(5, 9);
        let paddle_top = sim.left.rect.y;
        sim.ball.rect.x = PADDLE_MARGIN + PADDLE_WIDTH + 2.0;
        sim.ball.rect.y = paddle_top + 20.0;
        sim.ball.vel_x = -BALL_SPEED;
        sim.ball.vel_y = 0.0;

        let state = sim.step(Move::None, Move::None);
        assert!(state.hit_left);
        assert!(state.ball_vel_x > BALL_SPEED);
        assert_eq!(state.ball_x, PADDLE_MARGIN + PADDLE_WIDTH);
        assert_eq!(state.scored, None);
    }

    #[test]
    fn ball_speed_is_capped() {
        let mut sim = Simulation::new(100, 3);
        for _ in 0..20_000 {
            let state = sim.step(Move::None, Move::None);
            assert!(state.ball_vel_x.abs() <= BALL_MAX_SPEED);
            assert!(state.ball_vel_y.abs() <= BALL_MAX_SPEED);
        }
    }

    #[test]
    fn snapshot_has_no_event_flags() {
        let sim = Simulation::new(5, 0);
        let state = sim.snapshot();
        assert!(!state.has_event());
        assert_eq!(state.frame, 0);
        assert_eq!((state.score_left, state.score_right), (0, 0));
    }
}
