//! The Worker Engine: one isolated execution context running matches on request.
//!
//! A [`WorkerEngine`] owns a dedicated OS thread holding its own [`Simulation`] and
//! [`AgentCache`]. The caller only talks to it through [`Command`]s and reads back
//! [`WorkerEvent`]s (see [`crate::protocol`]); nothing mutable is shared.
//!
//! Two modes exist. In [`WorkerMode::Interactive`] the worker streams frames of a live game driven
//! by [`WorkerEngine::update`]. In [`WorkerMode::Batch`] it sits blocked on its command queue and
//! is mostly used through [`WorkerEngine::play_match`].

use std::{
    path::PathBuf,
    sync::{
        mpsc::{self, RecvTimeoutError, TryRecvError},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{debug, info, instrument, trace, warn};

use crate::agent::{AgentCache, AgentProvider};
use crate::error::EngineError;
use crate::match_runner::{run_fast_match, MatchConfig, MatchResult};
use crate::protocol::{result_channel, Command, ResultReceiver, ResultSender, WorkerEvent};
use crate::simulation::{FrameState, Move, Side, Simulation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    /// Steps the live game once per tick with the latest moves. `target_fps == 0` steps once per
    /// batch of received moves instead.
    Interactive { target_fps: u32 },
    /// Steps only when moves arrive, otherwise blocks on the command queue.
    Batch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    AwaitingMoves,
    RunningBatch,
    Stopped,
}

/// Parameters of a worker, fixed for its lifetime.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub mode: WorkerMode,
    pub startup_timeout: Duration,
    pub match_timeout: Duration,
    pub stop_grace: Duration,
    pub cache_capacity: usize,
    /// Target score of the live game streamed in interactive mode.
    pub target_score: u32,
    pub seed: u64,
    /// Where recorded matches are written. Recording is disabled when unset.
    pub recordings_dir: Option<PathBuf>,
    /// Agents loaded into the cache before the worker reports `Ready`.
    pub preload: Vec<String>,
}

impl WorkerSettings {
    pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_MATCH_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(1);

    pub fn new(mode: WorkerMode) -> Self {
        WorkerSettings {
            mode,
            startup_timeout: Self::DEFAULT_STARTUP_TIMEOUT,
            match_timeout: Self::DEFAULT_MATCH_TIMEOUT,
            stop_grace: Self::DEFAULT_STOP_GRACE,
            cache_capacity: AgentCache::DEFAULT_CAPACITY,
            target_score: MatchConfig::DEFAULT_TARGET_SCORE,
            seed: 0,
            recordings_dir: None,
            preload: vec![],
        }
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

    pub fn with_target_score(mut self, target_score: u32) -> Self {
        self.target_score = target_score;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_recordings_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.recordings_dir = Some(dir.into());
        self
    }

    pub fn with_preload(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.preload = ids.into_iter().map(Into::into).collect();
        self
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::new(WorkerMode::Batch)
    }
}

struct WorkerLink {
    commands: mpsc::Sender<Command>,
    results: ResultReceiver,
    thread: JoinHandle<()>,
}

/// Caller-side handle of a worker thread.
pub struct WorkerEngine {
    name: String,
    settings: WorkerSettings,
    provider: Arc<dyn AgentProvider>,
    state: WorkerState,
    link: Option<WorkerLink>,
    pending_result: Option<MatchResult>,
}

impl WorkerEngine {
    pub fn new(
        name: impl Into<String>,
        settings: WorkerSettings,
        provider: Arc<dyn AgentProvider>,
    ) -> WorkerEngine {
        WorkerEngine {
            name: name.into(),
            settings,
            provider,
            state: WorkerState::Idle,
            link: None,
            pending_result: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.link.is_some()
    }

    fn resting_state(&self) -> WorkerState {
        match self.settings.mode {
            WorkerMode::Interactive { .. } => WorkerState::AwaitingMoves,
            WorkerMode::Batch => WorkerState::Idle,
        }
    }

    /// Spawns the worker thread and blocks until it reports `Ready`.
    ///
    /// A worker that misses the startup timeout is detached and [`EngineError::StartupTimeout`]
    /// is returned. Starting a running engine does nothing.
    #[instrument(skip(self), fields(worker = %self.name))]
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.link.is_some() {
            return Ok(());
        }

        let (tx_command, rx_command) = mpsc::channel();
        let (tx_result, rx_result) = result_channel();
        let settings = self.settings.clone();
        let provider = self.provider.clone();
        let thread = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || worker_main(settings, provider, rx_command, tx_result))
            .map_err(|e| EngineError::WorkerCrashed(format!("could not spawn thread: {e}")))?;

        self.link = Some(WorkerLink {
            commands: tx_command,
            results: rx_result,
            thread,
        });

        let timeout = self.settings.startup_timeout;
        let outcome = match self.link.as_ref().map(|l| l.results.recv_timeout(timeout)) {
            Some(Ok(WorkerEvent::Ready)) => Ok(()),
            Some(Ok(other)) => Err(EngineError::ProtocolViolation(format!(
                "expected Ready, got {other:?}"
            ))),
            Some(Err(RecvTimeoutError::Timeout)) => Err(EngineError::StartupTimeout(timeout)),
            Some(Err(RecvTimeoutError::Disconnected)) | None => Err(EngineError::WorkerCrashed(
                "worker exited during startup".to_string(),
            )),
        };

        match outcome {
            Ok(()) => {
                self.state = self.resting_state();
                debug!("worker ready");
                Ok(())
            }
            Err(e) => {
                warn!("worker failed to start: {e}");
                self.stop();
                Err(e)
            }
        }
    }

    /// Enqueues the given moves and returns the most recent frame, if any. Never blocks.
    ///
    /// A match result met while draining is kept for [`take_pending_result`](Self::take_pending_result).
    pub fn update(&mut self, left: Option<Move>, right: Option<Move>) -> Option<FrameState> {
        let link = self.link.as_ref()?;

        for (side, direction) in [(Side::Left, left), (Side::Right, right)] {
            if let Some(direction) = direction {
                if link.commands.send(Command::Move { side, direction }).is_err() {
                    trace!(worker = %self.name, "move dropped, worker is gone");
                }
            }
        }

        let mut latest = None;
        loop {
            match link.results.try_recv() {
                Ok(Some(WorkerEvent::Frame(frame))) => latest = Some(frame),
                Ok(Some(WorkerEvent::MatchResult(result))) => {
                    self.pending_result = Some(*result);
                }
                Ok(Some(WorkerEvent::Ready)) => trace!("late Ready discarded"),
                Ok(None) => break,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    warn!(worker = %self.name, "worker disconnected");
                    self.state = WorkerState::Stopped;
                    break;
                }
            }
        }
        latest
    }

    pub fn take_pending_result(&mut self) -> Option<MatchResult> {
        self.pending_result.take()
    }

    /// Runs one match on the worker and waits for its result.
    ///
    /// Errors: [`EngineError::MatchTimeout`] when no result arrives within the match timeout (the
    /// engine should then be recycled), [`EngineError::WorkerCrashed`] when the worker died.
    #[instrument(skip_all, fields(worker = %self.name, left = %config.left, right = %config.right))]
    pub fn play_match(&mut self, config: MatchConfig) -> Result<MatchResult, EngineError> {
        let timeout = self.settings.match_timeout;
        let Some(link) = self.link.as_ref() else {
            return Err(EngineError::WorkerCrashed(
                "worker is not running".to_string(),
            ));
        };

        if self.state == WorkerState::RunningBatch {
            // a previous match timed out: its late result must not be taken for this one
            match link.results.try_recv() {
                Ok(Some(WorkerEvent::MatchResult(_))) => trace!("stale result discarded"),
                _ => {
                    return Err(EngineError::ProtocolViolation(
                        "a match is still running on this worker".to_string(),
                    ))
                }
            }
        }

        link.results.take_frame();
        if link.commands.send(Command::PlayMatch { config }).is_err() {
            self.state = WorkerState::Stopped;
            return Err(EngineError::WorkerCrashed(
                "command queue closed".to_string(),
            ));
        }
        self.state = WorkerState::RunningBatch;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match link.results.recv_timeout(remaining) {
                Ok(WorkerEvent::MatchResult(result)) => {
                    self.state = self.resting_state();
                    return Ok(*result);
                }
                Ok(WorkerEvent::Ready) | Ok(WorkerEvent::Frame(_)) => {
                    trace!("event discarded while waiting for a match result")
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!("match timed out after {timeout:?}");
                    return Err(EngineError::MatchTimeout(timeout));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.state = WorkerState::Stopped;
                    return Err(EngineError::WorkerCrashed(
                        "worker died during the match".to_string(),
                    ));
                }
            }
        }
    }

    /// Asks the worker to stop and joins it within the grace period.
    ///
    /// Returns `false` when the thread did not exit in time and was detached, or had panicked.
    pub fn stop(&mut self) -> bool {
        self.state = WorkerState::Stopped;
        let Some(link) = self.link.take() else {
            return true;
        };
        let _ = link.commands.send(Command::Stop);
        drop(link.commands);

        let deadline = Instant::now() + self.settings.stop_grace;
        while !link.thread.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10).min(self.settings.stop_grace / 10));
        }

        if !link.thread.is_finished() {
            warn!(worker = %self.name, "worker unresponsive, detaching its thread");
            return false;
        }
        match link.thread.join() {
            Ok(()) => {
                debug!(worker = %self.name, "worker stopped");
                true
            }
            Err(_) => {
                warn!(worker = %self.name, "worker thread had panicked");
                false
            }
        }
    }
}

impl Drop for WorkerEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_main(
    settings: WorkerSettings,
    provider: Arc<dyn AgentProvider>,
    commands: mpsc::Receiver<Command>,
    results: ResultSender,
) {
    let mut cache = AgentCache::new(settings.cache_capacity);
    for id in &settings.preload {
        if let Err(e) = cache.get_or_load(id, provider.as_ref()) {
            warn!("preload skipped: {e}");
        }
    }

    let mut games = 0u64;
    let mut sim = Simulation::new(settings.target_score, settings.seed);
    let mut moves = (Move::None, Move::None);
    let tick = match settings.mode {
        WorkerMode::Interactive { target_fps } if target_fps > 0 => {
            Some(Duration::from_secs(1) / target_fps)
        }
        _ => None,
    };
    let mut next_tick = Instant::now() + tick.unwrap_or_default();
    let mut deferred: Option<Command> = None;

    if results.send(WorkerEvent::Ready).is_err() {
        return;
    }
    info!("worker ready");

    let mut step = |sim: &mut Simulation, moves: (Move, Move)| {
        let frame = sim.step(moves.0, moves.1);
        let _ = results.send(WorkerEvent::Frame(frame));
        if frame.game_over {
            games += 1;
            *sim = Simulation::new(settings.target_score, settings.seed.wrapping_add(games));
        }
    };

    loop {
        let command = if let Some(command) = deferred.take() {
            Some(command)
        } else if let Some(tick) = tick {
            let wait = next_tick.saturating_duration_since(Instant::now());
            match commands.recv_timeout(wait) {
                Ok(command) => Some(command),
                Err(RecvTimeoutError::Timeout) => {
                    step(&mut sim, moves);
                    next_tick = (next_tick + tick).max(Instant::now());
                    None
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        } else {
            match commands.recv() {
                Ok(command) => Some(command),
                Err(_) => break,
            }
        };

        match command {
            None => {}
            Some(Command::Stop) => break,
            Some(Command::PlayMatch { config }) => {
                let result = run_fast_match(
                    &config,
                    &mut cache,
                    provider.as_ref(),
                    settings.recordings_dir.as_deref(),
                );
                if results
                    .send(WorkerEvent::MatchResult(Box::new(result)))
                    .is_err()
                {
                    break;
                }
            }
            Some(Command::Move { side, direction }) => {
                set_move(&mut moves, side, direction);
                if tick.is_some() {
                    continue;
                }
                // every move already queued belongs to the same frame
                loop {
                    match commands.try_recv() {
                        Ok(Command::Move { side, direction }) => {
                            set_move(&mut moves, side, direction)
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                step(&mut sim, moves);
                moves = (Move::None, Move::None);
            }
        }
    }
    info!("worker exiting");
}

fn set_move(moves: &mut (Move, Move), side: Side, direction: Move) {
    match side {
        Side::Left => moves.0 = direction,
        Side::Right => moves.1 = direction,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::agent::{AgentHandle, AgentRoster, IdleAgent, TrackerAgent};

    fn roster() -> Arc<dyn AgentProvider> {
        Arc::new(
            AgentRoster::new()
                .with_agent(
                    "tracker",
                    TrackerAgent {
                        dead_zone: 5.0,
                        lookahead: 0.0,
                    },
                )
                .with_agent("idle", IdleAgent)
                .with_agent("crasher", |_: &FrameState, _: Side| -> Move {
                    panic!("agent failure")
                })
                .with_agent("sleeper", |_: &FrameState, _: Side| {
                    thread::sleep(Duration::from_millis(20));
                    Move::None
                }),
        )
    }

    fn wait_for_frame(engine: &mut WorkerEngine) -> Option<FrameState> {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if let Some(frame) = engine.update(None, None) {
                return Some(frame);
            }
            thread::sleep(Duration::from_millis(5));
        }
        None
    }

    #[test]
    fn batch_worker_plays_a_match() {
        let mut engine = WorkerEngine::new("w", WorkerSettings::default(), roster());
        engine.start().unwrap();
        assert_eq!(engine.state(), WorkerState::Idle);

        let result = engine
            .play_match(MatchConfig::new("tracker", "idle").with_seed(3))
            .unwrap();
        assert!(result.error.is_none());
        assert!(result.frames > 0);
        assert_eq!(engine.state(), WorkerState::Idle);
        assert!(engine.stop());
        assert_eq!(engine.state(), WorkerState::Stopped);
    }

    #[test]
    fn batch_worker_steps_once_per_update() {
        let mut engine = WorkerEngine::new("w", WorkerSettings::default(), roster());
        engine.start().unwrap();
        assert!(engine.update(None, None).is_none());

        engine.update(Some(Move::Up), None);
        let frame = wait_for_frame(&mut engine).expect("a frame");
        assert_eq!(frame.frame, 1);

        engine.update(None, Some(Move::Down));
        let frame = wait_for_frame(&mut engine).expect("a frame");
        assert_eq!(frame.frame, 2);
    }

    #[test]
    fn interactive_worker_streams_frames() {
        let settings = WorkerSettings::new(WorkerMode::Interactive { target_fps: 200 });
        let mut engine = WorkerEngine::new("w", settings, roster());
        engine.start().unwrap();
        assert_eq!(engine.state(), WorkerState::AwaitingMoves);

        let first = wait_for_frame(&mut engine).expect("a frame");
        thread::sleep(Duration::from_millis(50));
        let later = wait_for_frame(&mut engine).expect("a frame");
        assert!(later.frame > first.frame);
    }

    #[test]
    fn unknown_agent_is_reported_in_the_result() {
        let mut engine = WorkerEngine::new("w", WorkerSettings::default(), roster());
        engine.start().unwrap();
        let result = engine.play_match(MatchConfig::new("tracker", "nobody")).unwrap();
        assert_eq!(result.error, Some(EngineError::AgentNotFound("nobody".into())));
        // the worker survives
        assert!(engine.play_match(MatchConfig::new("idle", "idle")).is_ok());
    }

    #[test]
    fn panicking_agent_crashes_the_worker() {
        let mut engine = WorkerEngine::new("w", WorkerSettings::default(), roster());
        engine.start().unwrap();
        let err = engine
            .play_match(MatchConfig::new("crasher", "idle"))
            .unwrap_err();
        assert!(matches!(err, EngineError::WorkerCrashed(_)));
        assert_eq!(engine.state(), WorkerState::Stopped);
        assert!(!engine.stop());
    }

    #[test]
    fn slow_match_times_out() {
        let settings = WorkerSettings::default()
            .with_match_timeout(Duration::from_millis(100))
            .with_stop_grace(Duration::from_millis(50));
        let mut engine = WorkerEngine::new("w", settings, roster());
        engine.start().unwrap();
        let err = engine
            .play_match(MatchConfig::new("sleeper", "idle"))
            .unwrap_err();
        assert_eq!(err, EngineError::MatchTimeout(Duration::from_millis(100)));
        assert!(matches!(
            engine.play_match(MatchConfig::new("idle", "idle")),
            Err(EngineError::ProtocolViolation(_))
        ));
        // the match thread is stuck in the sleeper agent: it gets detached
        assert!(!engine.stop());
    }

    struct SlowProvider {
        released: AtomicBool,
    }

    impl AgentProvider for SlowProvider {
        fn load(&self, _id: &str) -> Result<AgentHandle, EngineError> {
            while !self.released.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(5));
            }
            Ok(Arc::new(IdleAgent))
        }
    }

    #[test]
    fn startup_timeout() {
        let provider = Arc::new(SlowProvider {
            released: AtomicBool::new(false),
        });
        let settings = WorkerSettings::default()
            .with_startup_timeout(Duration::from_millis(50))
            .with_stop_grace(Duration::from_millis(20))
            .with_preload(["slow"]);
        let mut engine = WorkerEngine::new("w", settings, provider.clone());
        assert_eq!(
            engine.start(),
            Err(EngineError::StartupTimeout(Duration::from_millis(50)))
        );
        assert!(!engine.is_running());
        provider.released.store(true, Ordering::Relaxed);
    }

    #[test]
    fn play_match_requires_start() {
        let mut engine = WorkerEngine::new("w", WorkerSettings::default(), roster());
        assert!(matches!(
            engine.play_match(MatchConfig::new("idle", "idle")),
            Err(EngineError::WorkerCrashed(_))
        ));
    }
}
