//! Drives a whole tournament: pre-filter, round-robin, Elo updates, pruning and results.
//!
//! The scheduler owns every piece of mutable league state (rating registry, population
//! inventory, match index, deletion log). Matches run on a pool of [`WorkerEngine`]s: each
//! dispatched match gets a short-lived driver thread that owns one worker for the duration of
//! the match and sends it back with the outcome over an mpsc channel. Only the scheduler thread
//! applies outcomes, so ratings and deletions are never touched concurrently.
//!
//! Progress is published as a [`Standings`] snapshot behind an `Arc<RwLock<_>>`, which readers
//! (a dashboard, the CLI) may poll at any time. [`TournamentHandle::spawn`] runs the scheduler
//! on its own thread and exposes cancellation.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt::Display,
    path::PathBuf,
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc, RwLock,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::agent::AgentProvider;
use crate::agent_collector::AgentDirectory;
use crate::configuration::{Configuration, TournamentSettings};
use crate::error::EngineError;
use crate::logger::init_logger;
use crate::match_index::MatchIndex;
use crate::match_runner::{MatchConfig, MatchResult};
pub use crate::match_runner::CancellationToken;
use crate::population::{PopulationEntry, PopulationProvider};
use crate::rating::{exchange, Outcome, RatingRegistry};
use crate::session::{
    DeletionLog, DeletionRecord, LeagueHistory, SessionOutcome, TournamentSession,
};
use crate::tournament_strategy::{
    is_shutout, keep_top_n, pre_filter, similarity_prune, DeletionReason, Pairing,
    RoundRobinTournament, Standing,
};
use crate::worker::{WorkerEngine, WorkerSettings};

/// How often the scheduler wakes up to check for cancellation while matches run.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TournamentPhase {
    #[default]
    Setup,
    Running,
    Pruning,
    Results,
}

/// Eventually consistent view of a running tournament.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Standings {
    pub phase: TournamentPhase,
    pub matches_total: usize,
    pub matches_played: usize,
    pub running: Vec<Pairing>,
    /// Best rating first.
    pub table: Vec<Standing>,
}

/// Cancels the token when dropped, so an early return also stops the running matches.
struct CancelOnDrop(CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

type MatchOutcomeMessage = (WorkerEngine, Pairing, Result<MatchResult, EngineError>);

pub struct TournamentScheduler {
    config: Configuration,
    settings: TournamentSettings,
    agents: Arc<dyn AgentProvider>,
    population: Arc<dyn PopulationProvider>,
    registry: RatingRegistry,
    index: Option<MatchIndex>,
    deletion_log: Option<DeletionLog>,
    history: Option<LeagueHistory>,
    session_summary: Option<PathBuf>,
    cancel: CancellationToken,
    standings: Arc<RwLock<Standings>>,
}

/// Mutable state of one run.
struct Run {
    entries: HashMap<String, Standing>,
    queue: VecDeque<Pairing>,
    running: Vec<Pairing>,
    retried: HashSet<Pairing>,
    consecutive_crashes: u32,
    deletions: Vec<DeletionRecord>,
    matches_scheduled: usize,
    matches_played: usize,
    matches_skipped: usize,
    matches_inconclusive: usize,
    aborted: Option<String>,
}

impl TournamentScheduler {
    pub fn new(
        config: Configuration,
        settings: TournamentSettings,
        agents: Arc<dyn AgentProvider>,
        population: Arc<dyn PopulationProvider>,
        registry: RatingRegistry,
    ) -> TournamentScheduler {
        let registry = registry.with_initial_rating(settings.initial_rating);
        TournamentScheduler {
            config,
            settings,
            agents,
            population,
            registry,
            index: None,
            deletion_log: None,
            history: None,
            session_summary: None,
            cancel: CancellationToken::new(),
            standings: Arc::default(),
        }
    }

    /// Scheduler over the agent directory and data files named by `config`.
    #[instrument(skip_all)]
    pub fn from_configuration(
        config: Configuration,
        settings: TournamentSettings,
    ) -> anyhow::Result<TournamentScheduler> {
        if config.log {
            init_logger(config.data_dir())?;
        }
        trace!(?config, ?settings);

        let directory = Arc::new(AgentDirectory::open(config.agents_dir())?);
        let registry = RatingRegistry::load(config.ratings_path());
        let index = MatchIndex::open(config.index_path());
        let deletion_log = DeletionLog::new(config.deletions_path());
        let history = LeagueHistory::load(config.history_path());
        let summary = config.last_session_path();

        Ok(
            TournamentScheduler::new(config, settings, directory.clone(), directory, registry)
                .with_match_index(index)
                .with_deletion_log(deletion_log)
                .with_history(history)
                .with_session_summary(summary),
        )
    }

    pub fn with_match_index(mut self, index: MatchIndex) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_deletion_log(mut self, log: DeletionLog) -> Self {
        self.deletion_log = Some(log);
        self
    }

    pub fn with_history(mut self, history: LeagueHistory) -> Self {
        self.history = Some(history);
        self
    }

    /// Where the summary of each finished session is written.
    pub fn with_session_summary(mut self, path: impl Into<PathBuf>) -> Self {
        self.session_summary = Some(path.into());
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn standings(&self) -> Arc<RwLock<Standings>> {
        self.standings.clone()
    }

    pub fn registry(&self) -> &RatingRegistry {
        &self.registry
    }

    pub fn match_index(&self) -> Option<&MatchIndex> {
        self.index.as_ref()
    }

    pub fn history(&self) -> Option<&LeagueHistory> {
        self.history.as_ref()
    }

    /// Plays a complete tournament.
    ///
    /// Errors are fatal conditions only (population unavailable, workers unable to start).
    /// Cancellation and repeated worker crashes end the session early and are reported in
    /// [`TournamentSession::outcome`].
    #[instrument(skip_all)]
    pub fn run(&mut self) -> anyhow::Result<TournamentSession> {
        let started = OffsetDateTime::now_utc().unix_timestamp();

        // 1. setup
        self.publish_phase(TournamentPhase::Setup);
        let mut run = self.setup()?;
        info!(
            participants = run.entries.len(),
            pairings = run.matches_scheduled,
            "tournament ready"
        );

        // 2. matches
        self.publish_phase(TournamentPhase::Running);
        if self.config.verbose {
            disable_line_wrap();
        }
        let played = self.play_all(&mut run);
        if self.config.verbose {
            enable_line_wrap();
            println!();
        }
        played?;

        let outcome = if self.cancel.is_cancelled() {
            info!("tournament cancelled");
            SessionOutcome::Cancelled
        } else if let Some(reason) = run.aborted.take() {
            error!("tournament aborted: {reason}");
            SessionOutcome::Aborted { reason }
        } else {
            // 3. retention
            self.publish_phase(TournamentPhase::Pruning);
            self.prune(&mut run);
            SessionOutcome::Completed
        };

        // 4. results
        self.publish_phase(TournamentPhase::Results);
        let rankings = self.table(&run);
        let session = TournamentSession {
            started,
            finished: OffsetDateTime::now_utc().unix_timestamp(),
            outcome,
            participants: run.entries.len() + run.deletions.len(),
            matches_scheduled: run.matches_scheduled,
            matches_played: run.matches_played,
            matches_skipped: run.matches_skipped,
            matches_inconclusive: run.matches_inconclusive,
            deletions: run.deletions,
            rankings,
        };
        self.persist(&session);
        Ok(session)
    }

    fn setup(&mut self) -> anyhow::Result<Run> {
        let entries = self
            .population
            .enumerate()
            .context("could not enumerate the population")?;

        let mut present = vec![];
        for mut entry in entries {
            if !entry.file_present {
                warn!("'{}' has no agent file, left out", entry.agent_id);
                continue;
            }
            // ghosts keep the rating their provider reports
            if !entry.ghost {
                if !self.registry.contains(&entry.agent_id) {
                    self.registry
                        .set(entry.agent_id.clone(), self.registry.initial_rating());
                }
                entry.rating = self.registry.get(&entry.agent_id);
            }
            present.push(entry);
        }
        self.save_ratings();

        let mut run = Run {
            entries: HashMap::new(),
            queue: VecDeque::new(),
            running: vec![],
            retried: HashSet::new(),
            consecutive_crashes: 0,
            deletions: vec![],
            matches_scheduled: 0,
            matches_played: 0,
            matches_skipped: 0,
            matches_inconclusive: 0,
            aborted: None,
        };

        let (kept, deletions) = pre_filter(present, self.settings.min_fitness_threshold);
        for (agent_id, reason) in deletions {
            self.delete(&mut run, &agent_id, reason);
        }

        let ids: Vec<String> = kept.iter().map(|e| e.agent_id.clone()).collect();
        run.entries = kept
            .iter()
            .map(|e: &PopulationEntry| (e.agent_id.clone(), Standing::new(e)))
            .collect();

        if ids.len() < 2 {
            info!("fewer than two agents, no match to play");
        } else {
            run.queue = RoundRobinTournament::new(self.settings.seed)
                .pairings(&ids)
                .into();
        }
        run.matches_scheduled = run.queue.len();
        self.publish(&run);
        Ok(run)
    }

    fn spawn_worker(&self, number: usize) -> Result<WorkerEngine, EngineError> {
        let settings: WorkerSettings = self.config.worker_settings(&self.settings);
        let mut worker = WorkerEngine::new(format!("worker-{number}"), settings, self.agents.clone());
        worker.start()?;
        Ok(worker)
    }

    fn play_all(&mut self, run: &mut Run) -> anyhow::Result<()> {
        if run.queue.is_empty() {
            return Ok(());
        }

        let pool_size = self.config.workers.min(run.queue.len()).max(1);
        let mut spawned = 0;
        let mut idle = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            spawned += 1;
            idle.push(
                self.spawn_worker(spawned)
                    .context("could not start the worker pool")?,
            );
        }
        debug!(pool_size, "worker pool ready");

        let (tx_result, rx_result) = mpsc::channel::<MatchOutcomeMessage>();
        let in_flight = CancellationToken::new();
        let _stop_on_error = CancelOnDrop(in_flight.clone());
        let mut sequence = 0u64;

        loop {
            if self.cancel.is_cancelled() || run.aborted.is_some() {
                break;
            }

            while !idle.is_empty() {
                let Some(pairing) = run.queue.pop_front() else {
                    break;
                };
                if !run.entries.contains_key(&pairing.left)
                    || !run.entries.contains_key(&pairing.right)
                {
                    trace!(%pairing, "pairing references a deleted agent");
                    run.matches_skipped += 1;
                    continue;
                }
                let Some(worker) = idle.pop() else { break };
                sequence += 1;
                self.launch_match(
                    worker,
                    pairing,
                    sequence,
                    in_flight.clone(),
                    tx_result.clone(),
                    run,
                )?;
            }
            self.publish(run);

            if run.running.is_empty() {
                break;
            }

            // not finished <=> match running <=> result to receive
            let (worker, pairing, result) = match rx_result.recv_timeout(POLL_INTERVAL) {
                Ok(message) => message,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(anyhow!("match drivers disconnected"));
                }
            };
            if let Some(pos) = run.running.iter().position(|p| *p == pairing) {
                run.running.remove(pos);
            }

            match result {
                Ok(result) => {
                    run.consecutive_crashes = 0;
                    idle.push(worker);
                    self.on_result(run, pairing, result);
                }
                Err(EngineError::MatchTimeout(timeout)) => {
                    warn!(%pairing, "match timed out after {timeout:?}, counted as inconclusive");
                    run.matches_inconclusive += 1;
                    drop(worker);
                    spawned += 1;
                    idle.push(
                        self.spawn_worker(spawned)
                            .context("could not replace a timed out worker")?,
                    );
                }
                Err(e) => {
                    run.consecutive_crashes += 1;
                    drop(worker);
                    if run.consecutive_crashes >= 2 {
                        run.aborted = Some(format!("worker crashed twice in a row: {e}"));
                        break;
                    }
                    warn!(%pairing, "{e}, respawning the worker");
                    spawned += 1;
                    idle.push(
                        self.spawn_worker(spawned)
                            .context("could not respawn a crashed worker")?,
                    );
                    if run.retried.insert(pairing.clone()) {
                        run.queue.push_front(pairing);
                    } else {
                        run.matches_skipped += 1;
                    }
                }
            }
            self.publish(run);
        }

        in_flight.cancel();
        self.drain(run, &rx_result);
        Ok(())
    }

    /// Waits for the workers of abandoned matches to come back and stops them. Their results are
    /// discarded.
    fn drain(&self, run: &mut Run, rx_result: &Receiver<MatchOutcomeMessage>) {
        // a driver always answers within the match timeout
        let deadline = Instant::now() + self.config.match_timeout;
        while !run.running.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx_result.recv_timeout(remaining) {
                Ok((mut worker, pairing, _)) => {
                    debug!(%pairing, "abandoned match stopped");
                    run.running.retain(|p| *p != pairing);
                    worker.stop();
                }
                Err(_) => {
                    warn!(
                        abandoned = run.running.len(),
                        "in-flight matches did not stop in time"
                    );
                    break;
                }
            }
        }
        run.running.clear();
        self.publish(run);
    }

    fn launch_match(
        &self,
        mut worker: WorkerEngine,
        pairing: Pairing,
        sequence: u64,
        cancel: CancellationToken,
        tx_result: Sender<MatchOutcomeMessage>,
        run: &mut Run,
    ) -> anyhow::Result<()> {
        let rating = |id: &str| run.entries.get(id).map_or(self.registry.get(id), |s| s.rating);
        let config = MatchConfig::new(pairing.left.clone(), pairing.right.clone())
            .with_target_score(self.settings.target_score)
            .with_seed(self.settings.seed.wrapping_add(sequence))
            .with_record_match(self.settings.record_matches)
            .with_early_termination(self.settings.early_termination)
            .with_match_type("tournament")
            .with_metadata("p1_rating_before", rating(&pairing.left))
            .with_metadata("p2_rating_before", rating(&pairing.right))
            .with_cancellation(cancel);

        run.running.push(pairing.clone());
        if self.config.verbose {
            print_running_matches(&run.running);
        }

        thread::Builder::new()
            .name(format!("match-{sequence}"))
            .spawn(move || {
                let result = worker.play_match(config);
                // the scheduler may be gone after a cancellation
                let _ = tx_result.send((worker, pairing, result));
            })
            .context("could not spawn a match driver")?;
        Ok(())
    }

    fn on_result(&mut self, run: &mut Run, pairing: Pairing, result: MatchResult) {
        if let Some(e) = &result.error {
            warn!(%pairing, "pairing skipped: {e}");
            run.matches_skipped += 1;
            return;
        }
        let (Some(left), Some(right)) = (
            run.entries.get(&pairing.left).cloned(),
            run.entries.get(&pairing.right).cloned(),
        ) else {
            debug!(%pairing, "result discarded, an agent was deleted meanwhile");
            run.matches_skipped += 1;
            return;
        };
        run.matches_played += 1;

        let outcome = Outcome::from_scores(result.score_left, result.score_right);
        let (mut new_left, mut new_right) =
            exchange(left.rating, right.rating, outcome, self.settings.k_factor);
        if left.ghost {
            new_left = left.rating;
        }
        if right.ghost {
            new_right = right.rating;
        }
        for (standing, rating, scored, conceded, play) in [
            (&left, new_left, result.score_left, result.score_right, &result.analytics.left),
            (&right, new_right, result.score_right, result.score_left, &result.analytics.right),
        ] {
            if !standing.ghost {
                self.registry.set(standing.agent_id.clone(), rating);
            }
            if let Some(entry) = run.entries.get_mut(&standing.agent_id) {
                entry.rating = rating;
                entry.record.record(scored, conceded);
                entry.record.play.absorb(play);
            }
        }
        self.save_ratings();

        if self.config.verbose {
            print_match_result(&pairing, &result, new_left, new_right);
        }
        trace!(
            %pairing,
            score_left = result.score_left,
            score_right = result.score_right,
            new_left,
            new_right,
            "match applied"
        );

        if let (Some(index), Some(mut entry)) = (self.index.as_mut(), result.recorded) {
            entry
                .metadata
                .insert("p1_rating_after".to_string(), new_left.into());
            entry
                .metadata
                .insert("p2_rating_after".to_string(), new_right.into());
            if let Err(e) = index.index(entry) {
                warn!("could not index match: {e:#}");
            }
        }

        if self.settings.delete_on_shutout {
            let (winner, loser, winner_score, loser_score) = match outcome {
                Outcome::Win => (&left, &right, result.score_left, result.score_right),
                Outcome::Loss => (&right, &left, result.score_right, result.score_left),
                Outcome::Draw => return,
            };
            if !loser.ghost
                && is_shutout(
                    winner_score,
                    loser_score,
                    self.settings.target_score,
                    self.settings.shutout_score_gap,
                )
            {
                let reason = DeletionReason::Shutout {
                    opponent: winner.agent_id.clone(),
                    score: (winner_score, loser_score),
                };
                self.delete(run, &loser.agent_id, reason);
            }
        }
    }

    fn prune(&mut self, run: &mut Run) {
        let standings: Vec<Standing> = run.entries.values().cloned().collect();
        let (kept, mut deletions) =
            similarity_prune(standings, self.settings.similarity_threshold);
        let (_, top_n_deletions) = keep_top_n(kept, self.settings.retain_top_n);
        deletions.extend(top_n_deletions);
        for (agent_id, reason) in deletions {
            self.delete(run, &agent_id, reason);
        }
    }

    /// Removes an agent from every piece of league state and from the pending queue.
    fn delete(&mut self, run: &mut Run, agent_id: &str, reason: DeletionReason) {
        info!(agent = agent_id, "deleting: {reason}");
        if let Err(e) = self.population.delete(agent_id) {
            warn!("could not delete '{agent_id}' from the population: {e:#}");
        }
        self.registry.remove(agent_id);
        self.save_ratings();
        run.entries.remove(agent_id);

        let before = run.queue.len();
        run.queue.retain(|p| !p.involves(agent_id));
        run.matches_skipped += before - run.queue.len();

        let record = DeletionRecord::now(agent_id, reason);
        if let Some(log) = &self.deletion_log {
            if let Err(e) = log.append(&record) {
                warn!("could not log deletion: {e:#}");
            }
        }
        run.deletions.push(record);
    }

    fn table(&self, run: &Run) -> Vec<Standing> {
        let mut table: Vec<Standing> = run.entries.values().cloned().collect();
        table.sort_by(|a, b| {
            b.rating
                .total_cmp(&a.rating)
                .then(a.agent_id.cmp(&b.agent_id))
        });
        table
    }

    fn publish(&self, run: &Run) {
        let table = self.table(run);
        let mut standings = self.standings.write().unwrap_or_else(|e| e.into_inner());
        standings.matches_total = run.matches_scheduled;
        standings.matches_played = run.matches_played;
        standings.running = run.running.clone();
        standings.table = table;
    }

    fn publish_phase(&self, phase: TournamentPhase) {
        self.standings
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .phase = phase;
    }

    /// Writes the registry after every change so ratings and deletions on disk stay in step.
    fn save_ratings(&self) {
        if let Err(e) = self.registry.save() {
            error!("could not save ratings: {e:#}");
        }
    }

    fn persist(&mut self, session: &TournamentSession) {
        self.save_ratings();
        if let Some(history) = self.history.as_mut() {
            history.record_session(session);
            if let Err(e) = history.save(self.config.history_path()) {
                error!("could not save league history: {e:#}");
            }
        }
        if let Some(path) = &self.session_summary {
            if let Err(e) = session.save(path) {
                error!("could not save session summary: {e:#}");
            }
        }
    }
}

/// A tournament running on its own thread.
pub struct TournamentHandle {
    cancel: CancellationToken,
    standings: Arc<RwLock<Standings>>,
    thread: JoinHandle<anyhow::Result<TournamentSession>>,
}

impl TournamentHandle {
    pub fn spawn(mut scheduler: TournamentScheduler) -> anyhow::Result<TournamentHandle> {
        let cancel = scheduler.cancellation_token();
        let standings = scheduler.standings();
        let thread = thread::Builder::new()
            .name("tournament-scheduler".to_string())
            .spawn(move || scheduler.run())
            .context("could not spawn the scheduler thread")?;
        Ok(TournamentHandle {
            cancel,
            standings,
            thread,
        })
    }

    /// Requests cancellation. In-flight matches are stopped at their next frame and abandoned
    /// without rating changes.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn standings(&self) -> Standings {
        self.standings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    pub fn join(self) -> anyhow::Result<TournamentSession> {
        self.thread
            .join()
            .map_err(|_| anyhow!("the scheduler thread panicked"))?
    }
}

fn print_match_result(pairing: &Pairing, result: &MatchResult, new_left: f64, new_right: f64) {
    // clear line, green match, score, ratings, start of line
    println!(
        "\x1b[2K\x1b[32m{pairing}: \x1b[39m{}-{} \x1b[33m{new_left:.1}/{new_right:.1}\x1b[39m\x1b[0G",
        result.score_left, result.score_right
    );
}

fn print_running_matches<T: Display>(running: &[T]) {
    // clear, green, default, start of line
    print!(
        "\x1b[2K\x1b[32mRunning...:\x1b[39m {}\x1b[0G",
        running
            .iter()
            .map(T::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );
    let _ = std::io::Write::flush(&mut std::io::stdout());
}

fn disable_line_wrap() {
    print!("\x1b[?7l");
}

fn enable_line_wrap() {
    print!("\x1b[?7h");
}
