use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use paddle_league::{
    prelude::*,
    session::{DeletionLog, LeagueHistory},
    tournament_scheduler::TournamentPhase,
    tournament_strategy::DeletionReason,
};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

fn init_test_logger() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn tracker(dead_zone: f32, lookahead: f32) -> AgentSpec {
    AgentSpec::Tracker {
        dead_zone,
        lookahead,
    }
}

fn populate(dir: &Path, agents: &[(&str, f64, AgentSpec)]) -> AgentDirectory {
    fs::create_dir_all(dir).unwrap();
    let directory = AgentDirectory::open(dir).unwrap();
    for (id, fitness, spec) in agents {
        directory
            .write(id, &AgentDescriptor::new(*fitness, spec.clone()))
            .unwrap();
    }
    directory
}

fn quiet(data_dir: &Path) -> Configuration {
    Configuration::new()
        .with_verbose(false)
        .with_workers(3)
        .with_data_dir(data_dir)
}

#[test]
fn full_tournament_on_an_agent_directory() {
    init_test_logger();
    let data = tempfile::tempdir().unwrap();
    let config = quiet(data.path());
    let agents = populate(
        &config.agents_dir(),
        &[
            ("weak_1", 50.0, tracker(10.0, 0.0)),
            ("weak_2", 150.0, AgentSpec::Idle),
            ("gen_3", 250.0, tracker(4.0, 2.0)),
            ("gen_4", 900.0, tracker(12.0, 0.0)),
            ("gen_5", 400.0, tracker(25.0, 1.0)),
            ("gen_6", 300.0, AgentSpec::Idle),
        ],
    );
    let settings = TournamentSettings::default()
        .with_min_fitness(200.0)
        .with_retain_top_n(2)
        .with_record_matches(true)
        .with_seed(42);

    let mut scheduler =
        TournamentScheduler::from_configuration(config.clone(), settings).unwrap();
    let session = scheduler.run().unwrap();

    assert_eq!(session.outcome, SessionOutcome::Completed);
    assert_eq!(session.participants, 6);
    // 4 agents pass the fitness filter
    assert_eq!(session.matches_scheduled, 6);
    assert_eq!(
        session.matches_played + session.matches_skipped + session.matches_inconclusive,
        session.matches_scheduled
    );
    assert!(session.rankings.len() <= 2);
    assert!(session
        .rankings
        .windows(2)
        .all(|w| w[0].rating >= w[1].rating));

    let low_fitness: Vec<_> = session
        .deletions
        .iter()
        .filter(|d| matches!(d.reason, DeletionReason::LowFitness { .. }))
        .map(|d| d.agent_id.as_str())
        .collect();
    assert_eq!(low_fitness, ["weak_1", "weak_2"]);

    // deletions are reflected everywhere
    let remaining = agents.enumerate().unwrap();
    assert_eq!(remaining.len(), session.rankings.len());
    let registry = RatingRegistry::load(config.ratings_path());
    for deletion in &session.deletions {
        assert!(!registry.contains(&deletion.agent_id));
        assert!(agents.load(&deletion.agent_id).is_err());
    }
    for standing in &session.rankings {
        assert!((registry.get(&standing.agent_id) - standing.rating).abs() < 1e-6);
    }
    let logged: Vec<_> = DeletionLog::new(config.deletions_path())
        .read_all()
        .unwrap()
        .into_iter()
        .map(|d| d.agent_id)
        .collect();
    let deleted: Vec<_> = session.deletions.iter().map(|d| d.agent_id.clone()).collect();
    assert_eq!(logged, deleted);

    // recorded matches are indexed with their post-match ratings
    let index = MatchIndex::open(config.index_path());
    assert_eq!(index.len(), session.matches_played);
    for entry in index.search(&MatchQuery::new().with_match_type("tournament")) {
        assert!(entry.metadata.contains_key("p1_rating_after"));
        assert!(entry.file_path.as_ref().is_some_and(|p| p.exists()));
    }

    let history = LeagueHistory::load(config.history_path());
    assert_eq!(history.champions.len(), 1);
    assert_eq!(
        history.champions[0].agent_id,
        session.champion().unwrap().agent_id
    );
    assert!(config.last_session_path().exists());
}

#[test]
fn index_can_be_rebuilt_from_recordings() {
    let data = tempfile::tempdir().unwrap();
    let config = quiet(data.path());
    populate(
        &config.agents_dir(),
        &[
            ("a", 1.0, tracker(5.0, 0.0)),
            ("b", 1.0, tracker(20.0, 0.0)),
            ("c", 1.0, AgentSpec::Idle),
        ],
    );
    let settings = TournamentSettings::default()
        .with_record_matches(true)
        .with_delete_on_shutout(false)
        .with_similarity_threshold(0.0)
        .with_retain_top_n(0);
    let session = TournamentScheduler::from_configuration(config.clone(), settings)
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(session.matches_played, 3);

    fs::write(config.index_path(), "garbage").unwrap();
    let mut index = MatchIndex::open(config.index_path());
    assert!(index.is_empty());
    assert_eq!(index.rebuild(&config.matches_dir()).unwrap(), 3);

    let reopened = MatchIndex::open(config.index_path());
    assert_eq!(reopened.len(), 3);
    assert_eq!(reopened.by_participant("a").len(), 2);
    let h2h = reopened.head_to_head("a", "b");
    assert_eq!(h2h.total_matches, 1);
    assert_eq!(h2h.a_wins + h2h.b_wins + h2h.draws, 1);
}

#[test]
fn shutouts_cascade_through_the_queue() {
    // with a target of one point every decisive match is a shutout
    let roster = Arc::new(
        AgentRoster::new()
            .with_agent("idle_1", paddle_league::agent::IdleAgent)
            .with_agent("idle_2", paddle_league::agent::IdleAgent)
            .with_agent("idle_3", paddle_league::agent::IdleAgent)
            .with_agent("idle_4", paddle_league::agent::IdleAgent)
            .with_agent("idle_5", paddle_league::agent::IdleAgent),
    );
    let ids = ["idle_1", "idle_2", "idle_3", "idle_4", "idle_5"];
    let population = Arc::new(StaticPopulation::new(
        ids.iter().map(|id| PopulationEntry::new(*id, 1.0)).collect(),
    ));
    let mut settings = TournamentSettings::default()
        .with_target_score(1)
        .with_retain_top_n(0)
        .with_similarity_threshold(0.0)
        .with_seed(9);
    settings.shutout_score_gap = 1;

    let mut scheduler = TournamentScheduler::new(
        Configuration::new().with_verbose(false).with_workers(2),
        settings,
        roster,
        population.clone(),
        RatingRegistry::in_memory(),
    );
    let session = scheduler.run().unwrap();
    assert_eq!(session.outcome, SessionOutcome::Completed);

    let shutouts: Vec<_> = session
        .deletions
        .iter()
        .filter(|d| matches!(d.reason, DeletionReason::Shutout { .. }))
        .collect();
    // idle paddles never return the serve: every match is decided
    assert!(!shutouts.is_empty());
    assert_eq!(
        session.matches_played + session.matches_skipped,
        session.matches_scheduled
    );
    for deletion in &shutouts {
        assert!(!population.ids().contains(&deletion.agent_id));
        assert!(!scheduler.registry().contains(&deletion.agent_id));
        assert!(session
            .rankings
            .iter()
            .all(|s| s.agent_id != deletion.agent_id));
    }
    assert_eq!(population.ids().len() + shutouts.len(), ids.len());
}

/// Agent directory that reads the ratings file each time an agent file is about to go.
struct RatingsOnDelete {
    agents: AgentDirectory,
    ratings: PathBuf,
    seen: Mutex<Vec<(String, BTreeMap<String, f64>)>>,
}

impl PopulationProvider for RatingsOnDelete {
    fn enumerate(&self) -> anyhow::Result<Vec<PopulationEntry>> {
        self.agents.enumerate()
    }

    fn delete(&self, agent_id: &str) -> anyhow::Result<()> {
        let on_disk = RatingRegistry::load(&self.ratings)
            .iter()
            .map(|(id, rating)| (id.to_string(), rating))
            .collect();
        self.seen
            .lock()
            .unwrap()
            .push((agent_id.to_string(), on_disk));
        self.agents.delete(agent_id)
    }
}

#[test]
fn ratings_file_follows_every_deletion() {
    let data = tempfile::tempdir().unwrap();
    let config = quiet(data.path()).with_workers(2);
    let ids = ["i1", "i2", "i3", "i4", "i5", "i6"];
    let agents: Vec<_> = ids.iter().map(|id| (*id, 1.0, AgentSpec::Idle)).collect();
    let directory = populate(&config.agents_dir(), &agents);

    let mut seeded = RatingRegistry::load(config.ratings_path());
    for id in ids {
        seeded.set(id, 1200.0);
    }
    seeded.save().unwrap();

    let watched = Arc::new(RatingsOnDelete {
        agents: directory.clone(),
        ratings: config.ratings_path(),
        seen: Mutex::new(vec![]),
    });
    let mut settings = TournamentSettings::default()
        .with_target_score(1)
        .with_retain_top_n(0)
        .with_similarity_threshold(0.0)
        .with_seed(3);
    settings.shutout_score_gap = 1;
    let session = TournamentScheduler::new(
        config.clone(),
        settings,
        Arc::new(directory),
        watched.clone(),
        RatingRegistry::load(config.ratings_path()),
    )
    .run()
    .unwrap();

    let seen = watched.seen.lock().unwrap();
    assert!(!seen.is_empty());
    // the shutout that caused the first deletion is already on disk
    assert!(seen[0].1.values().any(|rating| *rating > 1200.0));
    for (k, (_, on_disk)) in seen.iter().enumerate() {
        for (earlier, _) in &seen[..k] {
            assert!(!on_disk.contains_key(earlier), "{earlier} still rated on disk");
        }
    }

    let stored = RatingRegistry::load(config.ratings_path());
    for deletion in &session.deletions {
        assert!(!stored.contains(&deletion.agent_id));
    }
    assert_eq!(stored.len() + session.deletions.len(), ids.len());
}

#[test]
fn cancelled_tournament_skips_pruning() {
    let slow = |_: &FrameState, _: Side| {
        thread::sleep(Duration::from_millis(2));
        Move::None
    };
    let roster = Arc::new(
        AgentRoster::new()
            .with_agent("a", slow)
            .with_agent("b", slow)
            .with_agent("c", slow)
            .with_agent("d", slow),
    );
    let population = Arc::new(StaticPopulation::new(
        ["a", "b", "c", "d"]
            .iter()
            .map(|id| PopulationEntry::new(*id, 1.0))
            .collect(),
    ));
    let scheduler = TournamentScheduler::new(
        Configuration::new()
            .with_verbose(false)
            .with_workers(1)
            .with_stop_grace(Duration::from_millis(20)),
        TournamentSettings::default().with_retain_top_n(1),
        roster,
        population.clone(),
        RatingRegistry::in_memory(),
    );
    let handle = TournamentHandle::spawn(scheduler).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while handle.standings().running.is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(handle.standings().phase, TournamentPhase::Running);
    handle.cancel();

    let session = handle.join().unwrap();
    assert!(session.cancelled());
    assert!(session.matches_played < session.matches_scheduled);
    assert!(session.deletions.is_empty());
    assert_eq!(population.ids().len(), 4);
}
