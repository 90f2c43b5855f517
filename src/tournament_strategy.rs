//! Pairing and retention rules of a tournament.
//!
//! Everything here is pure: the [`TournamentScheduler`](crate::tournament_scheduler) decides when
//! to call these functions and applies their deletions.
//!
//! # Retention
//! After the round-robin is played, survivors go through two cuts:
//! - similarity pruning: agents whose ratings round to the same multiple of the similarity
//!   threshold are considered duplicates, and only the one with the best [`TournamentRecord`]
//!   survives;
//! - top-N: the remaining agents are ranked by rating and only the first N are kept.
//!
//! Ghost opponents are never deleted and never count toward either cut.

use std::{
    cmp::Ordering,
    collections::BTreeMap,
    fmt::{self, Display},
};

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::analytics::SideStats;
use crate::population::PopulationEntry;

/// One scheduled match, `left` playing on the left side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pairing {
    pub left: String,
    pub right: String,
}

impl Pairing {
    pub fn new(left: impl Into<String>, right: impl Into<String>) -> Pairing {
        Pairing {
            left: left.into(),
            right: right.into(),
        }
    }

    pub fn involves(&self, agent_id: &str) -> bool {
        self.left == agent_id || self.right == agent_id
    }
}

impl Display for Pairing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} vs {}", self.left, self.right)
    }
}

/// Every agent plays every other agent once.
pub struct RoundRobinTournament {
    seed: u64,
}

impl RoundRobinTournament {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// All `n·(n-1)/2` unordered pairs `(i, j)` with `i < j`, in a seeded random order.
    pub fn pairings(&self, agents: &[String]) -> Vec<Pairing> {
        let n = agents.len();
        let mut pending = Vec::with_capacity(n * n.saturating_sub(1) / 2);
        for i in 0..n {
            for j in i + 1..n {
                pending.push(Pairing::new(agents[i].clone(), agents[j].clone()));
            }
        }
        let mut rng = StdRng::seed_from_u64(self.seed);
        pending.shuffle(&mut rng);
        pending
    }
}

/// Results of one agent during a tournament.
#[derive(Default, Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TournamentRecord {
    pub wins: u32,
    pub draws: u32,
    pub losses: u32,
    pub points_scored: u32,
    pub points_conceded: u32,
    /// Play statistics summed over all matches.
    pub play: SideStats,
}

impl TournamentRecord {
    pub fn record(&mut self, scored: u32, conceded: u32) {
        match scored.cmp(&conceded) {
            Ordering::Greater => self.wins += 1,
            Ordering::Less => self.losses += 1,
            Ordering::Equal => self.draws += 1,
        }
        self.points_scored += scored;
        self.points_conceded += conceded;
    }

    pub fn matches(&self) -> u32 {
        self.wins + self.draws + self.losses
    }

    pub fn point_differential(&self) -> i64 {
        i64::from(self.points_scored) - i64::from(self.points_conceded)
    }
}

impl Display for TournamentRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "win: {}, draw: {}, loss: {}, points: {}-{}",
            self.wins, self.draws, self.losses, self.points_scored, self.points_conceded
        )
    }
}

/// Rating and record of an agent, as published in the standings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standing {
    pub agent_id: String,
    pub rating: f64,
    pub fitness: f64,
    pub ghost: bool,
    pub record: TournamentRecord,
}

impl Standing {
    pub fn new(entry: &PopulationEntry) -> Standing {
        Standing {
            agent_id: entry.agent_id.clone(),
            rating: entry.rating,
            fitness: entry.fitness,
            ghost: entry.ghost,
            record: TournamentRecord::default(),
        }
    }

    /// Wins, then point differential, then rating.
    pub fn compare_performance(&self, other: &Standing) -> Ordering {
        self.record
            .wins
            .cmp(&other.record.wins)
            .then(
                self.record
                    .point_differential()
                    .cmp(&other.record.point_differential()),
            )
            .then(self.rating.total_cmp(&other.rating))
    }
}

/// Why an agent was removed from the population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DeletionReason {
    LowFitness {
        fitness: f64,
        threshold: f64,
    },
    Shutout {
        opponent: String,
        score: (u32, u32),
    },
    SimilarityPruning {
        bucket: f64,
        kept: String,
    },
    NotInTopN {
        rank: usize,
        n: usize,
    },
}

impl Display for DeletionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeletionReason::LowFitness { fitness, threshold } => {
                write!(f, "fitness {fitness} below {threshold}")
            }
            DeletionReason::Shutout { opponent, score } => {
                write!(f, "shut out {}-{} by {opponent}", score.0, score.1)
            }
            DeletionReason::SimilarityPruning { bucket, kept } => {
                write!(f, "rating bucket {bucket} already held by {kept}")
            }
            DeletionReason::NotInTopN { rank, n } => write!(f, "rank {rank} outside top {n}"),
        }
    }
}

pub type Deletions = Vec<(String, DeletionReason)>;

/// Splits entries on the fitness threshold.
pub fn pre_filter(
    entries: Vec<PopulationEntry>,
    threshold: f64,
) -> (Vec<PopulationEntry>, Deletions) {
    let mut deletions = vec![];
    let kept = entries
        .into_iter()
        .filter(|entry| {
            if entry.ghost || entry.fitness >= threshold {
                return true;
            }
            deletions.push((
                entry.agent_id.clone(),
                DeletionReason::LowFitness {
                    fitness: entry.fitness,
                    threshold,
                },
            ));
            false
        })
        .collect();
    (kept, deletions)
}

/// A shutout: the loser scored nothing while the winner reached the target with at least `gap`
/// points of difference.
pub fn is_shutout(winner_score: u32, loser_score: u32, target: u32, gap: u32) -> bool {
    loser_score == 0 && winner_score >= target && winner_score - loser_score >= gap
}

/// Rating bucket of `rating`. Halves go to the even bucket so that e.g. 1205 lands with 1200.
pub fn similarity_bucket(rating: f64, similarity: f64) -> f64 {
    (rating / similarity).round_ties_even() * similarity
}

/// Keeps the best performer of each rating bucket. A non-positive similarity disables pruning.
pub fn similarity_prune(standings: Vec<Standing>, similarity: f64) -> (Vec<Standing>, Deletions) {
    if similarity <= 0.0 {
        return (standings, vec![]);
    }

    let mut kept = vec![];
    let mut buckets: BTreeMap<i64, Vec<Standing>> = BTreeMap::new();
    for standing in standings {
        if standing.ghost {
            kept.push(standing);
        } else {
            let key = (standing.rating / similarity).round_ties_even() as i64;
            buckets.entry(key).or_default().push(standing);
        }
    }

    let mut deletions = vec![];
    for (_, mut members) in buckets {
        members.sort_by(|a, b| b.compare_performance(a).then(a.agent_id.cmp(&b.agent_id)));
        let mut members = members.into_iter();
        let Some(best) = members.next() else {
            continue;
        };
        let bucket = similarity_bucket(best.rating, similarity);
        for pruned in members {
            deletions.push((
                pruned.agent_id,
                DeletionReason::SimilarityPruning {
                    bucket,
                    kept: best.agent_id.clone(),
                },
            ));
        }
        kept.push(best);
    }
    (kept, deletions)
}

/// Sorts by rating (best first) and keeps the first `n` non-ghost agents. `n == 0` keeps
/// everyone.
pub fn keep_top_n(mut standings: Vec<Standing>, n: usize) -> (Vec<Standing>, Deletions) {
    standings.sort_by(|a, b| {
        b.rating
            .total_cmp(&a.rating)
            .then(a.agent_id.cmp(&b.agent_id))
    });
    if n == 0 {
        return (standings, vec![]);
    }

    let mut kept = vec![];
    let mut deletions = vec![];
    let mut rank = 0;
    for standing in standings {
        if standing.ghost {
            kept.push(standing);
            continue;
        }
        rank += 1;
        if rank <= n {
            kept.push(standing);
        } else {
            deletions.push((standing.agent_id, DeletionReason::NotInTopN { rank, n }));
        }
    }
    (kept, deletions)
}
