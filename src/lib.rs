//! # Paddle League
//!
//! A concurrent match-execution and tournament engine for two-paddle ("pong") agents.
//!
//! It provides:
//! - A deterministic court simulation ([`simulation`])
//! - Isolated match execution through the [`WorkerEngine`](crate::worker::WorkerEngine) message
//!   protocol, one OS thread per worker
//! - Round-robin tournaments with Elo ratings, shutout deletion and population retention
//!   ([`TournamentScheduler`](crate::tournament_scheduler::TournamentScheduler))
//! - A durable, queryable [`MatchIndex`](crate::match_index::MatchIndex) of recorded matches
//!
//! Agents are cooperative decision functions implementing [`Agent`](crate::agent::Agent). They
//! are resolved by id through an [`AgentProvider`](crate::agent::AgentProvider); the built-in
//! [`AgentDirectory`](crate::agent_collector::AgentDirectory) reads them from `<id>.json`
//! descriptor files.
//!
//! # Documentation Overview
//!
//! - For the worker protocol and lifecycle, see the [`worker`] and [`protocol`] modules.
//! - For tournament phases, failure handling and cancellation, see [`tournament_scheduler`].
//! - For the retention policy, see [`tournament_strategy`].
//! - For runtime options and the settings file, see [`configuration`].
//!
//! # Usage Example
//!
//! ```no_run
//! use paddle_league::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Configuration::from_env().with_data_dir("league_data");
//!     let settings = LeagueSettings::load(config.settings_path())?.tournament;
//!
//!     let scheduler = TournamentScheduler::from_configuration(config, settings)?;
//!     let handle = TournamentHandle::spawn(scheduler)?;
//!     let session = handle.join()?;
//!
//!     for (rank, standing) in session.rankings.iter().enumerate() {
//!         println!("{}. {} ({:.1})", rank + 1, standing.agent_id, standing.rating);
//!     }
//!     Ok(())
//! }
//! ```

pub use anyhow;

pub mod agent;
pub mod agent_collector;
pub mod analytics;
pub mod configuration;
pub mod error;
mod logger;
pub mod match_index;
pub mod match_runner;
pub mod population;
pub mod protocol;
pub mod rating;
pub mod recorder;
pub mod session;
pub mod simulation;
pub mod tournament_scheduler;
pub mod tournament_strategy;
pub mod worker;

pub use logger::init_logger;

/// Commonly used types and traits for quick access.
///
/// ```rust
/// use paddle_league::prelude::*;
/// ```
pub mod prelude {
    pub use crate::agent::{Agent, AgentCache, AgentProvider, AgentRoster, AgentSpec};
    pub use crate::agent_collector::{AgentDescriptor, AgentDirectory};
    pub use crate::configuration::{Configuration, LeagueSettings, TournamentSettings};
    pub use crate::error::EngineError;
    pub use crate::match_index::{MatchIndex, MatchQuery};
    pub use crate::match_runner::{MatchConfig, MatchResult};
    pub use crate::population::{PopulationEntry, PopulationProvider, StaticPopulation};
    pub use crate::rating::RatingRegistry;
    pub use crate::session::{SessionOutcome, TournamentSession};
    pub use crate::simulation::{FrameState, Move, Side};
    pub use crate::tournament_scheduler::{
        CancellationToken, Standings, TournamentHandle, TournamentScheduler,
    };
    pub use crate::worker::{WorkerEngine, WorkerMode, WorkerSettings};
}
