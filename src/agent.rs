use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::EngineError;
use crate::simulation::{FrameState, Move, Side, BALL_RADIUS, PADDLE_HEIGHT};

/// A cooperative decision function controlling one paddle.
pub trait Agent: Send + Sync {
    fn decide(&self, frame: &FrameState, side: Side) -> Move;
}

impl<F> Agent for F
where
    F: Fn(&FrameState, Side) -> Move + Send + Sync,
{
    fn decide(&self, frame: &FrameState, side: Side) -> Move {
        self(frame, side)
    }
}

/// Resolves agent ids to decision functions.
///
/// Implementations are shared (read-only) by every worker, each worker keeping its own
/// [`AgentCache`] in front of it.
pub trait AgentProvider: Send + Sync {
    fn load(&self, id: &str) -> Result<Arc<dyn Agent>, EngineError>;
}

/// Opaque reference to a resolved agent, owned by the cache that created it.
pub type AgentHandle = Arc<dyn Agent>;

/// Parameters of the built-in agents, as stored in agent descriptor files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentSpec {
    /// Follows the ball, optionally extrapolating its position `lookahead` frames ahead.
    Tracker {
        #[serde(default = "default_dead_zone")]
        dead_zone: f32,
        #[serde(default)]
        lookahead: f32,
    },
    /// Never moves.
    Idle,
}

fn default_dead_zone() -> f32 {
    10.0
}

impl AgentSpec {
    pub fn build(&self) -> AgentHandle {
        match *self {
            AgentSpec::Tracker {
                dead_zone,
                lookahead,
            } => Arc::new(TrackerAgent {
                dead_zone,
                lookahead,
            }),
            AgentSpec::Idle => Arc::new(IdleAgent),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TrackerAgent {
    pub dead_zone: f32,
    pub lookahead: f32,
}

impl Agent for TrackerAgent {
    fn decide(&self, frame: &FrameState, side: Side) -> Move {
        let approaching = match side {
            Side::Left => frame.ball_vel_x < 0.0,
            Side::Right => frame.ball_vel_x > 0.0,
        };
        let mut target = frame.ball_y + BALL_RADIUS;
        if approaching {
            target += frame.ball_vel_y * self.lookahead;
        }
        let paddle_center = frame.paddle_y(side) + PADDLE_HEIGHT / 2.0;
        if target < paddle_center - self.dead_zone {
            Move::Up
        } else if target > paddle_center + self.dead_zone {
            Move::Down
        } else {
            Move::None
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IdleAgent;

impl Agent for IdleAgent {
    fn decide(&self, _frame: &FrameState, _side: Side) -> Move {
        Move::None
    }
}

/// In-memory provider, mostly useful for tests and embedding.
#[derive(Default, Clone)]
pub struct AgentRoster {
    agents: HashMap<String, AgentHandle>,
}

impl AgentRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agent(mut self, id: impl Into<String>, agent: impl Agent + 'static) -> Self {
        self.agents.insert(id.into(), Arc::new(agent));
        self
    }

    pub fn insert(&mut self, id: impl Into<String>, agent: AgentHandle) {
        self.agents.insert(id.into(), agent);
    }
}

impl AgentProvider for AgentRoster {
    fn load(&self, id: &str) -> Result<AgentHandle, EngineError> {
        self.agents
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::AgentNotFound(id.to_string()))
    }
}

/// Bounded, worker-local cache of resolved agents with FIFO eviction.
pub struct AgentCache {
    capacity: usize,
    order: VecDeque<String>,
    agents: HashMap<String, AgentHandle>,
}

impl AgentCache {
    pub const DEFAULT_CAPACITY: usize = 50;

    pub fn new(capacity: usize) -> AgentCache {
        AgentCache {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            agents: HashMap::new(),
        }
    }

    /// Returns the cached agent, loading it through `provider` on a miss.
    pub fn get_or_load(
        &mut self,
        id: &str,
        provider: &dyn AgentProvider,
    ) -> Result<AgentHandle, EngineError> {
        if let Some(agent) = self.agents.get(id) {
            return Ok(agent.clone());
        }
        let agent = provider.load(id)?;
        if self.agents.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                trace!(evicted = %oldest, "agent cache full");
                self.agents.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.agents.insert(id.to_string(), agent.clone());
        Ok(agent)
    }

    /// Drops a cached agent, e.g. after its descriptor was deleted.
    pub fn invalidate(&mut self, id: &str) {
        if self.agents.remove(id).is_some() {
            self.order.retain(|cached| cached != id);
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.agents.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
