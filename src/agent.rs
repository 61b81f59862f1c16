//! Agent registry
//!
//! Tracks which agents take part in coordination along with the policy each
//! one carries: priority tier, retention, default conflict strategy.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::conflict::ConflictStrategy;
use crate::error::{Error, Result};
use crate::storage::{self, KvStore, AGENT_PREFIX};

/// Priority tier, used as a conflict tie breaker. Higher wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentPriority {
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl AgentPriority {
    pub fn value(self) -> u8 {
        self as u8
    }
}

impl Default for AgentPriority {
    fn default() -> Self {
        AgentPriority::Medium
    }
}

impl std::fmt::Display for AgentPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentPriority::Low => write!(f, "low"),
            AgentPriority::Medium => write!(f, "medium"),
            AgentPriority::High => write!(f, "high"),
            AgentPriority::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Inactive,
    Maintenance,
    Error,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Active => write!(f, "active"),
            AgentStatus::Inactive => write!(f, "inactive"),
            AgentStatus::Maintenance => write!(f, "maintenance"),
            AgentStatus::Error => write!(f, "error"),
        }
    }
}

fn default_retention_days() -> u32 {
    90
}

fn default_true() -> bool {
    true
}

fn default_working_items() -> usize {
    50
}

/// Registration parameters for an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub priority: AgentPriority,

    /// Days a deleted record is kept before being purged
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    #[serde(default = "default_strategy")]
    pub default_strategy: ConflictStrategy,

    /// Whether background sync passes include this agent
    #[serde(default = "default_true")]
    pub auto_sync: bool,

    #[serde(default = "default_working_items")]
    pub max_working_memory_items: usize,

    #[serde(default)]
    pub memory_categories: Vec<String>,
}

fn default_strategy() -> ConflictStrategy {
    ConflictStrategy::LatestWins
}

impl AgentConfig {
    pub fn new(agent_id: impl Into<String>) -> Self {
        let agent_id = agent_id.into();
        Self {
            name: agent_id.clone(),
            agent_id,
            priority: AgentPriority::default(),
            retention_days: default_retention_days(),
            default_strategy: default_strategy(),
            auto_sync: true,
            max_working_memory_items: default_working_items(),
            memory_categories: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: AgentPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    pub fn with_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    pub fn with_auto_sync(mut self, auto_sync: bool) -> Self {
        self.auto_sync = auto_sync;
        self
    }

    pub fn with_max_working_memory_items(mut self, items: usize) -> Self {
        self.max_working_memory_items = items;
        self
    }

    pub fn with_categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.memory_categories = categories.into_iter().map(Into::into).collect();
        self
    }

    pub fn retention(&self) -> Duration {
        Duration::days(i64::from(self.retention_days))
    }

    fn validate(&self) -> Result<()> {
        if self.agent_id.trim().is_empty() {
            return Err(Error::invalid_input("agent_id must not be empty"));
        }
        if self.agent_id.contains(':') {
            return Err(Error::invalid_input(format!(
                "agent_id must not contain ':' ({})",
                self.agent_id
            )));
        }
        Ok(())
    }
}

/// A registered participant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    #[serde(flatten)]
    pub config: AgentConfig,

    pub status: AgentStatus,

    pub registered_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn id(&self) -> &str {
        &self.config.agent_id
    }

    pub fn priority(&self) -> AgentPriority {
        self.config.priority
    }

    pub fn is_active(&self) -> bool {
        self.status == AgentStatus::Active
    }
}

/// Registry of agents, persisted under `agent:<id>`
pub struct AgentRegistry {
    store: Arc<dyn KvStore>,
    agents: RwLock<HashMap<String, Agent>>,
}

impl AgentRegistry {
    /// Load every persisted agent
    pub fn open(store: Arc<dyn KvStore>) -> Result<Self> {
        let agents: Vec<Agent> = storage::scan_json(store.as_ref(), AGENT_PREFIX)?;
        tracing::info!(agents = agents.len(), "Loaded agent registry");

        Ok(Self {
            store,
            agents: RwLock::new(
                agents
                    .into_iter()
                    .map(|a| (a.config.agent_id.clone(), a))
                    .collect(),
            ),
        })
    }

    fn persist(&self, agent: &Agent) -> Result<()> {
        storage::put_json(
            self.store.as_ref(),
            &format!("{}{}", AGENT_PREFIX, agent.id()),
            agent,
        )
    }

    /// Register an agent. Re-registering an inactive agent reactivates it
    /// with the new configuration.
    pub fn register(&self, config: AgentConfig) -> Result<Agent> {
        config.validate()?;

        let mut agents = self
            .agents
            .write()
            .map_err(|e| Error::storage(e.to_string()))?;

        let now = Utc::now();
        let agent = match agents.get(&config.agent_id) {
            Some(existing) if existing.status != AgentStatus::Inactive => {
                return Err(Error::AlreadyRegistered(config.agent_id));
            }
            Some(existing) => Agent {
                config,
                status: AgentStatus::Active,
                registered_at: existing.registered_at,
                updated_at: now,
            },
            None => Agent {
                config,
                status: AgentStatus::Active,
                registered_at: now,
                updated_at: now,
            },
        };

        self.persist(&agent)?;
        agents.insert(agent.id().to_string(), agent.clone());

        tracing::info!(
            agent_id = %agent.id(),
            priority = %agent.priority(),
            strategy = %agent.config.default_strategy,
            "Registered agent"
        );
        Ok(agent)
    }

    /// Mark an agent inactive; its slice is left in place
    pub fn deregister(&self, agent_id: &str) -> Result<Agent> {
        let agent = self.update_status(agent_id, AgentStatus::Inactive)?;
        tracing::info!(agent_id = %agent_id, "Deregistered agent");
        Ok(agent)
    }

    pub fn update_status(&self, agent_id: &str, status: AgentStatus) -> Result<Agent> {
        let mut agents = self
            .agents
            .write()
            .map_err(|e| Error::storage(e.to_string()))?;

        let mut agent = agents
            .get(agent_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("agent {}", agent_id)))?;
        agent.status = status;
        agent.updated_at = Utc::now();

        self.persist(&agent)?;
        agents.insert(agent_id.to_string(), agent.clone());
        Ok(agent)
    }

    pub fn get(&self, agent_id: &str) -> Result<Agent> {
        let agents = self
            .agents
            .read()
            .map_err(|e| Error::storage(e.to_string()))?;
        agents
            .get(agent_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("agent {}", agent_id)))
    }

    /// The agent, provided it exists and is active
    pub fn ensure_active(&self, agent_id: &str) -> Result<Agent> {
        let agent = self.get(agent_id)?;
        if !agent.is_active() {
            return Err(Error::AgentInactive(agent_id.to_string()));
        }
        Ok(agent)
    }

    /// All agents ordered by id
    pub fn list(&self) -> Vec<Agent> {
        let Ok(agents) = self.agents.read() else {
            return Vec::new();
        };
        let mut list: Vec<Agent> = agents.values().cloned().collect();
        list.sort_by(|a, b| a.id().cmp(b.id()));
        list
    }

    /// Ids of active agents, ordered
    pub fn active(&self) -> Vec<String> {
        self.list()
            .into_iter()
            .filter(Agent::is_active)
            .map(|a| a.config.agent_id)
            .collect()
    }

    pub fn is_active(&self, agent_id: &str) -> bool {
        self.get(agent_id).map(|a| a.is_active()).unwrap_or(false)
    }

    /// Unknown agents rank lowest
    pub fn priority_of(&self, agent_id: &str) -> AgentPriority {
        self.get(agent_id)
            .map(|a| a.priority())
            .unwrap_or(AgentPriority::Low)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryKv;

    fn registry() -> (Arc<dyn KvStore>, AgentRegistry) {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryKv::new());
        let registry = AgentRegistry::open(store.clone()).unwrap();
        (store, registry)
    }

    #[test]
    fn register_twice_is_rejected() {
        let (_, registry) = registry();
        registry
            .register(AgentConfig::new("alden").with_priority(AgentPriority::High))
            .unwrap();

        let err = registry.register(AgentConfig::new("alden")).unwrap_err();
        assert!(matches!(err, Error::AlreadyRegistered(id) if id == "alden"));
    }

    #[test]
    fn deregistered_agent_can_be_reactivated() {
        let (_, registry) = registry();
        let first = registry.register(AgentConfig::new("mimic")).unwrap();
        registry.deregister("mimic").unwrap();
        assert!(!registry.is_active("mimic"));
        assert!(matches!(
            registry.ensure_active("mimic").unwrap_err(),
            Error::AgentInactive(_)
        ));

        let again = registry
            .register(AgentConfig::new("mimic").with_priority(AgentPriority::Low))
            .unwrap();
        assert!(again.is_active());
        assert_eq!(again.registered_at, first.registered_at);
        assert_eq!(again.priority(), AgentPriority::Low);
    }

    #[test]
    fn unknown_agent_is_not_found_and_ranks_low() {
        let (_, registry) = registry();
        assert!(matches!(registry.get("ghost").unwrap_err(), Error::NotFound(_)));
        assert!(registry.deregister("ghost").is_err());
        assert_eq!(registry.priority_of("ghost"), AgentPriority::Low);
    }

    #[test]
    fn registry_survives_reopen() {
        let (store, registry) = registry();
        registry
            .register(AgentConfig::new("sentry").with_strategy(ConflictStrategy::ManualReview))
            .unwrap();
        registry.register(AgentConfig::new("alice")).unwrap();
        registry.deregister("alice").unwrap();

        let reopened = AgentRegistry::open(store).unwrap();
        assert_eq!(reopened.list().len(), 2);
        assert_eq!(reopened.active(), vec!["sentry".to_string()]);
        assert_eq!(
            reopened.get("sentry").unwrap().config.default_strategy,
            ConflictStrategy::ManualReview
        );
    }

    #[test]
    fn priority_orders_numerically() {
        assert!(AgentPriority::Critical > AgentPriority::High);
        assert!(AgentPriority::Medium > AgentPriority::Low);
        assert_eq!(AgentPriority::High.value(), 3);
    }

    #[test]
    fn colon_in_agent_id_is_rejected() {
        let (_, registry) = registry();
        assert!(matches!(
            registry.register(AgentConfig::new("a:b")).unwrap_err(),
            Error::InvalidInput(_)
        ));
    }
}
