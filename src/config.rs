//! Configuration for dieah-sync

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::{AgentConfig, AgentPriority};
use crate::conflict::ConflictStrategy;
use crate::error::{Error, Result};
use crate::sharing::{RuleTrigger, SharingRule};

/// Configuration for the coordination engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory for all storage
    pub data_dir: PathBuf,

    /// Seconds between background sync passes
    pub sync_interval_secs: u64,

    /// Default lifetime of a lock
    pub lock_duration_secs: u64,

    /// Upper bound on how long `wait=true` acquisitions park
    pub lock_wait_timeout_secs: u64,

    /// Lifetime given to working memory stored without an explicit expiry
    pub working_memory_ttl_secs: u64,

    /// Sync operations kept in memory for statistics
    pub operation_history: usize,

    /// Embedding dimensions (384 for all-MiniLM-L6-v2)
    pub embedding_dimensions: usize,

    /// Maximum number of results returned by search
    pub max_search_results: usize,

    /// Minimum similarity score for search results (0.0 - 1.0)
    pub min_similarity_score: f32,

    /// HTTP server port
    pub server_port: u16,

    /// Agents registered at startup
    pub agents: Vec<AgentConfig>,

    pub sharing_rules: Vec<SharingRule>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("dieah-sync");

        Self {
            data_dir,
            sync_interval_secs: 60,
            lock_duration_secs: 300,
            lock_wait_timeout_secs: 30,
            working_memory_ttl_secs: 3600,
            operation_history: 1000,
            embedding_dimensions: 384,
            max_search_results: 10,
            min_similarity_score: 0.0,
            server_port: 8421,
            agents: default_agents(),
            sharing_rules: default_sharing_rules(),
        }
    }
}

impl Config {
    /// Create a new config with a custom data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Parse a TOML document; absent fields keep their defaults
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(source).map_err(|e| Error::config(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&source)
    }

    /// Load from `DIEAH_SYNC_CONFIG` if set, then apply environment overrides
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var("DIEAH_SYNC_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `DIEAH_SYNC_*` environment overrides
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(dir) = env_var("DIEAH_SYNC_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(v) = env_parse("DIEAH_SYNC_INTERVAL_SECS")? {
            self.sync_interval_secs = v;
        }
        if let Some(v) = env_parse("DIEAH_SYNC_LOCK_DURATION_SECS")? {
            self.lock_duration_secs = v;
        }
        if let Some(v) = env_parse("DIEAH_SYNC_LOCK_WAIT_SECS")? {
            self.lock_wait_timeout_secs = v;
        }
        if let Some(v) = env_parse("DIEAH_SYNC_PORT")? {
            self.server_port = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync_interval_secs == 0 {
            return Err(Error::config("sync_interval_secs must be positive"));
        }
        if self.lock_duration_secs == 0 {
            return Err(Error::config("lock_duration_secs must be positive"));
        }
        if !(0.0..=1.0).contains(&self.min_similarity_score) {
            return Err(Error::config("min_similarity_score must be in [0, 1]"));
        }
        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn lock_duration(&self) -> Duration {
        Duration::from_secs(self.lock_duration_secs)
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_wait_timeout_secs)
    }

    pub fn working_memory_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.working_memory_ttl_secs).unwrap_or(i64::MAX))
    }

    /// Get the path to the SQLite database
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("coordination.db")
    }

    /// Get the path to the sync operation audit log
    pub fn operation_log_path(&self) -> PathBuf {
        self.data_dir.join("logs").join("sync_operations.jsonl")
    }

    /// Ensure all required directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.data_dir.join("logs"))?;
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    env_var(name)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|_| Error::config(format!("{} has an invalid value: {}", name, raw)))
        })
        .transpose()
}

/// The four standard Dieah agents
pub fn default_agents() -> Vec<AgentConfig> {
    vec![
        AgentConfig::new("alden")
            .with_priority(AgentPriority::High)
            .with_retention_days(90)
            .with_strategy(ConflictStrategy::LatestWins)
            .with_max_working_memory_items(50)
            .with_categories(["conversation", "preference", "productivity", "scheduling"]),
        AgentConfig::new("alice")
            .with_priority(AgentPriority::Medium)
            .with_retention_days(60)
            .with_strategy(ConflictStrategy::HighestImportance)
            .with_max_working_memory_items(30)
            .with_categories(["behavior", "analysis", "pattern"]),
        AgentConfig::new("sentry")
            .with_priority(AgentPriority::Medium)
            .with_retention_days(180)
            .with_strategy(ConflictStrategy::ManualReview)
            .with_max_working_memory_items(20)
            .with_categories(["security", "incident", "threat"]),
        AgentConfig::new("mimic")
            .with_priority(AgentPriority::Low)
            .with_retention_days(30)
            .with_strategy(ConflictStrategy::AgentPriority)
            .with_auto_sync(false)
            .with_max_working_memory_items(40)
            .with_categories(["persona", "style", "preference"]),
    ]
}

pub fn default_sharing_rules() -> Vec<SharingRule> {
    vec![
        SharingRule::global_allow("user-preferences", "preference", ["alden", "alice", "mimic"]),
        SharingRule::global_allow("system-knowledge", "knowledge", ["alden", "alice", "sentry"]),
        SharingRule::global_allow("security-alerts", "security", ["alden", "sentry"]),
        SharingRule::global_allow("behavioral-patterns", "behavior", ["alice", "mimic"]),
        SharingRule::restricted("alden-personal", "alden", "personal_conversation"),
        SharingRule::restricted("alden-private-tasks", "alden", "private_task"),
        SharingRule::restricted("alice-internals", "alice", "analysis_internals"),
        SharingRule::restricted("alice-cognitive-model", "alice", "cognitive_model"),
        SharingRule::restricted("sentry-credentials", "sentry", "security_credentials"),
        SharingRule::restricted("sentry-incident-details", "sentry", "incident_details"),
        SharingRule::restricted("mimic-persona-templates", "mimic", "persona_template"),
        SharingRule::restricted("mimic-style-adaptation", "mimic", "style_adaptation"),
        SharingRule::auto_propagate(
            "preference-changes",
            RuleTrigger::Tag("preference-change".into()),
            ["alden", "mimic"],
        ),
        SharingRule::auto_propagate(
            "security-incidents",
            RuleTrigger::Tag("security-incident".into()),
            ["alden", "sentry"],
        ),
        SharingRule::auto_propagate(
            "behavioral-insights",
            RuleTrigger::Tag("behavioral-insight".into()),
            ["alden", "alice"],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharing::SharingMode;

    #[test]
    fn defaults_carry_the_standard_roster() {
        let config = Config::default();
        let ids: Vec<&str> = config.agents.iter().map(|a| a.agent_id.as_str()).collect();
        assert_eq!(ids, ["alden", "alice", "sentry", "mimic"]);
        assert_eq!(config.sync_interval(), Duration::from_secs(60));
        assert_eq!(config.lock_duration(), Duration::from_secs(300));
        assert_eq!(config.lock_wait_timeout(), Duration::from_secs(30));
        assert!(config
            .sharing_rules
            .iter()
            .any(|r| r.mode == SharingMode::RestrictedDeny));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            sync_interval_secs = 5

            [[agents]]
            agent_id = "scout"
            priority = "critical"
            default_strategy = "merge-content"

            [[sharing_rules]]
            name = "notes"
            trigger = { category = "note*" }
            target_agents = ["scout"]
            mode = "global-allow"
            "#,
        )
        .unwrap();

        assert_eq!(config.sync_interval_secs, 5);
        assert_eq!(config.lock_wait_timeout_secs, 30);
        assert_eq!(config.agents.len(), 1);
        assert_eq!(config.agents[0].priority, AgentPriority::Critical);
        assert_eq!(config.agents[0].retention_days, 90);
        assert!(config.agents[0].auto_sync);
        assert_eq!(config.sharing_rules[0].trigger, RuleTrigger::Category("note*".into()));
    }

    #[test]
    fn zero_interval_is_rejected() {
        assert!(Config::from_toml_str("sync_interval_secs = 0").is_err());
        assert!(Config::from_toml_str("not toml = [").is_err());
    }

    #[test]
    fn paths_live_under_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_data_dir(dir.path());
        config.ensure_dirs().unwrap();
        assert!(config.sqlite_path().starts_with(dir.path()));
        assert!(config.operation_log_path().parent().unwrap().exists());
    }
}
