//! Orchestrator configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// What a process does with the event queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestratorMode {
    /// Enqueue only. Never drains the queue.
    Producer,
    /// Drain only. Does not start the cron scheduler.
    Worker,
    /// Both.
    #[default]
    All,
}

impl OrchestratorMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrchestratorMode::Producer => "producer",
            OrchestratorMode::Worker => "worker",
            OrchestratorMode::All => "all",
        }
    }

    /// True if this mode drains the queue.
    pub fn consumes(&self) -> bool {
        !matches!(self, OrchestratorMode::Producer)
    }

    /// True if this mode runs the cron scheduler.
    pub fn schedules(&self) -> bool {
        !matches!(self, OrchestratorMode::Worker)
    }
}

impl fmt::Display for OrchestratorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When a processed event is acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AckPolicy {
    /// Ack every processed event.
    #[default]
    Always,
    /// Ack only events with no dispatch errors and no failed workflows;
    /// nack the rest.
    OnSuccess,
}

/// Distributed lock settings for chatflow conversations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationLockConfig {
    pub ttl: Duration,
    /// Extra acquisition attempts after the first.
    pub retry_count: u32,
    pub retry_delay: Duration,
    /// Refresh period while held. `None` disables refreshing.
    pub refresh_interval: Option<Duration>,
    /// Prepended to the conversation id to form the lock key.
    pub key_prefix: String,
}

impl Default for ConversationLockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            retry_count: 50,
            retry_delay: Duration::from_millis(100),
            refresh_interval: Some(Duration::from_secs(10)),
            key_prefix: "conversation:".to_string(),
        }
    }
}

impl ConversationLockConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_retry(mut self, retry_count: u32, retry_delay: Duration) -> Self {
        self.retry_count = retry_count;
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Option<Duration>) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn lock_key(&self, conversation_id: &str) -> String {
        format!("{}{}", self.key_prefix, conversation_id)
    }
}

/// Top-level orchestrator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub mode: OrchestratorMode,
    /// Events processed concurrently by the drain loop.
    pub max_concurrent_events: usize,
    /// Workflows run concurrently for one event.
    pub workflow_concurrency: usize,
    pub ack_policy: AckPolicy,
    pub conversation_lock: ConversationLockConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            mode: OrchestratorMode::All,
            max_concurrent_events: 1,
            workflow_concurrency: 2,
            ack_policy: AckPolicy::Always,
            conversation_lock: ConversationLockConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_mode(mut self, mode: OrchestratorMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_max_concurrent_events(mut self, max: usize) -> Self {
        self.max_concurrent_events = max;
        self
    }

    pub fn with_workflow_concurrency(mut self, concurrency: usize) -> Self {
        self.workflow_concurrency = concurrency;
        self
    }

    pub fn with_ack_policy(mut self, policy: AckPolicy) -> Self {
        self.ack_policy = policy;
        self
    }

    pub fn with_conversation_lock(mut self, config: ConversationLockConfig) -> Self {
        self.conversation_lock = config;
        self
    }
}
