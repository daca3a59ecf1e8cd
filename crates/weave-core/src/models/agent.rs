use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Step types an agent can execute. Every step is bound to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Design,
    Build,
    Test,
    Review,
    Release,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::Design,
        Capability::Build,
        Capability::Test,
        Capability::Review,
        Capability::Release,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Design => "design",
            Self::Build => "build",
            Self::Test => "test",
            Self::Review => "review",
            Self::Release => "release",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "design" => Some(Self::Design),
            "build" => Some(Self::Build),
            "test" => Some(Self::Test),
            "review" => Some(Self::Review),
            "release" => Some(Self::Release),
            _ => None,
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentHealth {
    Healthy,
    Degraded,
    Unreachable,
}

impl AgentHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unreachable => "unreachable",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "healthy" => Some(Self::Healthy),
            "degraded" => Some(Self::Degraded),
            "unreachable" => Some(Self::Unreachable),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRegistration {
    pub agent_id: String,
    pub capabilities: Vec<Capability>,
    pub health: AgentHealth,
    pub last_heartbeat_at: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    /// Steps currently assigned to this agent. Not persisted.
    #[serde(default)]
    pub in_flight: u32,
}

impl AgentRegistration {
    pub fn new(agent_id: String, capabilities: Vec<Capability>) -> Self {
        let now = Utc::now();
        let mut capabilities = capabilities;
        capabilities.sort();
        capabilities.dedup();
        Self {
            agent_id,
            capabilities,
            health: AgentHealth::Healthy,
            last_heartbeat_at: now,
            registered_at: now,
            in_flight: 0,
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}
