//! Agent identity.
//!
//! An agent is a unit of singleton background work identified purely by URI.
//! The URI scheme names the agent family that knows how to run it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::IdError;

/// The sentinel agent URI a node runs while it holds cluster leadership.
pub const LEADER_URI: &str = "wolverine://leader";

/// URI identifying a single agent, e.g. `wolverinedb://master`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentUri(String);

impl AgentUri {
    /// Parses an agent URI. The scheme is normalised to lower case.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        let Some((scheme, rest)) = s.split_once("://") else {
            return Err(IdError::MissingScheme(s.to_string()));
        };

        if scheme.is_empty()
            || !scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        {
            return Err(IdError::MissingScheme(s.to_string()));
        }

        Ok(Self(format!("{}://{}", scheme.to_ascii_lowercase(), rest)))
    }

    /// Builds an agent URI from a family scheme and a path.
    pub fn from_parts(scheme: &str, path: &str) -> Result<Self, IdError> {
        Self::parse(&format!("{scheme}://{path}"))
    }

    /// The leadership sentinel URI.
    #[must_use]
    pub fn leader() -> Self {
        Self(LEADER_URI.to_string())
    }

    /// The family scheme of this agent.
    #[must_use]
    pub fn scheme(&self) -> &str {
        self.0.split_once("://").map_or("", |(scheme, _)| scheme)
    }

    /// Everything after `scheme://`.
    #[must_use]
    pub fn path(&self) -> &str {
        self.0.split_once("://").map_or("", |(_, path)| path)
    }

    /// Returns true for the leadership sentinel.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.0 == LEADER_URI
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for AgentUri {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AgentUri {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<AgentUri> for String {
    fn from(uri: AgentUri) -> Self {
        uri.0
    }
}
