//! Directory collaborator: tells a new session where the replicas are and
//! which replicas initially lead the two pilots.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use crate::client::messages::ReplicaId;
use crate::client::views::NUM_PILOTS;
use crate::utils::CopilotError;

use async_trait::async_trait;

use serde::Deserialize;

/// Source of cluster membership for a client session.
#[async_trait]
pub trait Directory: Send {
    /// Ordered list of replica addresses; a replica's index in this list is
    /// its replica ID.
    async fn replica_list(&mut self) -> Result<Vec<SocketAddr>, CopilotError>;

    /// Initial leader replica IDs of pilot 0 and pilot 1.
    async fn two_leaders(
        &mut self,
    ) -> Result<[ReplicaId; NUM_PILOTS], CopilotError>;
}

fn default_leaders() -> [ReplicaId; NUM_PILOTS] {
    [0, 1]
}

/// Directory backed by a fixed membership, typically parsed from TOML:
///
/// ```toml
/// servers = ["10.0.0.1:7070", "10.0.0.2:7070", "10.0.0.3:7070"]
/// leaders = [0, 1]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticDirectory {
    servers: Vec<SocketAddr>,

    #[serde(default = "default_leaders")]
    leaders: [ReplicaId; NUM_PILOTS],
}

impl StaticDirectory {
    /// Creates a static directory, checking that the leader hints point into
    /// the server list.
    pub fn new(
        servers: Vec<SocketAddr>,
        leaders: [ReplicaId; NUM_PILOTS],
    ) -> Result<Self, CopilotError> {
        let dir = StaticDirectory { servers, leaders };
        dir.validate()?;
        Ok(dir)
    }

    /// Parses a static directory from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, CopilotError> {
        let dir: StaticDirectory = toml::from_str(toml_str)?;
        dir.validate()?;
        Ok(dir)
    }

    /// Parses a static directory from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CopilotError> {
        Self::from_toml(&fs::read_to_string(path)?)
    }

    fn validate(&self) -> Result<(), CopilotError> {
        if self.servers.is_empty() {
            return logged_err!("directory has no servers");
        }
        for (pilot, &leader) in self.leaders.iter().enumerate() {
            if leader < 0 || leader as usize >= self.servers.len() {
                return logged_err!(
                    "invalid leader {} for pilot {} with {} servers",
                    leader,
                    pilot,
                    self.servers.len()
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn replica_list(&mut self) -> Result<Vec<SocketAddr>, CopilotError> {
        Ok(self.servers.clone())
    }

    async fn two_leaders(
        &mut self,
    ) -> Result<[ReplicaId; NUM_PILOTS], CopilotError> {
        Ok(self.leaders)
    }
}
