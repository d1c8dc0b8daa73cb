//! Process roles for the two-process topology.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Role a process plays in the shared-memory pairing.
///
/// Exactly one `Server` (the chain daemon side) and one `Client` (the
/// analytics side) may be attached to a namespace at a time. The role decides
/// which physical queue of the symmetric pair is the local "in" queue and
/// which heartbeat semaphore the process posts on. `Util` exists only for
/// out-of-band cleanup and never attaches queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessRole {
    /// Chain-daemon side; owner of the `server_sema` heartbeat.
    Server,
    /// Analytics side; owner of the `client_sema` heartbeat.
    Client,
    /// Cleanup-only role: reset the bookkeeper and exit.
    Util,
}

impl ProcessRole {
    /// The peer of this role, if it has one.
    pub fn peer(self) -> Option<ProcessRole> {
        match self {
            ProcessRole::Server => Some(ProcessRole::Client),
            ProcessRole::Client => Some(ProcessRole::Server),
            ProcessRole::Util => None,
        }
    }

    /// Stable lowercase name, used in backing-file names and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessRole::Server => "server",
            ProcessRole::Client => "client",
            ProcessRole::Util => "util",
        }
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server" => Ok(ProcessRole::Server),
            "client" => Ok(ProcessRole::Client),
            "util" => Ok(ProcessRole::Util),
            other => Err(format!("unknown role: {other}")),
        }
    }
}
