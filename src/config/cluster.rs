//! Cluster peer configuration.

use serde::Deserialize;

/// Cluster membership configuration.
///
/// Peers are statically configured; a service-registry integration sits in
/// front of this file and rewrites the peer list, the daemon itself only
/// dials what it is given.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ClusterConfig {
    /// Bind address for inbound peer links. Absent means this node accepts
    /// no inbound links (single node, or dial-only).
    #[serde(default)]
    pub listen_addr: Option<String>,
    /// Peers this node dials.
    #[serde(default)]
    pub peers: Vec<PeerBlock>,
}

/// One configured peer.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerBlock {
    /// Peer node name, must match the remote `server.name`.
    pub name: String,
    /// host:port of the peer's cluster listener.
    pub addr: String,
    /// Dial at startup and redial on loss.
    #[serde(default = "default_autoconnect")]
    pub autoconnect: bool,
}

fn default_autoconnect() -> bool {
    true
}
