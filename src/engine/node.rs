use crate::common::config::NodeConfig;
use crate::common::types::Location;

/// Engine-side state of a simulated node.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub address: String,
    pub location: Location,
    /// Antenna gain in dB.
    pub gain: f64,
    /// Whether the node process is registered.
    pub connected: bool,
    /// Packets the node put on the air.
    pub sent: u64,
    /// Packets delivered to the node.
    pub received: u64,
}

impl From<&NodeConfig> for Node {
    fn from(config: &NodeConfig) -> Self {
        Node {
            address: config.address.clone(),
            location: config.location,
            gain: config.gain.unwrap_or(0.0),
            connected: false,
            sent: 0,
            received: 0,
        }
    }
}
