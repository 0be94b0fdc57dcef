//! Shared value types used across the medium, engine and gateway.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Geographic position of a node.
///
/// `alt` is optional: when unset the terrain layer derives the antenna height
/// from the terrain profile and distance calculations treat it as 0 m.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Location {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lng: f64,
    /// Altitude in metres.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<f64>,
}

impl Location {
    pub fn new(lat: f64, lng: f64) -> Self {
        Location { lat, lng, alt: None }
    }

    pub fn with_alt(lat: f64, lng: f64, alt: f64) -> Self {
        Location { lat, lng, alt: Some(alt) }
    }
}

/// Per-layer attenuation contributions in dB, keyed by layer name.
pub type AttenuationMap = BTreeMap<String, f64>;

/// A viable radio link between two loaded nodes.
///
/// `a < b` always holds so each unordered pair appears once.
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub a: usize,
    pub b: usize,
    /// Total attenuation in dB.
    pub fading: f64,
    /// Attenuation per fading layer.
    pub breakdown: AttenuationMap,
}

/// Radio transceiver state for one band of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransceiverState {
    #[default]
    Idle,
    Sleep,
    /// Listening on a channel.
    Receive,
    /// Currently locked on an incoming packet.
    Receiving,
    Transmitting,
}

impl std::fmt::Display for TransceiverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransceiverState::Idle => write!(f, "idle"),
            TransceiverState::Sleep => write!(f, "sleep"),
            TransceiverState::Receive => write!(f, "receive"),
            TransceiverState::Receiving => write!(f, "receiving"),
            TransceiverState::Transmitting => write!(f, "transmitting"),
        }
    }
}
