//! In-flight packets.

use embassy_time::{Duration, Instant};

/// Reception of a transmission at one candidate receiver.
#[derive(Debug, Clone, PartialEq)]
pub struct Reception {
    /// Receiver node index.
    pub node: usize,
    /// Received signal strength in dBm.
    pub rssi: f64,
    /// Total fading from the origin in dB.
    pub fading: f64,
    /// Cleared when an overlapping transmission interferes.
    pub success: bool,
}

/// A packet on the air from `start` to `end`.
#[derive(Debug, Clone)]
pub struct Transmission {
    /// Origin node index.
    pub origin: usize,
    pub band: String,
    pub channel: u32,
    pub data: Vec<u8>,
    pub start: Instant,
    pub end: Instant,
    pub receptions: Vec<Reception>,
}

impl Transmission {
    pub fn new(origin: usize, band: &str, channel: u32, data: Vec<u8>, start: Instant, duration: Duration) -> Self {
        Transmission {
            origin,
            band: band.to_string(),
            channel,
            data,
            start,
            end: start + duration,
            receptions: Vec::new(),
        }
    }

    /// Same band and channel, and the on-air intervals intersect.
    pub fn collides_with(&self, other: &Transmission) -> bool {
        self.band == other.band && self.channel == other.channel && self.start < other.end && other.start < self.end
    }

    /// On the air at `now` on `band`/`channel`.
    pub fn is_active_on(&self, band: &str, channel: u32, now: Instant) -> bool {
        self.band == band && self.channel == channel && self.start <= now && now < self.end
    }
}
