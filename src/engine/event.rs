//! Scheduled events.

use std::collections::BTreeMap;

use crate::common::config::{EventAction, EventConfig};
use crate::common::types::Location;

#[derive(Debug, Clone, PartialEq)]
pub enum EventError {
    MissingField(&'static str),
    InvalidField { field: &'static str, value: String },
    UnknownNode(String),
}

impl std::fmt::Display for EventError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventError::MissingField(field) => write!(f, "missing '{}'", field),
            EventError::InvalidField { field, value } => write!(f, "'{}' is not a number: {:?}", field, value),
            EventError::UnknownNode(address) => write!(f, "unknown node '{}'", address),
        }
    }
}

impl std::error::Error for EventError {}

/// A scheduled event and whether it already ran.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Simulated milliseconds since the start of the run.
    pub timestamp_ms: u64,
    pub nodes: Vec<String>,
    pub action: EventAction,
    pub data: BTreeMap<String, String>,
    pub comment: String,
    pub executed: bool,
}

impl From<&EventConfig> for Event {
    fn from(config: &EventConfig) -> Self {
        Event {
            timestamp_ms: config.timestamp_ms,
            nodes: config.nodes.clone(),
            action: config.action,
            data: config.data.clone(),
            comment: config.comment.clone(),
            executed: false,
        }
    }
}

impl Event {
    pub fn is_due(&self, now_ms: u64) -> bool {
        !self.executed && self.timestamp_ms <= now_ms
    }
}

fn parse_coordinate(data: &BTreeMap<String, String>, field: &'static str) -> Result<Option<f64>, EventError> {
    data.get(field)
        .map(|value| {
            value.trim().parse::<f64>().map_err(|_| EventError::InvalidField {
                field,
                value: value.clone(),
            })
        })
        .transpose()
}

/// Target location of a `set-location` event: `lat` and `lon` are required,
/// `alt` is optional.
pub fn parse_location(data: &BTreeMap<String, String>) -> Result<Location, EventError> {
    let lat = parse_coordinate(data, "lat")?.ok_or(EventError::MissingField("lat"))?;
    let lng = parse_coordinate(data, "lon")?.ok_or(EventError::MissingField("lon"))?;
    let alt = parse_coordinate(data, "alt")?;
    Ok(Location { lat, lng, alt })
}
