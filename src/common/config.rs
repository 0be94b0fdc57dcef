//! Simulation config loading, parsing, and validation logic.
//!
//! A config describes the run (end time, tick rate), the medium (bands and
//! optional map tiles), plugin settings, the nodes and the scripted events.
//! Files ending in `.toml` are parsed with `toml`, everything else as JSON.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use super::types::Location;
use super::units::{Attenuation, Baud, Frequency};

/// Error type for config loading failures.
#[derive(Debug)]
pub enum ConfigError {
    FileReadError(String),
    ParseError(String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileReadError(msg) => write!(f, "Failed to read file: {}", msg),
            ConfigError::ParseError(msg) => write!(f, "Failed to parse config: {}", msg),
            ConfigError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Serialization format of a config document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Toml,
}

impl ConfigFormat {
    /// Pick the format from the file extension, defaulting to JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Json,
        }
    }
}

fn default_end_time_ms() -> u64 {
    1000
}

fn default_tick_rate_ms() -> u64 {
    100
}

fn default_setup_timeout_ms() -> u64 {
    60_000
}

fn default_noise_floor() -> f64 {
    -120.0
}

fn default_tile_size() -> u32 {
    512
}

/// Root structure of a simulation config.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Human readable name of the scenario.
    #[serde(default)]
    pub name: String,
    /// Simulated run length in milliseconds.
    #[serde(default = "default_end_time_ms")]
    pub end_time_ms: u64,
    /// Interval between engine ticks in milliseconds.
    #[serde(default = "default_tick_rate_ms")]
    pub tick_rate_ms: u64,
    /// How long setup waits for all nodes to register.
    #[serde(default = "default_setup_timeout_ms")]
    pub setup_timeout_ms: u64,
    /// Seed for the random fading and packet error draws. Random when unset.
    #[serde(default)]
    pub seed: Option<u64>,
    pub medium: MediumConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
    /// Values applied to nodes that leave a field unset.
    #[serde(default)]
    pub defaults: NodeDefaults,
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub events: Vec<EventConfig>,
}

/// Medium block: radio bands and optional map data.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MediumConfig {
    /// Bands keyed by name.
    pub bands: BTreeMap<String, Band>,
    #[serde(default)]
    pub maps: Option<MapConfig>,
}

/// Physical parameters of one simulated frequency band.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Band {
    /// Centre frequency.
    pub frequency: Frequency,
    /// Over-the-air bit rate.
    pub baud: Baud,
    /// Bytes added to every packet (preamble, header, CRC).
    #[serde(default)]
    pub overhead: usize,
    /// Standard deviation of the random fading layer.
    #[serde(default)]
    pub fading: Attenuation,
    /// Maximum total attenuation of a viable link.
    pub link_budget: Attenuation,
    /// Concurrent transmissions attenuated less than this interfere.
    /// Defaults to the link budget.
    #[serde(default)]
    pub interference_budget: Option<Attenuation>,
    /// Probability in [0, 1] that a delivered packet is corrupted anyway.
    #[serde(default)]
    pub error_rate: f64,
    #[serde(default)]
    pub channels: Channels,
    /// Receiver noise floor in dBm.
    #[serde(default = "default_noise_floor")]
    pub noise_floor: f64,
    /// Transmit power in dBm used for RSSI reports.
    #[serde(default)]
    pub transmit_power: f64,
}

/// Channel plan of a band. A count of 0 means the channel is not checked.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Channels {
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub spacing: Frequency,
}

impl Band {
    /// Attenuation below which a concurrent transmission interferes.
    pub fn interference_threshold(&self) -> f64 {
        self.interference_budget.unwrap_or(self.link_budget).0
    }

    /// Whether `channel` exists in this band's channel plan.
    pub fn has_channel(&self, channel: u32) -> bool {
        self.channels.count == 0 || (channel as u64) < self.channels.count
    }
}

/// Map tiles covering the simulated area (Web-Mercator tile coordinates).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MapConfig {
    /// Tile column of the image's top-left tile.
    pub x: u32,
    /// Tile row of the image's top-left tile.
    pub y: u32,
    /// Zoom level.
    pub level: u32,
    #[serde(default = "default_tile_size")]
    pub tile_size: u32,
    /// Terrain-RGB encoded PNG.
    #[serde(default)]
    pub terrain: Option<String>,
    /// Foliage mask PNG.
    #[serde(default)]
    pub foliage: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PluginsConfig {
    /// Enables the state assertion plugin.
    #[serde(default)]
    pub state: Option<StatePluginConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StatePluginConfig {
    /// Where to write the JSON summary on close.
    #[serde(default)]
    pub output: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NodeDefaults {
    #[serde(default)]
    pub gain: Option<f64>,
}

/// A node definition.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    pub address: String,
    pub location: Location,
    /// Antenna gain in dB.
    #[serde(default)]
    pub gain: Option<f64>,
}

/// Actions a scripted event can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventAction {
    /// Move the target nodes to `lat`/`lon` (and optional `alt`).
    SetLocation,
    /// Assert a field previously reported by the node (plugins only).
    CheckState,
}

impl std::fmt::Display for EventAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventAction::SetLocation => write!(f, "set-location"),
            EventAction::CheckState => write!(f, "check-state"),
        }
    }
}

/// A scheduled event.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventConfig {
    /// Offset from the start of the run in milliseconds.
    pub timestamp_ms: u64,
    /// Target node addresses.
    pub nodes: Vec<String>,
    pub action: EventAction,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    #[serde(default)]
    pub comment: String,
}

/// Load, parse, and validate a config file.
///
/// Relative file paths in the config are resolved against the config file's
/// directory.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read file: {}", path))
        .map_err(|e| ConfigError::FileReadError(e.to_string()))?;

    let mut config = parse_config(&data, ConfigFormat::from_path(Path::new(path)))?;
    if let Some(parent_dir) = Path::new(path).parent() {
        resolve_paths(&mut config, parent_dir);
    }
    Ok(config)
}

/// Make map tile and state summary paths relative to `base_dir`.
/// Absolute paths are kept as they are.
pub fn resolve_paths(config: &mut Config, base_dir: &Path) {
    let maps = config.medium.maps.as_mut().map(|maps| [&mut maps.terrain, &mut maps.foliage]);
    let state_output = config.plugins.state.as_mut().map(|state| &mut state.output);
    for path in maps.into_iter().flatten().chain(state_output).flatten() {
        *path = base_dir.join(&*path).to_string_lossy().to_string();
    }
}

/// Parse and validate an in-memory config document and apply node defaults.
pub fn parse_config(data: &str, format: ConfigFormat) -> Result<Config, ConfigError> {
    let mut config: Config = match format {
        ConfigFormat::Json => serde_json::from_str(data)
            .context("Invalid JSON format")
            .map_err(|e| ConfigError::ParseError(format!("{:#}", e)))?,
        ConfigFormat::Toml => toml::from_str(data)
            .context("Invalid TOML format")
            .map_err(|e| ConfigError::ParseError(format!("{:#}", e)))?,
    };

    for node in config.nodes.iter_mut() {
        if node.gain.is_none() {
            node.gain = config.defaults.gain;
        }
    }

    validate_config(&config).map_err(ConfigError::ValidationError)?;

    Ok(config)
}

/// Validate a parsed config.
///
/// # Returns
///
/// `Ok(())` if validation passes, `Err(String)` with error description otherwise.
pub fn validate_config(config: &Config) -> Result<(), String> {
    if config.nodes.is_empty() {
        return Err("Config must contain at least one node".to_string());
    }
    if config.tick_rate_ms == 0 {
        return Err("tick_rate_ms must be positive".to_string());
    }

    let mut addresses = HashSet::new();
    for node in &config.nodes {
        if node.address.is_empty() {
            return Err("Node address must not be empty".to_string());
        }
        if !addresses.insert(node.address.as_str()) {
            return Err(format!("Duplicate node address found: {}", node.address));
        }
        let loc = &node.location;
        if !(-90.0..=90.0).contains(&loc.lat) || !(-180.0..=180.0).contains(&loc.lng) {
            return Err(format!("Node {} location ({}, {}) is not a valid coordinate", node.address, loc.lat, loc.lng));
        }
    }

    if config.medium.bands.is_empty() {
        return Err("Medium must define at least one band".to_string());
    }
    for (name, band) in &config.medium.bands {
        if band.frequency.0 <= 0.0 {
            return Err(format!("Band {} frequency must be positive", name));
        }
        if band.baud.0 <= 0.0 {
            return Err(format!("Band {} baud must be positive", name));
        }
        if !(0.0..=1.0).contains(&band.error_rate) {
            return Err(format!("Band {} error_rate {} must be within 0-1", name, band.error_rate));
        }
        if band.fading.0 < 0.0 {
            return Err(format!("Band {} fading deviation must be non-negative", name));
        }
    }

    if let Some(maps) = &config.medium.maps {
        if maps.tile_size == 0 {
            return Err("Map tile_size must be positive".to_string());
        }
    }

    for (idx, event) in config.events.iter().enumerate() {
        if event.nodes.is_empty() {
            return Err(format!("Event {} has no target nodes", idx));
        }
        for address in &event.nodes {
            if !addresses.contains(address.as_str()) {
                return Err(format!("Event {} references unknown node {}", idx, address));
            }
        }
    }

    Ok(())
}
