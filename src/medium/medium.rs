//! Shared radio medium.
//!
//! The medium owns its own view of the nodes (address, location, antenna gain,
//! per-band transceiver state) and every in-flight transmission. It is driven
//! by `MediumCommand`s from the engine and emits messages addressed to nodes.
//!
//! Flow of a packet:
//! 1) `Packet` from a node creates a `Transmission`. The receivers are the
//!    nodes listening on the band/channel whose link to the origin is within
//!    the link budget.
//! 2) Overlapping transmissions on the same band/channel mark each other's
//!    receptions as corrupted where the interferer reaches the receiver within
//!    the interference budget.
//! 3) When the end time passes, `complete_due` emits `SendComplete` to the
//!    origin, then `Packet`s to the receivers that are still listening, were
//!    not interfered with and pass the error-rate draw.

use anyhow::Context;
use embassy_futures::select::{Either, select};
use embassy_time::{Duration, Instant, Timer};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap};

use super::layers::{Endpoint, FadingError, FoliageLayer, FreeSpaceLayer, LayerManager, RandomLayer, TerrainLayer, TotalFading};
use super::map_tiles::{FoliageMap, MapTile, TerrainMap};
use super::signal_calculations::{dbm_to_mw, mw_to_dbm, transmission_duration};
use super::transmission::{Reception, Transmission};
use crate::common::config::{Band, Config, NodeConfig};
use crate::common::types::{Link, Location, TransceiverState};
use crate::messages::{MediumCommand, MediumQueueReceiver, Message, MessageQueueSender, RfInfo};

/// Upper bound on how long the medium task sleeps with nothing in the air.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// Errors raised while handling a medium command.
#[derive(Debug, Clone, PartialEq)]
pub enum MediumError {
    UnknownBand(String),
    UnknownNode(String),
    InvalidChannel { band: String, channel: u32 },
    /// The state is owned by the medium and cannot be requested.
    InvalidState(TransceiverState),
    Fading(FadingError),
    /// The message kind is not handled by the medium.
    Unsupported(&'static str),
}

impl std::fmt::Display for MediumError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediumError::UnknownBand(band) => write!(f, "unknown band '{}'", band),
            MediumError::UnknownNode(address) => write!(f, "unknown node '{}'", address),
            MediumError::InvalidChannel { band, channel } => write!(f, "channel {} does not exist on band '{}'", channel, band),
            MediumError::InvalidState(state) => write!(f, "state '{}' cannot be set by a node", state),
            MediumError::Fading(e) => write!(f, "{}", e),
            MediumError::Unsupported(kind) => write!(f, "'{}' messages are not handled by the medium", kind),
        }
    }
}

impl std::error::Error for MediumError {}

impl From<FadingError> for MediumError {
    fn from(e: FadingError) -> Self {
        MediumError::Fading(e)
    }
}

/// Requested transceiver state of one band.
#[derive(Debug, Clone, Copy, Default)]
struct Radio {
    state: TransceiverState,
    channel: u32,
}

struct MediumNode {
    address: String,
    location: Location,
    gain: f64,
    radios: HashMap<String, Radio>,
}

impl MediumNode {
    fn listens_on(&self, band: &str, channel: u32) -> bool {
        self.radios
            .get(band)
            .is_some_and(|radio| radio.state == TransceiverState::Receive && radio.channel == channel)
    }

    fn endpoint(&self) -> Endpoint<'_> {
        Endpoint {
            address: &self.address,
            location: &self.location,
        }
    }
}

/// Packet counters kept per band and per node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketCounters {
    /// Transmissions started.
    pub sent: u64,
    /// Packets handed to a receiver.
    pub delivered: u64,
    /// Receptions lost to interference or the error rate.
    pub corrupted: u64,
    /// Receptions dropped because the receiver stopped listening.
    pub lost: u64,
}

#[derive(Debug, Clone, Default)]
pub struct MediumStats {
    pub bands: BTreeMap<String, PacketCounters>,
    /// Indexed like the medium's nodes; `sent` counts as origin, the rest as receiver.
    pub nodes: Vec<PacketCounters>,
}

pub struct Medium {
    bands: BTreeMap<String, Band>,
    nodes: Vec<MediumNode>,
    index: HashMap<String, usize>,
    layers: LayerManager,
    /// In creation order.
    transmissions: Vec<Transmission>,
    rng: StdRng,
    stats: MediumStats,
}

fn fading_between(layers: &mut LayerManager, band_name: &str, band: &Band, a: &MediumNode, b: &MediumNode) -> Result<f64, FadingError> {
    Ok(layers.total_fading(band_name, band, a.endpoint(), b.endpoint())?.total)
}

/// Whether a transmission from `source` disturbs a reception at `receiver`.
/// A node cannot receive while it transmits.
fn interferes(layers: &mut LayerManager, band_name: &str, band: &Band, nodes: &[MediumNode], source: usize, receiver: usize) -> bool {
    if source == receiver {
        return true;
    }
    match fading_between(layers, band_name, band, &nodes[source], &nodes[receiver]) {
        Ok(fading) => fading <= band.interference_threshold(),
        Err(e) => {
            log::debug!("No interference estimate {} -> {}: {}", nodes[source].address, nodes[receiver].address, e);
            false
        }
    }
}

impl Medium {
    pub fn new(bands: BTreeMap<String, Band>, nodes: &[NodeConfig], layers: LayerManager, seed: Option<u64>) -> Self {
        let nodes: Vec<MediumNode> = nodes
            .iter()
            .map(|node| MediumNode {
                address: node.address.clone(),
                location: node.location,
                gain: node.gain.unwrap_or(0.0),
                radios: HashMap::new(),
            })
            .collect();
        let index = nodes.iter().enumerate().map(|(idx, node)| (node.address.clone(), idx)).collect();
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1)),
            None => StdRng::from_entropy(),
        };
        let stats = MediumStats {
            bands: bands.keys().map(|name| (name.clone(), PacketCounters::default())).collect(),
            nodes: vec![PacketCounters::default(); nodes.len()],
        };

        Medium {
            bands,
            nodes,
            index,
            layers,
            transmissions: Vec::new(),
            rng,
            stats,
        }
    }

    /// Build a medium with the fading layers the config asks for.
    ///
    /// Free-space and random fading are always bound; terrain and foliage
    /// are bound when the corresponding map image is configured.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut layers = LayerManager::new();
        layers.bind_layer(Box::new(FreeSpaceLayer))?;

        if let Some(maps) = &config.medium.maps {
            if let Some(path) = &maps.terrain {
                let tile = MapTile::load(path, maps).context("Failed to set up terrain layer")?;
                layers.bind_layer(Box::new(TerrainLayer::new(Box::new(TerrainMap::new(tile)))))?;
            }
            if let Some(path) = &maps.foliage {
                let tile = MapTile::load(path, maps).context("Failed to set up foliage layer")?;
                layers.bind_layer(Box::new(FoliageLayer::new(Box::new(FoliageMap::new(tile)))))?;
            }
        }
        layers.bind_layer(Box::new(RandomLayer::new(config.seed)))?;

        log::info!("Medium layers: {}", layers.layer_names().join(", "));
        Ok(Self::new(config.medium.bands.clone(), &config.nodes, layers, config.seed))
    }

    fn node_index(&self, address: &str) -> Result<usize, MediumError> {
        self.index.get(address).copied().ok_or_else(|| MediumError::UnknownNode(address.to_string()))
    }

    fn band(&self, name: &str) -> Result<&Band, MediumError> {
        self.bands.get(name).ok_or_else(|| MediumError::UnknownBand(name.to_string()))
    }

    fn checked_band(&self, name: &str, channel: u32) -> Result<&Band, MediumError> {
        let band = self.band(name)?;
        if !band.has_channel(channel) {
            return Err(MediumError::InvalidChannel {
                band: name.to_string(),
                channel,
            });
        }
        Ok(band)
    }

    /// Total fading between two nodes on a band.
    pub fn total_fading(&mut self, band_name: &str, a: &str, b: &str) -> Result<TotalFading, MediumError> {
        let a = self.node_index(a)?;
        let b = self.node_index(b)?;
        let band = self.bands.get(band_name).ok_or_else(|| MediumError::UnknownBand(band_name.to_string()))?;
        Ok(self.layers.total_fading(band_name, band, self.nodes[a].endpoint(), self.nodes[b].endpoint())?)
    }

    /// Every viable link on a band, as `(a, b)` index pairs with `a < b`.
    ///
    /// A link is viable when its total fading does not exceed the link budget.
    /// Pairs whose fading cannot be evaluated are left out.
    pub fn links(&mut self, band_name: &str) -> Result<Vec<Link>, MediumError> {
        let band = self.bands.get(band_name).ok_or_else(|| MediumError::UnknownBand(band_name.to_string()))?;
        let mut links = Vec::new();
        for a in 0..self.nodes.len() {
            for b in a + 1..self.nodes.len() {
                match self.layers.total_fading(band_name, band, self.nodes[a].endpoint(), self.nodes[b].endpoint()) {
                    Ok(fading) if fading.total <= band.link_budget.0 => links.push(Link {
                        a,
                        b,
                        fading: fading.total,
                        breakdown: fading.breakdown,
                    }),
                    Ok(_) => {}
                    Err(e) => log::debug!("Link {} - {} on {} excluded: {}", self.nodes[a].address, self.nodes[b].address, band_name, e),
                }
            }
        }
        Ok(links)
    }

    /// Addresses of the nodes reachable from `address` on a band.
    pub fn visible(&mut self, address: &str, band_name: &str) -> Result<Vec<String>, MediumError> {
        let origin = self.node_index(address)?;
        let links = self.links(band_name)?;
        Ok(links
            .iter()
            .filter_map(|link| match (link.a == origin, link.b == origin) {
                (true, _) => Some(self.nodes[link.b].address.clone()),
                (_, true) => Some(self.nodes[link.a].address.clone()),
                _ => None,
            })
            .collect())
    }

    /// Effective transceiver state of a node's band at `now`.
    ///
    /// `Transmitting` while the node has a transmission pending on the band,
    /// `Receiving` while it listens to an active transmission that reaches it,
    /// the requested state otherwise.
    pub fn transceiver_state(&self, now: Instant, address: &str, band: &str) -> Result<TransceiverState, MediumError> {
        let node = self.node_index(address)?;
        self.band(band)?;
        if self.transmissions.iter().any(|t| t.origin == node && t.band == band) {
            return Ok(TransceiverState::Transmitting);
        }
        let radio = self.nodes[node].radios.get(band).copied().unwrap_or_default();
        let receiving = radio.state == TransceiverState::Receive
            && self
                .transmissions
                .iter()
                .any(|t| t.is_active_on(band, radio.channel, now) && t.receptions.iter().any(|r| r.node == node));
        Ok(if receiving { TransceiverState::Receiving } else { radio.state })
    }

    pub fn stats(&self) -> &MediumStats {
        &self.stats
    }

    /// End time of the earliest transmission still in the air.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.transmissions.iter().map(|t| t.end).min()
    }

    /// Apply one command at `now`, returning the immediate replies.
    ///
    /// Errors are logged and the command dropped.
    pub fn handle_command(&mut self, now: Instant, command: MediumCommand) -> Vec<Message> {
        match command {
            MediumCommand::Message(message) => {
                let kind = message.kind();
                let address = message.address().to_string();
                match self.handle_message(now, message) {
                    Ok(replies) => replies,
                    Err(e) => {
                        log::warn!("Dropped {} from {}: {}", kind, address, e);
                        Vec::new()
                    }
                }
            }
            MediumCommand::NodeMoved { address, location } => {
                match self.node_index(&address) {
                    Ok(idx) => {
                        self.nodes[idx].location = location;
                        let dropped = self.layers.invalidate(&address);
                        log::debug!("Node {} moved to ({:.6}, {:.6}), {} cached links dropped", address, location.lat, location.lng, dropped);
                    }
                    Err(e) => log::warn!("Ignored move: {}", e),
                }
                Vec::new()
            }
            MediumCommand::LogStats => {
                self.log_stats();
                Vec::new()
            }
        }
    }

    fn handle_message(&mut self, now: Instant, message: Message) -> Result<Vec<Message>, MediumError> {
        let kind = message.kind();
        match message {
            Message::Packet { address, info, data } => {
                let origin = self.node_index(&address)?;
                self.start_transmission(now, origin, info, data)?;
                Ok(Vec::new())
            }
            Message::StartReceive { address, band, channel } => {
                self.set_radio(&address, &band, TransceiverState::Receive, channel)?;
                Ok(Vec::new())
            }
            Message::StopReceive { address, band } => {
                self.set_radio(&address, &band, TransceiverState::Idle, 0)?;
                Ok(Vec::new())
            }
            Message::StateSet {
                address,
                band,
                channel,
                state,
            } => {
                match state {
                    TransceiverState::Idle | TransceiverState::Sleep | TransceiverState::Receive => {
                        self.set_radio(&address, &band, state, channel)?
                    }
                    TransceiverState::Receiving | TransceiverState::Transmitting => return Err(MediumError::InvalidState(state)),
                }
                Ok(Vec::new())
            }
            Message::RssiRequest { address, band, channel } => {
                let rssi = self.rssi_at(now, &address, &band, channel)?;
                Ok(vec![Message::RssiResponse {
                    address,
                    info: RfInfo::new(&band, channel, rssi),
                }])
            }
            Message::CcaRequest { address, band, channel } => {
                let clear = self.channel_clear(now, &address, &band, channel)?;
                Ok(vec![Message::CcaResponse {
                    address,
                    band,
                    channel,
                    clear,
                }])
            }
            Message::Register { .. }
            | Message::Deregister { .. }
            | Message::FieldSet { .. }
            | Message::Event { .. }
            | Message::SendComplete { .. }
            | Message::RssiResponse { .. }
            | Message::CcaResponse { .. } => Err(MediumError::Unsupported(kind)),
        }
    }

    fn set_radio(&mut self, address: &str, band: &str, state: TransceiverState, channel: u32) -> Result<(), MediumError> {
        let node = self.node_index(address)?;
        if state == TransceiverState::Receive {
            self.checked_band(band, channel)?;
        } else {
            self.band(band)?;
        }
        self.nodes[node].radios.insert(band.to_string(), Radio { state, channel });
        log::debug!("{} {} -> {} (channel {})", address, band, state, channel);
        Ok(())
    }

    fn start_transmission(&mut self, now: Instant, origin: usize, info: RfInfo, data: Vec<u8>) -> Result<(), MediumError> {
        self.checked_band(&info.band, info.channel)?;
        let band = self.bands.get(&info.band).ok_or_else(|| MediumError::UnknownBand(info.band.clone()))?;

        // One radio per node: a sender's packets go out back to back.
        let start = self
            .transmissions
            .iter()
            .filter(|t| t.origin == origin)
            .map(|t| t.end)
            .fold(now, |latest, end| latest.max(end));
        let duration = transmission_duration(data.len(), band.overhead, band.baud.0);
        let mut tx = Transmission::new(origin, &info.band, info.channel, data, start, duration);

        for (idx, node) in self.nodes.iter().enumerate() {
            if idx == origin || !node.listens_on(&info.band, info.channel) {
                continue;
            }
            let busy = self
                .transmissions
                .iter()
                .any(|t| t.origin == idx && t.band == tx.band && t.start < tx.end && tx.start < t.end);
            if busy {
                continue;
            }
            match fading_between(&mut self.layers, &info.band, band, &self.nodes[origin], node) {
                Ok(fading) if fading <= band.link_budget.0 => tx.receptions.push(Reception {
                    node: idx,
                    rssi: band.transmit_power + self.nodes[origin].gain + node.gain - fading,
                    fading,
                    success: true,
                }),
                Ok(_) => {}
                Err(e) => log::debug!("{} cannot reach {}: {}", self.nodes[origin].address, node.address, e),
            }
        }

        let colliding: Vec<usize> = self
            .transmissions
            .iter()
            .enumerate()
            .filter(|(_, other)| other.collides_with(&tx))
            .map(|(idx, _)| idx)
            .collect();
        let mut collisions = 0;
        for idx in colliding {
            let other = &mut self.transmissions[idx];
            for reception in tx.receptions.iter_mut().filter(|r| r.success) {
                if interferes(&mut self.layers, &info.band, band, &self.nodes, other.origin, reception.node) {
                    reception.success = false;
                    collisions += 1;
                }
            }
            for reception in other.receptions.iter_mut().filter(|r| r.success) {
                if interferes(&mut self.layers, &info.band, band, &self.nodes, origin, reception.node) {
                    reception.success = false;
                    collisions += 1;
                }
            }
        }

        log::debug!(
            "{} transmits {} bytes on {}/{}: {:?} .. {:?}, {} receivers, {} collisions",
            self.nodes[origin].address,
            tx.data.len(),
            tx.band,
            tx.channel,
            tx.start,
            tx.end,
            tx.receptions.len(),
            collisions
        );

        self.stats.nodes[origin].sent += 1;
        self.stats.bands.entry(info.band.clone()).or_default().sent += 1;
        self.transmissions.push(tx);
        Ok(())
    }

    /// Noise floor plus the power of every transmission in the air at the node.
    fn rssi_at(&mut self, now: Instant, address: &str, band_name: &str, channel: u32) -> Result<f64, MediumError> {
        let node = self.node_index(address)?;
        self.checked_band(band_name, channel)?;
        let band = self.bands.get(band_name).ok_or_else(|| MediumError::UnknownBand(band_name.to_string()))?;

        let mut power_mw = dbm_to_mw(band.noise_floor);
        for tx in self.transmissions.iter().filter(|t| t.origin != node && t.is_active_on(band_name, channel, now)) {
            match fading_between(&mut self.layers, band_name, band, &self.nodes[tx.origin], &self.nodes[node]) {
                Ok(fading) => power_mw += dbm_to_mw(band.transmit_power + self.nodes[tx.origin].gain + self.nodes[node].gain - fading),
                Err(e) => log::debug!("RSSI contribution skipped: {}", e),
            }
        }
        Ok(mw_to_dbm(power_mw))
    }

    fn channel_clear(&mut self, now: Instant, address: &str, band_name: &str, channel: u32) -> Result<bool, MediumError> {
        let node = self.node_index(address)?;
        self.checked_band(band_name, channel)?;
        let band = self.bands.get(band_name).ok_or_else(|| MediumError::UnknownBand(band_name.to_string()))?;

        let busy = self
            .transmissions
            .iter()
            .filter(|t| t.origin != node && t.is_active_on(band_name, channel, now))
            .any(|t| interferes(&mut self.layers, band_name, band, &self.nodes, t.origin, node));
        Ok(!busy)
    }

    /// Finish every transmission whose end time has passed.
    ///
    /// Transmissions are finished in creation order. Each yields a
    /// `SendComplete` for the origin followed by the delivered `Packet`s.
    pub fn complete_due(&mut self, now: Instant) -> Vec<Message> {
        if !self.transmissions.iter().any(|t| t.end <= now) {
            return Vec::new();
        }
        let (done, pending): (Vec<Transmission>, Vec<Transmission>) = std::mem::take(&mut self.transmissions).into_iter().partition(|t| t.end <= now);
        self.transmissions = pending;

        let mut out = Vec::new();
        for tx in done {
            self.finish(tx, &mut out);
        }
        out
    }

    fn finish(&mut self, tx: Transmission, out: &mut Vec<Message>) {
        let (transmit_power, error_rate) = self.bands.get(&tx.band).map(|b| (b.transmit_power, b.error_rate)).unwrap_or_default();
        out.push(Message::SendComplete {
            address: self.nodes[tx.origin].address.clone(),
            info: RfInfo::new(&tx.band, tx.channel, transmit_power),
        });

        let counters = self.stats.bands.entry(tx.band.clone()).or_default();
        for reception in &tx.receptions {
            let receiver = &self.nodes[reception.node];
            let node_counters = &mut self.stats.nodes[reception.node];
            if !receiver.listens_on(&tx.band, tx.channel) {
                node_counters.lost += 1;
                counters.lost += 1;
            } else if !reception.success || (error_rate > 0.0 && self.rng.r#gen::<f64>() < error_rate) {
                log::debug!(
                    "{} -> {} corrupted on {}/{} (fading {:.2} dB)",
                    self.nodes[tx.origin].address,
                    receiver.address,
                    tx.band,
                    tx.channel,
                    reception.fading
                );
                node_counters.corrupted += 1;
                counters.corrupted += 1;
            } else {
                node_counters.delivered += 1;
                counters.delivered += 1;
                out.push(Message::Packet {
                    address: receiver.address.clone(),
                    info: RfInfo::new(&tx.band, tx.channel, reception.rssi),
                    data: tx.data.clone(),
                });
            }
        }
    }

    fn log_stats(&self) {
        for (band, counters) in &self.stats.bands {
            log::info!(
                "Band {}: sent {}, delivered {}, corrupted {}, lost {}",
                band,
                counters.sent,
                counters.delivered,
                counters.corrupted,
                counters.lost
            );
        }
        for (node, counters) in self.nodes.iter().zip(&self.stats.nodes) {
            log::debug!(
                "Node {}: sent {}, delivered {}, corrupted {}, lost {}",
                node.address,
                counters.sent,
                counters.delivered,
                counters.corrupted,
                counters.lost
            );
        }
        let (hits, misses) = self.layers.cache().hit_stats();
        log::info!("Fading cache: {} entries, {} hits, {} misses", self.layers.cache().len(), hits, misses);
    }

    /// Process commands and deliver transmission outcomes until the task is dropped.
    pub async fn run(mut self, commands: MediumQueueReceiver, output: MessageQueueSender) {
        loop {
            let deadline = self.next_deadline().unwrap_or_else(|| Instant::now() + IDLE_WAIT);
            match select(commands.receive(), Timer::at(deadline)).await {
                Either::First(command) => {
                    for message in self.handle_command(Instant::now(), command) {
                        output.send(message).await;
                    }
                }
                Either::Second(_) => {}
            }
            for message in self.complete_due(Instant::now()) {
                output.send(message).await;
            }
        }
    }
}

#[embassy_executor::task]
pub async fn medium_task(medium: Medium, commands: MediumQueueReceiver, output: MessageQueueSender) {
    medium.run(commands, output).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::Channels;
    use crate::common::units::{Attenuation, Baud, Frequency};
    use crate::medium::geometry::EARTH_RADIUS;
    use crate::medium::layers::FadingLayer;
    use crate::messages::{MediumQueue, MessageQueue};
    use crate::testing::run_async;

    fn lora() -> Band {
        Band {
            frequency: Frequency(433e6),
            baud: Baud(9600.0),
            overhead: 8,
            fading: Attenuation(0.0),
            link_budget: Attenuation(100.0),
            interference_budget: None,
            error_rate: 0.0,
            channels: Channels {
                count: 2,
                spacing: Frequency(200e3),
            },
            noise_floor: -120.0,
            transmit_power: 14.0,
        }
    }

    fn north_km(km: f64) -> Location {
        Location::new((km * 1000.0 / EARTH_RADIUS).to_degrees(), 0.0)
    }

    fn node(address: &str, km: f64) -> NodeConfig {
        NodeConfig {
            address: address.to_string(),
            location: north_km(km),
            gain: None,
        }
    }

    fn free_space_medium(band: Band, positions: &[(&str, f64)]) -> Medium {
        let mut layers = LayerManager::new();
        layers.bind_layer(Box::new(FreeSpaceLayer)).unwrap();
        let nodes: Vec<NodeConfig> = positions.iter().map(|(address, km)| node(address, *km)).collect();
        Medium::new(BTreeMap::from([("lora".to_string(), band)]), &nodes, layers, Some(1))
    }

    fn msg(command: Message) -> MediumCommand {
        MediumCommand::Message(command)
    }

    fn packet(from: &str, len: usize) -> MediumCommand {
        msg(Message::Packet {
            address: from.to_string(),
            info: RfInfo::new("lora", 0, 0.0),
            data: vec![0xAB; len],
        })
    }

    fn listen(address: &str) -> MediumCommand {
        msg(Message::StartReceive {
            address: address.to_string(),
            band: "lora".to_string(),
            channel: 0,
        })
    }

    fn at(ms: u64) -> Instant {
        Instant::from_millis(ms)
    }

    fn delivered_to(messages: &[Message]) -> Vec<&str> {
        messages
            .iter()
            .filter(|m| matches!(m, Message::Packet { .. }))
            .map(|m| m.address())
            .collect()
    }

    struct Constant(f64);

    impl FadingLayer for Constant {
        fn name(&self) -> &'static str {
            "constant"
        }

        fn calculate_fading(&mut self, _band: &Band, _a: &Location, _b: &Location) -> Result<f64, FadingError> {
            Ok(self.0)
        }
    }

    #[test]
    fn four_node_free_space_links() {
        let mut medium = free_space_medium(lora(), &[("n0", 0.0), ("n1", 1.0), ("n2", 2.0), ("n3", 10.0)]);
        let links = medium.links("lora").unwrap();
        let summary: Vec<(usize, usize)> = links.iter().map(|l| (l.a, l.b)).collect();
        assert_eq!(summary, vec![(0, 1), (0, 2), (1, 2)]);
        assert!((links[0].fading - 85.18).abs() < 0.01);
        assert!((links[1].fading - 91.20).abs() < 0.01);
        assert!((links[2].fading - 85.18).abs() < 0.01);
        assert_eq!(links[0].breakdown.keys().collect::<Vec<_>>(), vec!["free-space"]);

        let mut visible = medium.visible("n1", "lora").unwrap();
        visible.sort();
        assert_eq!(visible, vec!["n0", "n2"]);
        assert!(medium.visible("n3", "lora").unwrap().is_empty());
    }

    #[test]
    fn low_frequency_kilometre_fading() {
        let mut band = lora();
        band.frequency = Frequency(433e3);
        let mut medium = free_space_medium(band, &[("a", 0.0), ("b", 1.0)]);
        let fading = medium.total_fading("lora", "a", "b").unwrap();
        assert!((fading.total - 25.18).abs() < 0.01);
        assert_eq!(medium.total_fading("wifi", "a", "b").unwrap_err(), MediumError::UnknownBand("wifi".to_string()));
        assert_eq!(medium.total_fading("lora", "a", "zz").unwrap_err(), MediumError::UnknownNode("zz".to_string()));
    }

    #[test]
    fn link_budget_is_inclusive() {
        let nodes = [node("a", 0.0), node("b", 1.0)];
        for (fading, expected) in [(100.0, 1), (100.0 + 1e-9, 0)] {
            let mut layers = LayerManager::new();
            layers.bind_layer(Box::new(Constant(fading))).unwrap();
            let mut medium = Medium::new(BTreeMap::from([("lora".to_string(), lora())]), &nodes, layers, None);
            assert_eq!(medium.links("lora").unwrap().len(), expected, "fading {}", fading);
        }
    }

    #[test]
    fn send_complete_waits_for_air_time() {
        let mut medium = free_space_medium(lora(), &[("a", 0.0), ("b", 1.0)]);
        medium.handle_command(at(1000), listen("b"));
        assert!(medium.handle_command(at(1000), packet("a", 10)).is_empty());
        assert_eq!(medium.next_deadline(), Some(at(1015)));
        assert_eq!(medium.transceiver_state(at(1005), "a", "lora").unwrap(), TransceiverState::Transmitting);
        assert_eq!(medium.transceiver_state(at(1005), "b", "lora").unwrap(), TransceiverState::Receiving);

        assert!(medium.complete_due(at(1014)).is_empty());
        let out = medium.complete_due(at(1015));
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0], Message::SendComplete { address, info } if address == "a" && info.rssi == 14.0));
        match &out[1] {
            Message::Packet { address, info, data } => {
                assert_eq!(address, "b");
                assert_eq!(data.len(), 10);
                assert!((info.rssi - (14.0 - 85.18)).abs() < 0.01);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(medium.next_deadline(), None);
        assert_eq!(medium.transceiver_state(at(1015), "a", "lora").unwrap(), TransceiverState::Idle);
        assert_eq!(medium.transceiver_state(at(1015), "b", "lora").unwrap(), TransceiverState::Receive);
        assert_eq!(medium.stats().nodes[1].delivered, 1);
    }

    #[test]
    fn sender_packets_are_sequential() {
        let mut medium = free_space_medium(lora(), &[("a", 0.0), ("b", 1.0)]);
        medium.handle_command(at(0), listen("b"));
        medium.handle_command(at(0), packet("a", 10));
        medium.handle_command(at(5), packet("a", 10));

        let first = medium.complete_due(at(15));
        assert_eq!(first.len(), 2);
        assert_eq!(medium.next_deadline(), Some(at(30)));
        assert!(medium.complete_due(at(29)).is_empty());
        let second = medium.complete_due(at(30));
        assert_eq!(delivered_to(&second), vec!["b"]);
    }

    #[test]
    fn completions_follow_creation_order() {
        let mut medium = free_space_medium(lora(), &[("a", 0.0), ("b", 50.0), ("c", 100.0)]);
        medium.handle_command(at(0), packet("a", 20));
        medium.handle_command(at(1), packet("b", 1));
        medium.handle_command(at(2), packet("c", 1));
        let out = medium.complete_due(at(100));
        let order: Vec<&str> = out.iter().map(|m| m.address()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn overlapping_transmissions_collide() {
        let mut medium = free_space_medium(lora(), &[("a", 0.0), ("b", 1.0), ("c", 2.0)]);
        medium.handle_command(at(0), listen("b"));
        medium.handle_command(at(0), packet("a", 10));
        medium.handle_command(at(5), packet("c", 10));
        let out = medium.complete_due(at(100));
        assert!(delivered_to(&out).is_empty());
        assert_eq!(out.iter().filter(|m| matches!(m, Message::SendComplete { .. })).count(), 2);
        assert_eq!(medium.stats().bands["lora"].corrupted, 2);
    }

    #[test]
    fn receptions_record_link_fading() {
        let mut medium = free_space_medium(lora(), &[("a", 0.0), ("b", 1.0)]);
        let expected = medium.total_fading("lora", "a", "b").unwrap().total;
        medium.handle_command(at(0), listen("b"));
        medium.handle_command(at(0), packet("a", 10));
        let reception = medium.transmissions[0].receptions[0].clone();
        assert_eq!(reception.node, 1);
        assert!((reception.fading - expected).abs() < 1e-9);
        assert!((reception.rssi - (14.0 - expected)).abs() < 1e-9);
    }

    #[test]
    fn distant_interferer_below_budget_is_harmless() {
        let mut band = lora();
        band.interference_budget = Some(Attenuation(80.0));
        let mut medium = free_space_medium(band, &[("a", 0.0), ("b", 1.0), ("c", 2.0)]);
        medium.handle_command(at(0), listen("b"));
        medium.handle_command(at(0), packet("a", 10));
        medium.handle_command(at(5), packet("c", 10));
        let out = medium.complete_due(at(100));
        assert_eq!(delivered_to(&out), vec!["b", "b"]);
    }

    #[test]
    fn receiver_that_stops_listening_gets_nothing() {
        let mut medium = free_space_medium(lora(), &[("a", 0.0), ("b", 1.0)]);
        medium.handle_command(at(0), listen("b"));
        medium.handle_command(at(0), packet("a", 10));
        medium.handle_command(
            at(5),
            msg(Message::StopReceive {
                address: "b".to_string(),
                band: "lora".to_string(),
            }),
        );
        let out = medium.complete_due(at(15));
        assert!(delivered_to(&out).is_empty());
        assert_eq!(medium.stats().nodes[1].lost, 1);
    }

    #[test]
    fn nodes_on_other_channels_or_asleep_do_not_receive() {
        let mut medium = free_space_medium(lora(), &[("a", 0.0), ("b", 1.0), ("c", 1.0)]);
        medium.handle_command(
            at(0),
            msg(Message::StartReceive {
                address: "b".to_string(),
                band: "lora".to_string(),
                channel: 1,
            }),
        );
        medium.handle_command(
            at(0),
            msg(Message::StateSet {
                address: "c".to_string(),
                band: "lora".to_string(),
                channel: 0,
                state: TransceiverState::Sleep,
            }),
        );
        medium.handle_command(at(0), packet("a", 10));
        assert!(delivered_to(&medium.complete_due(at(15))).is_empty());
    }

    #[test]
    fn cca_and_rssi_reflect_the_air() {
        let mut medium = free_space_medium(lora(), &[("a", 0.0), ("b", 1.0)]);
        medium.handle_command(at(0), packet("a", 10));

        let cca = |medium: &mut Medium, now: u64| {
            match medium
                .handle_command(
                    at(now),
                    msg(Message::CcaRequest {
                        address: "b".to_string(),
                        band: "lora".to_string(),
                        channel: 0,
                    }),
                )
                .pop()
            {
                Some(Message::CcaResponse { clear, .. }) => clear,
                other => panic!("unexpected {:?}", other),
            }
        };
        let rssi = |medium: &mut Medium, now: u64| {
            match medium
                .handle_command(
                    at(now),
                    msg(Message::RssiRequest {
                        address: "b".to_string(),
                        band: "lora".to_string(),
                        channel: 0,
                    }),
                )
                .pop()
            {
                Some(Message::RssiResponse { address, info }) => {
                    assert_eq!(address, "b");
                    info.rssi
                }
                other => panic!("unexpected {:?}", other),
            }
        };

        assert!(!cca(&mut medium, 5));
        assert!((rssi(&mut medium, 5) - (14.0 - 85.18)).abs() < 0.01);
        assert!(cca(&mut medium, 20));
        assert!((rssi(&mut medium, 20) + 120.0).abs() < 1e-9);
    }

    #[test]
    fn invalid_requests_are_dropped() {
        let mut medium = free_space_medium(lora(), &[("a", 0.0), ("b", 1.0)]);
        let bad_channel = msg(Message::StartReceive {
            address: "b".to_string(),
            band: "lora".to_string(),
            channel: 5,
        });
        assert!(medium.handle_command(at(0), bad_channel).is_empty());
        assert!(
            medium
                .handle_command(
                    at(0),
                    msg(Message::RssiRequest {
                        address: "b".to_string(),
                        band: "wifi".to_string(),
                        channel: 0,
                    })
                )
                .is_empty()
        );
        medium.handle_command(
            at(0),
            msg(Message::StateSet {
                address: "a".to_string(),
                band: "lora".to_string(),
                channel: 0,
                state: TransceiverState::Transmitting,
            }),
        );
        assert_eq!(medium.transceiver_state(at(0), "a", "lora").unwrap(), TransceiverState::Idle);
        assert_eq!(medium.transceiver_state(at(0), "b", "lora").unwrap(), TransceiverState::Idle);

        medium.handle_command(at(0), packet("ghost", 4));
        assert_eq!(medium.next_deadline(), None);
    }

    #[test]
    fn moving_a_node_changes_its_links() {
        let mut medium = free_space_medium(lora(), &[("n0", 0.0), ("n1", 1.0), ("n2", 2.0), ("n3", 10.0)]);
        assert_eq!(medium.links("lora").unwrap().len(), 3);
        medium.handle_command(
            at(0),
            MediumCommand::NodeMoved {
                address: "n3".to_string(),
                location: north_km(3.0),
            },
        );
        assert_eq!(medium.links("lora").unwrap().len(), 6);
    }

    #[test]
    fn certain_errors_corrupt_every_packet() {
        let mut band = lora();
        band.error_rate = 1.0;
        let mut medium = free_space_medium(band, &[("a", 0.0), ("b", 1.0)]);
        medium.handle_command(at(0), listen("b"));
        medium.handle_command(at(0), packet("a", 10));
        let out = medium.complete_due(at(15));
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], Message::SendComplete { .. }));
    }

    #[test]
    fn task_loop_delivers_after_air_time() {
        let commands: &'static MediumQueue = Box::leak(Box::new(MediumQueue::new()));
        let output: &'static MessageQueue = Box::leak(Box::new(MessageQueue::new()));
        let medium = free_space_medium(lora(), &[("a", 0.0), ("b", 1.0)]);

        let (first, second, air_time) = run_async(std::time::Duration::from_secs(10), move || async move {
            let driver = async {
                commands.send(listen("b")).await;
                let started = Instant::now();
                commands.send(packet("a", 10)).await;
                let first = output.receive().await;
                let first_at = Instant::now();
                let second = output.receive().await;
                (first, second, first_at - started)
            };
            match select(medium.run(commands.receiver(), output.sender()), driver).await {
                Either::First(()) => panic!("medium loop returned"),
                Either::Second(result) => result,
            }
        });

        assert!(matches!(first, Message::SendComplete { .. }));
        assert_eq!(second.address(), "b");
        assert!(air_time >= Duration::from_millis(15));
    }
}
