//! Simulation engine: node state, event timeline and the main loop.
//!
//! Flow:
//! 1) `setup` waits until every configured node has registered (or the
//!    timeout/interrupt hits), routing inbound messages meanwhile.
//! 2) `run` advances simulated time in fixed ticks using absolute deadlines,
//!    applying due events on each tick, and routes traffic between the
//!    gateway, the medium and the plugins until the end time or an interrupt.
//! 3) `close` notifies plugins and logs the run summary.
//!
//! Messages for the medium and the gateway are queued locally and sent from
//! the same `select` that watches the interrupt, the timers and the input
//! channels, so a full peer queue never stalls the engine.

use embassy_futures::select::{Either, Either4, select, select4};
use embassy_sync::channel::TrySendError;
use embassy_time::{Duration, Instant, Timer};
use std::collections::{HashMap, VecDeque};

use super::event::{Event, EventError, parse_location};
use super::node::Node;
use crate::common::config::{Config, EventAction};
use crate::common::stats::RunningStats;
use crate::messages::{InterruptSignal, LogLineQueueReceiver, MediumCommand, MediumQueueSender, Message, MessageQueueReceiver, MessageQueueSender, RunnerLine};
use crate::plugins::{PluginEvent, PluginManager};

/// How often setup re-checks the connection state.
const SETUP_RECHECK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Interrupted by the user.
    Interrupted,
    /// Some nodes did not register in time.
    SetupTimeout { missing: Vec<String> },
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Interrupted => write!(f, "interrupted"),
            EngineError::SetupTimeout { missing } => write!(f, "setup timed out waiting for {}", missing.join(", ")),
        }
    }
}

impl std::error::Error for EngineError {}

/// Channel ends owned by the engine.
#[derive(Clone, Copy)]
pub struct EngineChannels {
    /// Messages from nodes, via the gateway.
    pub inbound: MessageQueueReceiver,
    /// Messages to nodes, via the gateway.
    pub outbound: MessageQueueSender,
    pub medium: MediumQueueSender,
    /// Messages produced by the medium.
    pub medium_out: MessageQueueReceiver,
    pub log_lines: LogLineQueueReceiver,
    pub interrupt: &'static InterruptSignal,
}

pub struct Engine {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    events: Vec<Event>,
    tick_rate_ms: u64,
    end_time_ms: u64,
    setup_timeout: Duration,
    /// Simulated time of the last tick.
    last_time_ms: u64,
    plugins: PluginManager,
    channels: EngineChannels,
    tick_stats: RunningStats,
    /// Commands waiting for room in the medium queue.
    to_medium: VecDeque<MediumCommand>,
    /// Messages waiting for room in the outbound queue.
    to_gateway: VecDeque<Message>,
}

/// What woke the engine up.
enum Wake {
    Interrupt,
    Timer,
    SentToMedium,
    SentToGateway,
    MediumOut(Message),
    Inbound(Message),
    LogLine(RunnerLine),
}

impl Engine {
    pub fn new(config: &Config, plugins: PluginManager, channels: EngineChannels) -> Self {
        let nodes: Vec<Node> = config.nodes.iter().map(Node::from).collect();
        let index = nodes.iter().enumerate().map(|(idx, node)| (node.address.clone(), idx)).collect();
        Engine {
            nodes,
            index,
            events: config.events.iter().map(Event::from).collect(),
            tick_rate_ms: config.tick_rate_ms,
            end_time_ms: config.end_time_ms,
            setup_timeout: Duration::from_millis(config.setup_timeout_ms),
            last_time_ms: 0,
            plugins,
            channels,
            tick_stats: RunningStats::new(),
            to_medium: VecDeque::new(),
            to_gateway: VecDeque::new(),
        }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, address: &str) -> Option<&Node> {
        self.index.get(address).map(|&idx| &self.nodes[idx])
    }

    fn node_mut(&mut self, address: &str) -> Option<&mut Node> {
        self.index.get(address).map(|&idx| &mut self.nodes[idx])
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn last_time_ms(&self) -> u64 {
        self.last_time_ms
    }

    pub fn all_connected(&self) -> bool {
        self.nodes.iter().all(|n| n.connected)
    }

    fn missing_nodes(&self) -> Vec<String> {
        self.nodes.iter().filter(|n| !n.connected).map(|n| n.address.clone()).collect()
    }

    /// Apply every event due at `now_ms` that has not run yet, in list order.
    ///
    /// Each target node is handled independently: a failure for one target is
    /// logged and does not stop the others. Returns the commands the medium
    /// needs to see.
    pub fn apply_due_events(&mut self, now_ms: u64) -> Vec<MediumCommand> {
        let mut commands = Vec::new();
        for idx in 0..self.events.len() {
            if !self.events[idx].is_due(now_ms) {
                continue;
            }
            self.events[idx].executed = true;
            let event = self.events[idx].clone();
            log::info!("t={} ms: {} on {} {}", now_ms, event.action, event.nodes.join(","), event.comment);

            for address in &event.nodes {
                match self.apply_event(&event, address) {
                    Ok(Some(command)) => commands.push(command),
                    Ok(None) => {}
                    Err(e) => log::warn!("Event {} failed for {}: {}", event.action, address, e),
                }
                let notification = PluginEvent::Scheduled {
                    action: event.action,
                    data: &event.data,
                    comment: &event.comment,
                };
                self.plugins.event(now_ms, address, &notification);
            }
        }
        commands
    }

    fn apply_event(&mut self, event: &Event, address: &str) -> Result<Option<MediumCommand>, EventError> {
        match event.action {
            EventAction::SetLocation => {
                let location = parse_location(&event.data)?;
                let node = self.node_mut(address).ok_or_else(|| EventError::UnknownNode(address.to_string()))?;
                node.location = location;
                Ok(Some(MediumCommand::NodeMoved {
                    address: address.to_string(),
                    location,
                }))
            }
            // Evaluated by plugins.
            EventAction::CheckState => Ok(None),
        }
    }

    /// Advance simulated time by one tick and apply the events now due.
    pub fn handle_tick(&mut self) -> Vec<MediumCommand> {
        self.last_time_ms += self.tick_rate_ms;
        self.apply_due_events(self.last_time_ms)
    }

    /// Update node state for a message from a node and notify plugins.
    ///
    /// Returns the command to forward to the medium, if any.
    pub fn route_inbound(&mut self, message: Message) -> Option<MediumCommand> {
        let time = self.last_time_ms;
        match message {
            Message::Register { ref address } => {
                match self.node_mut(address) {
                    Some(node) => {
                        node.connected = true;
                        log::info!("Node {} connected", address);
                        self.plugins.connect(time, address);
                    }
                    None => log::warn!("Registration from unconfigured node {}", address),
                }
                None
            }
            Message::Deregister { ref address } => {
                if let Some(node) = self.node_mut(address) {
                    node.connected = false;
                    log::info!("Node {} disconnected", address);
                }
                None
            }
            Message::Packet {
                ref address, ref data, ..
            } => {
                if let Some(node) = self.node_mut(address) {
                    node.sent += 1;
                }
                self.plugins.receive(time, address, data);
                Some(MediumCommand::Message(message))
            }
            Message::StartReceive { .. }
            | Message::StopReceive { .. }
            | Message::StateSet { .. }
            | Message::RssiRequest { .. }
            | Message::CcaRequest { .. } => Some(MediumCommand::Message(message)),
            Message::FieldSet {
                ref address,
                ref name,
                ref data,
            } => {
                self.plugins.event(time, address, &PluginEvent::FieldSet { name, value: data });
                None
            }
            Message::Event { ref address, ref data } => {
                self.plugins.event(time, address, &PluginEvent::NodeEvent { data });
                None
            }
            Message::SendComplete { .. } | Message::RssiResponse { .. } | Message::CcaResponse { .. } => {
                log::warn!("Ignored {} from node {}", message.kind(), message.address());
                None
            }
        }
    }

    /// Account for a message produced by the medium. Returns it for the gateway.
    pub fn route_medium_output(&mut self, message: Message) -> Message {
        let time = self.last_time_ms;
        match message {
            Message::Packet {
                ref address, ref data, ..
            } => {
                if let Some(node) = self.node_mut(address) {
                    node.received += 1;
                }
                self.plugins.send(time, address, data);
            }
            Message::SendComplete { .. }
            | Message::RssiResponse { .. }
            | Message::CcaResponse { .. }
            | Message::Register { .. }
            | Message::Deregister { .. }
            | Message::StartReceive { .. }
            | Message::StopReceive { .. }
            | Message::RssiRequest { .. }
            | Message::StateSet { .. }
            | Message::FieldSet { .. }
            | Message::CcaRequest { .. }
            | Message::Event { .. } => {}
        }
        message
    }

    fn handle_log_line(&self, line: RunnerLine) {
        log::info!(target: "runner", "[{}] {}", line.address, line.line);
    }

    /// Wait for the next thing to do, with a timer firing at `timer`.
    ///
    /// Queued messages go out through send arms of the same `select`, so
    /// the interrupt and the timer are watched while a peer queue is full.
    async fn next_wake(&self, timer: Instant) -> Wake {
        let channels = self.channels;
        let to_medium = async {
            match self.to_medium.front() {
                Some(command) => channels.medium.send(command.clone()).await,
                None => std::future::pending().await,
            }
        };
        let to_gateway = async {
            match self.to_gateway.front() {
                Some(message) => channels.outbound.send(message.clone()).await,
                None => std::future::pending().await,
            }
        };

        match select(
            channels.interrupt.wait(),
            select4(
                Timer::at(timer),
                select(to_medium, to_gateway),
                channels.medium_out.receive(),
                select(channels.inbound.receive(), channels.log_lines.receive()),
            ),
        )
        .await
        {
            Either::First(()) => Wake::Interrupt,
            Either::Second(Either4::First(())) => Wake::Timer,
            Either::Second(Either4::Second(Either::First(()))) => Wake::SentToMedium,
            Either::Second(Either4::Second(Either::Second(()))) => Wake::SentToGateway,
            Either::Second(Either4::Third(message)) => Wake::MediumOut(message),
            Either::Second(Either4::Fourth(Either::First(message))) => Wake::Inbound(message),
            Either::Second(Either4::Fourth(Either::Second(line))) => Wake::LogLine(line),
        }
    }

    /// Handle message traffic. Interrupts and timers are the caller's.
    fn handle_traffic(&mut self, wake: Wake) {
        match wake {
            Wake::SentToMedium => {
                self.to_medium.pop_front();
            }
            Wake::SentToGateway => {
                self.to_gateway.pop_front();
            }
            Wake::MediumOut(message) => {
                let message = self.route_medium_output(message);
                self.to_gateway.push_back(message);
            }
            Wake::Inbound(message) => {
                if let Some(command) = self.route_inbound(message) {
                    self.to_medium.push_back(command);
                }
            }
            Wake::LogLine(line) => self.handle_log_line(line),
            Wake::Interrupt | Wake::Timer => {}
        }
    }

    /// Hand over whatever fits into the peer queues without waiting.
    fn flush_pending(&mut self) {
        while let Some(command) = self.to_medium.pop_front() {
            if let Err(TrySendError::Full(command)) = self.channels.medium.try_send(command) {
                self.to_medium.push_front(command);
                break;
            }
        }
        while let Some(message) = self.to_gateway.pop_front() {
            if let Err(TrySendError::Full(message)) = self.channels.outbound.try_send(message) {
                self.to_gateway.push_front(message);
                break;
            }
        }
        if !self.to_medium.is_empty() || !self.to_gateway.is_empty() {
            log::warn!(
                "{} medium commands and {} node messages left undelivered",
                self.to_medium.len(),
                self.to_gateway.len()
            );
        }
    }

    /// Wait for every node to register.
    ///
    /// Returns immediately when `wait_for_all` is false. Traffic from nodes
    /// that are already registered keeps flowing while waiting.
    ///
    /// # Returns
    ///
    /// `Err(EngineError::Interrupted)` on interrupt,
    /// `Err(EngineError::SetupTimeout)` when the setup timeout expires first.
    pub async fn setup(&mut self, wait_for_all: bool) -> Result<(), EngineError> {
        if !wait_for_all {
            return Ok(());
        }
        let deadline = Instant::now() + self.setup_timeout;
        log::info!("Waiting for {} nodes to register", self.nodes.len());

        while !self.all_connected() {
            let recheck = (Instant::now() + SETUP_RECHECK).min(deadline);
            let wake = self.next_wake(recheck).await;
            match wake {
                Wake::Interrupt => return Err(EngineError::Interrupted),
                Wake::Timer => {
                    if Instant::now() >= deadline {
                        return Err(EngineError::SetupTimeout {
                            missing: self.missing_nodes(),
                        });
                    }
                }
                wake => self.handle_traffic(wake),
            }
        }

        log::info!("All {} nodes registered", self.nodes.len());
        Ok(())
    }

    /// Run until the end time or an interrupt.
    pub async fn run(&mut self) -> Result<(), EngineError> {
        let start = Instant::now() - Duration::from_millis(self.last_time_ms);
        let end = start + Duration::from_millis(self.end_time_ms);
        log::info!("Simulation running until {} ms, tick {} ms", self.end_time_ms, self.tick_rate_ms);

        while self.last_time_ms < self.end_time_ms {
            let next_tick = start + Duration::from_millis(self.last_time_ms + self.tick_rate_ms);
            let wake = self.next_wake(next_tick.min(end)).await;
            match wake {
                Wake::Interrupt => {
                    log::info!("Interrupted at {} ms", self.last_time_ms);
                    break;
                }
                Wake::Timer => {
                    if next_tick > end {
                        break;
                    }
                    let tick_started = Instant::now();
                    let commands = self.handle_tick();
                    self.to_medium.extend(commands);
                    self.tick_stats.update(tick_started.elapsed().as_micros() as f64);
                }
                wake => self.handle_traffic(wake),
            }
        }

        self.flush_pending();
        log::info!("Simulation stopped at {} ms", self.last_time_ms);
        Ok(())
    }

    /// Notify plugins, ask the medium for its statistics and log a summary.
    pub async fn close(&mut self) {
        self.plugins.close();
        self.flush_pending();
        if self.channels.medium.try_send(MediumCommand::LogStats).is_err() {
            log::warn!("Medium queue full, statistics not requested");
        }
        embassy_futures::yield_now().await;

        let sent: u64 = self.nodes.iter().map(|n| n.sent).sum();
        let received: u64 = self.nodes.iter().map(|n| n.received).sum();
        let executed = self.events.iter().filter(|e| e.executed).count();
        log::info!(
            "Run summary: {} ms simulated, {} nodes, {} packets sent, {} delivered, {}/{} events executed",
            self.last_time_ms,
            self.nodes.len(),
            sent,
            received,
            executed,
            self.events.len()
        );
        for node in &self.nodes {
            log::debug!("  {}: sent {}, received {}, connected {}", node.address, node.sent, node.received, node.connected);
        }
        if self.tick_stats.count() > 0 {
            log::info!("Tick processing (us): {}", self.tick_stats);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::{ConfigFormat, parse_config};
    use crate::common::types::Location;
    use crate::medium::Medium;
    use crate::messages::{LogLineQueue, MediumQueue, MessageQueue, RfInfo};
    use crate::plugins::{Capabilities, Plugin, PluginError};
    use crate::testing::run_async;
    use embassy_futures::join::join;
    use std::sync::{Arc, Mutex};

    const WATCHDOG: std::time::Duration = std::time::Duration::from_secs(10);

    const CONFIG: &str = r#"{
        "end_time_ms": 300,
        "tick_rate_ms": 100,
        "setup_timeout_ms": 50,
        "medium": { "bands": { "lora": { "frequency": "433 MHz", "baud": 9600, "link_budget": "100 dB" } } },
        "nodes": [
            { "address": "a", "location": { "lat": 0.0, "lng": 0.0 } },
            { "address": "b", "location": { "lat": 0.01, "lng": 0.0 } }
        ],
        "events": [
            { "timestamp_ms": 200, "nodes": ["a", "b"], "action": "set-location", "data": { "lat": "1.0", "lon": "2.0" } },
            { "timestamp_ms": 200, "nodes": ["a"], "action": "set-location", "data": { "lat": "5.0" } },
            { "timestamp_ms": 250, "nodes": ["b"], "action": "check-state", "data": { "key": "k", "value": "v" } }
        ]
    }"#;

    struct Queues {
        inbound: &'static MessageQueue,
        outbound: &'static MessageQueue,
        medium: &'static MediumQueue,
        medium_out: &'static MessageQueue,
        log_lines: &'static LogLineQueue,
        interrupt: &'static InterruptSignal,
    }

    impl Queues {
        fn new() -> Self {
            Queues {
                inbound: Box::leak(Box::new(MessageQueue::new())),
                outbound: Box::leak(Box::new(MessageQueue::new())),
                medium: Box::leak(Box::new(MediumQueue::new())),
                medium_out: Box::leak(Box::new(MessageQueue::new())),
                log_lines: Box::leak(Box::new(LogLineQueue::new())),
                interrupt: Box::leak(Box::new(InterruptSignal::new())),
            }
        }

        fn channels(&self) -> EngineChannels {
            EngineChannels {
                inbound: self.inbound.receiver(),
                outbound: self.outbound.sender(),
                medium: self.medium.sender(),
                medium_out: self.medium_out.receiver(),
                log_lines: self.log_lines.receiver(),
                interrupt: self.interrupt,
            }
        }
    }

    /// Records every notification as a string.
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl Plugin for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::ALL
        }

        fn on_connect(&mut self, time_ms: u64, address: &str) -> Result<(), PluginError> {
            self.0.lock().unwrap().push(format!("{} connect {}", time_ms, address));
            Ok(())
        }

        fn on_receive(&mut self, _time_ms: u64, address: &str, _data: &[u8]) -> Result<(), PluginError> {
            self.0.lock().unwrap().push(format!("receive {}", address));
            Ok(())
        }

        fn on_send(&mut self, _time_ms: u64, address: &str, _data: &[u8]) -> Result<(), PluginError> {
            self.0.lock().unwrap().push(format!("send {}", address));
            Ok(())
        }

        fn on_event(&mut self, time_ms: u64, address: &str, event: &PluginEvent) -> Result<(), PluginError> {
            let label = match event {
                PluginEvent::Scheduled { action, .. } => action.to_string(),
                PluginEvent::FieldSet { name, .. } => format!("field {}", name),
                PluginEvent::NodeEvent { .. } => "node-event".to_string(),
            };
            self.0.lock().unwrap().push(format!("{} {} {}", time_ms, label, address));
            Ok(())
        }
    }

    fn engine_with_recorder(queues: &Queues) -> (Engine, Arc<Mutex<Vec<String>>>) {
        let config = parse_config(CONFIG, ConfigFormat::Json).unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut plugins = PluginManager::new();
        plugins.bind(Box::new(Recorder(calls.clone()))).unwrap();
        (Engine::new(&config, plugins, queues.channels()), calls)
    }

    fn register(address: &str) -> Message {
        Message::Register {
            address: address.to_string(),
        }
    }

    #[test]
    fn events_apply_once_per_target() {
        let queues = Queues::new();
        let (mut engine, calls) = engine_with_recorder(&queues);

        assert!(engine.apply_due_events(100).is_empty());
        let commands = engine.apply_due_events(200);
        assert_eq!(
            commands,
            vec![
                MediumCommand::NodeMoved {
                    address: "a".to_string(),
                    location: Location::new(1.0, 2.0),
                },
                MediumCommand::NodeMoved {
                    address: "b".to_string(),
                    location: Location::new(1.0, 2.0),
                },
            ]
        );
        // The malformed event is spent but leaves the node where it was.
        assert!(engine.events()[1].executed);
        assert_eq!(engine.node("a").unwrap().location, Location::new(1.0, 2.0));
        assert!(!engine.events()[2].executed);

        assert!(engine.apply_due_events(200).is_empty());
        assert!(engine.apply_due_events(300).is_empty());
        assert!(engine.events().iter().all(|e| e.executed));

        let calls = calls.lock().unwrap();
        assert_eq!(calls.iter().filter(|c| c.contains("set-location")).count(), 3);
        assert_eq!(calls.last().unwrap(), "300 check-state b");
    }

    #[test]
    fn ticks_advance_time_and_fire_events() {
        let queues = Queues::new();
        let (mut engine, _) = engine_with_recorder(&queues);
        assert!(engine.handle_tick().is_empty());
        assert_eq!(engine.last_time_ms(), 100);
        assert_eq!(engine.handle_tick().len(), 2);
        assert!(engine.handle_tick().is_empty());
        assert_eq!(engine.last_time_ms(), 300);
    }

    #[test]
    fn inbound_routing() {
        let queues = Queues::new();
        let (mut engine, calls) = engine_with_recorder(&queues);

        assert_eq!(engine.route_inbound(register("a")), None);
        assert!(engine.node("a").unwrap().connected);
        assert!(!engine.all_connected());
        assert_eq!(engine.route_inbound(register("zz")), None);

        let packet = Message::Packet {
            address: "a".to_string(),
            info: RfInfo::new("lora", 0, 0.0),
            data: vec![1],
        };
        assert_eq!(engine.route_inbound(packet.clone()), Some(MediumCommand::Message(packet)));
        assert_eq!(engine.node("a").unwrap().sent, 1);

        let listen = Message::StartReceive {
            address: "b".to_string(),
            band: "lora".to_string(),
            channel: 0,
        };
        assert_eq!(engine.route_inbound(listen.clone()), Some(MediumCommand::Message(listen)));

        let field = Message::FieldSet {
            address: "b".to_string(),
            name: "role".to_string(),
            data: b"leader".to_vec(),
        };
        assert_eq!(engine.route_inbound(field), None);

        let stray = Message::CcaResponse {
            address: "b".to_string(),
            band: "lora".to_string(),
            channel: 0,
            clear: true,
        };
        assert_eq!(engine.route_inbound(stray), None);

        assert_eq!(engine.route_inbound(Message::Deregister { address: "a".to_string() }), None);
        assert!(!engine.node("a").unwrap().connected);

        assert_eq!(*calls.lock().unwrap(), vec!["0 connect a", "receive a", "0 field role b"]);
    }

    #[test]
    fn medium_output_counts_deliveries() {
        let queues = Queues::new();
        let (mut engine, calls) = engine_with_recorder(&queues);
        let delivered = Message::Packet {
            address: "b".to_string(),
            info: RfInfo::new("lora", 0, -80.0),
            data: vec![1, 2],
        };
        assert_eq!(engine.route_medium_output(delivered.clone()), delivered);
        let complete = Message::SendComplete {
            address: "a".to_string(),
            info: RfInfo::default(),
        };
        assert_eq!(engine.route_medium_output(complete.clone()), complete);
        assert_eq!(engine.node("b").unwrap().received, 1);
        assert_eq!(engine.node("a").unwrap().received, 0);
        assert_eq!(*calls.lock().unwrap(), vec!["send b"]);
    }

    #[test]
    fn setup_without_waiting_returns_at_once() {
        let queues = Queues::new();
        let (mut engine, _) = engine_with_recorder(&queues);
        assert_eq!(embassy_futures::block_on(engine.setup(false)), Ok(()));
    }

    #[test]
    fn setup_completes_when_all_nodes_register() {
        let queues = Queues::new();
        let (mut engine, _) = engine_with_recorder(&queues);
        queues.inbound.try_send(register("a")).unwrap();
        queues.inbound.try_send(register("b")).unwrap();
        let (result, connected) = run_async(WATCHDOG, move || async move {
            let result = engine.setup(true).await;
            (result, engine.all_connected())
        });
        assert_eq!(result, Ok(()));
        assert!(connected);
    }

    #[test]
    fn setup_times_out_with_missing_nodes() {
        let queues = Queues::new();
        let (mut engine, _) = engine_with_recorder(&queues);
        queues.inbound.try_send(register("a")).unwrap();
        let result = run_async(WATCHDOG, move || async move { engine.setup(true).await });
        assert_eq!(
            result,
            Err(EngineError::SetupTimeout {
                missing: vec!["b".to_string()]
            })
        );
    }

    #[test]
    fn setup_stops_on_interrupt() {
        let queues = Queues::new();
        let (mut engine, _) = engine_with_recorder(&queues);
        queues.interrupt.signal(());
        let result = run_async(WATCHDOG, move || async move { engine.setup(true).await });
        assert_eq!(result, Err(EngineError::Interrupted));
    }

    #[test]
    fn setup_keeps_serving_registered_nodes() {
        const REQUESTS: usize = 200;
        let queues = Queues::new();
        let mut config = parse_config(CONFIG, ConfigFormat::Json).unwrap();
        config.setup_timeout_ms = 2000;
        let medium = Medium::from_config(&config).unwrap();
        let mut engine = Engine::new(&config, PluginManager::new(), queues.channels());
        let (inbound, outbound) = (queues.inbound, queues.outbound);
        let (medium_in, medium_out) = (queues.medium.receiver(), queues.medium_out.sender());

        let (setup, replies) = run_async(WATCHDOG, move || async move {
            // "b" never shows up; "a" keeps asking for clear-channel checks.
            let node_a = async {
                inbound.send(register("a")).await;
                for _ in 0..REQUESTS {
                    inbound
                        .send(Message::CcaRequest {
                            address: "a".to_string(),
                            band: "lora".to_string(),
                            channel: 0,
                        })
                        .await;
                }
                let mut replies = 0;
                while replies < REQUESTS {
                    if let Message::CcaResponse { address, clear, .. } = outbound.receive().await {
                        assert_eq!(address, "a");
                        assert!(clear);
                        replies += 1;
                    }
                }
                replies
            };
            match select(medium.run(medium_in, medium_out), join(engine.setup(true), node_a)).await {
                Either::First(()) => panic!("medium loop returned"),
                Either::Second(result) => result,
            }
        });

        assert_eq!(replies, REQUESTS);
        assert_eq!(
            setup,
            Err(EngineError::SetupTimeout {
                missing: vec!["b".to_string()]
            })
        );
    }

    #[test]
    fn run_reaches_end_time_and_forwards_moves() {
        let queues = Queues::new();
        let (mut engine, _) = engine_with_recorder(&queues);
        let (result, elapsed, last_time, all_executed) = run_async(WATCHDOG, move || async move {
            let started = Instant::now();
            let result = engine.run().await;
            let all_executed = engine.events().iter().all(|e| e.executed);
            (result, started.elapsed(), engine.last_time_ms(), all_executed)
        });
        assert_eq!(result, Ok(()));
        assert!(elapsed >= Duration::from_millis(300));
        assert_eq!(last_time, 300);
        assert!(all_executed);

        let mut moved = Vec::new();
        while let Ok(command) = queues.medium.try_receive() {
            moved.push(command);
        }
        assert_eq!(moved.len(), 2);
    }

    #[test]
    fn run_routes_medium_output_to_gateway() {
        let queues = Queues::new();
        let (mut engine, _) = engine_with_recorder(&queues);
        let delivered = Message::Packet {
            address: "a".to_string(),
            info: RfInfo::new("lora", 0, -70.0),
            data: vec![7],
        };
        queues.medium_out.try_send(delivered.clone()).unwrap();
        let (result, received) = run_async(WATCHDOG, move || async move {
            let result = engine.run().await;
            (result, engine.node("a").map(|n| n.received))
        });
        assert_eq!(result, Ok(()));
        assert_eq!(queues.outbound.try_receive().ok(), Some(delivered));
        assert_eq!(received, Some(1));
    }

    #[test]
    fn run_stops_on_interrupt() {
        let queues = Queues::new();
        let (mut engine, _) = engine_with_recorder(&queues);
        queues.interrupt.signal(());
        let (result, last_time) = run_async(WATCHDOG, move || async move {
            let result = engine.run().await;
            (result, engine.last_time_ms())
        });
        assert_eq!(result, Ok(()));
        assert_eq!(last_time, 0);
    }

    #[test]
    fn close_requests_medium_stats() {
        let queues = Queues::new();
        let (mut engine, _) = engine_with_recorder(&queues);
        run_async(WATCHDOG, move || async move { engine.close().await });
        assert_eq!(queues.medium.try_receive().ok(), Some(MediumCommand::LogStats));
    }
}
