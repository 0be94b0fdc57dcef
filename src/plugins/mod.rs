//! Observers notified of simulation activity.
//!
//! A plugin advertises the notifications it wants through `Capabilities` and
//! implements the matching handlers. The manager calls plugins in the order
//! they were bound; a failing handler is logged and does not affect the other
//! plugins or the simulation.

use std::collections::BTreeMap;

use crate::common::config::EventAction;

pub mod state;

pub use state::{StateEvent, StateManager};

#[derive(Debug, Clone, PartialEq)]
pub enum PluginError {
    /// The plugin subscribes to nothing.
    NoCapabilities(String),
    /// A handler could not process a notification.
    Handler(String),
    Io(String),
}

impl std::fmt::Display for PluginError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginError::NoCapabilities(name) => write!(f, "plugin '{}' has no capabilities", name),
            PluginError::Handler(msg) => write!(f, "{}", msg),
            PluginError::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for PluginError {}

/// Notifications a plugin subscribes to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Node registrations.
    pub connect: bool,
    /// Packets sent by nodes into the medium.
    pub receive: bool,
    /// Packets delivered by the medium to nodes.
    pub send: bool,
    /// Scheduled events, field reports and node events.
    pub event: bool,
}

impl Capabilities {
    pub const ALL: Capabilities = Capabilities {
        connect: true,
        receive: true,
        send: true,
        event: true,
    };

    pub fn is_empty(&self) -> bool {
        !(self.connect || self.receive || self.send || self.event)
    }
}

/// Event notification passed to `Plugin::on_event`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PluginEvent<'a> {
    /// A scheduled event was applied to the node.
    Scheduled {
        action: EventAction,
        data: &'a BTreeMap<String, String>,
        comment: &'a str,
    },
    /// The node reported a field value.
    FieldSet { name: &'a str, value: &'a [u8] },
    /// The node emitted a free-form event.
    NodeEvent { data: &'a [u8] },
}

/// Simulation observer. Times are simulated milliseconds since the run started.
pub trait Plugin: Send {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    fn on_connect(&mut self, _time_ms: u64, _address: &str) -> Result<(), PluginError> {
        Ok(())
    }

    fn on_receive(&mut self, _time_ms: u64, _address: &str, _data: &[u8]) -> Result<(), PluginError> {
        Ok(())
    }

    fn on_send(&mut self, _time_ms: u64, _address: &str, _data: &[u8]) -> Result<(), PluginError> {
        Ok(())
    }

    fn on_event(&mut self, _time_ms: u64, _address: &str, _event: &PluginEvent) -> Result<(), PluginError> {
        Ok(())
    }

    fn on_close(&mut self) -> Result<(), PluginError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct PluginManager {
    plugins: Vec<Box<dyn Plugin>>,
}

impl PluginManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, plugin: Box<dyn Plugin>) -> Result<(), PluginError> {
        if plugin.capabilities().is_empty() {
            return Err(PluginError::NoCapabilities(plugin.name().to_string()));
        }
        log::debug!("Bound plugin {} ({:?})", plugin.name(), plugin.capabilities());
        self.plugins.push(plugin);
        Ok(())
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    fn dispatch<F>(&mut self, wants: fn(&Capabilities) -> bool, mut handler: F)
    where
        F: FnMut(&mut dyn Plugin) -> Result<(), PluginError>,
    {
        for plugin in self.plugins.iter_mut().filter(|p| wants(&p.capabilities())) {
            if let Err(e) = handler(plugin.as_mut()) {
                log::warn!("Plugin {} failed: {}", plugin.name(), e);
            }
        }
    }

    pub fn connect(&mut self, time_ms: u64, address: &str) {
        self.dispatch(|c| c.connect, |p| p.on_connect(time_ms, address));
    }

    pub fn receive(&mut self, time_ms: u64, address: &str, data: &[u8]) {
        self.dispatch(|c| c.receive, |p| p.on_receive(time_ms, address, data));
    }

    pub fn send(&mut self, time_ms: u64, address: &str, data: &[u8]) {
        self.dispatch(|c| c.send, |p| p.on_send(time_ms, address, data));
    }

    pub fn event(&mut self, time_ms: u64, address: &str, event: &PluginEvent) {
        self.dispatch(|c| c.event, |p| p.on_event(time_ms, address, event));
    }

    /// Every plugin is closed, whatever its capabilities.
    pub fn close(&mut self) {
        self.dispatch(|_| true, |p| p.on_close());
    }
}
