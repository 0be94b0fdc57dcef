//! Composition root.
//!
//! Builds the channels, medium, gateway, engine and plugins from a config and
//! wires them together. Nothing here is global: a `Simulator` owns its
//! engine and hands the medium and gateway to their tasks on spawn.

use anyhow::Context;
use embassy_executor::Spawner;
use std::path::PathBuf;

use crate::common::config::Config;
use crate::engine::{Engine, EngineChannels, EngineError};
use crate::gateway::{FrameQueue, FrameQueueReceiver, FrameQueueSender, Gateway, gateway_task};
use crate::medium::{Medium, medium_task};
use crate::messages::{InterruptSignal, LogLineQueue, LogLineQueueSender, MediumQueue, MediumQueueReceiver, MessageQueue, MessageQueueReceiver, MessageQueueSender};
use crate::plugins::{PluginManager, StateManager};

/// Channel ends the transport side needs.
#[derive(Clone, Copy)]
pub struct TransportChannels {
    /// Frames received from nodes.
    pub frames_in: FrameQueueSender,
    /// Frames to send to nodes.
    pub frames_out: FrameQueueReceiver,
    /// Output lines of node processes.
    pub log_lines: LogLineQueueSender,
}

/// Channel ends handed to the services on spawn.
struct ServiceChannels {
    frames_in: FrameQueueReceiver,
    frames_out: FrameQueueSender,
    inbound: MessageQueueSender,
    outbound: MessageQueueReceiver,
    medium_in: MediumQueueReceiver,
    medium_out: MessageQueueSender,
}

pub struct Simulator {
    engine: Engine,
    services: Option<(Medium, Gateway, ServiceChannels)>,
    transport: TransportChannels,
}

pub fn build_plugins(config: &Config) -> anyhow::Result<PluginManager> {
    let mut plugins = PluginManager::new();
    if let Some(state) = &config.plugins.state {
        plugins
            .bind(Box::new(StateManager::new(state.output.as_ref().map(PathBuf::from))))
            .context("Failed to bind state plugin")?;
    }
    Ok(plugins)
}

impl Simulator {
    pub fn new(config: &Config, interrupt: &'static InterruptSignal) -> anyhow::Result<Self> {
        // INTENTIONAL LEAK: embassy channels must be 'static.
        let frames_in: &'static FrameQueue = Box::leak(Box::new(FrameQueue::new()));
        let frames_out: &'static FrameQueue = Box::leak(Box::new(FrameQueue::new()));
        let inbound: &'static MessageQueue = Box::leak(Box::new(MessageQueue::new()));
        let outbound: &'static MessageQueue = Box::leak(Box::new(MessageQueue::new()));
        let medium_in: &'static MediumQueue = Box::leak(Box::new(MediumQueue::new()));
        let medium_out: &'static MessageQueue = Box::leak(Box::new(MessageQueue::new()));
        let log_lines: &'static LogLineQueue = Box::leak(Box::new(LogLineQueue::new()));

        let medium = Medium::from_config(config).context("Failed to build medium")?;
        let plugins = build_plugins(config)?;
        log::info!("Plugins: [{}]", plugins.names().join(", "));

        let engine = Engine::new(
            config,
            plugins,
            EngineChannels {
                inbound: inbound.receiver(),
                outbound: outbound.sender(),
                medium: medium_in.sender(),
                medium_out: medium_out.receiver(),
                log_lines: log_lines.receiver(),
                interrupt,
            },
        );

        Ok(Simulator {
            engine,
            services: Some((
                medium,
                Gateway::new(),
                ServiceChannels {
                    frames_in: frames_in.receiver(),
                    frames_out: frames_out.sender(),
                    inbound: inbound.sender(),
                    outbound: outbound.receiver(),
                    medium_in: medium_in.receiver(),
                    medium_out: medium_out.sender(),
                },
            )),
            transport: TransportChannels {
                frames_in: frames_in.sender(),
                frames_out: frames_out.receiver(),
                log_lines: log_lines.sender(),
            },
        })
    }

    pub fn transport(&self) -> TransportChannels {
        self.transport
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Spawn the medium and gateway tasks. Only the first call has an effect.
    pub fn spawn_services(&mut self, spawner: Spawner) -> anyhow::Result<()> {
        let Some((medium, gateway, channels)) = self.services.take() else {
            log::warn!("Services already spawned");
            return Ok(());
        };
        spawner
            .spawn(medium_task(medium, channels.medium_in, channels.medium_out))
            .map_err(|e| anyhow::anyhow!("Failed to spawn medium task: {:?}", e))?;
        spawner
            .spawn(gateway_task(gateway, channels.frames_in, channels.frames_out, channels.inbound, channels.outbound))
            .map_err(|e| anyhow::anyhow!("Failed to spawn gateway task: {:?}", e))?;
        log::debug!("Medium and gateway tasks spawned");
        Ok(())
    }

    pub async fn setup(&mut self, wait_for_all: bool) -> Result<(), EngineError> {
        self.engine.setup(wait_for_all).await
    }

    pub async fn run(&mut self) -> Result<(), EngineError> {
        self.engine.run().await
    }

    pub async fn close(&mut self) {
        self.engine.close().await
    }
}
