//! Identity-to-address routing between the transport and the engine.

use embassy_futures::select::{Either, select};
use std::collections::HashMap;

use super::codec::{ClientId, CodecError, Frame, decode_frame, encode_frame};
use super::{FrameQueueReceiver, FrameQueueSender};
use crate::messages::{Message, MessageQueueReceiver, MessageQueueSender};

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayError {
    Codec(CodecError),
    /// A register message without an address.
    MissingAddress(ClientId),
    /// The client has not registered.
    UnknownClient(ClientId),
    /// No client is registered under the address.
    UnknownAddress(String),
    /// The address is already bound to another client.
    AddressTaken { address: String, owner: ClientId },
    /// The client is already bound to another address.
    ClientBound { client: ClientId, address: String },
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::Codec(e) => write!(f, "{}", e),
            GatewayError::MissingAddress(client) => write!(f, "register from {} carries no address", client),
            GatewayError::UnknownClient(client) => write!(f, "client {} is not registered", client),
            GatewayError::UnknownAddress(address) => write!(f, "no client registered as '{}'", address),
            GatewayError::AddressTaken { address, owner } => write!(f, "address '{}' already registered by {}", address, owner),
            GatewayError::ClientBound { client, address } => write!(f, "client {} already registered as '{}'", client, address),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<CodecError> for GatewayError {
    fn from(e: CodecError) -> Self {
        GatewayError::Codec(e)
    }
}

/// Two-way binding between client identities and node addresses.
///
/// The first registration wins in both directions.
#[derive(Debug, Default)]
pub struct ClientMap {
    by_client: HashMap<ClientId, String>,
    by_address: HashMap<String, ClientId>,
}

impl ClientMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `client` to `address`.
    ///
    /// # Returns
    ///
    /// `Ok(true)` for a new binding, `Ok(false)` if this exact binding already
    /// exists.
    pub fn bind(&mut self, client: ClientId, address: &str) -> Result<bool, GatewayError> {
        if let Some(bound) = self.by_client.get(&client) {
            if bound == address {
                return Ok(false);
            }
            return Err(GatewayError::ClientBound {
                client,
                address: bound.clone(),
            });
        }
        if let Some(owner) = self.by_address.get(address) {
            return Err(GatewayError::AddressTaken {
                address: address.to_string(),
                owner: *owner,
            });
        }
        self.by_client.insert(client, address.to_string());
        self.by_address.insert(address.to_string(), client);
        Ok(true)
    }

    /// Remove the client's binding, returning the address it held.
    pub fn unbind(&mut self, client: ClientId) -> Option<String> {
        let address = self.by_client.remove(&client)?;
        self.by_address.remove(&address);
        Some(address)
    }

    pub fn address_of(&self, client: ClientId) -> Option<&str> {
        self.by_client.get(&client).map(String::as_str)
    }

    pub fn client_of(&self, address: &str) -> Option<ClientId> {
        self.by_address.get(address).copied()
    }

    pub fn len(&self) -> usize {
        self.by_client.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_client.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct Gateway {
    clients: ClientMap,
}

impl Gateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clients(&self) -> &ClientMap {
        &self.clients
    }

    /// Decode a frame and resolve its sender.
    ///
    /// Returns the message to forward to the engine with its address set to
    /// the sender's registered address, or `None` when there is nothing to
    /// forward (a repeated registration).
    pub fn handle_inbound(&mut self, frame: Frame) -> Result<Option<Message>, GatewayError> {
        let (client, mut message) = decode_frame(frame)?;
        match message {
            Message::Register { ref address } => {
                if address.is_empty() {
                    return Err(GatewayError::MissingAddress(client));
                }
                if self.clients.bind(client, address)? {
                    log::info!("Client {} registered as {}", client, address);
                    Ok(Some(message))
                } else {
                    log::debug!("Repeated registration of {} from {}", address, client);
                    Ok(None)
                }
            }
            Message::Deregister { .. } => {
                let address = self.clients.unbind(client).ok_or(GatewayError::UnknownClient(client))?;
                log::info!("Client {} deregistered {}", client, address);
                message.set_address(address);
                Ok(Some(message))
            }
            Message::Packet { .. }
            | Message::StartReceive { .. }
            | Message::StopReceive { .. }
            | Message::RssiRequest { .. }
            | Message::StateSet { .. }
            | Message::FieldSet { .. }
            | Message::CcaRequest { .. }
            | Message::Event { .. } => {
                let address = self.clients.address_of(client).ok_or(GatewayError::UnknownClient(client))?.to_string();
                message.set_address(address);
                Ok(Some(message))
            }
            Message::SendComplete { .. } | Message::RssiResponse { .. } | Message::CcaResponse { .. } => {
                Err(GatewayError::Codec(CodecError::Direction(message.kind())))
            }
        }
    }

    /// Encode a message for the client registered under its address.
    pub fn handle_outbound(&self, message: &Message) -> Result<Frame, GatewayError> {
        let client = self
            .clients
            .client_of(message.address())
            .ok_or_else(|| GatewayError::UnknownAddress(message.address().to_string()))?;
        Ok(encode_frame(client, message)?)
    }

    /// Route frames from the transport to the engine and messages from the
    /// engine back to the transport. Undeliverable traffic is dropped.
    pub async fn run(mut self, frames_in: FrameQueueReceiver, frames_out: FrameQueueSender, inbound: MessageQueueSender, outbound: MessageQueueReceiver) {
        loop {
            match select(frames_in.receive(), outbound.receive()).await {
                Either::First(frame) => match self.handle_inbound(frame) {
                    Ok(Some(message)) => inbound.send(message).await,
                    Ok(None) => {}
                    Err(e @ GatewayError::Codec(_)) => log::warn!("Dropped inbound frame: {}", e),
                    Err(e) => log::debug!("Dropped inbound frame: {}", e),
                },
                Either::Second(message) => match self.handle_outbound(&message) {
                    Ok(frame) => frames_out.send(frame).await,
                    Err(e) => log::debug!("Dropped outbound {}: {}", message.kind(), e),
                },
            }
        }
    }
}

#[embassy_executor::task]
pub async fn gateway_task(
    gateway: Gateway,
    frames_in: FrameQueueReceiver,
    frames_out: FrameQueueSender,
    inbound: MessageQueueSender,
    outbound: MessageQueueReceiver,
) {
    gateway.run(frames_in, frames_out, inbound, outbound).await
}
