//! Messages exchanged between the gateway, engine and medium.
//!
//! Contains:
//! - The closed `Message` set spoken with node processes
//! - Commands accepted by the medium task
//! - Log lines coming from the node runner
//! - Bounded channels connecting the tasks

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, Receiver, Sender};
use embassy_sync::signal::Signal;
use serde::{Deserialize, Serialize};

use crate::common::types::{Location, TransceiverState};

/// Band, channel and received signal strength attached to radio messages.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RfInfo {
    #[serde(default)]
    pub band: String,
    #[serde(default)]
    pub channel: u32,
    /// dBm.
    #[serde(default)]
    pub rssi: f64,
}

impl RfInfo {
    pub fn new(band: &str, channel: u32, rssi: f64) -> Self {
        RfInfo {
            band: band.to_string(),
            channel,
            rssi,
        }
    }
}

/// Every message a node and the simulator exchange.
///
/// `address` is the logical node address. For messages coming from a node
/// the gateway fills it from the client registration; for messages going to a
/// node it names the destination. Raw bytes (`data`) travel in the frame's
/// payload part, not in the encoded header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    /// Node announces itself under `address`.
    Register {
        #[serde(default)]
        address: String,
    },
    /// Node leaves the simulation.
    Deregister {
        #[serde(default)]
        address: String,
    },
    /// Radio packet, sent by a node or delivered to one.
    Packet {
        #[serde(default)]
        address: String,
        #[serde(default)]
        info: RfInfo,
        #[serde(skip)]
        data: Vec<u8>,
    },
    /// A node's transmission finished.
    SendComplete {
        #[serde(default)]
        address: String,
        info: RfInfo,
    },
    StartReceive {
        #[serde(default)]
        address: String,
        band: String,
        channel: u32,
    },
    StopReceive {
        #[serde(default)]
        address: String,
        band: String,
    },
    RssiRequest {
        #[serde(default)]
        address: String,
        band: String,
        channel: u32,
    },
    RssiResponse {
        #[serde(default)]
        address: String,
        info: RfInfo,
    },
    StateSet {
        #[serde(default)]
        address: String,
        band: String,
        #[serde(default)]
        channel: u32,
        state: TransceiverState,
    },
    /// Node reports an application field (used by state assertions).
    FieldSet {
        #[serde(default)]
        address: String,
        name: String,
        #[serde(skip)]
        data: Vec<u8>,
    },
    CcaRequest {
        #[serde(default)]
        address: String,
        band: String,
        channel: u32,
    },
    /// `clear` is true when no interfering transmission is in the air.
    CcaResponse {
        #[serde(default)]
        address: String,
        band: String,
        channel: u32,
        clear: bool,
    },
    /// Free-form event emitted by a node.
    Event {
        #[serde(default)]
        address: String,
        #[serde(skip)]
        data: Vec<u8>,
    },
}

impl Message {
    pub fn address(&self) -> &str {
        match self {
            Message::Register { address }
            | Message::Deregister { address }
            | Message::Packet { address, .. }
            | Message::SendComplete { address, .. }
            | Message::StartReceive { address, .. }
            | Message::StopReceive { address, .. }
            | Message::RssiRequest { address, .. }
            | Message::RssiResponse { address, .. }
            | Message::StateSet { address, .. }
            | Message::FieldSet { address, .. }
            | Message::CcaRequest { address, .. }
            | Message::CcaResponse { address, .. }
            | Message::Event { address, .. } => address.as_str(),
        }
    }

    pub fn set_address(&mut self, new_address: String) {
        match self {
            Message::Register { address }
            | Message::Deregister { address }
            | Message::Packet { address, .. }
            | Message::SendComplete { address, .. }
            | Message::StartReceive { address, .. }
            | Message::StopReceive { address, .. }
            | Message::RssiRequest { address, .. }
            | Message::RssiResponse { address, .. }
            | Message::StateSet { address, .. }
            | Message::FieldSet { address, .. }
            | Message::CcaRequest { address, .. }
            | Message::CcaResponse { address, .. }
            | Message::Event { address, .. } => *address = new_address,
        }
    }

    /// Raw bytes carried outside the header. Empty for header-only messages.
    pub fn payload(&self) -> &[u8] {
        match self {
            Message::Packet { data, .. } | Message::FieldSet { data, .. } | Message::Event { data, .. } => data.as_slice(),
            Message::Register { .. }
            | Message::Deregister { .. }
            | Message::SendComplete { .. }
            | Message::StartReceive { .. }
            | Message::StopReceive { .. }
            | Message::RssiRequest { .. }
            | Message::RssiResponse { .. }
            | Message::StateSet { .. }
            | Message::CcaRequest { .. }
            | Message::CcaResponse { .. } => &[],
        }
    }

    /// Attach payload bytes. Returns false when the variant carries none and
    /// the bytes are non-empty.
    pub fn set_payload(&mut self, payload: Vec<u8>) -> bool {
        match self {
            Message::Packet { data, .. } | Message::FieldSet { data, .. } | Message::Event { data, .. } => {
                *data = payload;
                true
            }
            Message::Register { .. }
            | Message::Deregister { .. }
            | Message::SendComplete { .. }
            | Message::StartReceive { .. }
            | Message::StopReceive { .. }
            | Message::RssiRequest { .. }
            | Message::RssiResponse { .. }
            | Message::StateSet { .. }
            | Message::CcaRequest { .. }
            | Message::CcaResponse { .. } => payload.is_empty(),
        }
    }

    /// Whether a node may send this message to the simulator.
    pub fn is_node_originated(&self) -> bool {
        match self {
            Message::Register { .. }
            | Message::Deregister { .. }
            | Message::Packet { .. }
            | Message::StartReceive { .. }
            | Message::StopReceive { .. }
            | Message::RssiRequest { .. }
            | Message::StateSet { .. }
            | Message::FieldSet { .. }
            | Message::CcaRequest { .. }
            | Message::Event { .. } => true,
            Message::SendComplete { .. } | Message::RssiResponse { .. } | Message::CcaResponse { .. } => false,
        }
    }

    /// Wire name of the variant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Register { .. } => "register",
            Message::Deregister { .. } => "deregister",
            Message::Packet { .. } => "packet",
            Message::SendComplete { .. } => "send-complete",
            Message::StartReceive { .. } => "start-receive",
            Message::StopReceive { .. } => "stop-receive",
            Message::RssiRequest { .. } => "rssi-request",
            Message::RssiResponse { .. } => "rssi-response",
            Message::StateSet { .. } => "state-set",
            Message::FieldSet { .. } => "field-set",
            Message::CcaRequest { .. } => "cca-request",
            Message::CcaResponse { .. } => "cca-response",
            Message::Event { .. } => "event",
        }
    }
}

/// Commands accepted by the medium task.
#[derive(Debug, Clone, PartialEq)]
pub enum MediumCommand {
    /// A radio-related message from a node.
    Message(Message),
    /// A node was relocated by an event.
    NodeMoved { address: String, location: Location },
    /// Log packet counters and cache statistics.
    LogStats,
}

/// One line of output captured from a node process.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerLine {
    pub address: String,
    pub line: String,
}

/// Depth of the message channels (gateway ⇄ engine, medium → engine).
pub const MESSAGE_QUEUE_SIZE: usize = 64;
/// Bounded channel carrying decoded messages between tasks.
pub type MessageQueue = Channel<CriticalSectionRawMutex, Message, MESSAGE_QUEUE_SIZE>;
pub type MessageQueueSender = Sender<'static, CriticalSectionRawMutex, Message, MESSAGE_QUEUE_SIZE>;
pub type MessageQueueReceiver = Receiver<'static, CriticalSectionRawMutex, Message, MESSAGE_QUEUE_SIZE>;

/// Depth of the engine → medium command channel.
pub const MEDIUM_QUEUE_SIZE: usize = 64;
pub type MediumQueue = Channel<CriticalSectionRawMutex, MediumCommand, MEDIUM_QUEUE_SIZE>;
pub type MediumQueueSender = Sender<'static, CriticalSectionRawMutex, MediumCommand, MEDIUM_QUEUE_SIZE>;
pub type MediumQueueReceiver = Receiver<'static, CriticalSectionRawMutex, MediumCommand, MEDIUM_QUEUE_SIZE>;

/// Depth of the runner log-line channel.
pub const LOG_LINE_QUEUE_SIZE: usize = 32;
pub type LogLineQueue = Channel<CriticalSectionRawMutex, RunnerLine, LOG_LINE_QUEUE_SIZE>;
pub type LogLineQueueSender = Sender<'static, CriticalSectionRawMutex, RunnerLine, LOG_LINE_QUEUE_SIZE>;
pub type LogLineQueueReceiver = Receiver<'static, CriticalSectionRawMutex, RunnerLine, LOG_LINE_QUEUE_SIZE>;

/// Raised by the OS interrupt handler.
pub type InterruptSignal = Signal<CriticalSectionRawMutex, ()>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_encoding_skips_payload() {
        let msg = Message::Packet {
            address: "n1".to_string(),
            info: RfInfo::new("lora", 2, -80.0),
            data: vec![1, 2, 3],
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "packet");
        assert_eq!(json["info"]["channel"], 2);
        assert!(json.get("data").is_none());
    }

    #[test]
    fn header_decoding_defaults_address_and_payload() {
        let msg: Message = serde_json::from_str(r#"{"type":"start-receive","band":"lora","channel":7}"#).unwrap();
        assert_eq!(
            msg,
            Message::StartReceive {
                address: String::new(),
                band: "lora".to_string(),
                channel: 7
            }
        );
        let state: Message = serde_json::from_str(r#"{"type":"state-set","band":"lora","state":"sleep"}"#).unwrap();
        assert!(matches!(state, Message::StateSet { state: TransceiverState::Sleep, .. }));
    }

    #[test]
    fn payload_only_attaches_to_data_variants() {
        let mut event = Message::Event {
            address: String::new(),
            data: Vec::new(),
        };
        assert!(event.set_payload(b"boot".to_vec()));
        assert_eq!(event.payload(), b"boot");

        let mut register = Message::Register { address: "a".to_string() };
        assert!(register.set_payload(Vec::new()));
        assert!(!register.set_payload(vec![1]));
    }

    #[test]
    fn direction_split() {
        let to_node = Message::CcaResponse {
            address: "a".to_string(),
            band: "lora".to_string(),
            channel: 0,
            clear: true,
        };
        assert!(!to_node.is_node_originated());
        assert_eq!(to_node.kind(), "cca-response");
        let from_node = Message::RssiRequest {
            address: "a".to_string(),
            band: "lora".to_string(),
            channel: 0,
        };
        assert!(from_node.is_node_originated());
    }
}
