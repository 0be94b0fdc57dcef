//! Protocol gateway between node processes and the engine.
//!
//! - `codec`: client identities, frames and the datagram layout
//! - `gateway`: registration map and the routing task
//! - `udp`: UDP transport threads feeding the frame channels

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, Receiver, Sender};

pub mod codec;
#[allow(clippy::module_inception)]
pub mod gateway;
pub mod udp;

pub use codec::{ClientId, CodecError, Frame};
pub use gateway::{ClientMap, Gateway, GatewayError, gateway_task};
pub use udp::UdpTransport;

/// Depth of the transport frame channels.
pub const FRAME_QUEUE_SIZE: usize = 64;
/// Bounded channel carrying raw frames between the transport and the gateway.
pub type FrameQueue = Channel<CriticalSectionRawMutex, Frame, FRAME_QUEUE_SIZE>;
pub type FrameQueueSender = Sender<'static, CriticalSectionRawMutex, Frame, FRAME_QUEUE_SIZE>;
pub type FrameQueueReceiver = Receiver<'static, CriticalSectionRawMutex, Frame, FRAME_QUEUE_SIZE>;
