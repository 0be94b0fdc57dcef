//! UDP transport.
//!
//! One datagram per frame. A reader thread decodes incoming datagrams into the
//! inbound frame channel; a writer thread drains the outbound frame channel
//! and sends each frame to its client's socket address.

use anyhow::Context;
use std::net::{SocketAddr, UdpSocket};
use std::thread;

use super::codec::{ClientId, decode_datagram, encode_datagram};
use super::{FrameQueueReceiver, FrameQueueSender};

/// Largest datagram accepted.
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub fn bind(addr: &str) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(addr).with_context(|| format!("Failed to bind UDP socket on {}", addr))?;
        Ok(UdpTransport { socket })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.socket.local_addr().context("Failed to read local socket address")
    }

    /// Start the reader and writer threads.
    pub fn spawn(self, frames_in: FrameQueueSender, frames_out: FrameQueueReceiver) -> anyhow::Result<()> {
        let writer_socket = self.socket.try_clone().context("Failed to clone UDP socket")?;
        log::info!("Listening for nodes on udp://{}", self.local_addr()?);

        thread::Builder::new()
            .name("udp-reader".into())
            .spawn(move || read_loop(self.socket, frames_in))
            .context("Failed to spawn UDP reader thread")?;
        thread::Builder::new()
            .name("udp-writer".into())
            .spawn(move || write_loop(writer_socket, frames_out))
            .context("Failed to spawn UDP writer thread")?;
        Ok(())
    }
}

fn read_loop(socket: UdpSocket, frames_in: FrameQueueSender) {
    let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        match socket.recv_from(&mut buffer) {
            Ok((len, from)) => match decode_datagram(ClientId::from(from), &buffer[..len]) {
                Ok(frame) => embassy_futures::block_on(frames_in.send(frame)),
                Err(e) => log::warn!("Dropped datagram from {}: {}", from, e),
            },
            Err(e) => log::warn!("UDP receive failed: {}", e),
        }
    }
}

fn write_loop(socket: UdpSocket, frames_out: FrameQueueReceiver) {
    loop {
        let frame = embassy_futures::block_on(frames_out.receive());
        let target = frame.client.to_socket_addr();
        match encode_datagram(&frame) {
            Ok(bytes) => {
                if let Err(e) = socket.send_to(&bytes, target) {
                    log::warn!("Failed to send to {}: {}", target, e);
                }
            }
            Err(e) => log::warn!("Dropped frame for {}: {}", target, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{Frame, FrameQueue};
    use std::time::Duration;

    #[test]
    fn datagrams_cross_the_transport() {
        let frames_in: &'static FrameQueue = Box::leak(Box::new(FrameQueue::new()));
        let frames_out: &'static FrameQueue = Box::leak(Box::new(FrameQueue::new()));

        let transport = UdpTransport::bind("127.0.0.1:0").unwrap();
        let server = transport.local_addr().unwrap();
        transport.spawn(frames_in.sender(), frames_out.receiver()).unwrap();

        let node = UdpSocket::bind("127.0.0.1:0").unwrap();
        node.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let header = br#"{"type":"register","address":"n1"}"#;
        let mut datagram = (header.len() as u16).to_be_bytes().to_vec();
        datagram.extend_from_slice(header);
        node.send_to(&datagram, server).unwrap();

        let frame = embassy_futures::block_on(frames_in.receive());
        assert_eq!(frame.client, ClientId::from(node.local_addr().unwrap()));
        assert_eq!(frame.header, header.to_vec());
        assert!(frame.payload.is_empty());

        for byte in [9, 10] {
            embassy_futures::block_on(frames_out.send(Frame {
                client: frame.client,
                header: b"{}".to_vec(),
                payload: vec![byte],
            }));
        }
        let mut buffer = [0u8; 64];
        for byte in [9, 10] {
            let (len, from) = node.recv_from(&mut buffer).unwrap();
            assert_eq!(from, server);
            assert_eq!(&buffer[..len], &[0, 2, b'{', b'}', byte]);
        }
    }
}
