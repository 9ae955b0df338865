use std::io;

use bytes::{BufMut, BytesMut};
use pnet_packet::ip::IpNextHeaderProtocols;
use pnet_packet::udp::UdpPacket;

use crate::address::NetworkAddress;
use crate::buffer::SegmentedBuffer;
use crate::ip::{IpDatagram, IpListener, IpRouter, IPV4_HEADER_LEN};

pub const UDP_HEADER_LEN: usize = 8;
/// First port handed out when the caller does not pick a source port.
pub const EPHEMERAL_PORT_MIN: u16 = 49152;

/// A received UDP datagram, borrowed from the IP payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpDatagram<'a> {
    pub source: NetworkAddress,
    pub destination: NetworkAddress,
    pub source_port: u16,
    pub destination_port: u16,
    pub payload: &'a [u8],
}

/// Returns `true` when the datagram was consumed; later listeners are skipped.
pub trait UdpListener {
    fn on_datagram(&mut self, sender: &mut UdpSender<'_>, datagram: &UdpDatagram<'_>) -> bool;
}

#[derive(Debug)]
pub struct EphemeralPorts {
    last: u16,
}

impl EphemeralPorts {
    pub fn new() -> Self {
        Self {
            last: EPHEMERAL_PORT_MIN - 1,
        }
    }
    pub fn next_port(&mut self) -> u16 {
        self.last = self.last.wrapping_add(1);
        if self.last < EPHEMERAL_PORT_MIN {
            self.last = EPHEMERAL_PORT_MIN;
        }
        self.last
    }
}

impl Default for EphemeralPorts {
    fn default() -> Self {
        Self::new()
    }
}

/// Sending half of the UDP transport, lent to listeners so they can reply.
pub struct UdpSender<'a> {
    router: &'a mut IpRouter,
    ports: &'a mut EphemeralPorts,
}

impl<'a> UdpSender<'a> {
    pub fn new(router: &'a mut IpRouter, ports: &'a mut EphemeralPorts) -> Self {
        Self { router, ports }
    }
    pub fn router(&mut self) -> &mut IpRouter {
        &mut *self.router
    }
    /// Sends `payload` and returns the source port used, allocating an
    /// ephemeral one when `source_port` is `None`.
    pub fn send(
        &mut self,
        source_port: Option<u16>,
        destination_port: u16,
        destination: NetworkAddress,
        payload: &[u8],
    ) -> io::Result<u16> {
        if payload.len() > u16::MAX as usize - IPV4_HEADER_LEN - UDP_HEADER_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "buf too long"));
        }
        let Some(source) = self.router.source_for(destination) else {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no route to host"));
        };
        let source_port = source_port.unwrap_or_else(|| self.ports.next_port());
        let length = (UDP_HEADER_LEN + payload.len()) as u16;

        let mut header = BytesMut::with_capacity(UDP_HEADER_LEN);
        header.put_u16(source_port);
        header.put_u16(destination_port);
        header.put_u16(length);
        // checksum
        header.put_u16(0);

        let body = SegmentedBuffer::new(payload);
        let checksum = {
            let mut pseudo = BytesMut::with_capacity(12);
            pseudo.put_slice(&source.octets());
            pseudo.put_slice(&destination.octets());
            pseudo.put_u8(0);
            pseudo.put_u8(IpNextHeaderProtocols::Udp.0);
            pseudo.put_u16(length);
            let segment = body.prepend(&header);
            segment.prepend(&pseudo).checksum()
        };
        // zero means "no checksum" on the wire
        let checksum = if checksum == 0 { 0xFFFF } else { checksum };
        header[6..8].copy_from_slice(&checksum.to_be_bytes());

        self.router
            .send(source, destination, IpNextHeaderProtocols::Udp, &body.prepend(&header))?;
        Ok(source_port)
    }
}

pub struct UdpTransport {
    ports: EphemeralPorts,
    listeners: Vec<Box<dyn UdpListener>>,
    max_listeners: usize,
}

impl UdpTransport {
    pub fn new(max_listeners: usize) -> Self {
        Self {
            ports: EphemeralPorts::new(),
            listeners: Vec::with_capacity(max_listeners),
            max_listeners,
        }
    }
    /// Listeners are consulted in registration order.
    pub fn add_listener(&mut self, listener: impl UdpListener + 'static) -> io::Result<()> {
        if self.listeners.len() >= self.max_listeners {
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "udp listener table full"));
        }
        self.listeners.push(Box::new(listener));
        Ok(())
    }
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
    pub fn sender<'a>(&'a mut self, router: &'a mut IpRouter) -> UdpSender<'a> {
        UdpSender::new(router, &mut self.ports)
    }
    pub fn send(
        &mut self,
        router: &mut IpRouter,
        source_port: Option<u16>,
        destination_port: u16,
        destination: NetworkAddress,
        payload: &[u8],
    ) -> io::Result<u16> {
        self.sender(router)
            .send(source_port, destination_port, destination, payload)
    }
    /// Polls the router with UDP as the only upper layer.
    pub fn receive(&mut self, router: &mut IpRouter) {
        router.receive(self)
    }
}

impl IpListener for UdpTransport {
    fn on_datagram(&mut self, router: &mut IpRouter, datagram: &IpDatagram) -> bool {
        if datagram.protocol != IpNextHeaderProtocols::Udp {
            return false;
        }
        let Some(packet) = UdpPacket::new(&datagram.payload) else {
            log::trace!("udp datagram too short: {}", datagram.payload.len());
            return false;
        };
        let length = packet.get_length() as usize;
        if length < UDP_HEADER_LEN || length > datagram.payload.len() {
            log::trace!("bad udp length {length} in {} bytes", datagram.payload.len());
            return true;
        }
        let udp = UdpDatagram {
            source: datagram.source,
            destination: datagram.destination,
            source_port: packet.get_source(),
            destination_port: packet.get_destination(),
            payload: &datagram.payload[UDP_HEADER_LEN..length],
        };
        let mut sender = UdpSender::new(router, &mut self.ports);
        for listener in self.listeners.iter_mut() {
            if listener.on_datagram(&mut sender, &udp) {
                return true;
            }
        }
        log::trace!("no udp listener for port {}", udp.destination_port);
        false
    }
}
