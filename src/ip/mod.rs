use std::io;
use std::mem;
use std::sync::Arc;

use bytes::BytesMut;
use pnet_packet::ethernet::EtherTypes;
use pnet_packet::ip::IpNextHeaderProtocol;
use pnet_packet::ipv4::Ipv4Packet;

use crate::address::{LinkAddress, NetworkAddress};
use crate::arp::{unknown_interface, AddressResolver};
use crate::buffer::{checksum, SegmentedBuffer};
use crate::ip_stack::StackConfig;
use crate::link::{Frame, LinkLayer};
use crate::time::Clock;

pub const IPV4_HEADER_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextHop {
    /// The destination is on the attached network.
    Direct,
    Gateway(NetworkAddress),
}

impl From<NetworkAddress> for NextHop {
    fn from(gateway: NetworkAddress) -> Self {
        NextHop::Gateway(gateway)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub network: NetworkAddress,
    pub mask: NetworkAddress,
    pub next_hop: NextHop,
    pub interface: usize,
}

/// A received datagram addressed to this host, header already stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpDatagram {
    pub protocol: IpNextHeaderProtocol,
    pub source: NetworkAddress,
    pub destination: NetworkAddress,
    pub payload: BytesMut,
}

/// Upper-layer handler of inbound datagrams.
///
/// Returns `true` when the datagram was consumed, which stops the dispatch.
/// The router is lent to the listener so it can answer from inside the call.
pub trait IpListener {
    fn on_datagram(&mut self, router: &mut IpRouter, datagram: &IpDatagram) -> bool;
}

pub struct IpRouter {
    resolver: AddressResolver,
    routes: Vec<Route>,
    max_routes: usize,
    identification: u16,
    forwarding: bool,
    ttl: u8,
    rx_buffer_limit: usize,
    inbound: Vec<Frame>,
}

impl IpRouter {
    pub fn new(config: &StackConfig, clock: Arc<dyn Clock>) -> Self {
        let identification = (clock.millis() & 0xFFFF) as u16;
        Self {
            resolver: AddressResolver::new(
                config.arp_cache_size,
                config.arp_max_age,
                config.max_interfaces,
                clock,
            ),
            routes: Vec::with_capacity(config.max_routes),
            max_routes: config.max_routes,
            identification,
            forwarding: config.forwarding,
            ttl: config.ttl,
            rx_buffer_limit: config.rx_buffer_limit,
            inbound: Vec::new(),
        }
    }
    pub fn add_interface(&mut self, link: Box<dyn LinkLayer>, address: NetworkAddress) -> io::Result<usize> {
        self.resolver.add_interface(link, address)
    }
    /// Appends a route. A gateway equal to the interface's own address means
    /// the network is directly attached.
    pub fn add_route(
        &mut self,
        network: NetworkAddress,
        mask: NetworkAddress,
        next_hop: impl Into<NextHop>,
        interface: usize,
    ) -> io::Result<()> {
        let Some(local) = self.resolver.local_address(interface) else {
            return Err(unknown_interface());
        };
        if self.routes.len() >= self.max_routes {
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "routing table full"));
        }
        let next_hop = match next_hop.into() {
            NextHop::Gateway(gateway) if gateway == local => NextHop::Direct,
            next_hop => next_hop,
        };
        self.routes.push(Route {
            network: network & mask,
            mask,
            next_hop,
            interface,
        });
        Ok(())
    }
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }
    /// Picks the interface and the next-hop address for `destination`.
    ///
    /// The matching route with the most mask bits wins; among equals the one
    /// registered first is kept.
    pub fn find_interface(&self, destination: NetworkAddress) -> Option<(usize, NetworkAddress)> {
        let mut best: Option<&Route> = None;
        for route in &self.routes {
            if destination & route.mask != route.network {
                continue;
            }
            if best.map_or(true, |best| route.mask.rank() > best.mask.rank()) {
                best = Some(route);
            }
        }
        best.map(|route| match route.next_hop {
            NextHop::Direct => (route.interface, destination),
            NextHop::Gateway(gateway) => (route.interface, gateway),
        })
    }
    /// The source address [`IpRouter::send`] fills in for `destination`.
    pub fn source_for(&self, destination: NetworkAddress) -> Option<NetworkAddress> {
        let (interface, _) = self.find_interface(destination)?;
        self.resolver.local_address(interface)
    }
    pub fn send(
        &mut self,
        source: NetworkAddress,
        destination: NetworkAddress,
        protocol: IpNextHeaderProtocol,
        payload: &SegmentedBuffer<'_>,
    ) -> io::Result<()> {
        let total_len = IPV4_HEADER_LEN + payload.len();
        if total_len > u16::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("datagram too long: {total_len}"),
            ));
        }
        let Some((interface, next_hop)) = self.find_interface(destination) else {
            log::debug!("no route to {destination}");
            return Err(io::Error::new(io::ErrorKind::NotFound, "no route to host"));
        };
        let Some(link_address) = self.resolver.resolve(interface, next_hop) else {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "next hop unresolved"));
        };
        let source = if source.is_unspecified() {
            self.resolver.local_address(interface).ok_or_else(unknown_interface)?
        } else {
            source
        };
        let header = self.build_header(source, destination, protocol, total_len as u16);
        let datagram = payload.prepend(&header);
        log::trace!("{source} -> {destination} protocol {} len {total_len} via {link_address}", protocol.0);
        self.resolver
            .send_frame(interface, link_address, EtherTypes::Ipv4, &datagram)
    }
    fn build_header(
        &mut self,
        source: NetworkAddress,
        destination: NetworkAddress,
        protocol: IpNextHeaderProtocol,
        total_len: u16,
    ) -> [u8; IPV4_HEADER_LEN] {
        let mut header = [0u8; IPV4_HEADER_LEN];
        header[0] = 0x45;
        header[2..4].copy_from_slice(&total_len.to_be_bytes());
        header[4..6].copy_from_slice(&self.identification.to_be_bytes());
        header[8] = self.ttl;
        header[9] = protocol.0;
        header[12..16].copy_from_slice(&source.octets());
        header[16..20].copy_from_slice(&destination.octets());
        let checksum = checksum(&header);
        header[10..12].copy_from_slice(&checksum.to_be_bytes());
        self.identification = self.identification.wrapping_add(1);
        header
    }
    /// Drains every bound link once and dispatches what arrived.
    ///
    /// Frames are offered to the resolver first; IPv4 datagrams addressed to a
    /// local address then go to `listener`.
    pub fn receive(&mut self, listener: &mut dyn IpListener) {
        let mut frames = mem::take(&mut self.inbound);
        for interface in 0..self.resolver.interface_count() {
            self.resolver.recv_frames(interface, &mut frames);
            for frame in frames.drain(..) {
                if self.resolver.handle_frame(interface, &frame) {
                    continue;
                }
                self.handle_ipv4(&frame, listener);
            }
        }
        self.inbound = frames;
    }
    fn handle_ipv4(&mut self, frame: &Frame, listener: &mut dyn IpListener) {
        if frame.ether_type != EtherTypes::Ipv4 {
            log::trace!("ignored ether type {}", frame.ether_type);
            return;
        }
        let Some(datagram) = self.parse(&frame.payload) else {
            return;
        };
        if self.resolver.is_local(datagram.destination) {
            self.resolver.learn(datagram.source, frame.source);
            if !listener.on_datagram(self, &datagram) {
                log::trace!(
                    "unhandled datagram {} -> {} protocol {}",
                    datagram.source,
                    datagram.destination,
                    datagram.protocol.0
                );
            }
        } else if self.forwarding {
            let payload = SegmentedBuffer::new(&datagram.payload);
            if let Err(e) = self.send(datagram.source, datagram.destination, datagram.protocol, &payload) {
                log::debug!("forward {} -> {}: {e:?}", datagram.source, datagram.destination);
            }
        } else {
            log::trace!("dropped datagram for {}", datagram.destination);
        }
    }
    fn parse(&self, buf: &[u8]) -> Option<IpDatagram> {
        let Some(packet) = Ipv4Packet::new(buf) else {
            log::trace!("ipv4 frame too short: {}", buf.len());
            return None;
        };
        if packet.get_version() != 4 {
            log::trace!("not ipv4: version {}", packet.get_version());
            return None;
        }
        let header_len = packet.get_header_length() as usize * 4;
        let total_len = packet.get_total_length() as usize;
        if header_len < IPV4_HEADER_LEN || header_len > total_len || total_len > buf.len() {
            log::trace!(
                "bad ipv4 lengths: header {header_len} total {total_len} frame {}",
                buf.len()
            );
            return None;
        }
        let payload = &buf[header_len..total_len];
        if payload.len() > self.rx_buffer_limit {
            log::trace!("datagram of {} exceeds receive limit {}", payload.len(), self.rx_buffer_limit);
            return None;
        }
        Some(IpDatagram {
            protocol: packet.get_next_level_protocol(),
            source: packet.get_source().into(),
            destination: packet.get_destination().into(),
            payload: BytesMut::from(payload),
        })
    }
    pub fn set_forwarding(&mut self, forwarding: bool) {
        self.forwarding = forwarding;
    }
    pub fn forwarding(&self) -> bool {
        self.forwarding
    }
    pub fn resolver(&self) -> &AddressResolver {
        &self.resolver
    }
    pub fn resolver_mut(&mut self) -> &mut AddressResolver {
        &mut self.resolver
    }
    /// Link address of the interface `destination` is routed through.
    pub fn link_address_for(&self, destination: NetworkAddress) -> Option<LinkAddress> {
        let (interface, _) = self.find_interface(destination)?;
        self.resolver.link_address(interface)
    }
}
