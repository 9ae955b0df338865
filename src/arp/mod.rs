use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use pnet_packet::arp::{ArpHardwareTypes, ArpPacket};
use pnet_packet::ethernet::{EtherType, EtherTypes};

use crate::address::{LinkAddress, NetworkAddress};
use crate::buffer::SegmentedBuffer;
use crate::link::{Frame, LinkLayer};
use crate::time::Clock;

/// Ethernet/IPv4 ARP message length.
pub const ARP_PACKET_LEN: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum Operation {
    Request = 1,
    Reply = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntry {
    pub address: NetworkAddress,
    pub link_address: LinkAddress,
    /// Clock reading in milliseconds when the entry was learned.
    pub created: u64,
}

/// Bounded FIFO of address pairs.
///
/// Entries are never expired proactively; an entry older than `max_age` is
/// simply a miss until it is overwritten or evicted.
#[derive(Debug)]
pub(crate) struct ResolutionCache {
    entries: VecDeque<CacheEntry>,
    capacity: usize,
    max_age: Duration,
}

impl ResolutionCache {
    pub(crate) fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            max_age,
        }
    }
    pub(crate) fn learn(&mut self, entry: CacheEntry) {
        if let Some(existing) = self.entries.iter_mut().find(|e| e.address == entry.address) {
            *existing = entry;
            return;
        }
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }
    pub(crate) fn lookup(&self, address: NetworkAddress, now: u64) -> Option<LinkAddress> {
        let entry = self.entries.iter().find(|e| e.address == address)?;
        // ages are compared in whole seconds
        let age = now.saturating_sub(entry.created) / 1000;
        if age < self.max_age.as_secs() {
            Some(entry.link_address)
        } else {
            None
        }
    }
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
    pub(crate) fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.iter()
    }
}

/// A link-layer adapter bound to one local network address.
pub(crate) struct Interface {
    link: Box<dyn LinkLayer>,
    address: NetworkAddress,
}

impl Interface {
    fn send(&mut self, destination: LinkAddress, ether_type: EtherType, payload: &SegmentedBuffer<'_>) -> io::Result<()> {
        let source = self.link.address();
        self.link.send_frame(source, destination, ether_type, payload)
    }
}

/// Maps network addresses to link addresses and owns the interface bindings.
pub struct AddressResolver {
    cache: ResolutionCache,
    interfaces: Vec<Interface>,
    max_interfaces: usize,
    clock: Arc<dyn Clock>,
}

impl AddressResolver {
    pub fn new(cache_size: usize, max_age: Duration, max_interfaces: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache: ResolutionCache::new(cache_size, max_age),
            interfaces: Vec::with_capacity(max_interfaces),
            max_interfaces,
            clock,
        }
    }
    /// Binds `link` to `address` and returns the interface index.
    pub fn add_interface(&mut self, link: Box<dyn LinkLayer>, address: NetworkAddress) -> io::Result<usize> {
        if self.interfaces.len() >= self.max_interfaces {
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "interface table full"));
        }
        log::debug!("interface {} bound to {address} ({})", self.interfaces.len(), link.address());
        self.interfaces.push(Interface { link, address });
        Ok(self.interfaces.len() - 1)
    }
    pub fn interface_count(&self) -> usize {
        self.interfaces.len()
    }
    pub fn local_address(&self, index: usize) -> Option<NetworkAddress> {
        self.interfaces.get(index).map(|interface| interface.address)
    }
    pub fn link_address(&self, index: usize) -> Option<LinkAddress> {
        self.interfaces.get(index).map(|interface| interface.link.address())
    }
    pub fn is_local(&self, address: NetworkAddress) -> bool {
        self.interfaces.iter().any(|interface| interface.address == address)
    }
    /// Valid cache entry for `address`, without sending anything.
    pub fn cached(&self, address: NetworkAddress) -> Option<LinkAddress> {
        self.cache.lookup(address, self.clock.millis())
    }
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
    pub fn cache_entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.cache.entries()
    }
    /// Looks `target` up in the cache.
    ///
    /// On a miss (absent or expired) a request is broadcast on the interface and
    /// `None` is returned at once; the caller retries on a later poll.
    pub fn resolve(&mut self, index: usize, target: NetworkAddress) -> Option<LinkAddress> {
        if let Some(link_address) = self.cached(target) {
            return Some(link_address);
        }
        log::debug!("arp miss for {target} on interface {index}");
        if let Err(e) = self.request(index, target) {
            log::warn!("arp request for {target} on interface {index}: {e:?}");
        }
        None
    }
    pub fn learn(&mut self, address: NetworkAddress, link_address: LinkAddress) {
        let created = self.clock.millis();
        self.cache.learn(CacheEntry {
            address,
            link_address,
            created,
        });
    }
    fn request(&mut self, index: usize, target: NetworkAddress) -> io::Result<()> {
        let interface = self.interfaces.get_mut(index).ok_or_else(unknown_interface)?;
        let packet = build_packet(
            Operation::Request,
            interface.link.address(),
            interface.address,
            LinkAddress::NULL,
            target,
        );
        interface.send(LinkAddress::BROADCAST, EtherTypes::Arp, &SegmentedBuffer::new(&packet))
    }
    /// Consumes ARP frames received on interface `index`; any other EtherType is
    /// left for the next handler.
    pub fn handle_frame(&mut self, index: usize, frame: &Frame) -> bool {
        if frame.ether_type != EtherTypes::Arp {
            return false;
        }
        let Some(packet) = ArpPacket::new(&frame.payload) else {
            log::trace!("arp frame too short: {}", frame.payload.len());
            return true;
        };
        if packet.get_hardware_type() != ArpHardwareTypes::Ethernet
            || packet.get_protocol_type() != EtherTypes::Ipv4
            || packet.get_hw_addr_len() != 6
            || packet.get_proto_addr_len() != 4
        {
            log::trace!("arp frame for unsupported address types");
            return true;
        }
        let mac = packet.get_sender_hw_addr();
        let sender_link = LinkAddress([mac.0, mac.1, mac.2, mac.3, mac.4, mac.5]);
        let sender = NetworkAddress::from(packet.get_sender_proto_addr());
        let target = NetworkAddress::from(packet.get_target_proto_addr());
        match Operation::try_from(packet.get_operation().0) {
            Ok(Operation::Request) => {
                if !self.is_local(target) {
                    return true;
                }
                self.learn(sender, sender_link);
                if let Err(e) = self.reply(index, target, sender_link, sender) {
                    log::warn!("arp reply to {sender} on interface {index}: {e:?}");
                }
            }
            Ok(Operation::Reply) => {
                log::debug!("arp {sender} is at {sender_link}");
                self.learn(sender, sender_link);
            }
            Err(e) => {
                log::trace!("arp {e}");
            }
        }
        true
    }
    fn reply(
        &mut self,
        index: usize,
        local: NetworkAddress,
        target_link: LinkAddress,
        target: NetworkAddress,
    ) -> io::Result<()> {
        let interface = self.interfaces.get_mut(index).ok_or_else(unknown_interface)?;
        let packet = build_packet(Operation::Reply, interface.link.address(), local, target_link, target);
        interface.send(target_link, EtherTypes::Arp, &SegmentedBuffer::new(&packet))
    }
    pub(crate) fn send_frame(
        &mut self,
        index: usize,
        destination: LinkAddress,
        ether_type: EtherType,
        payload: &SegmentedBuffer<'_>,
    ) -> io::Result<()> {
        let interface = self.interfaces.get_mut(index).ok_or_else(unknown_interface)?;
        interface.send(destination, ether_type, payload)
    }
    pub(crate) fn recv_frames(&mut self, index: usize, frames: &mut Vec<Frame>) {
        if let Some(interface) = self.interfaces.get_mut(index) {
            interface.link.recv_frames(frames);
        }
    }
}

pub(crate) fn unknown_interface() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "unknown interface")
}

fn build_packet(
    operation: Operation,
    sender_link: LinkAddress,
    sender: NetworkAddress,
    target_link: LinkAddress,
    target: NetworkAddress,
) -> BytesMut {
    let mut packet = BytesMut::with_capacity(ARP_PACKET_LEN);
    packet.put_u16(ArpHardwareTypes::Ethernet.0);
    packet.put_u16(EtherTypes::Ipv4.0);
    packet.put_u8(6);
    packet.put_u8(4);
    packet.put_u16(operation.into());
    packet.put_slice(&sender_link.octets());
    packet.put_slice(&sender.octets());
    packet.put_slice(&target_link.octets());
    packet.put_slice(&target.octets());
    packet
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{arp_frame, ip, manual_clock, StubLink, LOCAL_MAC, PEER_MAC};

    fn resolver() -> (AddressResolver, crate::testing::StubHandle, Arc<crate::time::ManualClock>) {
        let clock = manual_clock();
        let mut resolver = AddressResolver::new(4, Duration::from_secs(60), 2, clock.clone());
        let (link, handle) = StubLink::new(LOCAL_MAC);
        resolver.add_interface(Box::new(link), ip("10.0.0.5")).unwrap();
        (resolver, handle, clock)
    }

    #[test]
    fn test_cache_updates_in_place() {
        let mut cache = ResolutionCache::new(4, Duration::from_secs(60));
        let address = ip("10.0.0.9");
        cache.learn(CacheEntry {
            address,
            link_address: PEER_MAC,
            created: 0,
        });
        cache.learn(CacheEntry {
            address,
            link_address: LOCAL_MAC,
            created: 10,
        });
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup(address, 20), Some(LOCAL_MAC));
    }

    #[test]
    fn test_cache_evicts_oldest() {
        let mut cache = ResolutionCache::new(2, Duration::from_secs(60));
        for last in 1..=3u8 {
            cache.learn(CacheEntry {
                address: NetworkAddress::new(10, 0, 0, last),
                link_address: LinkAddress([0x02, 0, 0, 0, 0, last]),
                created: 0,
            });
        }
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.lookup(NetworkAddress::new(10, 0, 0, 1), 0), None);
        assert!(cache.lookup(NetworkAddress::new(10, 0, 0, 2), 0).is_some());
        assert!(cache.lookup(NetworkAddress::new(10, 0, 0, 3), 0).is_some());
    }

    #[test]
    fn test_expired_entry_is_a_miss_but_stays() {
        let mut cache = ResolutionCache::new(2, Duration::from_secs(60));
        let address = ip("10.0.0.9");
        cache.learn(CacheEntry {
            address,
            link_address: PEER_MAC,
            created: 1_000,
        });
        assert_eq!(cache.lookup(address, 60_999), Some(PEER_MAC));
        assert_eq!(cache.lookup(address, 61_000), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_resolve_miss_broadcasts_request() {
        let (mut resolver, handle, _clock) = resolver();
        assert_eq!(resolver.resolve(0, ip("10.0.0.9")), None);
        let sent = handle.take_sent();
        assert_eq!(sent.len(), 1);
        let frame = &sent[0];
        assert_eq!(frame.destination, LinkAddress::BROADCAST);
        assert_eq!(frame.source, LOCAL_MAC);
        assert_eq!(frame.ether_type, EtherTypes::Arp);
        let packet = ArpPacket::new(&frame.payload).unwrap();
        assert_eq!(packet.get_operation().0, 1);
        assert_eq!(NetworkAddress::from(packet.get_sender_proto_addr()), ip("10.0.0.5"));
        assert_eq!(NetworkAddress::from(packet.get_target_proto_addr()), ip("10.0.0.9"));
        assert_eq!(&frame.payload[8..14], &LOCAL_MAC.octets());
        assert_eq!(&frame.payload[18..24], &[0; 6]);
    }

    #[test]
    fn test_resolve_after_reply_and_expiry() {
        let (mut resolver, handle, clock) = resolver();
        let reply = arp_frame(Operation::Reply, PEER_MAC, ip("10.0.0.9"), LOCAL_MAC, ip("10.0.0.5"), LOCAL_MAC);
        assert!(resolver.handle_frame(0, &reply));
        assert!(handle.take_sent().is_empty());
        assert_eq!(resolver.resolve(0, ip("10.0.0.9")), Some(PEER_MAC));
        assert!(handle.take_sent().is_empty());

        clock.advance(Duration::from_secs(60));
        assert_eq!(resolver.resolve(0, ip("10.0.0.9")), None);
        assert_eq!(resolver.cache_len(), 1);
        assert_eq!(handle.take_sent().len(), 1);
    }

    #[test]
    fn test_request_for_local_address_is_answered() {
        let (mut resolver, handle, _clock) = resolver();
        let request = arp_frame(
            Operation::Request,
            PEER_MAC,
            ip("10.0.0.9"),
            LinkAddress::NULL,
            ip("10.0.0.5"),
            LinkAddress::BROADCAST,
        );
        assert!(resolver.handle_frame(0, &request));
        assert_eq!(resolver.cached(ip("10.0.0.9")), Some(PEER_MAC));

        let sent = handle.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].destination, PEER_MAC);
        let packet = ArpPacket::new(&sent[0].payload).unwrap();
        assert_eq!(packet.get_operation().0, 2);
        assert_eq!(&sent[0].payload[8..14], &LOCAL_MAC.octets());
        assert_eq!(NetworkAddress::from(packet.get_sender_proto_addr()), ip("10.0.0.5"));
        assert_eq!(&sent[0].payload[18..24], &PEER_MAC.octets());
        assert_eq!(NetworkAddress::from(packet.get_target_proto_addr()), ip("10.0.0.9"));
    }

    #[test]
    fn test_request_for_other_host_is_ignored() {
        let (mut resolver, handle, _clock) = resolver();
        let request = arp_frame(
            Operation::Request,
            PEER_MAC,
            ip("10.0.0.9"),
            LinkAddress::NULL,
            ip("10.0.0.77"),
            LinkAddress::BROADCAST,
        );
        assert!(resolver.handle_frame(0, &request));
        assert_eq!(resolver.cache_len(), 0);
        assert!(handle.take_sent().is_empty());
    }

    #[test]
    fn test_malformed_and_foreign_frames() {
        let (mut resolver, handle, _clock) = resolver();
        let mut bad = arp_frame(Operation::Reply, PEER_MAC, ip("10.0.0.9"), LOCAL_MAC, ip("10.0.0.5"), LOCAL_MAC);
        bad.payload[4] = 8;
        assert!(resolver.handle_frame(0, &bad));
        assert_eq!(resolver.cache_len(), 0);

        let mut short = bad.clone();
        short.payload.truncate(20);
        assert!(resolver.handle_frame(0, &short));

        let mut not_arp = bad;
        not_arp.ether_type = EtherTypes::Ipv4;
        assert!(!resolver.handle_frame(0, &not_arp));
        assert!(handle.take_sent().is_empty());
    }

    #[test]
    fn test_interface_limit() {
        let (mut resolver, _handle, _clock) = resolver();
        let (second, _) = StubLink::new(PEER_MAC);
        assert_eq!(resolver.add_interface(Box::new(second), ip("192.168.1.1")).unwrap(), 1);
        let (third, _) = StubLink::new(PEER_MAC);
        let err = resolver.add_interface(Box::new(third), ip("172.16.0.1")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::OutOfMemory);
        assert!(resolver.is_local(ip("192.168.1.1")));
        assert_eq!(resolver.link_address(1), Some(PEER_MAC));
        assert_eq!(resolver.local_address(2), None);
    }
}
