//! Stub link and frame builders shared by the unit tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::mem;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use pnet_packet::ethernet::{EtherType, EtherTypes};
use pnet_packet::icmp::echo_request::EchoRequestPacket;
use pnet_packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::Packet;

use crate::address::{LinkAddress, NetworkAddress};
use crate::arp::Operation;
use crate::buffer::{checksum, SegmentedBuffer};
use crate::icmp::{echo_message, EchoKind};
use crate::ip::{IpDatagram, IpListener, IpRouter, NextHop};
use crate::ip_stack::StackConfig;
use crate::link::{Frame, LinkLayer};
use crate::time::ManualClock;

pub(crate) const LOCAL_MAC: LinkAddress = LinkAddress([0x02, 0, 0, 0, 0, 0x05]);
pub(crate) const PEER_MAC: LinkAddress = LinkAddress([0x02, 0, 0, 0, 0, 0x09]);
pub(crate) const GATEWAY_MAC: LinkAddress = LinkAddress([0x02, 0, 0, 0, 0, 0x01]);

pub(crate) type Responder = Box<dyn FnMut(&Frame) -> Vec<Frame>>;

#[derive(Default)]
struct StubState {
    inbound: VecDeque<Frame>,
    sent: Vec<Frame>,
    responder: Option<Responder>,
    tick: Option<(Arc<ManualClock>, Duration)>,
    fail_sends: bool,
}

/// Records sent frames and replays injected ones.
pub(crate) struct StubLink {
    address: LinkAddress,
    state: Rc<RefCell<StubState>>,
}

#[derive(Clone)]
pub(crate) struct StubHandle {
    state: Rc<RefCell<StubState>>,
}

impl StubLink {
    pub(crate) fn new(address: LinkAddress) -> (Self, StubHandle) {
        let state = Rc::new(RefCell::new(StubState::default()));
        (
            Self {
                address,
                state: state.clone(),
            },
            StubHandle { state },
        )
    }
}

impl LinkLayer for StubLink {
    fn address(&self) -> LinkAddress {
        self.address
    }

    fn send_frame(
        &mut self,
        source: LinkAddress,
        destination: LinkAddress,
        ether_type: EtherType,
        payload: &SegmentedBuffer<'_>,
    ) -> io::Result<()> {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        if state.fail_sends {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "link closed"));
        }
        let frame = Frame {
            source,
            destination,
            ether_type,
            payload: payload.to_bytes(),
        };
        if let Some(responder) = state.responder.as_mut() {
            state.inbound.extend(responder(&frame));
        }
        state.sent.push(frame);
        Ok(())
    }

    fn recv_frames(&mut self, frames: &mut Vec<Frame>) {
        let mut state = self.state.borrow_mut();
        if let Some((clock, step)) = &state.tick {
            clock.advance(*step);
        }
        frames.extend(state.inbound.drain(..));
    }
}

impl StubHandle {
    pub(crate) fn inject(&self, frame: Frame) {
        self.state.borrow_mut().inbound.push_back(frame);
    }
    pub(crate) fn take_sent(&self) -> Vec<Frame> {
        mem::take(&mut self.state.borrow_mut().sent)
    }
    /// Called for every sent frame; returned frames are queued for receipt.
    pub(crate) fn set_responder(&self, responder: Responder) {
        self.state.borrow_mut().responder = Some(responder);
    }
    /// Advances `clock` by `step` on every receive poll.
    pub(crate) fn tick_clock(&self, clock: Arc<ManualClock>, step: Duration) {
        self.state.borrow_mut().tick = Some((clock, step));
    }
    pub(crate) fn set_fail_sends(&self, fail: bool) {
        self.state.borrow_mut().fail_sends = fail;
    }
}

/// Keeps a copy of every datagram and claims it.
#[derive(Default)]
pub(crate) struct Recorder {
    pub(crate) datagrams: Vec<IpDatagram>,
}

impl IpListener for Recorder {
    fn on_datagram(&mut self, _router: &mut IpRouter, datagram: &IpDatagram) -> bool {
        self.datagrams.push(datagram.clone());
        true
    }
}

pub(crate) fn ip(address: &str) -> NetworkAddress {
    address.parse().unwrap()
}

pub(crate) fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(0))
}

/// Router bound to 10.0.0.5/24 on a stub link, default gateway 10.0.0.1.
pub(crate) fn router_with_clock(config: &StackConfig, clock: Arc<ManualClock>) -> (IpRouter, StubHandle) {
    let mut router = IpRouter::new(config, clock);
    let (link, handle) = StubLink::new(LOCAL_MAC);
    let interface = router.add_interface(Box::new(link), ip("10.0.0.5")).unwrap();
    router
        .add_route(ip("10.0.0.0"), ip("255.255.255.0"), NextHop::Direct, interface)
        .unwrap();
    router
        .add_route(ip("0.0.0.0"), ip("0.0.0.0"), ip("10.0.0.1"), interface)
        .unwrap();
    (router, handle)
}

pub(crate) fn router_with_stub(config: &StackConfig) -> (IpRouter, StubHandle) {
    router_with_clock(config, manual_clock())
}

pub(crate) fn arp_frame(
    operation: Operation,
    sender_link: LinkAddress,
    sender: NetworkAddress,
    target_link: LinkAddress,
    target: NetworkAddress,
    destination: LinkAddress,
) -> Frame {
    let mut payload = BytesMut::with_capacity(28);
    payload.put_u16(1);
    payload.put_u16(0x0800);
    payload.put_u8(6);
    payload.put_u8(4);
    payload.put_u16(operation.into());
    payload.put_slice(&sender_link.octets());
    payload.put_slice(&sender.octets());
    payload.put_slice(&target_link.octets());
    payload.put_slice(&target.octets());
    Frame {
        source: sender_link,
        destination,
        ether_type: EtherTypes::Arp,
        payload,
    }
}

pub(crate) fn ipv4_packet(
    source: NetworkAddress,
    destination: NetworkAddress,
    protocol: IpNextHeaderProtocol,
    payload: &[u8],
) -> BytesMut {
    let mut packet = BytesMut::with_capacity(20 + payload.len());
    packet.put_u8(0x45);
    packet.put_u8(0);
    packet.put_u16((20 + payload.len()) as u16);
    packet.put_u16(0x1c46);
    packet.put_u16(0);
    packet.put_u8(64);
    packet.put_u8(protocol.0);
    packet.put_u16(0);
    packet.put_slice(&source.octets());
    packet.put_slice(&destination.octets());
    let sum = checksum(&packet);
    packet[10..12].copy_from_slice(&sum.to_be_bytes());
    packet.put_slice(payload);
    packet
}

pub(crate) fn ipv4_frame(
    source_link: LinkAddress,
    destination_link: LinkAddress,
    source: NetworkAddress,
    destination: NetworkAddress,
    protocol: IpNextHeaderProtocol,
    payload: &[u8],
) -> Frame {
    Frame {
        source: source_link,
        destination: destination_link,
        ether_type: EtherTypes::Ipv4,
        payload: ipv4_packet(source, destination, protocol, payload),
    }
}

/// UDP segment with the checksum left at zero.
pub(crate) fn udp_segment(source_port: u16, destination_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut segment = Vec::with_capacity(8 + payload.len());
    segment.extend_from_slice(&source_port.to_be_bytes());
    segment.extend_from_slice(&destination_port.to_be_bytes());
    segment.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    segment.extend_from_slice(&[0, 0]);
    segment.extend_from_slice(payload);
    segment
}

/// Plays the remote host: every echo request sent gets a matching reply.
pub(crate) fn echo_responder() -> Responder {
    Box::new(|frame: &Frame| {
        if frame.ether_type != EtherTypes::Ipv4 {
            return Vec::new();
        }
        let Some(packet) = Ipv4Packet::new(&frame.payload) else {
            return Vec::new();
        };
        if packet.get_next_level_protocol() != IpNextHeaderProtocols::Icmp {
            return Vec::new();
        }
        let Some(request) = EchoRequestPacket::new(packet.payload()) else {
            return Vec::new();
        };
        if request.get_icmp_type().0 != u8::from(EchoKind::Request) {
            return Vec::new();
        }
        let reply = echo_message(
            EchoKind::Reply,
            request.get_identifier(),
            request.get_sequence_number(),
            request.payload(),
        );
        vec![ipv4_frame(
            frame.destination,
            frame.source,
            packet.get_destination().into(),
            packet.get_source().into(),
            IpNextHeaderProtocols::Icmp,
            &reply,
        )]
    })
}

/// Hands frames addressed to the sending station straight back.
pub(crate) fn loopback_responder() -> Responder {
    Box::new(|frame: &Frame| {
        if frame.destination == frame.source {
            vec![frame.clone()]
        } else {
            Vec::new()
        }
    })
}
