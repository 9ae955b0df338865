use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use pnet_packet::icmp::echo_reply::EchoReplyPacket;
use pnet_packet::icmp::echo_request::EchoRequestPacket;
use pnet_packet::icmp::IcmpPacket;
use pnet_packet::ip::IpNextHeaderProtocols;
use pnet_packet::Packet;

use crate::address::NetworkAddress;
use crate::buffer::{checksum, SegmentedBuffer};
use crate::ip::{IpDatagram, IpListener, IpRouter};
use crate::time::Clock;

pub const ICMP_ECHO_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum EchoKind {
    Reply = 0,
    Request = 8,
}

/// Answers echo requests and runs outbound pings.
pub struct IcmpEcho {
    last_reply: Option<u16>,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl IcmpEcho {
    pub fn new(timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            last_reply: None,
            timeout,
            clock,
        }
    }
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
    /// Identifier of the most recent echo reply seen.
    pub fn last_reply(&self) -> Option<u16> {
        self.last_reply
    }
    pub fn send_request(&mut self, router: &mut IpRouter, destination: NetworkAddress, identifier: u16) -> io::Result<()> {
        let message = echo_message(EchoKind::Request, identifier, 0, &[]);
        router.send(
            NetworkAddress::UNSPECIFIED,
            destination,
            IpNextHeaderProtocols::Icmp,
            &SegmentedBuffer::new(&message),
        )
    }
    /// Sends one echo request and calls `poll` until the matching reply shows up
    /// or the timeout runs out.
    ///
    /// `poll` is expected to drive [`IpRouter::receive`] with this service in the
    /// listener chain. A failed send is not retried; the call still waits out the
    /// timeout. Must not be called from inside a listener.
    pub fn ping<P>(&mut self, router: &mut IpRouter, destination: NetworkAddress, mut poll: P) -> io::Result<Duration>
    where
        P: FnMut(&mut IpRouter, &mut IcmpEcho),
    {
        let identifier = rand::random::<u16>();
        let start = self.clock.millis();
        self.last_reply = None;
        if let Err(e) = self.send_request(router, destination, identifier) {
            log::debug!("ping {destination}: {e:?}");
        }
        loop {
            poll(&mut *router, &mut *self);
            if self.last_reply == Some(identifier) {
                let elapsed = self.clock.elapsed_since(start);
                log::debug!("ping {destination}: reply in {elapsed:?}");
                return Ok(elapsed);
            }
            if self.clock.has_elapsed(start, self.timeout) {
                log::debug!("ping {destination}: no reply within {:?}", self.timeout);
                return Err(io::Error::new(io::ErrorKind::TimedOut, "ping timed out"));
            }
        }
    }
}

impl IpListener for IcmpEcho {
    fn on_datagram(&mut self, router: &mut IpRouter, datagram: &IpDatagram) -> bool {
        if datagram.protocol != IpNextHeaderProtocols::Icmp || datagram.payload.len() < ICMP_ECHO_HEADER_LEN {
            return false;
        }
        let Some(packet) = IcmpPacket::new(&datagram.payload) else {
            return false;
        };
        if packet.get_icmp_code().0 != 0 {
            return false;
        }
        match EchoKind::try_from(packet.get_icmp_type().0) {
            Ok(EchoKind::Request) => {
                let Some(request) = EchoRequestPacket::new(&datagram.payload) else {
                    return false;
                };
                let reply = echo_message(
                    EchoKind::Reply,
                    request.get_identifier(),
                    request.get_sequence_number(),
                    request.payload(),
                );
                if let Err(e) = router.send(
                    datagram.destination,
                    datagram.source,
                    IpNextHeaderProtocols::Icmp,
                    &SegmentedBuffer::new(&reply),
                ) {
                    log::warn!("echo reply to {}: {e:?}", datagram.source);
                }
                true
            }
            Ok(EchoKind::Reply) => {
                let Some(reply) = EchoReplyPacket::new(&datagram.payload) else {
                    return false;
                };
                log::trace!("echo reply from {} id {}", datagram.source, reply.get_identifier());
                self.last_reply = Some(reply.get_identifier());
                true
            }
            Err(_) => false,
        }
    }
}

pub(crate) fn echo_message(kind: EchoKind, identifier: u16, sequence: u16, payload: &[u8]) -> BytesMut {
    let mut message = BytesMut::with_capacity(ICMP_ECHO_HEADER_LEN + payload.len());
    message.put_u8(kind.into());
    message.put_u8(0);
    message.put_u16(0);
    message.put_u16(identifier);
    message.put_u16(sequence);
    message.put_slice(payload);
    let checksum = checksum(&message);
    message[2..4].copy_from_slice(&checksum.to_be_bytes());
    message
}
