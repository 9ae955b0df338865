use std::io;

use bytes::BytesMut;
use flume::TrySendError;
use pnet_packet::ethernet::EtherType;

use crate::address::LinkAddress;
use crate::buffer::SegmentedBuffer;

/// A received link-layer frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub source: LinkAddress,
    pub destination: LinkAddress,
    pub ether_type: EtherType,
    pub payload: BytesMut,
}

/// The narrow contract a link-layer driver exposes to the protocol core.
///
/// `recv_frames` must only drain what is already queued when it is called and
/// must never block. A driver fed from an interrupt source serialises that
/// itself; the core calls it from a single thread.
pub trait LinkLayer {
    fn address(&self) -> LinkAddress;
    fn send_frame(
        &mut self,
        source: LinkAddress,
        destination: LinkAddress,
        ether_type: EtherType,
        payload: &SegmentedBuffer<'_>,
    ) -> io::Result<()>;
    fn recv_frames(&mut self, frames: &mut Vec<Frame>);
}

/// A link whose frames travel over `flume` channels.
///
/// The producing side (a driver thread or interrupt handler) pushes frames
/// into the channel; [`LinkLayer::recv_frames`] drains what is queued at call
/// time. [`ChannelLink::pair`] joins two links like a crossover cable.
pub struct ChannelLink {
    address: LinkAddress,
    promiscuous: bool,
    sender: flume::Sender<Frame>,
    receiver: flume::Receiver<Frame>,
}

impl ChannelLink {
    pub fn new(address: LinkAddress, sender: flume::Sender<Frame>, receiver: flume::Receiver<Frame>) -> Self {
        Self {
            address,
            promiscuous: false,
            sender,
            receiver,
        }
    }
    /// Two links wired to each other, each direction queueing up to `capacity` frames.
    pub fn pair(a: LinkAddress, b: LinkAddress, capacity: usize) -> (Self, Self) {
        let (a_to_b, b_from_a) = flume::bounded(capacity);
        let (b_to_a, a_from_b) = flume::bounded(capacity);
        (Self::new(a, a_to_b, a_from_b), Self::new(b, b_to_a, b_from_a))
    }
    /// Accept frames addressed to any station, not just this one and broadcast.
    pub fn set_promiscuous(&mut self, promiscuous: bool) {
        self.promiscuous = promiscuous;
    }
}

impl LinkLayer for ChannelLink {
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
        let frame = Frame {
            source,
            destination,
            ether_type,
            payload: payload.to_bytes(),
        };
        match self.sender.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(io::Error::new(io::ErrorKind::WouldBlock, "link queue full")),
            Err(TrySendError::Disconnected(_)) => Err(io::Error::new(io::ErrorKind::WriteZero, "link closed")),
        }
    }

    fn recv_frames(&mut self, frames: &mut Vec<Frame>) {
        let address = self.address;
        let promiscuous = self.promiscuous;
        let queued = self.receiver.len();
        frames.extend(
            self.receiver
                .try_iter()
                .take(queued)
                .filter(|frame| promiscuous || frame.destination == address || frame.destination.is_broadcast()),
        );
    }
}
