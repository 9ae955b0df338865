use std::io;
use std::sync::Arc;
use std::time::Duration;

use pnet_packet::ip::IpNextHeaderProtocol;

use crate::address::{NetworkAddress, ToNetworkAddress};
use crate::buffer::SegmentedBuffer;
use crate::icmp::IcmpEcho;
use crate::ip::{IpDatagram, IpListener, IpRouter, NextHop};
use crate::link::LinkLayer;
use crate::time::Clock;
use crate::udp::{UdpListener, UdpTransport};

#[derive(Copy, Clone, Debug)]
pub struct StackConfig {
    pub arp_cache_size: usize,
    /// Resolution cache entries older than this are misses.
    pub arp_max_age: Duration,
    pub max_interfaces: usize,
    pub max_routes: usize,
    pub max_udp_listeners: usize,
    pub max_ip_listeners: usize,
    pub ping_timeout: Duration,
    /// Resend datagrams addressed to other hosts.
    pub forwarding: bool,
    /// Largest datagram payload accepted on receive.
    pub rx_buffer_limit: usize,
    pub ttl: u8,
}

impl StackConfig {
    pub fn check(&self) -> io::Result<()> {
        if self.arp_cache_size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "arp_cache_size is zero"));
        }
        if self.arp_max_age.as_secs() == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "arp_max_age<1s"));
        }
        if self.max_interfaces == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "max_interfaces is zero"));
        }
        if self.max_routes == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "max_routes is zero"));
        }
        if self.max_udp_listeners == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "max_udp_listeners is zero"));
        }
        if self.max_ip_listeners == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "max_ip_listeners is zero"));
        }
        if self.ping_timeout.is_zero() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "ping_timeout is zero"));
        }
        if self.rx_buffer_limit < 8 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "rx_buffer_limit<8"));
        }
        if self.ttl == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "ttl is zero"));
        }
        Ok(())
    }
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            arp_cache_size: 8,
            arp_max_age: Duration::from_secs(300),
            max_interfaces: 4,
            max_routes: 8,
            max_udp_listeners: 8,
            max_ip_listeners: 4,
            ping_timeout: Duration::from_millis(1000),
            forwarding: false,
            rx_buffer_limit: 1500,
            ttl: 64,
        }
    }
}

/// A single-threaded IPv4 host: router, ARP, ICMP echo and UDP.
///
/// Nothing runs in the background. Inbound traffic is only processed inside
/// [`IpStack::poll`] (and while [`IpStack::ping`] waits), so the owner calls
/// `poll` from its main loop or scheduler tick.
pub struct IpStack {
    config: StackConfig,
    router: IpRouter,
    icmp: IcmpEcho,
    udp: UdpTransport,
    protocols: Vec<Box<dyn IpListener>>,
}

/// Create a protocol stack with no interfaces bound.
///
/// # Examples
/// ```rust
/// use std::sync::Arc;
/// use tiny_ip::address::LinkAddress;
/// use tiny_ip::link::ChannelLink;
/// use tiny_ip::time::SystemClock;
///
/// fn main() -> std::io::Result<()> {
///     let (link, _peer) = ChannelLink::pair(LinkAddress([2, 0, 0, 0, 0, 1]), LinkAddress([2, 0, 0, 0, 0, 2]), 64);
///     let mut ip_stack = tiny_ip::ip_stack(Default::default(), Arc::new(SystemClock::new()))?;
///     ip_stack.configure(link, "10.0.0.1", "255.255.255.0", "10.0.0.254")?;
///     loop {
///         ip_stack.poll();
///         # break;
///     }
///     Ok(())
/// }
/// ```
pub fn ip_stack(config: StackConfig, clock: Arc<dyn Clock>) -> io::Result<IpStack> {
    IpStack::new(config, clock)
}

/// The upper layers in dispatch order: ICMP, UDP, then application listeners.
struct UpperLayers<'a> {
    icmp: &'a mut IcmpEcho,
    udp: &'a mut UdpTransport,
    protocols: &'a mut [Box<dyn IpListener>],
}

impl IpListener for UpperLayers<'_> {
    fn on_datagram(&mut self, router: &mut IpRouter, datagram: &IpDatagram) -> bool {
        if self.icmp.on_datagram(router, datagram) || self.udp.on_datagram(router, datagram) {
            return true;
        }
        for listener in self.protocols.iter_mut() {
            if listener.on_datagram(router, datagram) {
                return true;
            }
        }
        false
    }
}

impl IpStack {
    pub fn new(config: StackConfig, clock: Arc<dyn Clock>) -> io::Result<Self> {
        config.check()?;
        Ok(Self {
            router: IpRouter::new(&config, clock.clone()),
            icmp: IcmpEcho::new(config.ping_timeout, clock),
            udp: UdpTransport::new(config.max_udp_listeners),
            protocols: Vec::with_capacity(config.max_ip_listeners),
            config,
        })
    }
    pub fn config(&self) -> &StackConfig {
        &self.config
    }
    pub fn add_interface(&mut self, link: impl LinkLayer + 'static, address: impl ToNetworkAddress) -> io::Result<usize> {
        let address = address.to_addr()?;
        self.router.add_interface(Box::new(link), address)
    }
    /// Binds `link` to `address` and adds the on-link route for its subnet plus
    /// a default route through `gateway` (skipped when the gateway is 0.0.0.0).
    pub fn configure(
        &mut self,
        link: impl LinkLayer + 'static,
        address: impl ToNetworkAddress,
        subnet: impl ToNetworkAddress,
        gateway: impl ToNetworkAddress,
    ) -> io::Result<usize> {
        let address = address.to_addr()?;
        let subnet = subnet.to_addr()?;
        let gateway = gateway.to_addr()?;
        let needed = if gateway.is_unspecified() { 1 } else { 2 };
        if self.router.routes().len() + needed > self.config.max_routes {
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "routing table full"));
        }
        let interface = self.router.add_interface(Box::new(link), address)?;
        self.router
            .add_route(address & subnet, subnet, NextHop::Direct, interface)?;
        if !gateway.is_unspecified() {
            self.router.add_route(
                NetworkAddress::UNSPECIFIED,
                NetworkAddress::UNSPECIFIED,
                gateway,
                interface,
            )?;
        }
        log::debug!("interface {interface}: {address} mask {subnet} gateway {gateway}");
        Ok(interface)
    }
    pub fn add_route(
        &mut self,
        network: impl ToNetworkAddress,
        mask: impl ToNetworkAddress,
        next_hop: impl Into<NextHop>,
        interface: usize,
    ) -> io::Result<()> {
        self.router
            .add_route(network.to_addr()?, mask.to_addr()?, next_hop, interface)
    }
    pub fn set_forwarding(&mut self, forwarding: bool) {
        self.router.set_forwarding(forwarding)
    }
    pub fn add_udp_listener(&mut self, listener: impl UdpListener + 'static) -> io::Result<()> {
        self.udp.add_listener(listener)
    }
    /// Registers a handler for datagrams neither ICMP nor UDP consumed.
    pub fn add_ip_listener(&mut self, listener: impl IpListener + 'static) -> io::Result<()> {
        if self.protocols.len() >= self.config.max_ip_listeners {
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "ip listener table full"));
        }
        self.protocols.push(Box::new(listener));
        Ok(())
    }
    /// Drains every bound link once and runs all resulting protocol work.
    pub fn poll(&mut self) {
        let Self {
            router,
            icmp,
            udp,
            protocols,
            ..
        } = self;
        router.receive(&mut UpperLayers { icmp, udp, protocols })
    }
    /// Pings `destination`, polling the whole stack while waiting.
    pub fn ping(&mut self, destination: impl ToNetworkAddress) -> io::Result<Duration> {
        let destination = destination.to_addr()?;
        let Self {
            router,
            icmp,
            udp,
            protocols,
            ..
        } = self;
        icmp.ping(router, destination, |router, icmp| {
            router.receive(&mut UpperLayers {
                icmp,
                udp: &mut *udp,
                protocols: &mut protocols[..],
            })
        })
    }
    /// Returns the source port used.
    pub fn send_udp(
        &mut self,
        source_port: Option<u16>,
        destination_port: u16,
        destination: impl ToNetworkAddress,
        payload: &[u8],
    ) -> io::Result<u16> {
        let destination = destination.to_addr()?;
        self.udp
            .send(&mut self.router, source_port, destination_port, destination, payload)
    }
    pub fn send_ip(
        &mut self,
        destination: impl ToNetworkAddress,
        protocol: IpNextHeaderProtocol,
        payload: &[u8],
    ) -> io::Result<()> {
        let destination = destination.to_addr()?;
        self.router.send(
            NetworkAddress::UNSPECIFIED,
            destination,
            protocol,
            &SegmentedBuffer::new(payload),
        )
    }
    pub fn router(&self) -> &IpRouter {
        &self.router
    }
    pub fn router_mut(&mut self) -> &mut IpRouter {
        &mut self.router
    }
    pub fn icmp(&self) -> &IcmpEcho {
        &self.icmp
    }
}
