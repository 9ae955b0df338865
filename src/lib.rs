/*!
A small cooperative IPv4 core: ARP, routing, ICMP echo and UDP over any
[`link::LinkLayer`].

All work happens on the caller's thread inside [`IpStack::poll`]; nothing is
spawned and nothing blocks except [`IpStack::ping`], which polls until its
timeout.

# Example
```no_run
use std::sync::Arc;
use tiny_ip::address::LinkAddress;
use tiny_ip::link::ChannelLink;
use tiny_ip::time::SystemClock;
use tiny_ip::udp::{UdpDatagram, UdpListener, UdpSender};

struct Echo;

impl UdpListener for Echo {
    fn on_datagram(&mut self, sender: &mut UdpSender<'_>, datagram: &UdpDatagram<'_>) -> bool {
        if datagram.destination_port != 7 {
            return false;
        }
        if let Err(e) = sender.send(Some(7), datagram.source_port, datagram.source, datagram.payload) {
            println!("{e:?}");
        }
        true
    }
}

fn main() -> std::io::Result<()> {
    // replace with a driver for real hardware
    let (link, _wire) = ChannelLink::pair(LinkAddress([2, 0, 0, 0, 0, 1]), LinkAddress([2, 0, 0, 0, 0, 2]), 64);
    let mut ip_stack = tiny_ip::ip_stack(Default::default(), Arc::new(SystemClock::new()))?;
    ip_stack.configure(link, "192.168.1.10", "255.255.255.0", "192.168.1.1")?;
    ip_stack.add_udp_listener(Echo)?;
    loop {
        ip_stack.poll();
    }
}
```
*/

pub mod address;
pub mod arp;
pub mod buffer;
pub mod icmp;
pub mod ip;
mod ip_stack;
pub use ip_stack::*;
pub mod link;
pub mod time;
pub mod udp;

#[cfg(test)]
mod testing;
