use std::cell::Cell;
use std::io;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use tiny_ip::address::{LinkAddress, NetworkAddress};
use tiny_ip::link::ChannelLink;
use tiny_ip::time::SystemClock;
use tiny_ip::udp::{UdpDatagram, UdpListener, UdpSender};
use tiny_ip::{ip_stack, IpStack, StackConfig};

const CLIENT_MAC: LinkAddress = LinkAddress([0x02, 0, 0, 0, 0, 0x01]);
const SERVER_MAC: LinkAddress = LinkAddress([0x02, 0, 0, 0, 0, 0x02]);
const SERVER_IP: NetworkAddress = NetworkAddress::new(10, 0, 0, 2);
const ECHO_PORT: u16 = 7;

/// Two stacks joined by an in-memory cable: one pings the other and exchanges
/// UDP echo messages with it.
#[derive(Parser)]
pub struct Args {
    #[arg(short, long, default_value_t = 3)]
    count: usize,
    #[arg(short, long, default_value = "hello")]
    message: String,
    #[arg(short, long, default_value_t = 1000)]
    timeout_ms: u64,
}

struct Echo;

impl UdpListener for Echo {
    fn on_datagram(&mut self, sender: &mut UdpSender<'_>, datagram: &UdpDatagram<'_>) -> bool {
        if datagram.destination_port != ECHO_PORT {
            return false;
        }
        log::info!("echo {} bytes to {}:{}", datagram.payload.len(), datagram.source, datagram.source_port);
        if let Err(e) = sender.send(Some(ECHO_PORT), datagram.source_port, datagram.source, datagram.payload) {
            log::warn!("echo {e:?}");
        }
        true
    }
}

struct Replies(Rc<Cell<usize>>);

impl UdpListener for Replies {
    fn on_datagram(&mut self, _sender: &mut UdpSender<'_>, datagram: &UdpDatagram<'_>) -> bool {
        log::info!(
            "reply from {}:{} {:?}",
            datagram.source,
            datagram.source_port,
            String::from_utf8_lossy(datagram.payload)
        );
        self.0.set(self.0.get() + 1);
        true
    }
}

pub fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let config = StackConfig {
        ping_timeout: Duration::from_millis(args.timeout_ms),
        ..Default::default()
    };
    config.check()?;

    let (client_link, server_link) = ChannelLink::pair(CLIENT_MAC, SERVER_MAC, 64);
    let running = Arc::new(AtomicBool::new(true));
    let server = {
        let running = running.clone();
        thread::spawn(move || -> io::Result<()> {
            let mut ip_stack = ip_stack(config, Arc::new(SystemClock::new()))?;
            ip_stack.configure(server_link, SERVER_IP, "255.255.255.0", "0.0.0.0")?;
            ip_stack.add_udp_listener(Echo)?;
            while running.load(Ordering::Acquire) {
                ip_stack.poll();
                thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        })
    };

    let result = run_client(&args, config, client_link);
    running.store(false, Ordering::Release);
    match server.join() {
        Ok(rs) => rs?,
        Err(_) => anyhow::bail!("server thread panicked"),
    }
    result
}

fn run_client(args: &Args, config: StackConfig, link: ChannelLink) -> anyhow::Result<()> {
    let mut ip_stack = ip_stack(config, Arc::new(SystemClock::new()))?;
    ip_stack.configure(link, "10.0.0.1", "255.255.255.0", "0.0.0.0")?;
    let replies = Rc::new(Cell::new(0));
    ip_stack.add_udp_listener(Replies(replies.clone()))?;

    // the first ping usually only resolves the server's link address
    for seq in 0..args.count {
        match ip_stack.ping(SERVER_IP) {
            Ok(rtt) => log::info!("ping {SERVER_IP} seq={seq} time={rtt:?}"),
            Err(e) => log::warn!("ping {SERVER_IP} seq={seq} {e:?}"),
        }
    }

    for seq in 0..args.count {
        let message = format!("{} {seq}", args.message);
        let port = send_udp(&mut ip_stack, message.as_bytes(), config.ping_timeout)?;
        log::info!("sent {:?} from port {port}", message);
        let start = Instant::now();
        while replies.get() <= seq && start.elapsed() < config.ping_timeout {
            ip_stack.poll();
            thread::sleep(Duration::from_millis(1));
        }
    }
    log::info!("{}/{} udp replies", replies.get(), args.count);
    Ok(())
}

fn send_udp(ip_stack: &mut IpStack, payload: &[u8], timeout: Duration) -> io::Result<u16> {
    let start = Instant::now();
    loop {
        match ip_stack.send_udp(None, ECHO_PORT, SERVER_IP, payload) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock && start.elapsed() < timeout => {
                ip_stack.poll();
                thread::sleep(Duration::from_millis(1));
            }
            rs => return rs,
        }
    }
}
