//! A single-NIC userspace IPv4/IPv6 host that terminates TCP and UDP
//! arriving on a TUN link endpoint and surfaces each new flow to a handler.
//!
//! ICMPv4/ICMPv6 are enabled on the interface but otherwise untouched here:
//! smoltcp answers echo requests itself, so there is no forwarder for it.

mod closer;
mod device;
mod error;
mod flow;
mod stream;
mod tcp;
mod udp;

pub use closer::OnceCloser;
pub use error::Error;
pub use flow::FlowMetadata;
pub use stream::FlowStream;

use device::ChannelDevice;
use futures::future::BoxFuture;
use ip_packet::IpPacket;
use smoltcp::iface::{Config, Interface, Route, SocketSet};
use smoltcp::wire::{HardwareAddress, IpEndpoint, Ipv4Address, Ipv4Cidr, Ipv6Address, Ipv6Cidr};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant as StdInstant};
use tcp::TcpForwarder;
use tokio::sync::mpsc;
use udp::UdpForwarder;

/// Interface addresses smoltcp is told it owns. These never appear on the
/// wire; together with [`Interface::set_any_ip`] and the catch-all gateway
/// routes below they just give smoltcp's IPv4/IPv6 layers something to
/// anchor their routing decision on.
const PLACEHOLDER_IPV4: Ipv4Address = Ipv4Address::new(127, 0, 0, 1);
const PLACEHOLDER_IPV6: Ipv6Address = Ipv6Address::new(0, 0, 0, 0, 0, 0, 0, 1);

/// How often the poll loop wakes up even with nothing queued, so smoltcp's
/// own retransmission and keepalive timers still fire.
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy)]
pub struct StackOptions {
    pub mtu: usize,
    pub enable_ipv4: bool,
    pub enable_ipv6: bool,
}

impl Default for StackOptions {
    fn default() -> Self {
        Self {
            mtu: ip_packet::DEFAULT_MTU as usize,
            enable_ipv4: true,
            enable_ipv6: true,
        }
    }
}

/// A freshly-accepted UDP flow: one (source, destination) pair worth of
/// datagrams, both directions.
pub struct UdpFlow {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl UdpFlow {
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    pub fn send(&self, datagram: Vec<u8>) -> anyhow::Result<()> {
        self.tx
            .send(datagram)
            .map_err(|_| anyhow::anyhow!("UDP flow no longer has a stack-side endpoint"))
    }
}

pub type TcpHandler =
    Arc<dyn Fn(FlowStream, FlowMetadata) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub type UdpHandler =
    Arc<dyn Fn(UdpFlow, FlowMetadata) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Handle to a running protocol stack.
///
/// Dropping this without calling [`Stack::close`] leaves the poll-loop
/// thread running; `close` is the only supported shutdown path.
pub struct Stack {
    inbound_tx: mpsc::Sender<IpPacket>,
    shutdown: OnceCloser,
    join: Option<std::thread::JoinHandle<()>>,
}

impl Stack {
    /// Starts the stack on a dedicated thread, attached to `link` (packets
    /// read from the TUN arrive via `link.0`; packets the stack produces go
    /// out via `link.1`).
    ///
    /// Mirrors the `NetworkStack` boundary's `AttachLink` +
    /// `SetTCPForwarder` + `SetUDPForwarder`: all three happen together here
    /// because smoltcp's `Interface` needs the device at construction time.
    pub fn start(
        options: StackOptions,
        link: (mpsc::Receiver<IpPacket>, mpsc::Sender<IpPacket>),
        tcp_handler: TcpHandler,
        udp_handler: UdpHandler,
    ) -> Result<Self, Error> {
        let (tun_to_stack_tx, tun_to_stack_rx) = mpsc::channel::<IpPacket>(256);
        let shutdown = OnceCloser::new();
        let shutdown_for_thread = shutdown.clone();

        let join = std::thread::Builder::new()
            .name("net-stack-poll".to_owned())
            .spawn(move || {
                run_poll_loop(
                    options,
                    tun_to_stack_rx,
                    link,
                    tcp_handler,
                    udp_handler,
                    shutdown_for_thread,
                )
            })
            .map_err(|e| Error::StackCreationFailed(e.to_string()))?;

        Ok(Self {
            inbound_tx: tun_to_stack_tx,
            shutdown,
            join: Some(join),
        })
    }

    /// Feeds one packet read off the TUN into the stack.
    pub async fn feed(&self, packet: IpPacket) -> bool {
        self.inbound_tx.send(packet).await.is_ok()
    }

    /// Detaches the link endpoint, closes the stack, and aborts every live
    /// endpoint, matching the shutdown order in the design notes: link
    /// first, then the stack, then whatever the stack's cleanup surfaced.
    pub fn close(mut self) {
        if self.shutdown.close() {
            drop(self.inbound_tx);
        }

        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn run_poll_loop(
    options: StackOptions,
    inbound_rx: mpsc::Receiver<IpPacket>,
    (mut tun_rx, tun_tx): (mpsc::Receiver<IpPacket>, mpsc::Sender<IpPacket>),
    tcp_handler: TcpHandler,
    udp_handler: UdpHandler,
    shutdown: OnceCloser,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(error) => {
            tracing::error!(%error, "Failed to start protocol stack runtime");
            return;
        }
    };

    runtime.block_on(poll_loop(
        options,
        inbound_rx,
        tun_rx_take(&mut tun_rx),
        tun_tx,
        tcp_handler,
        udp_handler,
        shutdown,
    ));
}

// Helper purely so `poll_loop`'s signature reads as "inbound from TUN" /
// "outbound to TUN" without a second mutable borrow of the same receiver.
fn tun_rx_take(rx: &mut mpsc::Receiver<IpPacket>) -> mpsc::Receiver<IpPacket> {
    std::mem::replace(rx, mpsc::channel(1).1)
}

#[allow(clippy::too_many_arguments)]
async fn poll_loop(
    options: StackOptions,
    mut inbound_rx: mpsc::Receiver<IpPacket>,
    mut tun_rx: mpsc::Receiver<IpPacket>,
    tun_tx: mpsc::Sender<IpPacket>,
    tcp_handler: TcpHandler,
    udp_handler: UdpHandler,
    shutdown: OnceCloser,
) {
    let boot = StdInstant::now();
    let mut device = ChannelDevice::new(options.mtu);

    let mut config = Config::new(HardwareAddress::Ip);
    config.random_seed = rand_seed();

    let mut iface = Interface::new(config, &mut device, smol_now(boot, StdInstant::now()));
    iface.set_any_ip(true);

    iface.update_ip_addrs(|addrs| {
        if options.enable_ipv4 {
            let _ = addrs.push(IpCidr4(Ipv4Cidr::new(PLACEHOLDER_IPV4, 32)));
        }
        if options.enable_ipv6 {
            let _ = addrs.push(IpCidr6(Ipv6Cidr::new(PLACEHOLDER_IPV6, 128)));
        }
    });

    iface.routes_mut().update(|routes| {
        if options.enable_ipv4 {
            let _ = routes.push(Route::new_ipv4_gateway(PLACEHOLDER_IPV4));
        }
        if options.enable_ipv6 {
            let _ = routes.push(Route::new_ipv6_gateway(PLACEHOLDER_IPV6));
        }
    });

    let mut sockets = SocketSet::new(Vec::new());
    let mut tcp_forwarder = TcpForwarder::default();
    let mut udp_forwarder = UdpForwarder::default();

    loop {
        if shutdown.is_closed() {
            break;
        }

        let now = smol_now(boot, StdInstant::now());

        tokio::select! {
            biased;

            packet = inbound_rx.recv() => {
                match packet {
                    Some(packet) => feed_packet(&mut device, &mut tcp_forwarder, &mut udp_forwarder, &mut sockets, packet),
                    None => break,
                }
            }
            packet = tun_rx.recv() => {
                match packet {
                    Some(packet) => feed_packet(&mut device, &mut tcp_forwarder, &mut udp_forwarder, &mut sockets, packet),
                    None => break,
                }
            }
            _ = tokio::time::sleep(MAX_POLL_INTERVAL) => {}
        }

        // Drain anything else already queued without waiting again, so a
        // burst of packets gets one poll() rather than one per packet.
        while let Ok(packet) = inbound_rx.try_recv() {
            feed_packet(&mut device, &mut tcp_forwarder, &mut udp_forwarder, &mut sockets, packet);
        }
        while let Ok(packet) = tun_rx.try_recv() {
            feed_packet(&mut device, &mut tcp_forwarder, &mut udp_forwarder, &mut sockets, packet);
        }

        iface.poll(now, &mut device, &mut sockets);

        {
            let tcp_handler = tcp_handler.clone();
            tcp_forwarder.drive(&mut iface, &mut sockets, |stream, metadata, closer| {
                let handler = tcp_handler.clone();
                tokio::spawn(async move {
                    if let Err(error) = handler(stream, metadata).await {
                        tracing::debug!(%error, ?metadata, "TCP handler returned an error, aborting");
                        closer.close();
                    }
                });
            });
        }

        {
            let udp_handler = udp_handler.clone();
            udp_forwarder.drive(&mut sockets, |metadata, reply_tx, deliver_rx| {
                let handler = udp_handler.clone();
                let flow = UdpFlow {
                    tx: reply_tx,
                    rx: deliver_rx,
                };
                tokio::spawn(async move {
                    if let Err(error) = handler(flow, metadata).await {
                        tracing::debug!(%error, ?metadata, "UDP handler returned an error");
                    }
                });
            });
        }

        while let Some(packet) = device.dequeue_outbound() {
            if tun_tx.send(packet).await.is_err() {
                return;
            }
        }
    }
}

fn feed_packet(
    device: &mut ChannelDevice,
    tcp_forwarder: &mut TcpForwarder,
    udp_forwarder: &mut UdpForwarder,
    sockets: &mut SocketSet<'static>,
    packet: IpPacket,
) {
    if let Some(transport) = packet.transport() {
        let destination = match transport {
            ip_packet::Transport::Tcp { dst, .. } => {
                Some((SocketAddr::new(packet.destination(), dst), true))
            }
            ip_packet::Transport::Udp { dst, .. } => {
                Some((SocketAddr::new(packet.destination(), dst), false))
            }
            _ => None,
        };

        if let Some((destination, is_tcp)) = destination {
            if is_tcp {
                tcp_forwarder.ensure_listening(sockets, destination);
            } else {
                udp_forwarder.ensure_bound(sockets, destination);
            }
        }
    }

    device.enqueue_inbound(packet);
}

fn smol_now(boot: StdInstant, now: StdInstant) -> smoltcp::time::Instant {
    let millis = now.duration_since(boot).as_millis();
    smoltcp::time::Instant::from_millis(millis as i64)
}

fn rand_seed() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    RandomState::new().build_hasher().finish()
}

// Small helpers so `update_ip_addrs`'s closure reads without repeating
// `smoltcp::wire::IpCidr::from` at every call site.
#[allow(non_snake_case)]
fn IpCidr4(cidr: Ipv4Cidr) -> smoltcp::wire::IpCidr {
    smoltcp::wire::IpCidr::Ipv4(cidr)
}

#[allow(non_snake_case)]
fn IpCidr6(cidr: Ipv6Cidr) -> smoltcp::wire::IpCidr {
    smoltcp::wire::IpCidr::Ipv6(cidr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_enable_both_families() {
        let options = StackOptions::default();
        assert!(options.enable_ipv4);
        assert!(options.enable_ipv6);
        assert_eq!(options.mtu, ip_packet::DEFAULT_MTU as usize);
    }
}
