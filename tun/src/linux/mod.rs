mod checksum;
mod rules;

use crate::ioctl;
use crate::options::Options;
use crate::Error;
use anyhow::{Context as _, Result};
use futures::TryStreamExt;
use ip_network::{Ipv4Network, Ipv6Network};
use ip_packet::{IpPacket, IpPacketBuf};
use netlink_packet_route::route::{RouteMessage, RouteProtocol, RouteScope};
use rtnetlink::{Handle, LinkUnspec, RouteMessageBuilder};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsRawFd, RawFd};
use tokio::sync::mpsc;

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

/// A provisioned Linux TUN device: raw packet I/O plus the routing state
/// (addresses, routes, policy rules) that steer selected traffic into it.
pub struct Tun {
    name: String,
    fd: RawFd,
    table_index: u32,
    auto_route: bool,
    inet4_address: Vec<Ipv4Network>,
    inet6_address: Vec<Ipv6Network>,
    rules: rules::InstalledRules,
    outbound_tx: mpsc::Sender<IpPacket>,
    inbound_rx: mpsc::Receiver<IpPacket>,
    vectored: vectored_io::SyscallVectoredWriter,
    _send_thread: std::thread::JoinHandle<()>,
    _recv_thread: std::thread::JoinHandle<()>,
}

impl Tun {
    pub async fn new(mut options: Options) -> Result<Self, Error> {
        options = options.with_defaults();

        let fd = open(&options.name).map_err(permission_or_provisioning)?;

        let (connection, handle, _) = rtnetlink::new_connection()
            .context("Failed to open netlink connection")
            .map_err(Error::DeviceProvisioningFailed)?;
        tokio::spawn(connection);

        let index = link_index(&handle, &options.name)
            .await
            .map_err(Error::DeviceProvisioningFailed)?;

        if let Err(e) = configure(&handle, index, &mut options).await {
            // Best-effort unwind; nothing actionable if this also fails.
            let _ = unset_routes(&handle, index, &options).await;
            return Err(Error::DeviceProvisioningFailed(e));
        }

        let installed_rules = rules::install(&handle, &options)
            .await
            .map_err(Error::DeviceProvisioningFailed)?;

        spawn_search_domain_config(&options);

        let vectored = vectored_io::for_raw_fd(fd)
            .map_err(|e| Error::DeviceProvisioningFailed(anyhow::Error::new(e)))?;

        let (outbound_tx, outbound_rx) = mpsc::channel(1024);
        let (inbound_tx, inbound_rx) = mpsc::channel(1024);

        let send_thread = std::thread::spawn(move || tun_send(fd, outbound_rx));
        let recv_thread = std::thread::spawn(move || tun_recv(fd, inbound_tx));

        Ok(Self {
            name: options.name,
            fd,
            table_index: options.table_index,
            auto_route: options.auto_route,
            inet4_address: options.inet4_address,
            inet6_address: options.inet6_address,
            rules: installed_rules,
            outbound_tx,
            inbound_rx,
            vectored,
            _send_thread: send_thread,
            _recv_thread: recv_thread,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn send(&self, packet: IpPacket) -> Result<(), Error> {
        self.outbound_tx
            .send(packet)
            .await
            .map_err(|_| Error::DeviceProvisioningFailed(anyhow::anyhow!("TUN send task gone")))
    }

    /// A cheap, cloneable write handle: lets a caller drive the read half of
    /// this device with `&mut self` in one task while writing from another.
    pub fn sender(&self) -> TunSender {
        TunSender {
            outbound_tx: self.outbound_tx.clone(),
        }
    }

    pub async fn recv(&mut self) -> Option<IpPacket> {
        self.inbound_rx.recv().await
    }

    /// Writes several packets in a single `writev` call.
    pub async fn write_vectored(&self, packets: &[IpPacket]) -> std::io::Result<()> {
        let slices: Vec<&[u8]> = packets.iter().map(|p| p.packet()).collect();
        self.vectored.write_vectored(&slices).await
    }

    pub async fn close(self) -> Result<(), Error> {
        let (connection, handle, _) = rtnetlink::new_connection()
            .context("Failed to open netlink connection")
            .map_err(Error::DeviceProvisioningFailed)?;
        tokio::spawn(connection);

        if let Ok(index) = link_index(&handle, &self.name).await {
            let options = Options {
                name: self.name.clone(),
                table_index: self.table_index,
                auto_route: self.auto_route,
                inet4_address: self.inet4_address.clone(),
                inet6_address: self.inet6_address.clone(),
                ..Options::default()
            };
            let _ = unset_routes(&handle, index, &options).await;
        }

        rules::uninstall(&handle, &self.rules).await;

        // SAFETY: `fd` was opened by this struct and nothing else holds it.
        unsafe {
            libc::close(self.fd);
        }

        Ok(())
    }
}

/// A cloned outbound channel endpoint, independent of the device's own
/// borrow so it can be held by a task that never touches `recv`.
#[derive(Clone)]
pub struct TunSender {
    outbound_tx: mpsc::Sender<IpPacket>,
}

impl TunSender {
    pub async fn send(&self, packet: IpPacket) -> Result<(), Error> {
        self.outbound_tx
            .send(packet)
            .await
            .map_err(|_| Error::DeviceProvisioningFailed(anyhow::anyhow!("TUN send task gone")))
    }
}

fn permission_or_provisioning(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        Error::PermissionDenied(e)
    } else {
        Error::DeviceProvisioningFailed(e.into())
    }
}

fn open(name: &str) -> std::io::Result<RawFd> {
    // SAFETY: "/dev/net/tun" is a static, NUL-terminated C string.
    let fd = unsafe { libc::open(c"/dev/net/tun".as_ptr(), libc::O_RDWR) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }

    let mut req = ioctl::Request::new_tun(name);

    // SAFETY: `fd` was just opened and `req` is a valid, live request.
    if let Err(e) = unsafe { ioctl::exec(fd, TUNSETIFF, &mut req) } {
        unsafe { libc::close(fd) };
        return Err(e);
    }

    set_non_blocking(fd)?;

    Ok(fd)
}

fn set_non_blocking(fd: RawFd) -> std::io::Result<()> {
    // SAFETY: `fd` is open for the duration of this call.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }

    // SAFETY: same as above.
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }

    Ok(())
}

async fn link_index(handle: &Handle, name: &str) -> Result<u32> {
    let link = handle
        .link()
        .get()
        .match_name(name.to_owned())
        .execute()
        .try_next()
        .await
        .context("Failed to query TUN link")?
        .context("TUN interface not found after creation")?;

    Ok(link.header.index)
}

async fn configure(handle: &Handle, index: u32, options: &mut Options) -> Result<()> {
    match handle
        .link()
        .set(LinkUnspec::new_with_index(index).mtu(options.mtu).build())
        .execute()
        .await
    {
        Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::EPERM => {
            // Unprivileged; the Go original treats this as non-fatal.
        }
        other => other.context("Failed to set MTU")?,
    }

    for network in &options.inet4_address {
        handle
            .address()
            .add(
                index,
                network.network_address().into(),
                network.netmask(),
            )
            .execute()
            .await
            .context("Failed to add IPv4 address")?;
    }

    for network in &options.inet6_address {
        handle
            .address()
            .add(
                index,
                network.network_address().into(),
                network.netmask(),
            )
            .execute()
            .await
            .context("Failed to add IPv6 address")?;
    }

    {
        let ctl_fd = control_socket()?;
        if let Ok(false) = checksum::rx_checksum_offload_enabled(ctl_fd, &options.name) {
            let _ = checksum::disable_rx_checksum_offload(ctl_fd, &options.name);
        }
        // SAFETY: `ctl_fd` was just opened above and is not used after this.
        unsafe { libc::close(ctl_fd) };
    }

    handle
        .link()
        .set(LinkUnspec::new_with_index(index).up().build())
        .execute()
        .await
        .context("Failed to bring link up")?;

    if options.table_index == 0 {
        options.table_index = allocate_free_table(handle).await?;
    }

    set_routes(handle, index, options).await?;

    Ok(())
}

fn control_socket() -> Result<RawFd> {
    // SAFETY: a plain datagram socket used only for ioctl addressing.
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(fd)
}

async fn allocate_free_table(handle: &Handle) -> Result<u32> {
    let v4_routes = handle
        .route()
        .get(RouteMessageBuilder::<Ipv4Addr>::new().build())
        .execute()
        .try_collect::<Vec<_>>()
        .await
        .context("Failed to list IPv4 routes while allocating a table id")?;

    let v6_routes = handle
        .route()
        .get(RouteMessageBuilder::<Ipv6Addr>::new().build())
        .execute()
        .try_collect::<Vec<_>>()
        .await
        .context("Failed to list IPv6 routes while allocating a table id")?;

    let used: std::collections::HashSet<u32> = v4_routes
        .iter()
        .chain(v6_routes.iter())
        .map(table_id)
        .collect();

    loop {
        let candidate = rand::random::<u32>().max(1);
        if !used.contains(&candidate) {
            return Ok(candidate);
        }
    }
}

fn table_id(message: &RouteMessage) -> u32 {
    message.header.table as u32
}

fn auto_route_ranges(options: &Options) -> (Vec<Ipv4Network>, Vec<Ipv6Network>) {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();

    if !options.inet4_address.is_empty() {
        v4.push(Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0).expect("0.0.0.0/0 is always valid"));
    }
    if !options.inet6_address.is_empty() {
        v6.push(Ipv6Network::new(Ipv6Addr::UNSPECIFIED, 0).expect("::/0 is always valid"));
    }

    (v4, v6)
}

async fn set_routes(handle: &Handle, index: u32, options: &Options) -> Result<()> {
    if !options.auto_route {
        return Ok(());
    }

    let (v4, v6) = auto_route_ranges(options);

    for network in v4 {
        let message = RouteMessageBuilder::<Ipv4Addr>::new()
            .output_interface(index)
            .protocol(RouteProtocol::Static)
            .scope(RouteScope::Universe)
            .table_id(options.table_index)
            .destination_prefix(network.network_address(), network.netmask())
            .build();

        match handle.route().add(message).execute().await {
            Ok(()) => {}
            Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::EEXIST => {}
            Err(e) => return Err(e).context("Failed to add IPv4 auto-route"),
        }
    }

    for network in v6 {
        let message = RouteMessageBuilder::<Ipv6Addr>::new()
            .output_interface(index)
            .protocol(RouteProtocol::Static)
            .scope(RouteScope::Universe)
            .table_id(options.table_index)
            .destination_prefix(network.network_address(), network.netmask())
            .build();

        match handle.route().add(message).execute().await {
            Ok(()) => {}
            Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::EEXIST => {}
            Err(e) => return Err(e).context("Failed to add IPv6 auto-route"),
        }
    }

    Ok(())
}

async fn unset_routes(handle: &Handle, index: u32, options: &Options) -> Result<()> {
    let (v4, v6) = auto_route_ranges(options);

    for network in v4 {
        let message = RouteMessageBuilder::<Ipv4Addr>::new()
            .output_interface(index)
            .table_id(options.table_index)
            .destination_prefix(network.network_address(), network.netmask())
            .build();
        let _ = handle.route().del(message).execute().await;
    }

    for network in v6 {
        let message = RouteMessageBuilder::<Ipv6Addr>::new()
            .output_interface(index)
            .table_id(options.table_index)
            .destination_prefix(network.network_address(), network.netmask())
            .build();
        let _ = handle.route().del(message).execute().await;
    }

    Ok(())
}

/// Best-effort `resolvectl` configuration, fired off and never awaited; the
/// caller has no way to observe whether it succeeded.
fn spawn_search_domain_config(options: &Options) {
    if which_resolvectl().is_none() {
        return;
    }

    let name = options.name.clone();
    // Mirrors the Go original: the DNS server handed to `resolvectl` is one
    // address past the interface's own, not the network address itself.
    let dns_servers: Vec<String> = options
        .inet4_address
        .first()
        .map(|n| next_addr_v4(n.network_address()).to_string())
        .into_iter()
        .chain(
            options
                .inet6_address
                .first()
                .map(|n| next_addr_v6(n.network_address()).to_string()),
        )
        .collect();

    if dns_servers.is_empty() {
        return;
    }

    tokio::spawn(async move {
        let _ = tokio::process::Command::new("resolvectl")
            .args(["domain", &name, "~."])
            .status()
            .await;
        let _ = tokio::process::Command::new("resolvectl")
            .args(["default-route", &name, "true"])
            .status()
            .await;
        let mut args = vec!["dns".to_owned(), name];
        args.extend(dns_servers);
        let _ = tokio::process::Command::new("resolvectl")
            .args(args)
            .status()
            .await;
    });
}

fn next_addr_v4(addr: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(addr).wrapping_add(1))
}

fn next_addr_v6(addr: Ipv6Addr) -> Ipv6Addr {
    Ipv6Addr::from(u128::from(addr).wrapping_add(1))
}

fn which_resolvectl() -> Option<()> {
    std::env::var_os("PATH")?
        .to_str()?
        .split(':')
        .map(std::path::Path::new)
        .any(|dir| dir.join("resolvectl").exists())
        .then_some(())
}

/// A raw fd handle, `Copy` so the send/recv threads can each own one without
/// taking the fd's lifetime from the `Tun` struct.
#[derive(Clone, Copy)]
struct BorrowedFd(RawFd);

impl AsRawFd for BorrowedFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

fn tun_send(fd: RawFd, mut outbound_rx: mpsc::Receiver<IpPacket>) {
    let Ok(rt) = tokio::runtime::Builder::new_current_thread().enable_all().build() else {
        tracing::error!("Failed to build TUN send runtime");
        return;
    };

    let result = rt.block_on(async move {
        let async_fd = tokio::io::unix::AsyncFd::with_interest(
            BorrowedFd(fd),
            tokio::io::Interest::WRITABLE,
        )?;

        while let Some(packet) = outbound_rx.recv().await {
            if let Err(e) = async_fd
                .async_io(tokio::io::Interest::WRITABLE, |fd| {
                    let bytes = packet.packet();
                    // SAFETY: `fd` is valid and `bytes` outlives the call.
                    let n = unsafe {
                        libc::write(fd.as_raw_fd(), bytes.as_ptr() as *const _, bytes.len())
                    };
                    if n < 0 {
                        Err(std::io::Error::last_os_error())
                    } else {
                        Ok(n as usize)
                    }
                })
                .await
            {
                tracing::warn!("Failed to write to TUN fd: {e}");
            }
        }

        std::io::Result::Ok(())
    });

    if let Err(e) = result {
        tracing::error!("TUN send task exited: {e}");
    }
}

fn tun_recv(fd: RawFd, inbound_tx: mpsc::Sender<IpPacket>) {
    let Ok(rt) = tokio::runtime::Builder::new_current_thread().enable_all().build() else {
        tracing::error!("Failed to build TUN recv runtime");
        return;
    };

    let result = rt.block_on(async move {
        let async_fd = tokio::io::unix::AsyncFd::with_interest(
            BorrowedFd(fd),
            tokio::io::Interest::READABLE,
        )?;

        loop {
            let next_inbound_packet = async_fd
                .async_io(tokio::io::Interest::READABLE, |fd| {
                    let mut buf = IpPacketBuf::new();
                    // SAFETY: `fd` is valid and `buf` has `MAX_IP_SIZE` capacity.
                    let n = unsafe {
                        libc::read(
                            fd.as_raw_fd(),
                            buf.buf().as_mut_ptr() as *mut _,
                            buf.buf().len(),
                        )
                    };
                    if n < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    if n == 0 {
                        return Ok(None);
                    }

                    IpPacket::new(buf, n as usize)
                        .map(Some)
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
                })
                .await;

            match next_inbound_packet {
                Ok(None) => {
                    tracing::debug!("TUN fd closed");
                    break;
                }
                Ok(Some(packet)) => {
                    if inbound_tx.send(packet).await.is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                    tracing::debug!("Dropping malformed packet from TUN: {e:#}");
                }
                Err(e) => tracing::warn!("Failed to read from TUN fd: {e}"),
            }
        }

        std::io::Result::Ok(())
    });

    if let Err(e) = result {
        tracing::error!("TUN recv task exited: {e}");
    }
}
