//! Example driver: brings up a TUN device, routes selected prefixes into it,
//! and relays every TCP/UDP flow the stack terminates back out through the
//! host's original default-route interface (or one named explicitly),
//! avoiding the routing loop the TUN's own default route would otherwise
//! create.
//!
//! ```text
//! sudo tun-relay --addr 198.18.0.1/16
//! curl --interface tun0 https://example.com
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use ip_network::Ipv4Network;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

#[derive(Parser, Debug)]
#[command(name = "tun-relay", about = "Terminates TCP/UDP on a TUN device and relays flows out a physical NIC")]
struct Cli {
    /// TUN device name; a free `tunN` name is picked when omitted.
    #[arg(long = "name", default_value = "")]
    name: String,

    /// IPv4 CIDR address assigned to the TUN device.
    #[arg(long = "addr", default_value = "198.18.0.1/16")]
    addr: String,

    /// Force every relayed flow to this remote instead of its original destination.
    #[arg(long = "remote")]
    remote: Option<SocketAddr>,

    /// Physical interface outbound traffic is pinned to; the host's current
    /// default-route interface is used when omitted.
    #[arg(long = "outbound-iface")]
    outbound_iface: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();

    let outbound_iface = match cli.outbound_iface {
        Some(name) => name,
        None => {
            let route = iface::default_route(iface::Family::V4)
                .await
                .context("Failed to resolve the host's default route")?;
            route.interface_name
        }
    };

    tracing::info!(name = %cli.name, addr = %cli.addr, outbound_iface = %outbound_iface, "Starting TUN relay");

    let network: Ipv4Network = cli.addr.parse().context("Invalid TUN CIDR address")?;

    let tun_options = tun::Options {
        name: cli.name,
        inet4_address: vec![network],
        auto_route: true,
        ..tun::Options::default()
    };

    let tun = tun::Tun::new(tun_options)
        .await
        .context("Failed to provision TUN device")?;
    let tun_sender = tun.sender();

    let tcp_handler = match cli.remote {
        Some(remote) => fixed_destination_tcp_handler(outbound_iface.clone(), remote),
        None => relay::tcp_handler(outbound_iface.clone()),
    };
    let udp_nat = Arc::new(relay::NatMap::new(outbound_iface.clone()));
    let udp_handler = udp_handler(udp_nat);

    let stack_options = net_stack::StackOptions::default();
    let (tun_to_stack_tx, tun_to_stack_rx) = mpsc::channel(1024);
    let (stack_to_tun_tx, mut stack_to_tun_rx) = mpsc::channel(1024);

    let stack = net_stack::Stack::start(
        stack_options,
        (tun_to_stack_rx, stack_to_tun_tx),
        tcp_handler,
        udp_handler,
    )
    .context("Failed to start protocol stack")?;

    let writer = tokio::spawn(async move {
        while let Some(packet) = stack_to_tun_rx.recv().await {
            if let Err(error) = tun_sender.send(packet).await {
                tracing::warn!(%error, "Failed to write packet to TUN");
                break;
            }
        }
    });

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    let reader = tokio::spawn(async move {
        let mut tun = tun;

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown_rx => break,
                packet = tun.recv() => {
                    match packet {
                        Some(packet) => {
                            if tun_to_stack_tx.send(packet).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        if let Err(error) = tun.close().await {
            tracing::warn!(%error, "Failed to tear down TUN device cleanly");
        }
    });

    tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;
    tracing::info!("Shutting down");

    let _ = shutdown_tx.send(());
    let _ = reader.await;
    stack.close();
    let _ = writer.await;

    Ok(())
}

/// Builds a [`net_stack::TcpHandler`] that ignores each flow's original
/// destination and relays to `remote` instead, for quick manual testing.
fn fixed_destination_tcp_handler(interface: String, remote: SocketAddr) -> net_stack::TcpHandler {
    use futures::future::BoxFuture;
    use futures::FutureExt;

    Arc::new(
        move |flow: net_stack::FlowStream, metadata: net_stack::FlowMetadata| -> BoxFuture<'static, anyhow::Result<()>> {
            let interface = interface.clone();

            async move {
                tracing::debug!(?metadata, %remote, "Relaying TCP flow to forced remote");
                let outbound = relay::dial_tcp(&interface, remote).await?;
                relay::splice(flow, outbound).await?;
                Ok(())
            }
            .boxed()
        },
    )
}

fn udp_handler(nat: Arc<relay::NatMap>) -> net_stack::UdpHandler {
    use futures::future::BoxFuture;
    use futures::FutureExt;

    Arc::new(
        move |flow: net_stack::UdpFlow, metadata: net_stack::FlowMetadata| -> BoxFuture<'static, anyhow::Result<()>> {
            let nat = nat.clone();

            async move {
                tracing::debug!(?metadata, "Relaying UDP flow");
                nat.serve(flow, metadata).await?;
                Ok(())
            }
            .boxed()
        },
    )
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    // `netlink_proto` is noisy at anything below `warn`; a bare `RUST_LOG=debug`
    // would otherwise be unreadable.
    const QUIET_CRATES: &str = "netlink_proto=warn";

    let directives = std::env::var("RUST_LOG").unwrap_or_default();
    let filter = if directives.is_empty() {
        EnvFilter::new(QUIET_CRATES)
    } else {
        EnvFilter::new(format!("{QUIET_CRATES},{directives}"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
