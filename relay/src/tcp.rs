//! TCP splice: dial the original destination back out through a device-pinned
//! socket, then copy bytes in both directions until either side is done.

use crate::{family_str, Error};
use futures::future::BoxFuture;
use futures::FutureExt;
use net_stack::{FlowMetadata, FlowStream, TcpHandler};
use socket2::{Domain, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// Dials `destination`, pinning the socket to `interface` before connecting.
///
/// The blocking `connect(2)` call (and the `setsockopt` the pin hook makes)
/// run on a blocking-pool thread; only the handshake itself is awaited from
/// async code.
pub async fn dial_tcp(interface: &str, destination: SocketAddr) -> Result<TcpStream, Error> {
    let interface = interface.to_owned();

    let std_stream = tokio::task::spawn_blocking(move || -> Result<std::net::TcpStream, Error> {
        let domain = if destination.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::STREAM, None).map_err(Error::SocketCreationFailed)?;
        let hook = socket_binder::bind_for_stream(&interface, None);
        hook(family_str(destination, true), destination, &socket)?;

        socket.connect(&destination.into()).map_err(Error::Connect)?;

        Ok(socket.into())
    })
    .await
    .expect("dial_tcp blocking task panicked")?;

    std_stream.set_nonblocking(true)?;
    Ok(TcpStream::from_std(std_stream)?)
}

/// Copies bytes in both directions between `flow` and `outbound` until
/// either side hits EOF or an error; the other side is then shut down too.
pub async fn splice(mut flow: FlowStream, mut outbound: TcpStream) -> Result<(u64, u64), Error> {
    let result = tokio::io::copy_bidirectional(&mut flow, &mut outbound).await;

    let _ = flow.shutdown().await;
    let _ = outbound.shutdown().await;

    Ok(result?)
}

/// Builds a [`TcpHandler`] that relays every accepted connection out through
/// `interface`, pinned so it bypasses the TUN's stolen default route.
pub fn tcp_handler(interface: impl Into<Arc<str>>) -> TcpHandler {
    let interface = interface.into();

    Arc::new(move |flow: FlowStream, metadata: FlowMetadata| -> BoxFuture<'static, anyhow::Result<()>> {
        let interface = interface.clone();

        async move {
            let outbound = dial_tcp(&interface, metadata.destination).await?;
            splice(flow, outbound).await?;
            Ok(())
        }
        .boxed()
    })
}
