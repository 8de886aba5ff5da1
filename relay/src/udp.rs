//! UDP NAT map: one device-pinned outbound socket per client source
//! address/port, torn down after 30s of silence.
//!
//! Mirrors the shape of a connection-tracking table a router keeps for
//! symmetric NAT: a reply is only ever handed back to the client if it came
//! from the remote the client itself talked to.

use crate::{family_str, Error};
use net_stack::FlowMetadata;
use socket2::{Domain, Socket, Type};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::time::Duration;

const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_DATAGRAM: usize = 65_535;

struct Entry {
    outbound: Arc<UdpSocket>,
}

/// A client-keyed table of device-pinned outbound UDP sockets.
///
/// `serve` is normally called once per flow the protocol stack surfaces;
/// sharing one [`NatMap`] across several calls lets concurrent flows from the
/// same client destination reuse a socket instead of opening one each time.
pub struct NatMap {
    interface: Arc<str>,
    entries: RwLock<HashMap<SocketAddr, Arc<Entry>>>,
}

impl NatMap {
    pub fn new(interface: impl Into<Arc<str>>) -> Self {
        Self {
            interface: interface.into(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Relays one accepted UDP flow: every datagram the stack delivers is
    /// sent to `metadata.destination` through this client's pinned outbound
    /// socket; replies from that same remote are sent back to the flow.
    /// Replies from anywhere else are dropped. The entry is torn down after
    /// 30 seconds with nothing to relay in either direction.
    pub async fn serve(&self, mut flow: net_stack::UdpFlow, metadata: FlowMetadata) -> Result<(), Error> {
        let entry = self.entry_for(metadata).await?;
        let mut reply_buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                biased;

                outgoing = tokio::time::timeout(IDLE_TIMEOUT, flow.recv()) => {
                    match outgoing {
                        Ok(Some(datagram)) => {
                            if let Err(error) = entry.outbound.send_to(&datagram, metadata.destination).await {
                                tracing::debug!(%error, %metadata.destination, "Failed to relay UDP datagram outbound");
                            }
                        }
                        Ok(None) => break,
                        Err(_elapsed) => break,
                    }
                }

                incoming = tokio::time::timeout(IDLE_TIMEOUT, entry.outbound.recv_from(&mut reply_buf)) => {
                    match incoming {
                        Ok(Ok((n, from))) => {
                            if from != metadata.destination {
                                tracing::trace!(%from, expected = %metadata.destination, "Dropping UDP reply from unlearned remote");
                                continue;
                            }
                            let _ = flow.send(reply_buf[..n].to_vec());
                        }
                        Ok(Err(error)) => {
                            tracing::debug!(%error, "UDP outbound socket read failed");
                            break;
                        }
                        Err(_elapsed) => break,
                    }
                }
            }
        }

        self.entries.write().await.remove(&metadata.source);

        Ok(())
    }

    async fn entry_for(&self, metadata: FlowMetadata) -> Result<Arc<Entry>, Error> {
        if let Some(entry) = self.entries.read().await.get(&metadata.source) {
            return Ok(entry.clone());
        }

        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(&metadata.source) {
            return Ok(entry.clone());
        }

        let outbound = Arc::new(dial_udp(&self.interface, metadata.destination).await?);
        let entry = Arc::new(Entry { outbound });
        entries.insert(metadata.source, entry.clone());

        Ok(entry)
    }
}

/// Opens an unconnected UDP socket pinned to `interface`, ready to exchange
/// datagrams with `destination`.
///
/// The pin hook is composed with `destination` rather than the (wildcard)
/// local bind address: this socket is never meant to serve more than the one
/// remote it was opened for, and passing the wildcard would make the
/// global-unicast gate in `socket-binder` treat the pin as a no-op.
pub async fn dial_udp(interface: &str, destination: SocketAddr) -> Result<UdpSocket, Error> {
    let interface = interface.to_owned();

    let std_socket = tokio::task::spawn_blocking(move || -> Result<std::net::UdpSocket, Error> {
        let domain = if destination.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::DGRAM, None).map_err(Error::SocketCreationFailed)?;
        let hook = socket_binder::bind_for_packet(&interface, None);
        hook(family_str(destination, false), destination, &socket)?;

        let local: SocketAddr = if destination.is_ipv4() {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        socket.bind(&local.into())?;

        Ok(socket.into())
    })
    .await
    .expect("dial_udp blocking task panicked")?;

    std_socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(std_socket)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn entry_lookup_is_double_checked() {
        // Exercises the read-then-write path without a real interface: two
        // concurrent lookups for an address that was never dial-able should
        // both surface the same dial error rather than panicking the lock.
        let map = NatMap::new("nonexistent-test-iface0");
        let metadata = FlowMetadata {
            source: "10.0.0.1:1234".parse().unwrap(),
            destination: "93.184.216.34:80".parse().unwrap(),
        };

        let first = map.entry_for(metadata).await;
        let second = map.entry_for(metadata).await;

        assert!(first.is_err());
        assert!(second.is_err());
    }
}
