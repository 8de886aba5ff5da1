//! TCP forwarder: arms one listening socket per destination the TUN has
//! surfaced, hands each accepted connection to a fresh task, and re-arms a
//! replacement listener immediately so the next simultaneous SYN to that
//! destination has somewhere to land.
//!
//! This is the smoltcp-shaped stand-in for a stack-wide "catch every SYN
//! regardless of destination port" protocol handler: smoltcp sockets must
//! each be bound to one concrete local endpoint, so the destination is
//! learned from the first packet seen for it rather than from a single
//! wildcard registration.

use crate::closer::OnceCloser;
use crate::flow::FlowMetadata;
use crate::stream::{channel_pair, FlowStream, FlowStreamHandle};
use smoltcp::iface::{Interface, SocketSet};
use smoltcp::socket::tcp;
use smoltcp::storage::RingBuffer;
use smoltcp::wire::IpEndpoint;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Receive and send buffer size used for every accepted socket. gVisor's
/// `{min=1, default=20480, max=20480}` range option has no equivalent in
/// smoltcp, whose sockets own one fixed-size ring buffer; we size it at the
/// range's default.
const TCP_BUFFER_SIZE: usize = 20480;
const KEEPALIVE: Duration = Duration::from_secs(15);

struct ActiveConnection {
    stack_side: FlowStreamHandle,
    closer: OnceCloser,
    dispatched: bool,
}

#[derive(Default)]
pub(crate) struct TcpForwarder {
    listeners: HashMap<SocketAddr, smoltcp::iface::SocketHandle>,
    active: HashMap<smoltcp::iface::SocketHandle, ActiveConnection>,
}

impl TcpForwarder {
    /// Arms a fresh listening socket for `destination` if one isn't already
    /// waiting there.
    pub(crate) fn ensure_listening(
        &mut self,
        sockets: &mut SocketSet<'static>,
        destination: SocketAddr,
    ) {
        if self.listeners.contains_key(&destination) {
            return;
        }

        let handle = sockets.add(new_listener(destination));
        self.listeners.insert(destination, handle);
    }

    /// Called once per poll after `Interface::poll` returned `true`. Walks
    /// every tracked socket, dispatches newly-established connections,
    /// pumps bytes for already-dispatched ones, and reclaims closed ones.
    pub(crate) fn drive(
        &mut self,
        iface: &mut Interface,
        sockets: &mut SocketSet<'static>,
        on_accept: impl Fn(FlowStream, FlowMetadata, OnceCloser),
    ) {
        let mut reap = Vec::new();

        for (destination, handle) in self.listeners.clone() {
            let socket = sockets.get_mut::<tcp::Socket>(handle);

            if matches!(socket.state(), tcp::State::Listen | tcp::State::SynReceived) {
                continue;
            }

            // The listener left `Listen` state: either it accepted a remote
            // (now `Established`) or it was reset before completing the
            // handshake. Either way, replace it so the destination keeps
            // accepting new connections.
            let local = socket.local_endpoint();
            let remote = socket.remote_endpoint();

            self.listeners.remove(&destination);
            let fresh_handle = sockets.add(new_listener(destination));
            self.listeners.insert(destination, fresh_handle);

            if let (Some(local), Some(remote)) = (local, remote) {
                let metadata = FlowMetadata {
                    source: endpoint_to_socket_addr(remote),
                    destination: endpoint_to_socket_addr(local),
                };
                let (user_side, stack_side) = channel_pair();
                let closer = OnceCloser::new();

                self.active.insert(
                    handle,
                    ActiveConnection {
                        stack_side,
                        closer: closer.clone(),
                        dispatched: true,
                    },
                );

                on_accept(user_side, metadata, closer);
            } else {
                reap.push(handle);
            }
        }

        for handle in reap {
            sockets.remove(handle);
        }

        self.pump_active(sockets);
        let _ = iface; // reserved: future retransmit/abort coordination hooks
    }

    fn pump_active(&mut self, sockets: &mut SocketSet<'static>) {
        let mut closed = Vec::new();

        for (&handle, conn) in self.active.iter_mut() {
            let socket = sockets.get_mut::<tcp::Socket>(handle);

            if !conn.dispatched {
                continue;
            }

            // Stack -> handler.
            while socket.can_recv() {
                let mut done = false;
                let _ = socket.recv(|data| {
                    if data.is_empty() {
                        done = true;
                        return (0, ());
                    }
                    if conn.stack_side.tx.send(data.to_vec()).is_err() {
                        conn.closer.close();
                    }
                    (data.len(), ())
                });
                if done {
                    break;
                }
            }

            // Handler -> stack.
            while socket.can_send() {
                match conn.stack_side.rx.try_recv() {
                    Ok(data) => {
                        if socket.send_slice(&data).is_err() {
                            conn.closer.close();
                            break;
                        }
                    }
                    Err(tokio::sync::mpsc::error::TryRecvError::Empty) => break,
                    Err(tokio::sync::mpsc::error::TryRecvError::Disconnected) => {
                        socket.close();
                        break;
                    }
                }
            }

            if conn.closer.is_closed() && !matches!(socket.state(), tcp::State::Closed) {
                socket.abort();
            }

            if matches!(socket.state(), tcp::State::Closed) {
                closed.push(handle);
            }
        }

        for handle in closed {
            self.active.remove(&handle);
            sockets.remove(handle);
        }
    }
}

fn new_listener(destination: SocketAddr) -> tcp::Socket<'static> {
    let mut socket = tcp::Socket::new(
        RingBuffer::new(vec![0u8; TCP_BUFFER_SIZE]),
        RingBuffer::new(vec![0u8; TCP_BUFFER_SIZE]),
    );
    socket.set_keep_alive(Some(KEEPALIVE.into()));
    socket
        .listen(IpEndpoint::from(destination))
        .expect("a fresh socket can always listen");

    socket
}

fn endpoint_to_socket_addr(endpoint: IpEndpoint) -> SocketAddr {
    SocketAddr::new(endpoint.addr.into(), endpoint.port)
}
