//! UDP forwarder.
//!
//! One bound smoltcp socket per destination the TUN has surfaced (sockets
//! are connectionless, so a single bound socket safely serves every remote
//! sender for that destination). A distinct (source, destination) pair is
//! treated as its own flow, each dispatched to the handler exactly once, the
//! way the TCP forwarder treats each accepted connection as its own flow.

use crate::flow::FlowMetadata;
use smoltcp::iface::SocketSet;
use smoltcp::socket::udp;
use smoltcp::storage::PacketMetadata;
use smoltcp::wire::IpEndpoint;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::mpsc;

const UDP_BUFFER_SIZE: usize = 20480;
const UDP_METADATA_SLOTS: usize = 64;

struct Flow {
    to_handler: mpsc::UnboundedSender<Vec<u8>>,
    from_handler: mpsc::UnboundedReceiver<Vec<u8>>,
}

struct BoundSocket {
    handle: smoltcp::iface::SocketHandle,
    flows: HashMap<SocketAddr, Flow>,
}

#[derive(Default)]
pub(crate) struct UdpForwarder {
    bound: HashMap<SocketAddr, BoundSocket>,
}

impl UdpForwarder {
    pub(crate) fn ensure_bound(&mut self, sockets: &mut SocketSet<'static>, destination: SocketAddr) {
        if self.bound.contains_key(&destination) {
            return;
        }

        let mut socket = new_socket();
        socket
            .bind(IpEndpoint::from(destination))
            .expect("a fresh socket can always bind");

        let handle = sockets.add(socket);
        self.bound.insert(
            destination,
            BoundSocket {
                handle,
                flows: HashMap::new(),
            },
        );
    }

    /// Drains every bound socket: delivers inbound datagrams to existing
    /// flows (dispatching `on_flow` the first time a (source, destination)
    /// pair is seen), then flushes whatever the handlers queued for
    /// sending back out.
    pub(crate) fn drive(
        &mut self,
        sockets: &mut SocketSet<'static>,
        mut on_flow: impl FnMut(FlowMetadata, mpsc::UnboundedSender<Vec<u8>>, mpsc::UnboundedReceiver<Vec<u8>>),
    ) {
        for (&destination, bound) in self.bound.iter_mut() {
            let socket = sockets.get_mut::<udp::Socket>(bound.handle);

            while socket.can_recv() {
                let Ok((payload, meta)) = socket.recv() else {
                    break;
                };
                let source = SocketAddr::new(meta.endpoint.addr.into(), meta.endpoint.port);

                let flow = match bound.flows.get_mut(&source) {
                    Some(flow) => flow,
                    None => {
                        let (deliver_tx, deliver_rx) = mpsc::unbounded_channel();
                        let (reply_tx, reply_rx) = mpsc::unbounded_channel();

                        bound.flows.insert(
                            source,
                            Flow {
                                to_handler: deliver_tx,
                                from_handler: reply_rx,
                            },
                        );

                        on_flow(
                            FlowMetadata {
                                source,
                                destination,
                            },
                            reply_tx,
                            deliver_rx,
                        );

                        bound.flows.get_mut(&source).expect("just inserted")
                    }
                };

                let _ = flow.to_handler.send(payload.to_vec());
            }

            bound.flows.retain(|&source, flow| {
                let meta = udp::UdpMetadata::from(IpEndpoint::from(source));

                loop {
                    match flow.from_handler.try_recv() {
                        Ok(reply) => {
                            let _ = socket.send_slice(&reply, meta);
                        }
                        Err(mpsc::error::TryRecvError::Empty) => return true,
                        Err(mpsc::error::TryRecvError::Disconnected) => return false,
                    }
                }
            });
        }
    }
}

fn new_socket() -> udp::Socket<'static> {
    udp::Socket::new(
        udp::PacketBuffer::new(
            vec![PacketMetadata::EMPTY; UDP_METADATA_SLOTS],
            vec![0u8; UDP_BUFFER_SIZE],
        ),
        udp::PacketBuffer::new(
            vec![PacketMetadata::EMPTY; UDP_METADATA_SLOTS],
            vec![0u8; UDP_BUFFER_SIZE],
        ),
    )
}
