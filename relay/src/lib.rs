//! Handler-side relay helpers.
//!
//! The protocol stack only terminates flows and hands them to a handler;
//! what the handler does with a [`net_stack::FlowStream`] or
//! [`net_stack::UdpFlow`] is up to it. These two helpers cover the common
//! case: dial back out through a socket pinned to the original physical NIC
//! (see `socket-binder`) so the reply traffic doesn't loop back through the
//! TUN, then shuffle bytes between the two ends.

mod error;
mod tcp;
mod udp;

pub use error::Error;
pub use tcp::{dial_tcp, splice, tcp_handler};
pub use udp::{dial_udp, NatMap};

use std::net::SocketAddr;

fn family_str(addr: SocketAddr, stream: bool) -> &'static str {
    match (stream, addr) {
        (true, SocketAddr::V4(_)) => "tcp4",
        (true, SocketAddr::V6(_)) => "tcp6",
        (false, SocketAddr::V4(_)) => "udp4",
        (false, SocketAddr::V6(_)) => "udp6",
    }
}
