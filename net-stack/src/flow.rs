use std::net::SocketAddr;

/// Addresses captured at the moment a forwarder accepts a new TCP segment or
/// UDP datagram from the stack.
///
/// `source` is the original remote peer (the party whose packet entered the
/// TUN); `destination` is the original local target the peer tried to reach.
/// Neither is mutated after capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowMetadata {
    pub source: SocketAddr,
    pub destination: SocketAddr,
}
