//! A minimal representation of a raw IP packet as it travels between the TUN
//! device and the protocol stack.
//!
//! This deliberately does not attempt to be a general-purpose packet-building
//! library; it only exposes the handful of fields the rest of the workspace
//! needs to read (addresses, protocol, ports) plus a reusable receive buffer.

use anyhow::{Context as _, Result, bail};
use etherparse::{IpNumber, Ipv4HeaderSlice, Ipv6HeaderSlice, TcpHeaderSlice, UdpHeaderSlice};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// The MTU we hand to the TUN device and size our buffers around.
///
/// 9000 matches the "jumbo frame" default called out for this stack; hosts
/// that reject it fall back transparently because `set_mtu` treats
/// permission failures as non-fatal.
pub const DEFAULT_MTU: u32 = 9000;

/// Upper bound on any single IP packet we will ever read or write.
pub const MAX_IP_SIZE: usize = 9000;

/// A fixed-capacity buffer used to read one packet off the TUN device.
#[derive(Debug)]
pub struct IpPacketBuf {
    inner: [u8; MAX_IP_SIZE],
}

impl Default for IpPacketBuf {
    fn default() -> Self {
        Self {
            inner: [0u8; MAX_IP_SIZE],
        }
    }
}

impl IpPacketBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buf(&mut self) -> &mut [u8] {
        &mut self.inner
    }
}

/// A validated IP packet, either borrowed from an [`IpPacketBuf`] or owned.
#[derive(Debug, Clone)]
pub struct IpPacket {
    buf: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp { src: u16, dst: u16 },
    Udp { src: u16, dst: u16 },
    Icmp,
    Other(u8),
}

impl IpPacket {
    /// Copies `len` bytes out of `buf` and validates that they form an IPv4 or IPv6 packet.
    pub fn new(mut buf: IpPacketBuf, len: usize) -> Result<Self> {
        anyhow::ensure!(len <= MAX_IP_SIZE, "packet exceeds MAX_IP_SIZE");

        let packet = Self {
            buf: buf.buf()[..len].to_vec(),
        };
        packet.validate()?;

        Ok(packet)
    }

    /// Wraps an already-assembled buffer (e.g. one built for transmission) without copying.
    pub fn from_vec(buf: Vec<u8>) -> Result<Self> {
        let packet = Self { buf };
        packet.validate()?;
        Ok(packet)
    }

    fn validate(&self) -> Result<()> {
        match self.version() {
            Some(4) => {
                Ipv4HeaderSlice::from_slice(&self.buf).context("invalid IPv4 header")?;
            }
            Some(6) => {
                Ipv6HeaderSlice::from_slice(&self.buf).context("invalid IPv6 header")?;
            }
            _ => bail!("not an IP packet"),
        }

        Ok(())
    }

    pub fn packet(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    fn version(&self) -> Option<u8> {
        self.buf.first().map(|b| b >> 4)
    }

    pub fn source(&self) -> IpAddr {
        match self.version() {
            Some(4) => IpAddr::V4(Ipv4Addr::from(
                Ipv4HeaderSlice::from_slice(&self.buf)
                    .expect("validated on construction")
                    .source(),
            )),
            _ => IpAddr::V6(Ipv6Addr::from(
                Ipv6HeaderSlice::from_slice(&self.buf)
                    .expect("validated on construction")
                    .source(),
            )),
        }
    }

    pub fn destination(&self) -> IpAddr {
        match self.version() {
            Some(4) => IpAddr::V4(Ipv4Addr::from(
                Ipv4HeaderSlice::from_slice(&self.buf)
                    .expect("validated on construction")
                    .destination(),
            )),
            _ => IpAddr::V6(Ipv6Addr::from(
                Ipv6HeaderSlice::from_slice(&self.buf)
                    .expect("validated on construction")
                    .destination(),
            )),
        }
    }

    fn protocol_and_payload(&self) -> (IpNumber, &[u8]) {
        match self.version() {
            Some(4) => {
                let header =
                    Ipv4HeaderSlice::from_slice(&self.buf).expect("validated on construction");
                let start = header.slice().len();
                (header.protocol(), &self.buf[start..])
            }
            _ => {
                let header =
                    Ipv6HeaderSlice::from_slice(&self.buf).expect("validated on construction");
                let start = header.slice().len();
                (header.next_header(), &self.buf[start..])
            }
        }
    }

    /// Parses the transport-layer header, if any is recognised.
    pub fn transport(&self) -> Option<Transport> {
        let (protocol, payload) = self.protocol_and_payload();

        match protocol {
            IpNumber::TCP => {
                let tcp = TcpHeaderSlice::from_slice(payload).ok()?;
                Some(Transport::Tcp {
                    src: tcp.source_port(),
                    dst: tcp.destination_port(),
                })
            }
            IpNumber::UDP => {
                let udp = UdpHeaderSlice::from_slice(payload).ok()?;
                Some(Transport::Udp {
                    src: udp.source_port(),
                    dst: udp.destination_port(),
                })
            }
            IpNumber::ICMP | IpNumber::IPV6_ICMP => Some(Transport::Icmp),
            other => Some(Transport::Other(other.0)),
        }
    }

    /// The UDP payload, if this is a UDP packet.
    pub fn udp_payload(&self) -> Option<&[u8]> {
        let (protocol, payload) = self.protocol_and_payload();

        if !matches!(protocol, IpNumber::UDP) {
            return None;
        }

        let udp = UdpHeaderSlice::from_slice(payload).ok()?;
        let header_len = udp.slice().len();

        payload.get(header_len..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_udp_packet() -> Vec<u8> {
        let builder = etherparse::PacketBuilder::ipv4([10, 0, 0, 1], [10, 0, 0, 2], 64)
            .udp(4242, 53);
        let payload = b"hello";
        let mut buf = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut buf, payload).unwrap();
        buf
    }

    #[test]
    fn parses_udp_ports_and_payload() {
        let packet = IpPacket::from_vec(raw_udp_packet()).unwrap();

        assert_eq!(
            packet.transport(),
            Some(Transport::Udp { src: 4242, dst: 53 })
        );
        assert_eq!(packet.udp_payload(), Some(&b"hello"[..]));
        assert_eq!(packet.source(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(
            packet.destination(),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))
        );
    }

    #[test]
    fn rejects_non_ip_buffer() {
        let buf = vec![0xFFu8; 40];
        assert!(IpPacket::from_vec(buf).is_err());
    }
}
