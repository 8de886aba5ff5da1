//! A [`smoltcp::phy::Device`] entirely backed by in-memory queues.
//!
//! Packets are fed in by the stack's poll loop right before calling
//! [`smoltcp::iface::Interface::poll`] and drained right after; there is no
//! direct coupling to the TUN file descriptor here, only to the channel that
//! carries already-parsed [`IpPacket`]s.

use ip_packet::{IpPacket, IpPacketBuf};
use smoltcp::phy::{Device, DeviceCapabilities, Medium};
use smoltcp::time::Instant;
use std::collections::VecDeque;

#[derive(Default)]
pub(crate) struct ChannelDevice {
    inbound: VecDeque<IpPacket>,
    outbound: VecDeque<IpPacket>,
    mtu: usize,
}

impl ChannelDevice {
    pub(crate) fn new(mtu: usize) -> Self {
        Self {
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
            mtu,
        }
    }

    pub(crate) fn enqueue_inbound(&mut self, packet: IpPacket) {
        self.inbound.push_back(packet);
    }

    pub(crate) fn dequeue_outbound(&mut self) -> Option<IpPacket> {
        self.outbound.pop_front()
    }
}

impl Device for ChannelDevice {
    type RxToken<'a> = RxToken;
    type TxToken<'a> = TxToken<'a>;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let packet = self.inbound.pop_front()?;

        Some((
            RxToken { buf: packet.into_vec() },
            TxToken { outbound: &mut self.outbound },
        ))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(TxToken { outbound: &mut self.outbound })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;

        caps
    }
}

pub(crate) struct RxToken {
    buf: Vec<u8>,
}

impl smoltcp::phy::RxToken for RxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.buf)
    }
}

pub(crate) struct TxToken<'a> {
    outbound: &'a mut VecDeque<IpPacket>,
}

impl<'a> smoltcp::phy::TxToken for TxToken<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buf = IpPacketBuf::new();
        let result = f(&mut buf.buf()[..len]);

        match IpPacket::new(buf, len) {
            Ok(packet) => self.outbound.push_back(packet),
            Err(error) => tracing::debug!(%error, "Dropping outbound packet smoltcp produced"),
        }

        result
    }
}
