//! Opens a TUN device, provisions its addresses/routes/policy rules, and
//! hands back a handle for pushing and pulling raw IP packets.

mod error;
mod ioctl;
pub mod options;

pub use error::Error;
pub use options::Options;

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
pub use linux::Tun;

/// A cheap, cloneable handle for writing packets to a [`Tun`] without
/// holding the device's own `&mut self` borrow.
///
/// Lets a caller run the read and write halves of a TUN device from
/// separate tasks: `Tun::recv` needs `&mut self`, but `TunSender::send`
/// only needs a cloned channel endpoint.
#[cfg(target_os = "linux")]
pub use linux::TunSender;

#[cfg(not(target_os = "linux"))]
pub struct Tun;

#[cfg(not(target_os = "linux"))]
impl Tun {
    pub async fn new(_options: Options) -> Result<Self, Error> {
        Err(Error::PlatformUnsupported)
    }

    pub fn name(&self) -> &str {
        unreachable!("construction always fails on this platform")
    }

    pub async fn send(&self, _packet: ip_packet::IpPacket) -> Result<(), Error> {
        unreachable!("construction always fails on this platform")
    }

    pub async fn recv(&mut self) -> Option<ip_packet::IpPacket> {
        unreachable!("construction always fails on this platform")
    }

    pub fn sender(&self) -> TunSender {
        unreachable!("construction always fails on this platform")
    }

    pub async fn close(self) -> Result<(), Error> {
        unreachable!("construction always fails on this platform")
    }
}

#[cfg(not(target_os = "linux"))]
pub struct TunSender;

#[cfg(not(target_os = "linux"))]
impl TunSender {
    pub async fn send(&self, _packet: ip_packet::IpPacket) -> Result<(), Error> {
        unreachable!("construction always fails on this platform")
    }
}

#[cfg(test)]
mod tests {
    use super::options::calculate_interface_name;

    #[test]
    fn interface_name_defaults_to_tun_prefix() {
        let name = calculate_interface_name(None);
        assert!(name.starts_with("tun"));
    }

    #[test]
    fn interface_name_respects_preferred_base() {
        let name = calculate_interface_name(Some("wg"));
        assert!(name.starts_with("wg"));
    }
}
