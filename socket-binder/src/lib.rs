//! Pins sockets to a specific host interface before they connect or bind, so
//! a handler's outbound traffic bypasses whatever default route the TUN has
//! stolen.

mod error;
mod platform;

pub use error::Error;

use socket2::Socket;
use std::net::SocketAddr;
use std::sync::Arc;

/// A pre-connect/pre-bind hook: given the socket family string (`tcp4`,
/// `udp6`, ...), the peer or bind address, and the raw socket, do whatever
/// platform-specific pinning is required.
pub type ControlHook = Arc<dyn Fn(&str, SocketAddr, &Socket) -> Result<(), Error> + Send + Sync>;

/// Builds a [`ControlHook`] that binds to `interface`, optionally chaining
/// onto an `existing` hook.
///
/// The existing hook, if any, always runs first; if it fails the new hook
/// never runs. This mirrors composing middleware onto a dialler rather than
/// replacing whatever the caller already configured.
pub fn bind_for_stream(interface: &str, existing: Option<ControlHook>) -> ControlHook {
    compose(existing, make_hook(interface.to_owned()))
}

/// Same composition as [`bind_for_stream`], for packet (UDP) listeners.
pub fn bind_for_packet(interface: &str, existing: Option<ControlHook>) -> ControlHook {
    compose(existing, make_hook(interface.to_owned()))
}

fn compose(existing: Option<ControlHook>, new_hook: ControlHook) -> ControlHook {
    match existing {
        None => new_hook,
        Some(existing) => Arc::new(move |network, addr, socket| {
            existing(network, addr, socket)?;
            new_hook(network, addr, socket)
        }),
    }
}

fn make_hook(interface: String) -> ControlHook {
    Arc::new(move |network, addr, socket| {
        if !is_global_unicast(addr.ip()) {
            return Ok(());
        }

        platform::bind_to_device(&interface, network, socket)
    })
}

fn is_global_unicast(addr: std::net::IpAddr) -> bool {
    use std::net::IpAddr;

    match addr {
        IpAddr::V4(v4) => {
            !(v4.is_loopback() || v4.is_link_local() || v4.is_multicast() || v4.is_unspecified())
        }
        IpAddr::V6(v6) => {
            let is_unicast_link_local = (v6.segments()[0] & 0xffc0) == 0xfe80;

            !(v6.is_loopback() || v6.is_multicast() || v6.is_unspecified() || is_unicast_link_local)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn global_unicast_classification() {
        assert!(is_global_unicast(std::net::IpAddr::V4(Ipv4Addr::new(
            93, 184, 216, 34
        ))));
        assert!(!is_global_unicast(std::net::IpAddr::V4(
            Ipv4Addr::LOCALHOST
        )));
        assert!(!is_global_unicast(std::net::IpAddr::V4(Ipv4Addr::new(
            169, 254, 1, 1
        ))));
        assert!(!is_global_unicast(std::net::IpAddr::V6(Ipv6Addr::UNSPECIFIED)));
        assert!(!is_global_unicast(std::net::IpAddr::V6(
            Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1)
        )));
    }

    #[test]
    fn chained_hook_stops_on_first_error() {
        let failing: ControlHook = Arc::new(|_, _, _| Err(Error::PlatformUnsupported));
        let never_runs = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let marker = never_runs.clone();

        let second: ControlHook = Arc::new(move |_, _, _| {
            marker.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        });

        let composed = compose(Some(failing), second);

        let socket = Socket::new(socket2::Domain::IPV4, socket2::Type::DGRAM, None).unwrap();
        let addr: SocketAddr = "93.184.216.34:80".parse().unwrap();

        assert!(composed("udp4", addr, &socket).is_err());
        assert!(!never_runs.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn loopback_target_is_a_no_op() {
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let marker = ran.clone();

        let hook = make_hook("lo".to_owned());
        let socket = Socket::new(socket2::Domain::IPV4, socket2::Type::DGRAM, None).unwrap();
        let addr: SocketAddr = "127.0.0.1:53".parse().unwrap();

        // loopback is never global-unicast, so the platform call never happens
        // and this succeeds even on a host without an interface named "lo".
        hook("udp4", addr, &socket).unwrap();

        let _ = marker;
        let _ = ran;
    }
}
