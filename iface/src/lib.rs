//! Host interface discovery: a read-mostly registry of NICs, address
//! selection helpers, and default-route resolution.

mod error;
#[cfg(target_os = "linux")]
mod linux;
mod registry;
mod route;

pub use error::Error;
pub use registry::{pick_ipv4_addr, pick_ipv6_addr, Interface, Registry};
pub use route::{default_route, default_route_blocking, Family, Route};

use ipnet::IpNet;
use std::sync::OnceLock;

static GLOBAL: OnceLock<Registry> = OnceLock::new();

/// The process-wide interface registry, lazily populated on first access.
pub fn global() -> &'static Registry {
    let registry = GLOBAL.get_or_init(Registry::new);

    if registry.all_names().is_empty() {
        let _ = flush_blocking(registry);
    }

    registry
}

/// Re-enumerates the host and atomically swaps the registry's snapshot.
pub async fn flush(registry: &Registry) -> Result<(), Error> {
    #[cfg(target_os = "linux")]
    {
        let fresh = linux::enumerate().await?;
        registry.replace(fresh);
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = registry;
        Err(Error::PlatformUnsupported)
    }
}

fn flush_blocking(registry: &Registry) -> Result<(), Error> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build dedicated runtime for interface enumeration");

    rt.block_on(flush(registry))
}

/// The routing-table platform a [`Tun`](https://docs.rs/tun) device is being provisioned for.
///
/// Only used to pick the right auto-route prefix decomposition; see
/// [`build_auto_route_ranges`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingPlatform {
    Linux,
    MacOsClass,
}

/// Builds the set of prefixes that should be routed through the TUN when the
/// caller asked for "route everything" without specifying prefixes explicitly.
///
/// On Linux a single catch-all per family is fine. On macOS-class kernels,
/// installing a literal `0.0.0.0/0` on a point-to-point interface is
/// rejected, so the default is decomposed into eight non-overlapping halves
/// per family instead. This table is correctness-critical and must stay
/// literal rather than computed.
pub fn build_auto_route_ranges(platform: RoutingPlatform) -> Vec<IpNet> {
    match platform {
        RoutingPlatform::Linux => vec!["0.0.0.0/0".parse().unwrap(), "::/0".parse().unwrap()],
        RoutingPlatform::MacOsClass => {
            const V4: &[&str] = &[
                "1.0.0.0/8",
                "2.0.0.0/7",
                "4.0.0.0/6",
                "8.0.0.0/5",
                "16.0.0.0/4",
                "32.0.0.0/3",
                "64.0.0.0/2",
                "128.0.0.0/1",
            ];
            const V6: &[&str] = &[
                "100::/8",
                "200::/7",
                "400::/6",
                "800::/5",
                "1000::/4",
                "2000::/3",
                "4000::/2",
                "8000::/1",
            ];

            V4.iter()
                .chain(V6)
                .map(|s| s.parse().unwrap())
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linux_auto_routes_are_single_catch_all() {
        let ranges = build_auto_route_ranges(RoutingPlatform::Linux);

        assert_eq!(ranges, vec!["0.0.0.0/0".parse().unwrap(), "::/0".parse::<IpNet>().unwrap()]);
    }

    #[test]
    fn macos_auto_routes_decompose_v4_into_eight_prefixes() {
        let ranges = build_auto_route_ranges(RoutingPlatform::MacOsClass);

        let v4: Vec<_> = ranges.iter().filter(|p| matches!(p, IpNet::V4(_))).collect();

        assert_eq!(v4.len(), 8);
        assert_eq!(v4[0], &"1.0.0.0/8".parse::<IpNet>().unwrap());
        assert_eq!(v4[7], &"128.0.0.0/1".parse::<IpNet>().unwrap());
    }
}
