use crate::Error;

/// The outbound interface carrying the default route for a given address family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub interface_name: String,
    pub interface_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

#[cfg(target_os = "linux")]
pub async fn default_route(family: Family) -> Result<Route, Error> {
    crate::linux::default_route(family).await
}

#[cfg(not(target_os = "linux"))]
pub async fn default_route(_family: Family) -> Result<Route, Error> {
    Err(Error::PlatformUnsupported)
}

/// Blocking wrapper around [`default_route`] for callers outside an async context.
///
/// Spins up a dedicated single-threaded runtime for the duration of the call,
/// matching the TUN device's own pattern of keeping short-lived netlink work
/// off whatever runtime the caller happens to be on.
pub fn default_route_blocking(family: Family) -> Result<Route, Error> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build dedicated runtime for route resolution");

    rt.block_on(default_route(family))
}
