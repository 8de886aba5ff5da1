use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid IP address: {0}")]
    InvalidIpAddr(String),

    #[error("platform not supported")]
    PlatformUnsupported,

    #[error("permission denied: {0}")]
    PermissionDenied(#[source] std::io::Error),

    #[error("failed to provision TUN device: {0}")]
    DeviceProvisioningFailed(#[source] anyhow::Error),
}
