use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("interface index {0} not found")]
    IndexNotFound(u32),

    #[error("interface name {0:?} not found")]
    NameNotFound(String),

    #[error("no route")]
    NoRoute,

    #[error("platform not supported")]
    PlatformUnsupported,

    #[error("failed to enumerate interfaces: {0}")]
    Enumeration(#[source] anyhow::Error),
}
