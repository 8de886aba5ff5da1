use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("platform not supported")]
    PlatformUnsupported,

    #[error("interface {0:?} not found")]
    InterfaceNotFound(String),

    #[error("failed to set socket option: {0}")]
    SocketOptionFailed(#[source] std::io::Error),
}
