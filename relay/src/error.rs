use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open outbound socket: {0}")]
    SocketCreationFailed(#[source] std::io::Error),

    #[error("failed to pin outbound socket to interface: {0}")]
    Bind(#[from] socket_binder::Error),

    #[error("failed to dial remote: {0}")]
    Connect(#[source] std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
