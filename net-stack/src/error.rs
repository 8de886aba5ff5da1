use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to create the userspace protocol stack: {0}")]
    StackCreationFailed(String),

    #[error("accepted endpoint had no local or remote address")]
    FlowSurfaceFailed,
}
