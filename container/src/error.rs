use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("audit ack rejected: {0}")]
    AuditAck(String),

    #[error("observer registration failed: {0}")]
    Observer(String),
}
