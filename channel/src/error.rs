use crate::channel::ChannelPhase;
use thiserror::Error;
use warden_container::ContainerError;
use warden_core::WireError;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("{op} failed: {source}")]
    Resource {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid channel phase: expected {expected}, got {actual}")]
    InvalidPhase {
        expected: ChannelPhase,
        actual: ChannelPhase,
    },

    #[error("connectivity observer registration failed: {0}")]
    Observer(#[from] ContainerError),

    #[error("container has been dropped")]
    Detached,

    #[error("invalid config: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ChannelError {
    pub(crate) fn resource(op: &'static str, source: impl Into<std::io::Error>) -> Self {
        ChannelError::Resource {
            op,
            source: source.into(),
        }
    }
}

/// Why an outbound message did not reach the guest.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("guest is not connected")]
    NotConnected,

    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode failed: {0}")]
    Encode(#[from] WireError),
}
