use thiserror::Error;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    #[error("truncated frame: {buffered} bytes buffered, {expected} expected")]
    Truncated { buffered: usize, expected: usize },

    #[error("encode error: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid enum value {value} for {field}")]
    InvalidEnum { field: &'static str, value: i32 },
}
