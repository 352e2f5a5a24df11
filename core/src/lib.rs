//! Wire types shared by the host supervisor and the in-guest agent.
//!
//! Every message on the control socket is a prost-encoded record prefixed
//! with its length. The record layouts here are the protocol; field tags must
//! never be renumbered.

mod error;
pub mod frame;
pub mod message;

pub use error::WireError;
pub use frame::{DEFAULT_MAX_FRAME_LEN, FRAME_HEADER_LEN, FrameDecoder, encode_frame};
pub use message::*;
