//! Host side of the compartment control channel.
//!
//! A [`Channel`] owns the listening and connected Unix sockets for one
//! compartment, decodes guest messages into effects on the [`Container`]
//! collaborator, pushes host commands back to the guest, and keeps the
//! guest's connectivity in step with the container's desired value.
//!
//! Everything runs on a single thread inside an [`EventLoop`]; there is no
//! locking because callbacks never run concurrently.
//!
//! [`Container`]: warden_container::Container

mod audit;
mod channel;
mod config;
mod dispatch;
mod error;
pub mod event;
mod reconcile;
mod sender;

pub use audit::AuditForwarder;
pub use channel::{Channel, ChannelPhase};
pub use config::{ChannelConfig, DEFAULT_SOCKET_PATH};
pub use error::{ChannelError, DeliveryError};
pub use event::{EventLoop, Events, IoCallback, WatchId};
pub use sender::{Delivery, Outbound};
