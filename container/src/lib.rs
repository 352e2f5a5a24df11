//! The slice of a compartment's container object that the control channel
//! reads, mutates and observes.

mod container;
mod error;
mod exec;
mod memory;
mod observer;
mod types;

pub use container::{Container, Observer};
pub use error::ContainerError;
pub use exec::ExecArgv;
pub use memory::{ContainerSnapshot, MemoryContainer};
pub use observer::{ObserverList, ObserverToken};
pub use types::*;
pub use warden_core::Connectivity;
