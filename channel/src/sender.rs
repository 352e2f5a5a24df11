use crate::channel::{Channel, Connection, Inner};
use crate::error::DeliveryError;
use std::io::{self, ErrorKind, Write};
use std::os::unix::net::UnixStream;
use warden_container::Connectivity;
use warden_core::{HostCode, HostMessage, encode_frame};

/// Host → guest message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    ContainerName(String),
    ContainerDns(String),
    Connectivity(Connectivity),
    Shutdown,
    Suspend,
    Resume,
    AudioSuspend,
    /// Accepted but never transmitted.
    AudioResume,
    AuditComplete,
    AuditNotify(u64),
}

impl Outbound {
    pub fn code(&self) -> HostCode {
        match self {
            Outbound::ContainerName(_) => HostCode::ContainerCfgName,
            Outbound::ContainerDns(_) => HostCode::ContainerCfgDns,
            Outbound::Connectivity(_) => HostCode::ConnectivityChange,
            Outbound::Shutdown => HostCode::Shutdown,
            Outbound::Suspend => HostCode::Suspend,
            Outbound::Resume => HostCode::Resume,
            Outbound::AudioSuspend => HostCode::AudioSuspend,
            Outbound::AudioResume => HostCode::AudioResume,
            Outbound::AuditComplete => HostCode::AuditComplete,
            Outbound::AuditNotify(_) => HostCode::AuditNotify,
        }
    }

    pub fn to_message(&self) -> HostMessage {
        match self {
            Outbound::ContainerName(name) => HostMessage::name_reply(name.as_str()),
            Outbound::ContainerDns(dns) => HostMessage::dns_reply(dns.as_str()),
            Outbound::Connectivity(c) => HostMessage::connectivity_change(*c),
            Outbound::AuditNotify(remaining) => HostMessage::audit_notify(*remaining),
            other => HostMessage::command(other.code()),
        }
    }
}

/// Outcome of a send that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// No guest is connected and the message kind tolerates that.
    Skipped,
}

impl Channel {
    /// Send `message` to the guest.
    ///
    /// Without a connected guest every kind is [`Delivery::Skipped`] except
    /// [`Outbound::Shutdown`], which fails with
    /// [`DeliveryError::NotConnected`] so that a stop request can fall back
    /// to killing the compartment instead of waiting out its timeout.
    pub fn send(&self, message: Outbound) -> Result<Delivery, DeliveryError> {
        self.inner.send(message)
    }

    /// Ask the guest to shut down.
    pub fn request_stop(&self) -> Result<Delivery, DeliveryError> {
        tracing::info!("Sending stop command to guest of {}", self.inner.describe());
        self.inner.send(Outbound::Shutdown)
    }

    pub fn suspend(&self) -> Result<Delivery, DeliveryError> {
        self.inner.send(Outbound::Suspend)
    }

    pub fn resume(&self) -> Result<Delivery, DeliveryError> {
        self.inner.send(Outbound::Resume)
    }

    pub fn audio_suspend(&self) -> Result<Delivery, DeliveryError> {
        self.inner.send(Outbound::AudioSuspend)
    }

    pub fn audio_resume(&self) -> Result<Delivery, DeliveryError> {
        self.inner.send(Outbound::AudioResume)
    }
}

impl Inner {
    pub(crate) fn send(&self, message: Outbound) -> Result<Delivery, DeliveryError> {
        let code = message.code();

        if message == Outbound::AudioResume {
            tracing::debug!("Not forwarding {:?} to guest", code);
            return Ok(Delivery::Skipped);
        }

        if !self.is_connected() {
            if message == Outbound::Shutdown {
                tracing::warn!(
                    "Cannot send {:?} to {}: guest not connected",
                    code,
                    self.describe()
                );
                return Err(DeliveryError::NotConnected);
            }
            tracing::warn!(
                "Guest of {} not connected, dropping {:?}; the agent is probably still booting",
                self.describe(),
                code
            );
            return Ok(Delivery::Skipped);
        }

        let frame = encode_frame(&message.to_message())?;
        match self.write_raw(&frame) {
            Ok(()) => {
                tracing::debug!("Sent {:?} to {}", code, self.describe());
                Ok(Delivery::Sent)
            }
            Err(e) => {
                tracing::warn!("Failed to send {:?} to {}: {}", code, self.describe(), e);
                Err(e)
            }
        }
    }

    /// Write bytes as-is to the connected socket. A failed write does not
    /// close the connection; only the read side judges its health.
    ///
    /// Bytes the socket does not take right away are kept and flushed on
    /// writable readiness, so a frame is never cut short on the wire.
    pub(crate) fn write_raw(&self, bytes: &[u8]) -> Result<(), DeliveryError> {
        let mut state = self.state.borrow_mut();
        let connection = state
            .connection
            .as_mut()
            .ok_or(DeliveryError::NotConnected)?;
        let result = connection.write_frame(bytes);
        self.event_loop
            .set_writable(connection.watch, !connection.pending.is_empty());
        result?;
        Ok(())
    }

    /// Writable readiness on connection `id`: push out what is left of the
    /// last frame.
    pub(crate) fn flush_pending(&self, id: u64) {
        let mut state = self.state.borrow_mut();
        let Some(connection) = state.connection.as_mut().filter(|c| c.id == id) else {
            return;
        };
        let keep_watching = match connection.flush() {
            Ok(drained) => !drained,
            Err(e) => {
                tracing::warn!("Flush to guest of {} failed: {}", self.describe(), e);
                false
            }
        };
        self.event_loop.set_writable(connection.watch, keep_watching);
    }
}

impl Connection {
    /// Push out the unwritten tail of an earlier frame. Returns whether
    /// nothing is left.
    pub(crate) fn flush(&mut self) -> io::Result<bool> {
        if self.pending.is_empty() {
            return Ok(true);
        }
        let (written, error) = write_nonblocking(&self.stream, &self.pending);
        self.pending.drain(..written);
        match error {
            None => Ok(true),
            Some(e) if e.kind() == ErrorKind::WouldBlock => Ok(false),
            Some(e) => Err(e),
        }
    }

    /// Write `frame` after whatever is still pending. Fails without writing
    /// any of it if an earlier frame cannot be finished first or the socket
    /// takes none of it; once part of it is written the rest is kept.
    pub(crate) fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        if !self.flush()? {
            return Err(io::Error::new(
                ErrorKind::WouldBlock,
                "previous frame still being written",
            ));
        }

        let (written, error) = write_nonblocking(&self.stream, frame);
        match error {
            None => Ok(()),
            Some(e) if written == 0 => Err(e),
            Some(e) => {
                self.pending.extend_from_slice(&frame[written..]);
                if e.kind() == ErrorKind::WouldBlock {
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }
}

/// Write as much of `bytes` as the socket takes without blocking. Returns
/// the count written and the error that stopped it early, if any.
fn write_nonblocking(stream: &UnixStream, bytes: &[u8]) -> (usize, Option<io::Error>) {
    let mut writer = stream;
    let mut written = 0;
    while written < bytes.len() {
        match writer.write(&bytes[written..]) {
            Ok(0) => return (written, Some(io::Error::from(ErrorKind::WriteZero))),
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return (written, Some(e)),
        }
    }
    (written, None)
}
