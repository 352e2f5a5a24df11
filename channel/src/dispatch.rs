use crate::channel::{Connection, Inner};
use crate::event::Events;
use crate::sender::{Delivery, Outbound};
use std::io::{ErrorKind, Read};
use std::os::fd::AsRawFd;
use std::rc::Rc;
use warden_container::{Container, ContainerState, ExecArgv};
use warden_core::{FrameDecoder, GuestCode, GuestMessage, WireError};

const READ_CHUNK: usize = 4096;

/// What a readiness notification left behind on the connection.
enum Disposition {
    Open,
    Eof,
    Protocol(WireError),
    Io(std::io::Error),
}

impl Inner {
    /// Readiness on the listening socket: take one guest connection.
    pub(crate) fn handle_accept(self: &Rc<Self>, events: Events) {
        if events.exceptional {
            tracing::warn!(
                "Exception on listening control socket of {}; no further guest connections",
                self.describe()
            );
            self.close_listener();
            return;
        }
        if !events.readable || self.is_connected() {
            return;
        }

        let accepted = {
            let state = self.state.borrow();
            let Some(listener) = state.listener.as_ref() else {
                return;
            };
            listener.accept()
        };

        let stream = match accepted {
            Ok((stream, _)) => stream,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                return;
            }
            Err(e) => {
                tracing::warn!(
                    "Accept failed on control socket of {}: {}; no further guest connections",
                    self.describe(),
                    e
                );
                self.close_listener();
                return;
            }
        };

        if let Err(e) = stream.set_nonblocking(true) {
            tracing::warn!("Dropping guest connection to {}: {}", self.describe(), e);
            return;
        }

        let mut state = self.state.borrow_mut();
        state.connections_accepted += 1;
        let id = state.connections_accepted;

        let weak = Rc::downgrade(self);
        let watch = self.event_loop.add_io(
            stream.as_raw_fd(),
            Box::new(move |event_loop, watch, events| match weak.upgrade() {
                Some(inner) => inner.handle_connection(id, events),
                None => {
                    event_loop.remove_io(watch);
                }
            }),
        );

        tracing::info!(
            "Accepted guest connection {} (fd {}) from {}",
            id,
            stream.as_raw_fd(),
            self.describe()
        );

        state.connection = Some(Connection {
            id,
            stream,
            watch,
            decoder: FrameDecoder::new(self.config.max_frame_len),
            pending: Vec::new(),
        });

        // The listening socket stays registered for reconnects but is not
        // polled while a guest is attached.
        if let Some(listen_watch) = state.listen_watch {
            self.event_loop.set_enabled(listen_watch, false);
        }
    }

    /// Readiness on connection `id`: drain the socket, dispatch every
    /// complete frame, and close the connection on EOF or on the first
    /// malformed frame. Writable readiness finishes a partly written frame.
    pub(crate) fn handle_connection(self: &Rc<Self>, id: u64, events: Events) {
        if events.readable {
            let (messages, disposition) = self.read_messages(id);

            for message in messages {
                // A handler may have torn the channel down.
                if !self.connection_is(id) {
                    return;
                }
                self.handle_message(message);
            }

            match disposition {
                Disposition::Open => {}
                Disposition::Eof => {
                    tracing::info!("Guest agent of {} disconnected", self.describe());
                    self.close_connection(id);
                    return;
                }
                Disposition::Protocol(e) => {
                    tracing::warn!(
                        "Protocol error from guest of {}: {}; closing connection",
                        self.describe(),
                        e
                    );
                    self.close_connection(id);
                    return;
                }
                Disposition::Io(e) => {
                    tracing::warn!(
                        "Read from guest of {} failed: {}; closing connection",
                        self.describe(),
                        e
                    );
                    self.close_connection(id);
                    return;
                }
            }
        }

        if events.writable {
            self.flush_pending(id);
        }

        if events.exceptional {
            tracing::warn!(
                "Exception on connected control socket of {}; closing connection",
                self.describe()
            );
            self.close_connection(id);
        }
    }

    fn read_messages(&self, id: u64) -> (Vec<GuestMessage>, Disposition) {
        let limits = self.config.wire_limits();
        let mut state = self.state.borrow_mut();
        let Some(connection) = state.connection.as_mut().filter(|c| c.id == id) else {
            return (Vec::new(), Disposition::Open);
        };

        let mut disposition = Disposition::Open;
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match (&connection.stream).read(&mut buf) {
                Ok(0) => {
                    disposition = Disposition::Eof;
                    break;
                }
                Ok(n) => connection.decoder.extend(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    disposition = Disposition::Io(e);
                    break;
                }
            }
        }

        let mut messages = Vec::new();
        loop {
            match connection.decoder.decode_next::<GuestMessage>() {
                Ok(Some(message)) => match message.validate(&limits) {
                    Ok(()) => {
                        tracing::trace!("Received message code {} from guest", message.code);
                        messages.push(message);
                    }
                    Err(e) => return (messages, Disposition::Protocol(e)),
                },
                Ok(None) => break,
                Err(e) => return (messages, Disposition::Protocol(e)),
            }
        }

        if matches!(disposition, Disposition::Eof)
            && let Err(e) = connection.decoder.finish()
        {
            disposition = Disposition::Protocol(e);
        }

        (messages, disposition)
    }

    /// Apply one decoded guest message to the container.
    pub(crate) fn handle_message(&self, message: GuestMessage) {
        let Some(container) = self.container.upgrade() else {
            tracing::warn!("Dropping guest message code {}: container is gone", message.code);
            return;
        };

        match message.kind() {
            Ok(GuestCode::BootCompleted) => {
                container.set_state(ContainerState::Running);
            }

            Ok(GuestCode::AudioSuspendCompleted) | Ok(GuestCode::AudioResumeCompleted) => {}

            Ok(GuestCode::SuspendCompleted) => {
                tracing::info!("Guest of {} completed suspend", container.description());
                container.set_screen_on(false);
            }

            Ok(GuestCode::ResumeCompleted) => {
                tracing::info!("Guest of {} completed resume", container.description());
                container.set_screen_on(true);
            }

            Ok(GuestCode::Shutdown) => match container.state() {
                ContainerState::ShuttingDown => {
                    tracing::info!("Guest of {} is shutting down", container.description());
                }
                ContainerState::Stopped => {
                    tracing::error!(
                        "Guest reports shutdown of {}, which is already stopped",
                        container.description()
                    );
                }
                _ => {
                    tracing::info!(
                        "Guest of {} is shutting down, stopping it from the host side",
                        container.description()
                    );
                    if let Err(e) = container.stop() {
                        tracing::error!("Failed to stop {}: {}", container.description(), e);
                    }
                }
            },

            Ok(GuestCode::MasterClear) => {
                tracing::info!("Guest of {} requested a wipe", container.description());
                if let Err(e) = container.wipe() {
                    tracing::error!("Failed to wipe {}: {}", container.description(), e);
                }
            }

            Ok(GuestCode::ConnectivityChange) => {
                let Some(connectivity) = message.connectivity_value() else {
                    tracing::warn!("Connectivity change without a value, ignoring");
                    return;
                };
                tracing::info!(
                    "Guest of {} reports connectivity {}",
                    container.description(),
                    connectivity
                );
                // Record first: the container notifies its observers,
                // including this channel, from inside the setter.
                self.state.borrow_mut().connectivity = connectivity;
                container.set_connectivity(connectivity);
            }

            Ok(GuestCode::ImeiMacPhoneno) => {
                tracing::info!(
                    "Guest of {} reports imei: {}, mac: {}, phone number: {}",
                    container.description(),
                    message.imei.as_deref().unwrap_or(""),
                    message.mac.as_deref().unwrap_or(""),
                    message.phone_number.as_deref().unwrap_or("")
                );
                if let Some(imei) = message.imei.as_deref() {
                    container.set_imei(imei);
                }
                if let Some(mac) = message.mac.as_deref() {
                    container.set_mac_address(mac);
                }
                if let Some(phone_number) = message.phone_number.as_deref() {
                    container.set_phone_number(phone_number);
                }
            }

            Ok(GuestCode::ContainerCfgNameReq) => {
                let name = container.name();
                tracing::info!("Sending container name {} to guest", name);
                self.reply(&*container, Outbound::ContainerName(name));
            }

            Ok(GuestCode::ContainerCfgDnsReq) => {
                let dns = container.dns_server();
                tracing::info!("Sending DNS server {} to guest", dns);
                self.reply(&*container, Outbound::ContainerDns(dns));
            }

            Ok(GuestCode::ExecCapSystimePriv) => {
                let path = message.exec_path.as_deref().unwrap_or_default();
                let argv = match ExecArgv::new(path, &message.exec_args) {
                    Ok(argv) => argv,
                    Err(e) => {
                        tracing::warn!("Rejecting exec request from guest: {}", e);
                        return;
                    }
                };
                for (i, arg) in argv.args().iter().enumerate() {
                    tracing::trace!("argv[{}]: {:?}", i, arg);
                }
                if let Err(e) = container.exec_cap_systime(&argv) {
                    tracing::warn!("Exec of '{}' failed/permission denied: {}", path, e);
                }
            }

            Ok(GuestCode::AuditAck) => {
                tracing::info!("Got audit ACK from {}", container.uuid());
                let ack = message.audit_ack.as_deref().unwrap_or_default();
                if let Err(e) = container.process_audit_ack(ack) {
                    tracing::error!(
                        "Failed to process audit ACK from {}: {}",
                        container.uuid(),
                        e
                    );
                }
            }

            Err(code) => {
                tracing::warn!("Received unknown message code {} from guest", code);
            }
        }
    }

    fn reply(&self, container: &dyn Container, message: Outbound) {
        let code = message.code();
        match self.send(message) {
            Ok(Delivery::Sent) => {
                tracing::debug!("Sent {:?} reply to {}", code, container.description())
            }
            Ok(Delivery::Skipped) => {}
            Err(e) => tracing::warn!(
                "Could not reply {:?} to {}: {}",
                code,
                container.description(),
                e
            ),
        }
    }
}
