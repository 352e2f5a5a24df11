use crate::config::ChannelConfig;
use crate::error::ChannelError;
use crate::event::{EventLoop, WatchId};
use nix::sys::socket::{AddressFamily, SockFlag, SockType, UnixAddr, bind, socket};
use std::cell::RefCell;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::rc::{Rc, Weak};
use warden_container::{Connectivity, Container, ObserverToken};
use warden_core::FrameDecoder;

/// Lifecycle phase of a channel.
///
/// `Listening` and `Connected` alternate for as long as the guest
/// reconnects; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPhase {
    Uncreated,
    EndpointCreated,
    Bound,
    Listening,
    Connected,
    Closed,
}

impl std::fmt::Display for ChannelPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelPhase::Uncreated => write!(f, "uncreated"),
            ChannelPhase::EndpointCreated => write!(f, "endpoint created"),
            ChannelPhase::Bound => write!(f, "bound"),
            ChannelPhase::Listening => write!(f, "listening"),
            ChannelPhase::Connected => write!(f, "connected"),
            ChannelPhase::Closed => write!(f, "closed"),
        }
    }
}

pub(crate) struct Connection {
    pub(crate) id: u64,
    pub(crate) stream: UnixStream,
    pub(crate) watch: WatchId,
    pub(crate) decoder: FrameDecoder,
    /// Unwritten tail of the last outbound frame.
    pub(crate) pending: Vec<u8>,
}

pub(crate) struct State {
    // Milestone reached by the lifecycle operations; never `Connected`.
    pub(crate) phase: ChannelPhase,
    pub(crate) endpoint: Option<OwnedFd>,
    pub(crate) listener: Option<UnixListener>,
    pub(crate) listen_watch: Option<WatchId>,
    pub(crate) connection: Option<Connection>,
    pub(crate) connections_accepted: u64,
    /// Connectivity last received from or successfully pushed to the guest.
    pub(crate) connectivity: Connectivity,
    pub(crate) observer: Option<ObserverToken>,
}

pub(crate) struct Inner {
    pub(crate) container: Weak<dyn Container>,
    pub(crate) config: ChannelConfig,
    pub(crate) event_loop: EventLoop,
    pub(crate) state: RefCell<State>,
}

/// Control channel to the agent inside one compartment.
///
/// The channel holds only a weak reference to its container. The container
/// owns the channel and must tear it down (or drop it) before it goes away.
pub struct Channel {
    pub(crate) inner: Rc<Inner>,
}

impl Channel {
    pub fn new<C: Container + 'static>(
        container: &Rc<C>,
        config: ChannelConfig,
        event_loop: EventLoop,
    ) -> Self {
        let weak: Weak<C> = Rc::downgrade(container);
        let container: Weak<dyn Container> = weak;

        Self {
            inner: Rc::new(Inner {
                container,
                config,
                event_loop,
                state: RefCell::new(State {
                    phase: ChannelPhase::Uncreated,
                    endpoint: None,
                    listener: None,
                    listen_watch: None,
                    connection: None,
                    connections_accepted: 0,
                    connectivity: Connectivity::Offline,
                    observer: None,
                }),
            }),
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    pub fn phase(&self) -> ChannelPhase {
        let state = self.inner.state.borrow();
        match state.phase {
            ChannelPhase::Listening if state.connection.is_some() => ChannelPhase::Connected,
            phase => phase,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Whether the listening socket is open and registered with the event
    /// loop.
    pub fn is_listening(&self) -> bool {
        let state = self.inner.state.borrow();
        state.listener.is_some()
            && state
                .listen_watch
                .is_some_and(|id| self.inner.event_loop.is_registered(id))
    }

    pub fn last_connectivity(&self) -> Connectivity {
        self.inner.state.borrow().connectivity
    }

    /// Number of guest connections accepted over the channel's lifetime.
    pub fn connections_accepted(&self) -> u64 {
        self.inner.state.borrow().connections_accepted
    }

    /// Allocate the stream socket. Runs on the host before the guest's
    /// namespaces exist.
    pub fn create_endpoint(&self) -> Result<(), ChannelError> {
        self.inner.expect_phase(ChannelPhase::Uncreated)?;

        let fd = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(|e| ChannelError::resource("socket", e))?;

        tracing::debug!(
            "Created control socket {} for {}",
            fd.as_raw_fd(),
            self.inner.describe()
        );

        let mut state = self.inner.state.borrow_mut();
        state.endpoint = Some(fd);
        state.phase = ChannelPhase::EndpointCreated;
        Ok(())
    }

    /// Bind the pre-created socket to the configured path. The caller must
    /// already have entered the guest's mount namespace, so the path
    /// resolves inside it.
    pub fn bind_in_namespace(&self) -> Result<(), ChannelError> {
        self.inner.expect_phase(ChannelPhase::EndpointCreated)?;

        let path = &self.inner.config.socket_path;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ChannelError::resource("mkdir", e))?;
        }
        match std::fs::symlink_metadata(path) {
            Ok(meta) if meta.file_type().is_socket() => {
                tracing::debug!("Removing stale control socket {:?}", path);
                std::fs::remove_file(path).map_err(|e| ChannelError::resource("unlink", e))?;
            }
            _ => {}
        }

        let addr =
            UnixAddr::new(path.as_path()).map_err(|e| ChannelError::resource("bind", e))?;

        let mut state = self.inner.state.borrow_mut();
        let fd = state.endpoint.as_ref().ok_or(ChannelError::InvalidPhase {
            expected: ChannelPhase::EndpointCreated,
            actual: state.phase,
        })?;
        bind(fd.as_raw_fd(), &addr).map_err(|e| ChannelError::resource("bind", e))?;

        tracing::info!("Bound control socket to {:?}", path);
        state.phase = ChannelPhase::Bound;
        Ok(())
    }

    /// Start accepting the guest and observing the container's
    /// connectivity. Runs back in the host namespace once the guest
    /// process has been prepared.
    ///
    /// If only the observer registration fails, the error is returned but
    /// the socket keeps listening.
    pub fn begin_listening(&self) -> Result<(), ChannelError> {
        self.inner.expect_phase(ChannelPhase::Bound)?;

        {
            let mut state = self.inner.state.borrow_mut();
            let fd = state.endpoint.take().ok_or(ChannelError::InvalidPhase {
                expected: ChannelPhase::Bound,
                actual: state.phase,
            })?;

            if unsafe { libc::listen(fd.as_raw_fd(), self.inner.config.listen_backlog) } < 0 {
                let err = std::io::Error::last_os_error();
                state.endpoint = Some(fd);
                return Err(ChannelError::resource("listen", err));
            }

            let listener = UnixListener::from(fd);
            listener
                .set_nonblocking(true)
                .map_err(|e| ChannelError::resource("listen", e))?;

            let weak = Rc::downgrade(&self.inner);
            let watch = self.inner.event_loop.add_io(
                listener.as_raw_fd(),
                Box::new(move |event_loop, id, events| match weak.upgrade() {
                    Some(inner) => inner.handle_accept(events),
                    None => {
                        event_loop.remove_io(id);
                    }
                }),
            );

            state.listener = Some(listener);
            state.listen_watch = Some(watch);
            state.phase = ChannelPhase::Listening;
        }

        tracing::info!(
            "Waiting for guest agent of {} on {:?}",
            self.inner.describe(),
            self.inner.config.socket_path
        );

        let container = self.inner.container.upgrade().ok_or(ChannelError::Detached)?;
        let weak = Rc::downgrade(&self.inner);
        let token = container
            .register_observer(Rc::new(move |container: &dyn Container| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_connectivity_changed(container);
                }
            }))
            .map_err(|e| {
                tracing::warn!(
                    "Could not register connectivity observer for {}: {}",
                    container.description(),
                    e
                );
                ChannelError::Observer(e)
            })?;

        self.inner.state.borrow_mut().observer = Some(token);
        Ok(())
    }

    /// Close both sockets, drop their event-loop registrations and stop
    /// observing the container. Safe to call at any point, any number of
    /// times; the channel cannot be restarted afterwards.
    pub fn teardown(&self) {
        self.inner.teardown();
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.inner.teardown();
    }
}

impl Inner {
    pub(crate) fn describe(&self) -> String {
        match self.container.upgrade() {
            Some(container) => container.description(),
            None => "<detached container>".to_string(),
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state.borrow().connection.is_some()
    }

    pub(crate) fn connection_is(&self, id: u64) -> bool {
        self.state
            .borrow()
            .connection
            .as_ref()
            .is_some_and(|c| c.id == id)
    }

    fn expect_phase(&self, expected: ChannelPhase) -> Result<(), ChannelError> {
        let actual = self.state.borrow().phase;
        if actual != expected {
            return Err(ChannelError::InvalidPhase { expected, actual });
        }
        Ok(())
    }

    /// Close connection `id` if it is still the current one. The listening
    /// socket is left alone and re-armed so the guest can reconnect.
    pub(crate) fn close_connection(&self, id: u64) {
        let (connection, listen_watch) = {
            let mut state = self.state.borrow_mut();
            if !state.connection.as_ref().is_some_and(|c| c.id == id) {
                return;
            }
            (state.connection.take(), state.listen_watch)
        };

        if let Some(connection) = connection {
            self.event_loop.remove_io(connection.watch);
            close_logged(OwnedFd::from(connection.stream), "connected control socket");
            tracing::info!("Guest connection to {} closed", self.describe());
        }

        if let Some(watch) = listen_watch {
            self.event_loop.set_enabled(watch, true);
        }
    }

    /// Give up accepting: used when the listening socket fails.
    pub(crate) fn close_listener(&self) {
        let (listener, watch) = {
            let mut state = self.state.borrow_mut();
            (state.listener.take(), state.listen_watch.take())
        };

        if let Some(watch) = watch {
            self.event_loop.remove_io(watch);
        }
        if let Some(listener) = listener {
            close_logged(OwnedFd::from(listener), "listening control socket");
        }
    }

    pub(crate) fn teardown(&self) {
        let (connection, listener, listen_watch, endpoint, observer) = {
            let mut state = self.state.borrow_mut();
            if state.phase == ChannelPhase::Closed {
                return;
            }
            state.phase = ChannelPhase::Closed;
            (
                state.connection.take(),
                state.listener.take(),
                state.listen_watch.take(),
                state.endpoint.take(),
                state.observer.take(),
            )
        };

        if let Some(connection) = connection {
            self.event_loop.remove_io(connection.watch);
            close_logged(OwnedFd::from(connection.stream), "connected control socket");
        }
        if let Some(watch) = listen_watch {
            self.event_loop.remove_io(watch);
        }
        if let Some(listener) = listener {
            close_logged(OwnedFd::from(listener), "listening control socket");
        }
        if let Some(fd) = endpoint {
            close_logged(fd, "control socket");
        }
        if let Some(token) = observer
            && let Some(container) = self.container.upgrade()
        {
            container.unregister_observer(token);
        }

        tracing::debug!("Control channel for {} torn down", self.describe());
    }
}

/// Close `fd`, reporting failures only through the log.
fn close_logged(fd: OwnedFd, what: &str) {
    let raw = fd.into_raw_fd();
    if let Err(e) = nix::unistd::close(raw) {
        tracing::warn!("Failed to close {} {}: {}", what, raw, e);
    }
}
