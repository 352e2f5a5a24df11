//! Single-threaded I/O readiness reactor.
//!
//! Callbacks are registered per file descriptor and invoked from
//! [`EventLoop::run_once`] when `poll(2)` reports the descriptor readable,
//! writable (only while write interest is set) or in an exceptional
//! condition. A callback may register, pause or remove watches (including
//! its own) while it runs.

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::os::fd::{BorrowedFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(u64);

/// Readiness reported for one watch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Events {
    /// Data (or end-of-stream) can be read.
    pub readable: bool,
    /// Room to write; only reported while the watch asked for it.
    pub writable: bool,
    /// Error or invalid descriptor.
    pub exceptional: bool,
}

pub type IoCallback = Box<dyn FnMut(&EventLoop, WatchId, Events)>;

struct Watch {
    fd: RawFd,
    enabled: bool,
    writable: bool,
    // None while the callback is being dispatched
    callback: Option<IoCallback>,
}

#[derive(Default)]
struct Registry {
    next: u64,
    watches: BTreeMap<WatchId, Watch>,
}

#[derive(Clone, Default)]
pub struct EventLoop {
    registry: Rc<RefCell<Registry>>,
}

impl EventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch `fd` for readability. The descriptor must stay open until the
    /// watch is removed.
    pub fn add_io(&self, fd: RawFd, callback: IoCallback) -> WatchId {
        let mut registry = self.registry.borrow_mut();
        let id = WatchId(registry.next);
        registry.next += 1;
        registry.watches.insert(
            id,
            Watch {
                fd,
                enabled: true,
                writable: false,
                callback: Some(callback),
            },
        );
        tracing::trace!("Registered watch {:?} on fd {}", id, fd);
        id
    }

    pub fn remove_io(&self, id: WatchId) -> bool {
        let removed = self.registry.borrow_mut().watches.remove(&id);
        if removed.is_some() {
            tracing::trace!("Removed watch {:?}", id);
        }
        removed.is_some()
    }

    /// Pause or resume a watch without giving up its registration.
    pub fn set_enabled(&self, id: WatchId, enabled: bool) -> bool {
        match self.registry.borrow_mut().watches.get_mut(&id) {
            Some(watch) => {
                watch.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Ask for (or stop asking for) writable readiness on a watch.
    pub fn set_writable(&self, id: WatchId, writable: bool) -> bool {
        match self.registry.borrow_mut().watches.get_mut(&id) {
            Some(watch) => {
                watch.writable = writable;
                true
            }
            None => false,
        }
    }

    pub fn is_writable(&self, id: WatchId) -> bool {
        self.registry
            .borrow()
            .watches
            .get(&id)
            .is_some_and(|w| w.writable)
    }

    pub fn is_registered(&self, id: WatchId) -> bool {
        self.registry.borrow().watches.contains_key(&id)
    }

    pub fn is_enabled(&self, id: WatchId) -> bool {
        self.registry
            .borrow()
            .watches
            .get(&id)
            .is_some_and(|w| w.enabled)
    }

    pub fn len(&self) -> usize {
        self.registry.borrow().watches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.borrow().watches.is_empty()
    }

    /// Wait up to `timeout` (forever if `None`) for readiness and dispatch
    /// the ready callbacks. Returns the number of callbacks invoked.
    pub fn run_once(&self, timeout: Option<Duration>) -> std::io::Result<usize> {
        let armed: Vec<(WatchId, RawFd, PollFlags)> = self
            .registry
            .borrow()
            .watches
            .iter()
            .filter(|(_, w)| w.enabled)
            .map(|(id, w)| {
                let mut flags = PollFlags::POLLIN;
                if w.writable {
                    flags |= PollFlags::POLLOUT;
                }
                (*id, w.fd, flags)
            })
            .collect();

        if armed.is_empty() {
            if let Some(timeout) = timeout {
                std::thread::sleep(timeout);
            }
            return Ok(0);
        }

        let ready: Vec<(WatchId, Events)> = {
            // SAFETY: registered descriptors stay open until their watch is
            // removed, and no callback runs while these borrows are alive.
            let mut fds: Vec<PollFd> = armed
                .iter()
                .map(|(_, fd, flags)| {
                    PollFd::new(unsafe { BorrowedFd::borrow_raw(*fd) }, *flags)
                })
                .collect();

            let timeout = match timeout {
                Some(t) => PollTimeout::from(u16::try_from(t.as_millis()).unwrap_or(u16::MAX)),
                None => PollTimeout::NONE,
            };

            match poll(&mut fds, timeout) {
                Ok(0) => return Ok(0),
                Ok(_) => {}
                Err(Errno::EINTR) => return Ok(0),
                Err(e) => return Err(e.into()),
            }

            armed
                .iter()
                .zip(fds.iter())
                .filter_map(|((id, _, _), pfd)| {
                    let revents = pfd.revents()?;
                    let events = Events {
                        readable: revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP),
                        writable: revents.contains(PollFlags::POLLOUT),
                        exceptional: revents.intersects(
                            PollFlags::POLLERR | PollFlags::POLLNVAL | PollFlags::POLLPRI,
                        ),
                    };
                    (events.readable || events.writable || events.exceptional)
                        .then_some((*id, events))
                })
                .collect()
        };

        let mut dispatched = 0;
        for (id, events) in ready {
            // An earlier callback in this round may have removed or paused it.
            let callback = match self.registry.borrow_mut().watches.get_mut(&id) {
                Some(watch) if watch.enabled => watch.callback.take(),
                _ => None,
            };
            let Some(mut callback) = callback else {
                continue;
            };

            callback(self, id, events);
            dispatched += 1;

            if let Some(watch) = self.registry.borrow_mut().watches.get_mut(&id)
                && watch.callback.is_none()
            {
                watch.callback = Some(callback);
            }
        }

        Ok(dispatched)
    }

    /// Run until `done` returns true or `timeout` elapses. Returns whether
    /// `done` was satisfied.
    pub fn run_until(
        &self,
        timeout: Duration,
        mut done: impl FnMut() -> bool,
    ) -> std::io::Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if done() {
                return Ok(true);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            self.run_once(Some(remaining.min(Duration::from_millis(50))))?;
        }
    }
}
