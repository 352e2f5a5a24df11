use std::rc::Rc;
use std::time::{Duration, Instant};
use warden_channel::{Channel, ChannelConfig, ChannelError, Delivery, EventLoop};
use warden_container::{Connectivity, Container, ContainerState, MemoryContainer};

/// Hosts one compartment and its control channel on a single event loop.
pub struct Supervisor {
    channel: Channel,
    container: Rc<MemoryContainer>,
    event_loop: EventLoop,
    stop_timeout: Duration,
    stop_deadline: Option<Instant>,
    suspended: bool,
}

impl Supervisor {
    pub fn new(
        container: Rc<MemoryContainer>,
        config: ChannelConfig,
        stop_timeout: Duration,
    ) -> Self {
        let event_loop = EventLoop::new();
        let channel = Channel::new(&container, config, event_loop.clone());
        Self {
            channel,
            container,
            event_loop,
            stop_timeout,
            stop_deadline: None,
            suspended: false,
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn container(&self) -> &MemoryContainer {
        &self.container
    }

    /// Walk the channel through its setup phases while the compartment
    /// starts. A failed connectivity subscription is not fatal.
    pub fn start(&self) -> Result<(), ChannelError> {
        tracing::info!("Starting container {}", self.container.description());
        self.container.set_state(ContainerState::Starting);

        self.channel.create_endpoint()?;
        self.channel.bind_in_namespace()?;
        self.container.set_state(ContainerState::Booting);

        match self.channel.begin_listening() {
            Ok(()) => {}
            Err(ChannelError::Observer(e)) => {
                tracing::warn!("Connectivity changes will not reach the guest: {}", e);
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.container.state() == ContainerState::Stopped
    }

    pub fn is_stopping(&self) -> bool {
        self.stop_deadline.is_some()
    }

    /// Ask the guest to shut down; stop the compartment directly if it
    /// cannot be asked.
    pub fn stop(&mut self) {
        if self.is_stopping() || self.is_stopped() {
            return;
        }

        tracing::info!("Stopping container {}", self.container.description());
        self.container.set_state(ContainerState::ShuttingDown);

        match self.channel.request_stop() {
            Ok(_) => self.stop_deadline = Some(Instant::now() + self.stop_timeout),
            Err(e) => {
                tracing::warn!(
                    "Could not ask guest of {} to stop ({}), stopping it directly",
                    self.container.description(),
                    e
                );
                self.force_stop();
            }
        }
    }

    fn force_stop(&mut self) {
        if let Err(e) = self.container.stop() {
            tracing::error!("Failed to stop {}: {}", self.container.description(), e);
        }
        self.stop_deadline = None;
    }

    pub fn toggle_suspend(&mut self) {
        let result = if self.suspended {
            self.channel.resume()
        } else {
            self.channel.suspend()
        };

        match result {
            Ok(Delivery::Sent) => self.suspended = !self.suspended,
            Ok(Delivery::Skipped) => {}
            Err(e) => tracing::warn!("Suspend/resume not delivered: {}", e),
        }
    }

    /// Step the desired connectivity to the next value; the channel pushes
    /// it to the guest through its container observer.
    pub fn cycle_connectivity(&self) {
        let next = match self.container.connectivity() {
            Connectivity::Offline => Connectivity::Limited,
            Connectivity::Limited => Connectivity::Connected,
            Connectivity::Connected => Connectivity::Offline,
        };
        tracing::info!(
            "Setting connectivity of {} to {}",
            self.container.description(),
            next
        );
        self.container.set_connectivity(next);
    }

    /// Run one event-loop iteration, then finish a pending stop if the
    /// guest has gone away or the stop timeout has passed.
    pub fn poll(&mut self, timeout: Duration) -> std::io::Result<()> {
        self.event_loop.run_once(Some(timeout))?;

        let Some(deadline) = self.stop_deadline else {
            return Ok(());
        };
        if self.is_stopped() {
            self.stop_deadline = None;
        } else if !self.channel.is_connected() {
            tracing::info!("Guest of {} closed its channel", self.container.description());
            self.force_stop();
        } else if Instant::now() >= deadline {
            tracing::warn!(
                "Guest of {} did not stop within {:?}, stopping it",
                self.container.description(),
                self.stop_timeout
            );
            self.force_stop();
        }
        Ok(())
    }

    pub fn shutdown(self) {
        self.channel.teardown();
        tracing::info!("Container {} stopped", self.container.description());
    }
}
