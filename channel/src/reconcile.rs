use crate::channel::Inner;
use crate::sender::{Delivery, Outbound};
use warden_container::Container;

impl Inner {
    /// Observer callback for the container's connectivity attribute.
    ///
    /// Pushes the desired value to the guest only when it differs from the
    /// last value exchanged with the guest. That value is updated on
    /// successful delivery only, so a later notification retries.
    pub(crate) fn on_connectivity_changed(&self, container: &dyn Container) {
        let desired = container.connectivity();
        let current = self.state.borrow().connectivity;
        if desired == current {
            tracing::trace!("Connectivity of {} unchanged ({})", container.description(), desired);
            return;
        }

        tracing::info!(
            "Enforcing connectivity {} (guest has {}) on {}",
            desired,
            current,
            container.description()
        );

        match self.send(Outbound::Connectivity(desired)) {
            Ok(Delivery::Sent) => self.state.borrow_mut().connectivity = desired,
            Ok(Delivery::Skipped) => {}
            Err(e) => tracing::warn!(
                "Failed to send connectivity status to {}: {}",
                container.description(),
                e
            ),
        }
    }
}
