use crate::channel::{Channel, Inner};
use crate::error::DeliveryError;
use crate::sender::{Delivery, Outbound};

/// Relays audit records and storage notifications to the guest.
///
/// Obtained from [`Channel::audit`]. Retries are the caller's business.
pub struct AuditForwarder<'a> {
    inner: &'a Inner,
}

impl Channel {
    pub fn audit(&self) -> AuditForwarder<'_> {
        AuditForwarder { inner: &self.inner }
    }
}

impl AuditForwarder<'_> {
    /// Write an already packed and framed audit record verbatim.
    ///
    /// Unlike regular sends this fails when no guest is connected.
    pub fn send_record(&self, record: &[u8]) -> Result<(), DeliveryError> {
        tracing::trace!(
            "Sending packed audit record of {} bytes to {}",
            record.len(),
            self.inner.describe()
        );
        self.inner.write_raw(record).inspect_err(|e| {
            tracing::error!(
                "Failed to send packed audit record to {}: {}",
                self.inner.describe(),
                e
            )
        })
    }

    pub fn notify_remaining_storage(&self, remaining: u64) -> Result<Delivery, DeliveryError> {
        tracing::trace!(
            "Notifying {} about stored audit events, remaining storage: {}",
            self.inner.describe(),
            remaining
        );
        self.inner.send(Outbound::AuditNotify(remaining))
    }

    pub fn notify_complete(&self) -> Result<Delivery, DeliveryError> {
        tracing::trace!(
            "Notifying {} that all stored audit events were delivered",
            self.inner.describe()
        );
        self.inner.send(Outbound::AuditComplete)
    }
}
