use crate::error::ContainerError;
use crate::exec::ExecArgv;
use crate::observer::ObserverToken;
use crate::types::ContainerState;
use std::rc::Rc;
use uuid::Uuid;
use warden_core::Connectivity;

/// Callback invoked after an observed container attribute changes.
pub type Observer = Rc<dyn Fn(&dyn Container)>;

/// Container operations the control channel depends on.
///
/// All methods take `&self`: implementations are single-threaded and use
/// interior mutability, because observer callbacks re-enter the container
/// while one of its setters is still on the stack. Implementations must not
/// hold internal borrows while notifying observers.
pub trait Container {
    fn uuid(&self) -> Uuid;

    /// Human-readable identification for log lines.
    fn description(&self) -> String;

    fn name(&self) -> String;

    fn set_name(&self, name: &str);

    fn dns_server(&self) -> String;

    fn set_dns_server(&self, dns: &str);

    fn state(&self) -> ContainerState;

    fn set_state(&self, state: ContainerState);

    fn screen_on(&self) -> bool;

    fn set_screen_on(&self, screen_on: bool);

    fn connectivity(&self) -> Connectivity;

    /// Set the connectivity attribute and notify registered observers.
    fn set_connectivity(&self, connectivity: Connectivity);

    fn imei(&self) -> Option<String>;

    fn set_imei(&self, imei: &str);

    fn mac_address(&self) -> Option<String>;

    fn set_mac_address(&self, mac: &str);

    fn phone_number(&self) -> Option<String>;

    fn set_phone_number(&self, phone_number: &str);

    /// Stop the container. Implementations fall back to killing it when a
    /// graceful stop cannot be initiated.
    fn stop(&self) -> Result<(), ContainerError>;

    /// Factory-reset the container's data.
    fn wipe(&self) -> Result<(), ContainerError>;

    /// Run `argv` with the system-time capability inside the container.
    fn exec_cap_systime(&self, argv: &ExecArgv) -> Result<(), ContainerError>;

    fn process_audit_ack(&self, ack: &[u8]) -> Result<(), ContainerError>;

    fn register_observer(&self, observer: Observer) -> Result<ObserverToken, ContainerError>;

    fn unregister_observer(&self, token: ObserverToken);
}
