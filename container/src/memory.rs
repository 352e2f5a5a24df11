use crate::container::{Container, Observer};
use crate::error::ContainerError;
use crate::exec::ExecArgv;
use crate::observer::{ObserverList, ObserverToken};
use crate::types::ContainerState;
use std::cell::{Cell, RefCell};
use uuid::Uuid;
use warden_core::Connectivity;

#[derive(Debug, Clone)]
struct Attributes {
    name: String,
    dns_server: String,
    state: ContainerState,
    screen_on: bool,
    connectivity: Connectivity,
    imei: Option<String>,
    mac_address: Option<String>,
    phone_number: Option<String>,
}

#[derive(Debug, Default)]
struct Calls {
    stop: usize,
    wipe: usize,
    exec: Vec<Vec<Option<String>>>,
    audit_acks: Vec<Vec<u8>>,
}

/// Every observable attribute and side-effect counter at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSnapshot {
    pub name: String,
    pub dns_server: String,
    pub state: ContainerState,
    pub screen_on: bool,
    pub connectivity: Connectivity,
    pub imei: Option<String>,
    pub mac_address: Option<String>,
    pub phone_number: Option<String>,
    pub stop_calls: usize,
    pub wipe_calls: usize,
    pub exec_calls: usize,
    pub audit_acks: usize,
}

/// Single-threaded container model.
///
/// Stands in for a real compartment: `stop` moves straight to
/// [`ContainerState::Stopped`], exec and audit acks are recorded instead of
/// executed. Failures can be injected for each fallible operation.
pub struct MemoryContainer {
    uuid: Uuid,
    attrs: RefCell<Attributes>,
    calls: RefCell<Calls>,
    observers: ObserverList,
    fail_exec: Cell<bool>,
    fail_audit_ack: Cell<bool>,
    fail_observer: Cell<bool>,
}

impl MemoryContainer {
    pub fn new(name: &str) -> Self {
        Self::with_uuid(name, Uuid::new_v4())
    }

    pub fn with_uuid(name: &str, uuid: Uuid) -> Self {
        Self {
            uuid,
            attrs: RefCell::new(Attributes {
                name: name.to_string(),
                dns_server: String::new(),
                state: ContainerState::Stopped,
                screen_on: false,
                connectivity: Connectivity::Offline,
                imei: None,
                mac_address: None,
                phone_number: None,
            }),
            calls: RefCell::new(Calls::default()),
            observers: ObserverList::new(),
            fail_exec: Cell::new(false),
            fail_audit_ack: Cell::new(false),
            fail_observer: Cell::new(false),
        }
    }

    pub fn fail_exec(&self, fail: bool) {
        self.fail_exec.set(fail);
    }

    pub fn fail_audit_ack(&self, fail: bool) {
        self.fail_audit_ack.set(fail);
    }

    pub fn fail_observer_registration(&self, fail: bool) {
        self.fail_observer.set(fail);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub fn exec_invocations(&self) -> Vec<Vec<Option<String>>> {
        self.calls.borrow().exec.clone()
    }

    pub fn audit_acks(&self) -> Vec<Vec<u8>> {
        self.calls.borrow().audit_acks.clone()
    }

    pub fn snapshot(&self) -> ContainerSnapshot {
        let attrs = self.attrs.borrow();
        let calls = self.calls.borrow();
        ContainerSnapshot {
            name: attrs.name.clone(),
            dns_server: attrs.dns_server.clone(),
            state: attrs.state,
            screen_on: attrs.screen_on,
            connectivity: attrs.connectivity,
            imei: attrs.imei.clone(),
            mac_address: attrs.mac_address.clone(),
            phone_number: attrs.phone_number.clone(),
            stop_calls: calls.stop,
            wipe_calls: calls.wipe,
            exec_calls: calls.exec.len(),
            audit_acks: calls.audit_acks.len(),
        }
    }
}

impl Container for MemoryContainer {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn description(&self) -> String {
        format!("{} ({})", self.attrs.borrow().name, self.uuid)
    }

    fn name(&self) -> String {
        self.attrs.borrow().name.clone()
    }

    fn set_name(&self, name: &str) {
        self.attrs.borrow_mut().name = name.to_string();
    }

    fn dns_server(&self) -> String {
        self.attrs.borrow().dns_server.clone()
    }

    fn set_dns_server(&self, dns: &str) {
        self.attrs.borrow_mut().dns_server = dns.to_string();
    }

    fn state(&self) -> ContainerState {
        self.attrs.borrow().state
    }

    fn set_state(&self, state: ContainerState) {
        let previous = std::mem::replace(&mut self.attrs.borrow_mut().state, state);
        if previous != state {
            tracing::info!("Container {} state {} -> {}", self.uuid, previous, state);
        }
    }

    fn screen_on(&self) -> bool {
        self.attrs.borrow().screen_on
    }

    fn set_screen_on(&self, screen_on: bool) {
        self.attrs.borrow_mut().screen_on = screen_on;
    }

    fn connectivity(&self) -> Connectivity {
        self.attrs.borrow().connectivity
    }

    fn set_connectivity(&self, connectivity: Connectivity) {
        self.attrs.borrow_mut().connectivity = connectivity;
        self.observers.notify(self);
    }

    fn imei(&self) -> Option<String> {
        self.attrs.borrow().imei.clone()
    }

    fn set_imei(&self, imei: &str) {
        self.attrs.borrow_mut().imei = Some(imei.to_string());
    }

    fn mac_address(&self) -> Option<String> {
        self.attrs.borrow().mac_address.clone()
    }

    fn set_mac_address(&self, mac: &str) {
        self.attrs.borrow_mut().mac_address = Some(mac.to_string());
    }

    fn phone_number(&self) -> Option<String> {
        self.attrs.borrow().phone_number.clone()
    }

    fn set_phone_number(&self, phone_number: &str) {
        self.attrs.borrow_mut().phone_number = Some(phone_number.to_string());
    }

    fn stop(&self) -> Result<(), ContainerError> {
        self.calls.borrow_mut().stop += 1;
        self.set_state(ContainerState::Stopped);
        Ok(())
    }

    fn wipe(&self) -> Result<(), ContainerError> {
        self.calls.borrow_mut().wipe += 1;
        tracing::info!("Wiping container {}", self.uuid);
        Ok(())
    }

    fn exec_cap_systime(&self, argv: &ExecArgv) -> Result<(), ContainerError> {
        self.calls.borrow_mut().exec.push(argv.to_vec_lossy());
        if self.fail_exec.get() {
            return Err(ContainerError::PermissionDenied(
                argv.program().to_string_lossy().into_owned(),
            ));
        }
        Ok(())
    }

    fn process_audit_ack(&self, ack: &[u8]) -> Result<(), ContainerError> {
        self.calls.borrow_mut().audit_acks.push(ack.to_vec());
        if self.fail_audit_ack.get() {
            return Err(ContainerError::AuditAck(format!(
                "unknown record ({} bytes)",
                ack.len()
            )));
        }
        Ok(())
    }

    fn register_observer(&self, observer: Observer) -> Result<ObserverToken, ContainerError> {
        if self.fail_observer.get() {
            return Err(ContainerError::Observer(
                "observer registration disabled".to_string(),
            ));
        }
        Ok(self.observers.subscribe(observer))
    }

    fn unregister_observer(&self, token: ObserverToken) {
        self.observers.unsubscribe(token);
    }
}
