use crate::error::WireError;
use serde::{Deserialize, Serialize};

/// Network reachability of a compartment, shared by both directions of the
/// channel and by the container's own attribute.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration, Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum Connectivity {
    Offline = 1,
    Limited = 2,
    Connected = 3,
}

impl std::fmt::Display for Connectivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Connectivity::Offline => write!(f, "offline"),
            Connectivity::Limited => write!(f, "limited"),
            Connectivity::Connected => write!(f, "connected"),
        }
    }
}

/// Guest → host message codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum GuestCode {
    BootCompleted = 1,
    AudioSuspendCompleted = 2,
    AudioResumeCompleted = 3,
    SuspendCompleted = 4,
    ResumeCompleted = 5,
    Shutdown = 6,
    MasterClear = 7,
    ConnectivityChange = 8,
    ImeiMacPhoneno = 9,
    ContainerCfgNameReq = 10,
    ContainerCfgDnsReq = 11,
    ExecCapSystimePriv = 12,
    AuditAck = 13,
}

/// Host → guest message codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum HostCode {
    ContainerCfgName = 1,
    ContainerCfgDns = 2,
    ConnectivityChange = 3,
    Shutdown = 4,
    Suspend = 5,
    Resume = 6,
    AudioSuspend = 7,
    AudioResume = 8,
    AuditComplete = 9,
    AuditNotify = 10,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GuestMessage {
    #[prost(enumeration = "GuestCode", tag = "1")]
    pub code: i32,
    #[prost(enumeration = "Connectivity", optional, tag = "2")]
    pub connectivity: ::core::option::Option<i32>,
    #[prost(string, optional, tag = "3")]
    pub imei: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(string, optional, tag = "4")]
    pub mac: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(string, optional, tag = "5")]
    pub phone_number: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(string, optional, tag = "6")]
    pub exec_path: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(string, repeated, tag = "7")]
    pub exec_args: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(bytes = "vec", optional, tag = "8")]
    pub audit_ack: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HostMessage {
    #[prost(enumeration = "HostCode", tag = "1")]
    pub code: i32,
    #[prost(string, optional, tag = "2")]
    pub container_name: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(string, optional, tag = "3")]
    pub container_dns: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(enumeration = "Connectivity", optional, tag = "4")]
    pub connectivity: ::core::option::Option<i32>,
    #[prost(uint64, optional, tag = "5")]
    pub audit_remaining_storage: ::core::option::Option<u64>,
}

/// Bounds applied to guest-supplied payloads before anything acts on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireLimits {
    pub max_exec_args: usize,
    pub max_string_len: usize,
    pub max_exec_total_len: usize,
}

impl Default for WireLimits {
    fn default() -> Self {
        Self {
            max_exec_args: 256,
            max_string_len: 4096,
            max_exec_total_len: 64 * 1024,
        }
    }
}

impl GuestMessage {
    pub fn new(code: GuestCode) -> Self {
        Self {
            code: code as i32,
            ..Default::default()
        }
    }

    /// The message code, or the raw value if this peer speaks a code we do
    /// not know.
    pub fn kind(&self) -> Result<GuestCode, i32> {
        GuestCode::try_from(self.code).map_err(|_| self.code)
    }

    /// Connectivity payload, if present and valid.
    pub fn connectivity_value(&self) -> Option<Connectivity> {
        self.connectivity
            .and_then(|v| Connectivity::try_from(v).ok())
    }

    /// Reject payloads that are structurally valid protobuf but unsafe or
    /// meaningless to act on.
    pub fn validate(&self, limits: &WireLimits) -> Result<(), WireError> {
        for (field, value) in [
            ("imei", &self.imei),
            ("mac", &self.mac),
            ("phone_number", &self.phone_number),
        ] {
            if let Some(s) = value
                && s.len() > limits.max_string_len
            {
                return Err(WireError::LimitExceeded(format!(
                    "{} is {} bytes (max {})",
                    field,
                    s.len(),
                    limits.max_string_len
                )));
            }
        }

        match self.kind() {
            Ok(GuestCode::ConnectivityChange) => {
                let value = self
                    .connectivity
                    .ok_or(WireError::MissingField("connectivity"))?;
                if Connectivity::try_from(value).is_err() {
                    return Err(WireError::InvalidEnum {
                        field: "connectivity",
                        value,
                    });
                }
            }
            Ok(GuestCode::ExecCapSystimePriv) => {
                let path = self
                    .exec_path
                    .as_deref()
                    .ok_or(WireError::MissingField("exec_path"))?;
                if self.exec_args.len() > limits.max_exec_args {
                    return Err(WireError::LimitExceeded(format!(
                        "{} exec arguments (max {})",
                        self.exec_args.len(),
                        limits.max_exec_args
                    )));
                }
                let mut total = path.len();
                for arg in std::iter::once(path).chain(self.exec_args.iter().map(String::as_str)) {
                    if arg.len() > limits.max_string_len {
                        return Err(WireError::LimitExceeded(format!(
                            "exec argument of {} bytes (max {})",
                            arg.len(),
                            limits.max_string_len
                        )));
                    }
                }
                total += self.exec_args.iter().map(String::len).sum::<usize>();
                if total > limits.max_exec_total_len {
                    return Err(WireError::LimitExceeded(format!(
                        "exec vector of {} bytes (max {})",
                        total, limits.max_exec_total_len
                    )));
                }
            }
            _ => {}
        }

        Ok(())
    }
}

impl HostMessage {
    /// A message that carries nothing but its code.
    pub fn command(code: HostCode) -> Self {
        Self {
            code: code as i32,
            ..Default::default()
        }
    }

    pub fn name_reply(name: impl Into<String>) -> Self {
        Self {
            container_name: Some(name.into()),
            ..Self::command(HostCode::ContainerCfgName)
        }
    }

    pub fn dns_reply(dns: impl Into<String>) -> Self {
        Self {
            container_dns: Some(dns.into()),
            ..Self::command(HostCode::ContainerCfgDns)
        }
    }

    pub fn connectivity_change(connectivity: Connectivity) -> Self {
        Self {
            connectivity: Some(connectivity as i32),
            ..Self::command(HostCode::ConnectivityChange)
        }
    }

    pub fn audit_notify(remaining_storage: u64) -> Self {
        Self {
            audit_remaining_storage: Some(remaining_storage),
            ..Self::command(HostCode::AuditNotify)
        }
    }

    pub fn kind(&self) -> Result<HostCode, i32> {
        HostCode::try_from(self.code).map_err(|_| self.code)
    }

    pub fn connectivity_value(&self) -> Option<Connectivity> {
        self.connectivity
            .and_then(|v| Connectivity::try_from(v).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec(path: &str, args: &[&str]) -> GuestMessage {
        GuestMessage {
            exec_path: Some(path.to_string()),
            exec_args: args.iter().map(|s| s.to_string()).collect(),
            ..GuestMessage::new(GuestCode::ExecCapSystimePriv)
        }
    }

    #[test]
    fn test_unknown_code_is_reported_raw() {
        let msg = GuestMessage {
            code: 99,
            ..Default::default()
        };
        assert_eq!(msg.kind(), Err(99));
        assert!(msg.validate(&WireLimits::default()).is_ok());
    }

    #[test]
    fn test_connectivity_change_requires_value() {
        let limits = WireLimits::default();
        let mut msg = GuestMessage::new(GuestCode::ConnectivityChange);
        assert!(matches!(
            msg.validate(&limits),
            Err(WireError::MissingField("connectivity"))
        ));

        msg.connectivity = Some(42);
        assert!(matches!(
            msg.validate(&limits),
            Err(WireError::InvalidEnum { value: 42, .. })
        ));

        msg.connectivity = Some(Connectivity::Limited as i32);
        assert!(msg.validate(&limits).is_ok());
        assert_eq!(msg.connectivity_value(), Some(Connectivity::Limited));
    }

    #[test]
    fn test_exec_limits() {
        let limits = WireLimits {
            max_exec_args: 2,
            max_string_len: 16,
            max_exec_total_len: 24,
        };

        assert!(exec("/bin/date", &["-s", "now"]).validate(&limits).is_ok());
        assert!(matches!(
            exec("/bin/date", &["a", "b", "c"]).validate(&limits),
            Err(WireError::LimitExceeded(_))
        ));
        assert!(matches!(
            exec("/bin/date", &["0123456789abcdefg"]).validate(&limits),
            Err(WireError::LimitExceeded(_))
        ));
        assert!(matches!(
            exec("/usr/bin/date", &["0123456789", "0123"]).validate(&limits),
            Err(WireError::LimitExceeded(_))
        ));
    }

    #[test]
    fn test_exec_requires_path() {
        let msg = GuestMessage::new(GuestCode::ExecCapSystimePriv);
        assert!(matches!(
            msg.validate(&WireLimits::default()),
            Err(WireError::MissingField("exec_path"))
        ));
    }

    #[test]
    fn test_host_message_payloads() {
        let msg = HostMessage::connectivity_change(Connectivity::Connected);
        assert_eq!(msg.kind(), Ok(HostCode::ConnectivityChange));
        assert_eq!(msg.connectivity_value(), Some(Connectivity::Connected));

        let msg = HostMessage::command(HostCode::Shutdown);
        assert_eq!(msg.connectivity, None);
        assert_eq!(msg.container_name, None);
    }
}
