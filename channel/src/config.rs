use crate::error::ChannelError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;
use warden_core::{DEFAULT_MAX_FRAME_LEN, WireLimits};

/// Well-known socket path inside a compartment's mount namespace.
pub const DEFAULT_SOCKET_PATH: &str = "/dev/socket/warden-control";

const SOCKET_NAME: &str = "warden-control";

// sizeof(sockaddr_un.sun_path) minus the terminating NUL
const MAX_SOCKET_PATH_LEN: usize = 107;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Path the listening socket is bound to, resolved inside the guest's
    /// namespace.
    pub socket_path: PathBuf,
    pub listen_backlog: i32,
    pub max_frame_len: usize,
    pub max_exec_args: usize,
    /// Upper bound for any single guest-supplied string.
    pub max_string_len: usize,
    pub max_exec_total_len: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        let limits = WireLimits::default();
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            listen_backlog: 1,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            max_exec_args: limits.max_exec_args,
            max_string_len: limits.max_string_len,
            max_exec_total_len: limits.max_exec_total_len,
        }
    }
}

impl ChannelConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            ..Default::default()
        }
    }

    /// Per-container socket path below `runtime_dir`, for running several
    /// compartments without separate mount namespaces.
    pub fn for_container(runtime_dir: &Path, uuid: &Uuid) -> Self {
        Self::new(runtime_dir.join(uuid.to_string()).join(SOCKET_NAME))
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ChannelError> {
        let content = std::fs::read_to_string(path)?;
        let config: ChannelConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn wire_limits(&self) -> WireLimits {
        WireLimits {
            max_exec_args: self.max_exec_args,
            max_string_len: self.max_string_len,
            max_exec_total_len: self.max_exec_total_len,
        }
    }

    pub fn validate(&self) -> Result<(), ChannelError> {
        let len = self.socket_path.as_os_str().len();
        if len == 0 || len > MAX_SOCKET_PATH_LEN {
            return Err(ChannelError::Config(format!(
                "socket path {:?} must be 1..={} bytes",
                self.socket_path, MAX_SOCKET_PATH_LEN
            )));
        }
        if self.listen_backlog < 1 {
            return Err(ChannelError::Config(format!(
                "listen backlog must be positive, got {}",
                self.listen_backlog
            )));
        }
        if self.max_frame_len == 0 || self.max_frame_len > u32::MAX as usize {
            return Err(ChannelError::Config(format!(
                "max frame length {} out of range",
                self.max_frame_len
            )));
        }
        Ok(())
    }
}
