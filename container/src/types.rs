use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    #[default]
    Stopped,
    Starting,
    Booting,
    Running,
    Freezing,
    Frozen,
    ShuttingDown,
    Zombie,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerState::Stopped => write!(f, "stopped"),
            ContainerState::Starting => write!(f, "starting"),
            ContainerState::Booting => write!(f, "booting"),
            ContainerState::Running => write!(f, "running"),
            ContainerState::Freezing => write!(f, "freezing"),
            ContainerState::Frozen => write!(f, "frozen"),
            ContainerState::ShuttingDown => write!(f, "shutting down"),
            ContainerState::Zombie => write!(f, "zombie"),
        }
    }
}
