use std::fmt;

/// Phases of a lab run.
///
/// ```text
/// Idle -> Provisioning -> Running -> TearingDown -> Idle
///              |             |
///              +-> Cleanup <-+-> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabState {
    Idle,
    Provisioning,
    Running,
    TearingDown,
    Cleanup,
    Failed,
}

impl LabState {
    pub fn can_transition_to(self, next: LabState) -> bool {
        use LabState::*;
        matches!(
            (self, next),
            (Idle, Provisioning)
                | (Provisioning, Running)
                | (Provisioning, Cleanup)
                | (Running, Cleanup)
                | (Running, TearingDown)
                | (TearingDown, Idle)
                | (Cleanup, Failed)
        )
    }
}

impl fmt::Display for LabState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LabState::Idle => "idle",
            LabState::Provisioning => "provisioning",
            LabState::Running => "running",
            LabState::TearingDown => "tearing down",
            LabState::Cleanup => "cleanup",
            LabState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}
