use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    TomlError(String),
    YamlError(String),
    MissingField(String),
    DuplicateName(String),
    UnknownSwitch(String),
    DirectoryDoesNotExist(String),
    TemplateNotFound(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::TomlError(e) => write!(f, "TOML parsing error: {}", e),
            ConfigError::YamlError(e) => write!(f, "YAML parsing error: {}", e),
            ConfigError::MissingField(e) => write!(f, "Missing field: {}", e),
            ConfigError::DuplicateName(e) => write!(f, "Duplicate name: {}", e),
            ConfigError::UnknownSwitch(e) => write!(f, "Unknown switch: {}", e),
            ConfigError::DirectoryDoesNotExist(e) => write!(f, "Directory error: {}", e),
            ConfigError::TemplateNotFound(e) => write!(f, "Template error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

#[derive(Debug)]
pub enum MountError {
    IoError(std::io::Error),
    MountFailed { target: PathBuf, reason: String },
    UnmountFailed { target: PathBuf, reason: String },
}

impl fmt::Display for MountError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountError::IoError(e) => write!(f, "Mount IO error: {}", e),
            MountError::MountFailed { target, reason } => {
                write!(f, "Mount of {} failed: {}", target.display(), reason)
            }
            MountError::UnmountFailed { target, reason } => {
                write!(f, "Unmount of {} failed: {}", target.display(), reason)
            }
        }
    }
}

impl std::error::Error for MountError {}

impl From<std::io::Error> for MountError {
    fn from(err: std::io::Error) -> Self {
        MountError::IoError(err)
    }
}

#[derive(Debug)]
pub enum ProcessError {
    NamespaceUnavailable { pid: u32, reason: String },
    SignalFailed { pid: u32, reason: String },
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessError::NamespaceUnavailable { pid, reason } => {
                write!(f, "Network namespace of pid {} unavailable: {}", pid, reason)
            }
            ProcessError::SignalFailed { pid, reason } => {
                write!(f, "Failed to signal pid {}: {}", pid, reason)
            }
        }
    }
}

impl std::error::Error for ProcessError {}

#[derive(Debug)]
pub enum ServiceError {
    IoError(std::io::Error),
    RootNotMounted(String),
    StartFailed(String),
    PidFileUnreadable(String),
    StopFailed(String),
    EngineError(EngineError),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::IoError(e) => write!(f, "Service IO error: {}", e),
            ServiceError::RootNotMounted(e) => write!(f, "Host root not mounted: {}", e),
            ServiceError::StartFailed(e) => write!(f, "Service start failed: {}", e),
            ServiceError::PidFileUnreadable(e) => write!(f, "Pid file unreadable: {}", e),
            ServiceError::StopFailed(e) => write!(f, "Service stop failed: {}", e),
            ServiceError::EngineError(e) => write!(f, "Service engine error: {}", e),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<std::io::Error> for ServiceError {
    fn from(err: std::io::Error) -> Self {
        ServiceError::IoError(err)
    }
}

impl From<EngineError> for ServiceError {
    fn from(err: EngineError) -> Self {
        ServiceError::EngineError(err)
    }
}

#[derive(Debug)]
pub enum NatError {
    BadAddress(String),
    NoInternalInterface(String),
    RuleFailed { command: String, reason: String },
    EngineError(EngineError),
}

impl fmt::Display for NatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NatError::BadAddress(e) => write!(f, "NAT address error: {}", e),
            NatError::NoInternalInterface(e) => {
                write!(f, "NAT gateway {} has no internal interface", e)
            }
            NatError::RuleFailed { command, reason } => {
                write!(f, "NAT command `{}` failed: {}", command, reason)
            }
            NatError::EngineError(e) => write!(f, "NAT engine error: {}", e),
        }
    }
}

impl std::error::Error for NatError {}

impl From<EngineError> for NatError {
    fn from(err: EngineError) -> Self {
        NatError::EngineError(err)
    }
}

#[derive(Debug)]
pub enum EngineError {
    IoError(std::io::Error),
    UnknownNode(String),
    CommandFailed { command: String, reason: String },
    EmptyCommand,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::IoError(e) => write!(f, "Engine IO error: {}", e),
            EngineError::UnknownNode(e) => write!(f, "Unknown node: {}", e),
            EngineError::CommandFailed { command, reason } => {
                write!(f, "Command `{}` failed: {}", command, reason)
            }
            EngineError::EmptyCommand => write!(f, "Command cannot be empty"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::IoError(err)
    }
}

#[derive(Debug)]
pub enum LabError {
    ConfigurationError(ConfigError),
    MountError(MountError),
    ProcessError(ProcessError),
    ServiceError(ServiceError),
    NatError(NatError),
    EngineError(EngineError),
    LockError(std::io::Error),
    Locked { pid: u32 },
    Provisioning { step: String, source: Box<LabError> },
    SessionFailed(String),
}

impl LabError {
    /// Wraps an error with a short description of the step that raised it.
    pub fn provisioning(step: impl Into<String>, source: impl Into<LabError>) -> Self {
        LabError::Provisioning {
            step: step.into(),
            source: Box::new(source.into()),
        }
    }

    /// Process exit status to report for this error.
    pub fn exit_code(&self) -> i32 {
        1
    }
}

impl fmt::Display for LabError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabError::ConfigurationError(e) => write!(f, "Configuration error: {}", e),
            LabError::MountError(e) => write!(f, "Mount error: {}", e),
            LabError::ProcessError(e) => write!(f, "Process error: {}", e),
            LabError::ServiceError(e) => write!(f, "Service error: {}", e),
            LabError::NatError(e) => write!(f, "NAT error: {}", e),
            LabError::EngineError(e) => write!(f, "Network engine error: {}", e),
            LabError::LockError(e) => write!(f, "Lab lock error: {}", e),
            LabError::Locked { pid } => {
                write!(f, "Lab directory is already in use by process {}", pid)
            }
            LabError::Provisioning { step, source } => {
                write!(f, "Provisioning failed at step '{}': {}", step, source)
            }
            LabError::SessionFailed(e) => write!(f, "Interactive session failed: {}", e),
        }
    }
}

impl std::error::Error for LabError {}

impl From<ConfigError> for LabError {
    fn from(err: ConfigError) -> Self {
        LabError::ConfigurationError(err)
    }
}

impl From<MountError> for LabError {
    fn from(err: MountError) -> Self {
        LabError::MountError(err)
    }
}

impl From<ProcessError> for LabError {
    fn from(err: ProcessError) -> Self {
        LabError::ProcessError(err)
    }
}

impl From<ServiceError> for LabError {
    fn from(err: ServiceError) -> Self {
        LabError::ServiceError(err)
    }
}

impl From<NatError> for LabError {
    fn from(err: NatError) -> Self {
        LabError::NatError(err)
    }
}

impl From<EngineError> for LabError {
    fn from(err: EngineError) -> Self {
        LabError::EngineError(err)
    }
}
