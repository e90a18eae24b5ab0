//! Service states, control signals and status reports

use std::fmt;
use std::time::Duration;

/// Runtime state of a service as reported by the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Stopped,
    StartPending,
    StopPending,
    Running,
    /// Any other manager state (pause/continue pending, paused), kept as
    /// its raw code
    Other(u32),
}

impl RuntimeState {
    /// Numeric state code as used by the Windows service manager
    pub fn code(&self) -> u32 {
        match self {
            RuntimeState::Stopped => 1,
            RuntimeState::StartPending => 2,
            RuntimeState::StopPending => 3,
            RuntimeState::Running => 4,
            RuntimeState::Other(code) => *code,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            1 => RuntimeState::Stopped,
            2 => RuntimeState::StartPending,
            3 => RuntimeState::StopPending,
            4 => RuntimeState::Running,
            other => RuntimeState::Other(other),
        }
    }

    /// Human readable label; states without one render as their code
    pub fn label(&self) -> String {
        match self {
            RuntimeState::Running => "Running".to_string(),
            RuntimeState::StopPending => "StopPending".to_string(),
            RuntimeState::Stopped => "Stop".to_string(),
            other => other.code().to_string(),
        }
    }
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Result of querying a service entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceStatus {
    pub state: RuntimeState,
    /// Process id, 0 when the service has no process
    pub process_id: u32,
}

impl ServiceStatus {
    pub fn new(state: RuntimeState, process_id: u32) -> Self {
        Self { state, process_id }
    }

    pub fn stopped() -> Self {
        Self::new(RuntimeState::Stopped, 0)
    }
}

/// Control requests delivered by the service manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Stop,
    Shutdown,
    Interrogate,
    Pause,
    Continue,
    Preshutdown,
    Other,
}

/// Controls the running service accepts
pub const ACCEPTS_STOP_SHUTDOWN: &[ControlSignal] = &[ControlSignal::Stop, ControlSignal::Shutdown];

/// Exit code carried by a Stopped report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Win32(u32),
    ServiceSpecific(u32),
}

impl Default for ExitCode {
    fn default() -> Self {
        ExitCode::Win32(0)
    }
}

/// Status the service reports back to the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub state: RuntimeState,
    pub accepts: &'static [ControlSignal],
    pub exit_code: ExitCode,
}

impl StatusReport {
    pub fn pending(state: RuntimeState) -> Self {
        Self {
            state,
            accepts: &[],
            exit_code: ExitCode::default(),
        }
    }

    pub fn running() -> Self {
        Self {
            state: RuntimeState::Running,
            accepts: ACCEPTS_STOP_SHUTDOWN,
            exit_code: ExitCode::default(),
        }
    }

    pub fn stopped(exit_code: ExitCode) -> Self {
        Self {
            state: RuntimeState::Stopped,
            accepts: &[],
            exit_code,
        }
    }
}

/// What the manager does when the service process fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    None,
    Restart { delay: Duration },
}

impl RecoveryAction {
    /// Restart immediately on every failure
    pub fn restart_immediately() -> Self {
        RecoveryAction::Restart {
            delay: Duration::ZERO,
        }
    }
}
