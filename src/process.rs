//! Forced process termination

use crate::error::{Result, ServiceError};
use log::{info, warn};

/// Capability to forcibly terminate a process by id
pub trait ProcessTerminator: Send + Sync {
    fn terminate(&self, pid: u32) -> Result<()>;
}

/// Terminates processes through the system process table
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTerminator;

impl ProcessTerminator for SystemTerminator {
    fn terminate(&self, pid: u32) -> Result<()> {
        use sysinfo::{Pid, System};

        if pid == 0 {
            return Err(ServiceError::ProcessNotFound(pid));
        }

        let mut system = System::new();
        system.refresh_all();

        let process = system
            .process(Pid::from_u32(pid))
            .ok_or(ServiceError::ProcessNotFound(pid))?;
        let name = process.name().to_string_lossy().to_string();

        // SIGKILL on Unix, TerminateProcess on Windows
        if process.kill() {
            info!("Force terminated process {} ({})", pid, name);
            Ok(())
        } else {
            warn!("Failed to terminate process {} ({})", pid, name);
            Err(ServiceError::Manager(format!(
                "failed to terminate process {} ({})",
                pid, name
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_zero_is_rejected() {
        let result = SystemTerminator.terminate(0);
        assert!(matches!(result, Err(ServiceError::ProcessNotFound(0))));
    }

    #[test]
    fn test_unknown_pid_is_not_found() {
        let result = SystemTerminator.terminate(u32::MAX - 1);
        assert!(matches!(result, Err(ServiceError::ProcessNotFound(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_terminates_child_process() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("sleep should be available");

        SystemTerminator.terminate(child.id()).unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());
    }
}
