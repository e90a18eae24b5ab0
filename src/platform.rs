//! Platform detection for the run strategy

use crate::error::Result;
use log::debug;

/// Name of the service backend on this platform
pub fn platform_name() -> &'static str {
    #[cfg(target_os = "windows")]
    return "windows-service";

    #[cfg(not(target_os = "windows"))]
    return "interactive";
}

/// Determine whether the process was started interactively (by a user or
/// shell) rather than by the service manager.
///
/// Call once at startup and pass the value to the controller.
#[cfg(target_os = "windows")]
pub fn detect_interactive() -> Result<bool> {
    use crate::error::ServiceError;
    use winapi::shared::minwindef::{DWORD, FALSE};
    use winapi::um::processthreadsapi::{GetCurrentProcessId, ProcessIdToSessionId};

    let mut session_id: DWORD = 0;
    // SAFETY: session_id is a valid out pointer for the duration of the call
    let ok = unsafe { ProcessIdToSessionId(GetCurrentProcessId(), &mut session_id) };
    if ok == FALSE {
        return Err(ServiceError::Manager(format!(
            "failed to query session id: {}",
            std::io::Error::last_os_error()
        )));
    }

    // Services run in session 0, users never log on to it
    let interactive = session_id != 0;
    debug!("Process session id {}, interactive: {}", session_id, interactive);
    Ok(interactive)
}

/// Without a service manager backend every run is interactive
#[cfg(not(target_os = "windows"))]
pub fn detect_interactive() -> Result<bool> {
    debug!("No service manager backend on {}, running interactively", std::env::consts::OS);
    Ok(true)
}
