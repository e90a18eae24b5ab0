//! Windows Service Control Manager gateway
//!
//! Service entries go through the `windows-service` crate; event log
//! sources and the stop timeout live in the registry and go through winapi.

use super::{stop_timeout_from, ManagerSession, ServiceEntry, ServiceManager, ServiceSpec, StartType};
use crate::control_loop::{ControlLoop, StatusReporter};
use crate::error::{Result, ServiceError};
use crate::status::{ControlSignal, ExitCode, RecoveryAction, RuntimeState, ServiceStatus, StatusReport};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::ffi::{OsStr, OsString};
use std::os::windows::ffi::OsStrExt;
use std::ptr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use winapi::shared::minwindef::{DWORD, HKEY};
use winapi::shared::winerror::{
    ERROR_ACCESS_DENIED, ERROR_INVALID_SERVICE_CONTROL, ERROR_SERVICE_CANNOT_ACCEPT_CTRL,
    ERROR_SERVICE_DOES_NOT_EXIST, ERROR_SERVICE_EXISTS, ERROR_SUCCESS,
};
use winapi::um::winnt::{KEY_READ, KEY_WRITE, REG_DWORD, REG_EXPAND_SZ, REG_OPENED_EXISTING_KEY, REG_OPTION_NON_VOLATILE, REG_SZ};
use winapi::um::winreg::{
    RegCloseKey, RegCreateKeyExW, RegDeleteKeyW, RegOpenKeyExW, RegQueryValueExW, RegSetValueExW,
    HKEY_LOCAL_MACHINE,
};
use windows_service::service::{
    Service, ServiceAccess, ServiceAction, ServiceActionType, ServiceControl, ServiceControlAccept,
    ServiceErrorControl, ServiceExitCode, ServiceFailureActions, ServiceFailureResetPeriod,
    ServiceInfo, ServiceStartType, ServiceState, ServiceStatus as WinServiceStatus, ServiceType,
};
use windows_service::service_control_handler::{self, ServiceControlHandlerResult};
use windows_service::service_manager::{ServiceManager as ScManager, ServiceManagerAccess};
use windows_service::{define_windows_service, service_dispatcher};

const EVENT_LOG_KEY: &str = r"SYSTEM\CurrentControlSet\Services\EventLog\Application";
const EVENT_MESSAGE_FILE: &str = r"%SystemRoot%\System32\EventCreate.exe";
const CONTROL_KEY: &str = r"SYSTEM\CurrentControlSet\Control";
const STOP_TIMEOUT_VALUE: &str = "WaitToKillServiceTimeout";
/// EVENTLOG_ERROR_TYPE | EVENTLOG_WARNING_TYPE | EVENTLOG_INFORMATION_TYPE
const SUPPORTED_EVENT_TYPES: DWORD = 0x1 | 0x2 | 0x4;

/// Gateway to the local Service Control Manager
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsServiceManager;

impl WindowsServiceManager {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ServiceManager for WindowsServiceManager {
    fn connect(&self) -> Result<Box<dyn ManagerSession + '_>> {
        let manager = ScManager::local_computer(
            None::<&str>,
            ServiceManagerAccess::CONNECT | ServiceManagerAccess::CREATE_SERVICE,
        )
        .map_err(|e| match os_code(&e) {
            Some(code) if code == ERROR_ACCESS_DENIED => ServiceError::PermissionDenied,
            _ => manager_error("connect to service manager", &e),
        })?;
        Ok(Box::new(ScmSession { manager }))
    }

    fn register_log_source(&self, name: &str) -> Result<()> {
        let path = format!(r"{}\{}", EVENT_LOG_KEY, name);
        let key = RegKey::create(&path)?;
        if key.existed {
            return Err(ServiceError::Manager(format!(r"{} registry key already exists", path)));
        }
        key.set_expand_string("EventMessageFile", EVENT_MESSAGE_FILE)?;
        key.set_dword("TypesSupported", SUPPORTED_EVENT_TYPES)?;
        key.set_dword("CustomSource", 1)?;
        debug!("Registered event log source {}", name);
        Ok(())
    }

    fn remove_log_source(&self, name: &str) -> Result<()> {
        let path = wide(&format!(r"{}\{}", EVENT_LOG_KEY, name));
        // SAFETY: path is a NUL terminated UTF-16 string
        let status = unsafe { RegDeleteKeyW(HKEY_LOCAL_MACHINE, path.as_ptr()) };
        if status != ERROR_SUCCESS as i32 {
            return Err(ServiceError::Manager(format!(
                "failed to delete event log source {}: {}",
                name,
                std::io::Error::from_raw_os_error(status)
            )));
        }
        debug!("Removed event log source {}", name);
        Ok(())
    }

    fn stop_timeout(&self) -> Duration {
        let raw = RegKey::open_read(CONTROL_KEY).and_then(|key| key.string(STOP_TIMEOUT_VALUE));
        stop_timeout_from(raw.as_deref())
    }

    async fn dispatch(&self, name: &str, control_loop: ControlLoop) -> Result<()> {
        {
            let mut pending = PENDING_DISPATCH
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *pending = Some(control_loop);
        }

        let service_name = name.to_string();
        let dispatched = tokio::task::spawn_blocking(move || {
            service_dispatcher::start(&service_name, ffi_service_main)
        })
        .await
        .map_err(|e| ServiceError::Dispatch(format!("dispatcher thread failed: {}", e)))?;

        // Drop the loop if the dispatcher never called back
        PENDING_DISPATCH
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        dispatched.map_err(|e| ServiceError::Dispatch(e.to_string()))
    }
}

struct ScmSession {
    manager: ScManager,
}

impl ManagerSession for ScmSession {
    fn open(&self, name: &str) -> Result<Box<dyn ServiceEntry + '_>> {
        let access = ServiceAccess::QUERY_STATUS
            | ServiceAccess::START
            | ServiceAccess::STOP
            | ServiceAccess::PAUSE_CONTINUE
            | ServiceAccess::CHANGE_CONFIG
            | ServiceAccess::DELETE;
        let service = self.manager.open_service(name, access).map_err(|e| match os_code(&e) {
            Some(code) if code == ERROR_SERVICE_DOES_NOT_EXIST => ServiceError::NotInstalled(name.to_string()),
            _ => manager_error("open service", &e),
        })?;
        Ok(Box::new(ScmEntry { service }))
    }

    fn create(&self, spec: &ServiceSpec) -> Result<Box<dyn ServiceEntry + '_>> {
        let info = ServiceInfo {
            name: OsString::from(&spec.name),
            display_name: OsString::from(&spec.display_name),
            service_type: ServiceType::OWN_PROCESS,
            start_type: match spec.start_type {
                StartType::Automatic => ServiceStartType::AutoStart,
                StartType::Manual => ServiceStartType::OnDemand,
            },
            error_control: ServiceErrorControl::Normal,
            executable_path: spec.executable.clone(),
            launch_arguments: spec.arguments.iter().map(OsString::from).collect(),
            dependencies: Vec::new(),
            account_name: spec.account.as_ref().map(OsString::from),
            account_password: spec.password.as_ref().map(OsString::from),
        };
        let access = ServiceAccess::QUERY_STATUS
            | ServiceAccess::START
            | ServiceAccess::STOP
            | ServiceAccess::CHANGE_CONFIG
            | ServiceAccess::DELETE;
        let service = self.manager.create_service(&info, access).map_err(|e| match os_code(&e) {
            Some(code) if code == ERROR_SERVICE_EXISTS => ServiceError::AlreadyExists(spec.name.clone()),
            _ => manager_error("create service", &e),
        })?;

        if !spec.description.is_empty() {
            if let Err(e) = service.set_description(&spec.description) {
                warn!("Failed to set description of {}: {}", spec.name, e);
            }
        }
        Ok(Box::new(ScmEntry { service }))
    }
}

struct ScmEntry {
    service: Service,
}

impl ServiceEntry for ScmEntry {
    fn query(&self) -> Result<ServiceStatus> {
        let status = self
            .service
            .query_status()
            .map_err(|e| manager_error("query service status", &e))?;
        Ok(from_win_status(&status))
    }

    fn start(&self) -> Result<()> {
        self.service
            .start::<&OsStr>(&[])
            .map_err(|e| manager_error("start service", &e))
    }

    fn control(&self, signal: ControlSignal) -> Result<ServiceStatus> {
        let result = match signal {
            ControlSignal::Stop => self.service.stop(),
            ControlSignal::Pause => self.service.pause(),
            ControlSignal::Continue => self.service.resume(),
            ControlSignal::Interrogate => self.service.query_status(),
            other => {
                return Err(ServiceError::ControlRejected(format!(
                    "{:?} cannot be sent through the service manager",
                    other
                )))
            }
        };
        result.map(|status| from_win_status(&status)).map_err(|e| match os_code(&e) {
            Some(code) if code == ERROR_INVALID_SERVICE_CONTROL || code == ERROR_SERVICE_CANNOT_ACCEPT_CTRL => {
                ServiceError::ControlRejected(e.to_string())
            }
            _ => manager_error("control service", &e),
        })
    }

    fn set_recovery_action(&self, action: RecoveryAction) -> Result<()> {
        let actions = match action {
            RecoveryAction::None => vec![ServiceAction {
                action_type: ServiceActionType::None,
                delay: Duration::ZERO,
            }],
            RecoveryAction::Restart { delay } => vec![ServiceAction {
                action_type: ServiceActionType::Restart,
                delay,
            }],
        };
        self.service
            .update_failure_actions(ServiceFailureActions {
                reset_period: ServiceFailureResetPeriod::After(Duration::ZERO),
                reboot_msg: None,
                command: None,
                actions: Some(actions),
            })
            .map_err(|e| manager_error("set recovery actions", &e))
    }

    fn delete(&self) -> Result<()> {
        self.service.delete().map_err(|e| manager_error("delete service", &e))
    }
}

fn from_win_status(status: &WinServiceStatus) -> ServiceStatus {
    let state = match status.current_state {
        ServiceState::Stopped => RuntimeState::Stopped,
        ServiceState::StartPending => RuntimeState::StartPending,
        ServiceState::StopPending => RuntimeState::StopPending,
        ServiceState::Running => RuntimeState::Running,
        ServiceState::ContinuePending => RuntimeState::Other(5),
        ServiceState::PausePending => RuntimeState::Other(6),
        ServiceState::Paused => RuntimeState::Other(7),
    };
    ServiceStatus::new(state, status.process_id.unwrap_or(0))
}

fn os_code(err: &windows_service::Error) -> Option<u32> {
    match err {
        windows_service::Error::Winapi(io) => io.raw_os_error().map(|code| code as u32),
        _ => None,
    }
}

fn manager_error(operation: &str, err: &windows_service::Error) -> ServiceError {
    ServiceError::Manager(format!("{} failed: {}", operation, err))
}

fn wide(value: &str) -> Vec<u16> {
    OsStr::new(value).encode_wide().chain(std::iter::once(0)).collect()
}

/// Registry key under HKEY_LOCAL_MACHINE, closed on drop
struct RegKey {
    handle: HKEY,
    existed: bool,
}

impl RegKey {
    fn create(path: &str) -> Result<Self> {
        let path_w = wide(path);
        let mut handle: HKEY = ptr::null_mut();
        let mut disposition: DWORD = 0;
        // SAFETY: all pointers are valid for the duration of the call
        let status = unsafe {
            RegCreateKeyExW(
                HKEY_LOCAL_MACHINE,
                path_w.as_ptr(),
                0,
                ptr::null_mut(),
                REG_OPTION_NON_VOLATILE,
                KEY_WRITE | KEY_READ,
                ptr::null_mut(),
                &mut handle,
                &mut disposition,
            )
        };
        if status != ERROR_SUCCESS as i32 {
            return Err(ServiceError::Manager(format!(
                "failed to create registry key {}: {}",
                path,
                std::io::Error::from_raw_os_error(status)
            )));
        }
        Ok(Self {
            handle,
            existed: disposition == REG_OPENED_EXISTING_KEY,
        })
    }

    fn open_read(path: &str) -> Option<Self> {
        let path_w = wide(path);
        let mut handle: HKEY = ptr::null_mut();
        // SAFETY: all pointers are valid for the duration of the call
        let status = unsafe { RegOpenKeyExW(HKEY_LOCAL_MACHINE, path_w.as_ptr(), 0, KEY_READ, &mut handle) };
        if status != ERROR_SUCCESS as i32 {
            return None;
        }
        Some(Self {
            handle,
            existed: true,
        })
    }

    fn set_expand_string(&self, name: &str, value: &str) -> Result<()> {
        let data = wide(value);
        self.set_value(name, REG_EXPAND_SZ, data.as_ptr() as *const u8, (data.len() * 2) as DWORD)
    }

    fn set_dword(&self, name: &str, value: DWORD) -> Result<()> {
        self.set_value(
            name,
            REG_DWORD,
            &value as *const DWORD as *const u8,
            std::mem::size_of::<DWORD>() as DWORD,
        )
    }

    fn set_value(&self, name: &str, kind: DWORD, data: *const u8, len: DWORD) -> Result<()> {
        let name_w = wide(name);
        // SAFETY: data points to len readable bytes owned by the caller
        let status = unsafe { RegSetValueExW(self.handle, name_w.as_ptr(), 0, kind, data, len) };
        if status != ERROR_SUCCESS as i32 {
            return Err(ServiceError::Manager(format!(
                "failed to set registry value {}: {}",
                name,
                std::io::Error::from_raw_os_error(status)
            )));
        }
        Ok(())
    }

    /// Read a REG_SZ value
    fn string(&self, name: &str) -> Option<String> {
        let name_w = wide(name);
        let mut buffer: [u16; 256] = [0; 256];
        let mut size = (buffer.len() * 2) as DWORD;
        let mut kind: DWORD = 0;
        // SAFETY: buffer holds size bytes
        let status = unsafe {
            RegQueryValueExW(
                self.handle,
                name_w.as_ptr(),
                ptr::null_mut(),
                &mut kind,
                buffer.as_mut_ptr() as *mut u8,
                &mut size,
            )
        };
        if status != ERROR_SUCCESS as i32 || kind != REG_SZ {
            return None;
        }
        let len = (size as usize / 2).min(buffer.len());
        Some(
            String::from_utf16_lossy(&buffer[..len])
                .trim_end_matches('\0')
                .to_string(),
        )
    }
}

impl Drop for RegKey {
    fn drop(&mut self) {
        // SAFETY: handle was returned by RegCreateKeyExW/RegOpenKeyExW
        unsafe {
            RegCloseKey(self.handle);
        }
    }
}

/// Control loop waiting for the dispatcher to call the service entry point
static PENDING_DISPATCH: Mutex<Option<ControlLoop>> = Mutex::new(None);

define_windows_service!(ffi_service_main, service_main);

fn service_main(_arguments: Vec<OsString>) {
    let control_loop = PENDING_DISPATCH
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take();
    let Some(control_loop) = control_loop else {
        error!("Service entry point called without a pending control loop");
        return;
    };
    if let Err(e) = run_service(control_loop) {
        error!("Service failed: {}", e);
    }
}

fn run_service(control_loop: ControlLoop) -> Result<()> {
    let name = control_loop.service_name().to_string();
    let (tx, rx) = mpsc::unbounded_channel();

    let event_handler = move |control| -> ServiceControlHandlerResult {
        let signal = match control {
            ServiceControl::Stop => ControlSignal::Stop,
            ServiceControl::Shutdown => ControlSignal::Shutdown,
            ServiceControl::Interrogate => ControlSignal::Interrogate,
            _ => return ServiceControlHandlerResult::NotImplemented,
        };
        // Receiver gone means the loop already finished
        let _ = tx.send(signal);
        ServiceControlHandlerResult::NoError
    };

    let status_handle = service_control_handler::register(&name, event_handler)
        .map_err(|e| manager_error("register service control handler", &e))?;
    let reporter = ScmReporter {
        handle: Mutex::new(status_handle),
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| ServiceError::Dispatch(format!("failed to create runtime: {}", e)))?;

    info!("Service {} dispatched by the service manager", name);
    runtime.block_on(control_loop.run(rx, &reporter));
    Ok(())
}

struct ScmReporter {
    handle: Mutex<service_control_handler::ServiceStatusHandle>,
}

impl StatusReporter for ScmReporter {
    fn report(&self, status: &StatusReport) {
        let mut controls_accepted = ServiceControlAccept::empty();
        for signal in status.accepts {
            match signal {
                ControlSignal::Stop => controls_accepted |= ServiceControlAccept::STOP,
                ControlSignal::Shutdown => controls_accepted |= ServiceControlAccept::SHUTDOWN,
                _ => {}
            }
        }
        let current_state = match status.state {
            RuntimeState::Stopped => ServiceState::Stopped,
            RuntimeState::StartPending => ServiceState::StartPending,
            RuntimeState::StopPending => ServiceState::StopPending,
            RuntimeState::Running => ServiceState::Running,
            RuntimeState::Other(_) => return,
        };
        let exit_code = match status.exit_code {
            ExitCode::Win32(code) => ServiceExitCode::Win32(code),
            ExitCode::ServiceSpecific(code) => ServiceExitCode::ServiceSpecific(code),
        };

        let handle = self.handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = handle.set_service_status(WinServiceStatus {
            service_type: ServiceType::OWN_PROCESS,
            current_state,
            controls_accepted,
            exit_code,
            checkpoint: 0,
            wait_hint: Duration::default(),
            process_id: None,
        }) {
            warn!("Failed to report service status {:?}: {}", status.state, e);
        }
    }
}
