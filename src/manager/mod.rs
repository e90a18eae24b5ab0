//! Gateway to the operating system's service manager
//!
//! The controller never talks to the OS directly. It goes through these
//! traits so the Windows Service Control Manager and the in-memory manager
//! used in tests are interchangeable.
//!
//! Sessions and entries are scoped: the underlying OS handles are released
//! when the boxed value is dropped, so every early return releases them.

use crate::config::ServiceConfig;
use crate::control_loop::ControlLoop;
use crate::error::{Result, ServiceError};
use crate::status::{ControlSignal, RecoveryAction, ServiceStatus};
use async_trait::async_trait;
use log::debug;
use std::path::PathBuf;
use std::time::Duration;

pub mod memory;
#[cfg(target_os = "windows")]
pub mod windows;

pub use memory::{InMemoryManager, StopBehavior};
#[cfg(target_os = "windows")]
pub use windows::WindowsServiceManager;

/// Stop timeout used when the platform setting is missing or unreadable
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_millis(20_000);

/// Capability over the OS service manager
#[async_trait]
pub trait ServiceManager: Send + Sync {
    /// Open a manager session. Fails with `PermissionDenied` when the OS
    /// reports access denied.
    fn connect(&self) -> Result<Box<dyn ManagerSession + '_>>;

    /// Register the event log source for a service
    fn register_log_source(&self, name: &str) -> Result<()>;

    fn remove_log_source(&self, name: &str) -> Result<()>;

    /// Configured time the manager grants a service to stop
    fn stop_timeout(&self) -> Duration;

    /// Hand the control loop to the manager's dispatcher and wait until the
    /// loop has finished
    async fn dispatch(&self, name: &str, control_loop: ControlLoop) -> Result<()>;
}

/// An open manager session
pub trait ManagerSession {
    /// Open an existing entry. Fails with `NotInstalled` when absent.
    fn open(&self, name: &str) -> Result<Box<dyn ServiceEntry + '_>>;

    /// Create a new entry
    fn create(&self, spec: &ServiceSpec) -> Result<Box<dyn ServiceEntry + '_>>;
}

/// An open handle to a registered service
pub trait ServiceEntry {
    fn query(&self) -> Result<ServiceStatus>;

    fn start(&self) -> Result<()>;

    /// Send a control request. Fails with `ControlRejected` when the control
    /// is not valid in the current state.
    fn control(&self, signal: ControlSignal) -> Result<ServiceStatus>;

    fn set_recovery_action(&self, action: RecoveryAction) -> Result<()>;

    /// Delete the registration
    fn delete(&self) -> Result<()>;
}

/// Start type of a registered service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartType {
    Automatic,
    Manual,
}

/// Everything needed to create a service entry
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSpec {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub executable: PathBuf,
    pub arguments: Vec<String>,
    pub start_type: StartType,
    pub account: Option<String>,
    pub password: Option<String>,
}

impl ServiceSpec {
    /// Build the entry description from a config, resolving the executable
    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        let executable = match &config.executable {
            Some(path) => path.clone(),
            None => std::env::current_exe().map_err(|e| {
                ServiceError::Manager(format!("failed to resolve executable path: {}", e))
            })?,
        };

        Ok(Self {
            name: config.name.clone(),
            display_name: config.display_name().to_string(),
            description: config.description.clone(),
            executable,
            arguments: config.arguments.clone(),
            start_type: StartType::Automatic,
            account: config.user_name.clone(),
            password: config.password().map(str::to_string),
        })
    }
}

/// Parse a stop timeout setting in milliseconds, falling back to
/// [`DEFAULT_STOP_TIMEOUT`]
pub fn stop_timeout_from(raw: Option<&str>) -> Duration {
    match raw.map(str::trim).map(str::parse::<u64>) {
        Some(Ok(millis)) => Duration::from_millis(millis),
        Some(Err(e)) => {
            debug!("Invalid stop timeout setting ({}), using default", e);
            DEFAULT_STOP_TIMEOUT
        }
        None => DEFAULT_STOP_TIMEOUT,
    }
}
