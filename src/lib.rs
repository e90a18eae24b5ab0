//! infinisvc - service lifecycle controller
//!
//! Registers a long-running workload with the native service manager,
//! drives it through the manager's start/stop state machine and stops it
//! reliably, terminating the process when a graceful stop hangs.

pub mod config;
pub mod control_loop;
pub mod controller;
pub mod error;
pub mod error_box;
pub mod escalation;
pub mod manager;
pub mod platform;
pub mod process;
pub mod signal;
pub mod status;
pub mod workload;

pub use config::{ServiceConfig, ShutdownContext, ShutdownTrigger};
pub use controller::{ServiceController, ServiceView};
pub use error::{Result, ServiceError};
pub use manager::{InMemoryManager, ServiceManager};
#[cfg(target_os = "windows")]
pub use manager::WindowsServiceManager;
pub use status::{ControlSignal, RuntimeState};
pub use workload::{Heartbeat, Workload};
