//! In-memory service manager
//!
//! Behaves like the Windows Service Control Manager closely enough to drive
//! the controller end to end without privileges: entries, processes, log
//! sources, recovery actions and control dispatch are all simulated. Every
//! call is recorded, and open sessions/handles are counted so callers can
//! check that nothing leaks.

use super::{ManagerSession, ServiceEntry, ServiceManager, ServiceSpec, DEFAULT_STOP_TIMEOUT};
use crate::control_loop::{ControlLoop, StatusReporter};
use crate::error::{Result, ServiceError};
use crate::process::ProcessTerminator;
use crate::status::{ControlSignal, RecoveryAction, RuntimeState, ServiceStatus, StatusReport};
use async_trait::async_trait;
use log::debug;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// How a simulated service process reacts to a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBehavior {
    /// Reaches Stopped this long after the request
    After(Duration),
    /// Stays in StopPending until terminated
    Never,
    /// The manager rejects the stop control
    Reject,
}

/// A simulated service entry
#[derive(Debug, Clone)]
pub struct MemoryService {
    pub spec: ServiceSpec,
    pub recovery: RecoveryAction,
    pub starts: usize,
    state: RuntimeState,
    process_id: u32,
    stop_requested_at: Option<Instant>,
}

impl MemoryService {
    pub fn status(&self) -> ServiceStatus {
        ServiceStatus::new(self.state, self.process_id)
    }

    fn refresh(&mut self, behavior: StopBehavior) {
        if self.state != RuntimeState::StopPending {
            return;
        }
        if let (StopBehavior::After(delay), Some(at)) = (behavior, self.stop_requested_at) {
            if Instant::now() >= at + delay {
                self.mark_stopped();
            }
        }
    }

    fn mark_stopped(&mut self) {
        self.state = RuntimeState::Stopped;
        self.process_id = 0;
        self.stop_requested_at = None;
    }
}

#[derive(Debug)]
struct MemoryState {
    services: HashMap<String, MemoryService>,
    log_sources: HashSet<String>,
    deny_access: bool,
    fail_log_registration: bool,
    fail_log_removal: bool,
    fail_delete: bool,
    dispatch_error: Option<String>,
    stop_behavior: StopBehavior,
    stop_timeout: Duration,
    next_pid: u32,
    open_sessions: usize,
    open_handles: usize,
    calls: Vec<&'static str>,
    terminated: Vec<u32>,
    script: Vec<ControlSignal>,
    reports: Vec<StatusReport>,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            services: HashMap::new(),
            log_sources: HashSet::new(),
            deny_access: false,
            fail_log_registration: false,
            fail_log_removal: false,
            fail_delete: false,
            dispatch_error: None,
            stop_behavior: StopBehavior::After(Duration::from_millis(250)),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            next_pid: 1000,
            open_sessions: 0,
            open_handles: 0,
            calls: Vec::new(),
            terminated: Vec::new(),
            script: Vec::new(),
            reports: Vec::new(),
        }
    }
}

/// Shared handle to one simulated service manager
#[derive(Debug, Clone, Default)]
pub struct InMemoryManager {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `connect` fail as if the process lacked privileges
    pub fn deny_access(&self, deny: bool) {
        self.lock().deny_access = deny;
    }

    pub fn fail_log_registration(&self, fail: bool) {
        self.lock().fail_log_registration = fail;
    }

    pub fn fail_log_removal(&self, fail: bool) {
        self.lock().fail_log_removal = fail;
    }

    pub fn fail_delete(&self, fail: bool) {
        self.lock().fail_delete = fail;
    }

    /// Make `dispatch` report a dispatcher failure after the loop returns
    pub fn fail_dispatch(&self, message: impl Into<String>) {
        self.lock().dispatch_error = Some(message.into());
    }

    pub fn set_stop_behavior(&self, behavior: StopBehavior) {
        self.lock().stop_behavior = behavior;
    }

    pub fn set_stop_timeout(&self, timeout: Duration) {
        self.lock().stop_timeout = timeout;
    }

    /// Control signals delivered to the next dispatched control loop. The
    /// channel closes after the last one.
    pub fn script_signals(&self, signals: impl IntoIterator<Item = ControlSignal>) {
        self.lock().script = signals.into_iter().collect();
    }

    /// Terminator acting on the simulated processes
    pub fn terminator(&self) -> MemoryTerminator {
        MemoryTerminator {
            manager: self.clone(),
        }
    }

    pub fn is_installed(&self, name: &str) -> bool {
        self.lock().services.contains_key(name)
    }

    pub fn has_log_source(&self, name: &str) -> bool {
        self.lock().log_sources.contains(name)
    }

    pub fn service(&self, name: &str) -> Option<MemoryService> {
        let mut state = self.lock();
        let behavior = state.stop_behavior;
        state.services.get_mut(name).map(|service| {
            service.refresh(behavior);
            service.clone()
        })
    }

    pub fn open_sessions(&self) -> usize {
        self.lock().open_sessions
    }

    pub fn open_handles(&self) -> usize {
        self.lock().open_handles
    }

    /// Names of the gateway operations called so far, in order
    pub fn calls(&self) -> Vec<&'static str> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Process ids terminated through [`MemoryTerminator`]
    pub fn terminated(&self) -> Vec<u32> {
        self.lock().terminated.clone()
    }

    /// Status reports received from dispatched control loops
    pub fn reports(&self) -> Vec<StatusReport> {
        self.lock().reports.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, call: &'static str) -> MutexGuard<'_, MemoryState> {
        let mut state = self.lock();
        state.calls.push(call);
        state
    }
}

#[async_trait]
impl ServiceManager for InMemoryManager {
    fn connect(&self) -> Result<Box<dyn ManagerSession + '_>> {
        let mut state = self.record("connect");
        if state.deny_access {
            return Err(ServiceError::PermissionDenied);
        }
        state.open_sessions += 1;
        Ok(Box::new(MemorySession { manager: self }))
    }

    fn register_log_source(&self, name: &str) -> Result<()> {
        let mut state = self.record("register_log_source");
        if state.fail_log_registration || state.log_sources.contains(name) {
            return Err(ServiceError::Manager(format!(
                "Application\\{} registry key already exists",
                name
            )));
        }
        state.log_sources.insert(name.to_string());
        Ok(())
    }

    fn remove_log_source(&self, name: &str) -> Result<()> {
        let mut state = self.record("remove_log_source");
        if state.fail_log_removal || !state.log_sources.remove(name) {
            return Err(ServiceError::Manager(format!(
                "Application\\{} registry key cannot be deleted",
                name
            )));
        }
        Ok(())
    }

    fn stop_timeout(&self) -> Duration {
        self.lock().stop_timeout
    }

    async fn dispatch(&self, name: &str, control_loop: ControlLoop) -> Result<()> {
        let script = std::mem::take(&mut self.record("dispatch").script);
        debug!("Dispatching {} with {} scripted signals", name, script.len());

        let (tx, rx) = mpsc::unbounded_channel();
        for signal in script {
            // Receiver is alive until the loop below returns
            let _ = tx.send(signal);
        }
        drop(tx);

        let reporter = MemoryReporter {
            manager: self.clone(),
        };
        control_loop.run(rx, &reporter).await;

        match self.lock().dispatch_error.take() {
            Some(message) => Err(ServiceError::Dispatch(message)),
            None => Ok(()),
        }
    }
}

struct MemorySession<'a> {
    manager: &'a InMemoryManager,
}

impl Drop for MemorySession<'_> {
    fn drop(&mut self) {
        self.manager.lock().open_sessions -= 1;
    }
}

impl ManagerSession for MemorySession<'_> {
    fn open(&self, name: &str) -> Result<Box<dyn ServiceEntry + '_>> {
        let mut state = self.manager.record("open");
        if !state.services.contains_key(name) {
            return Err(ServiceError::NotInstalled(name.to_string()));
        }
        state.open_handles += 1;
        Ok(Box::new(MemoryEntry {
            manager: self.manager,
            name: name.to_string(),
        }))
    }

    fn create(&self, spec: &ServiceSpec) -> Result<Box<dyn ServiceEntry + '_>> {
        let mut state = self.manager.record("create");
        if state.services.contains_key(&spec.name) {
            return Err(ServiceError::AlreadyExists(spec.name.clone()));
        }
        state.services.insert(
            spec.name.clone(),
            MemoryService {
                spec: spec.clone(),
                recovery: RecoveryAction::None,
                starts: 0,
                state: RuntimeState::Stopped,
                process_id: 0,
                stop_requested_at: None,
            },
        );
        state.open_handles += 1;
        Ok(Box::new(MemoryEntry {
            manager: self.manager,
            name: spec.name.clone(),
        }))
    }
}

struct MemoryEntry<'a> {
    manager: &'a InMemoryManager,
    name: String,
}

impl MemoryEntry<'_> {
    fn with_service<T>(
        &self,
        call: &'static str,
        f: impl FnOnce(&mut MemoryService, StopBehavior, &mut u32) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.manager.record(call);
        let behavior = state.stop_behavior;
        let MemoryState {
            services, next_pid, ..
        } = &mut *state;
        let service = services
            .get_mut(&self.name)
            .ok_or_else(|| ServiceError::NotInstalled(self.name.clone()))?;
        service.refresh(behavior);
        f(service, behavior, next_pid)
    }
}

impl Drop for MemoryEntry<'_> {
    fn drop(&mut self) {
        self.manager.lock().open_handles -= 1;
    }
}

impl ServiceEntry for MemoryEntry<'_> {
    fn query(&self) -> Result<ServiceStatus> {
        self.with_service("query", |service, _, _| Ok(service.status()))
    }

    fn start(&self) -> Result<()> {
        self.with_service("start", |service, _, next_pid| {
            if service.state != RuntimeState::Stopped {
                return Err(ServiceError::Manager(
                    "An instance of the service is already running".to_string(),
                ));
            }
            service.state = RuntimeState::Running;
            service.process_id = *next_pid;
            service.starts += 1;
            *next_pid += 1;
            Ok(())
        })
    }

    fn control(&self, signal: ControlSignal) -> Result<ServiceStatus> {
        self.with_service("control", |service, behavior, _| match signal {
            ControlSignal::Interrogate => Ok(service.status()),
            ControlSignal::Stop => match service.state {
                RuntimeState::Stopped => Err(ServiceError::Manager(
                    "The service has not been started".to_string(),
                )),
                RuntimeState::Running if behavior != StopBehavior::Reject => {
                    service.state = RuntimeState::StopPending;
                    service.stop_requested_at = Some(Instant::now());
                    service.refresh(behavior);
                    Ok(service.status())
                }
                _ => Err(ServiceError::ControlRejected(
                    "The requested control is not valid for this service".to_string(),
                )),
            },
            other => Err(ServiceError::ControlRejected(format!(
                "{:?} is not accepted by {}",
                other, service.spec.name
            ))),
        })
    }

    fn set_recovery_action(&self, action: RecoveryAction) -> Result<()> {
        self.with_service("set_recovery_action", |service, _, _| {
            service.recovery = action;
            Ok(())
        })
    }

    fn delete(&self) -> Result<()> {
        let mut state = self.manager.record("delete");
        if state.fail_delete {
            return Err(ServiceError::Manager(
                "The specified service has already been marked for deletion".to_string(),
            ));
        }
        state
            .services
            .remove(&self.name)
            .map(|_| ())
            .ok_or_else(|| ServiceError::NotInstalled(self.name.clone()))
    }
}

/// Terminates simulated service processes
#[derive(Debug, Clone)]
pub struct MemoryTerminator {
    manager: InMemoryManager,
}

impl ProcessTerminator for MemoryTerminator {
    fn terminate(&self, pid: u32) -> Result<()> {
        let mut state = self.manager.lock();
        let service = state
            .services
            .values_mut()
            .find(|service| pid != 0 && service.process_id == pid)
            .ok_or(ServiceError::ProcessNotFound(pid))?;
        service.mark_stopped();
        state.terminated.push(pid);
        Ok(())
    }
}

struct MemoryReporter {
    manager: InMemoryManager,
}

impl StatusReporter for MemoryReporter {
    fn report(&self, status: &StatusReport) {
        self.manager.lock().reports.push(status.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn spec(name: &str) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            display_name: name.to_string(),
            description: String::new(),
            executable: PathBuf::from("svc.exe"),
            arguments: Vec::new(),
            start_type: super::super::StartType::Automatic,
            account: None,
            password: None,
        }
    }

    #[test]
    fn test_handles_released_on_drop() {
        let manager = InMemoryManager::new();
        {
            let session = manager.connect().unwrap();
            let _entry = session.create(&spec("svcA")).unwrap();
            assert_eq!(manager.open_sessions(), 1);
            assert_eq!(manager.open_handles(), 1);
            assert!(session.open("missing").is_err());
            assert_eq!(manager.open_handles(), 1);
        }
        assert_eq!(manager.open_sessions(), 0);
        assert_eq!(manager.open_handles(), 0);
    }

    #[test]
    fn test_denied_connect() {
        let manager = InMemoryManager::new();
        manager.deny_access(true);
        assert!(matches!(manager.connect(), Err(ServiceError::PermissionDenied)));
        assert_eq!(manager.open_sessions(), 0);
        assert_eq!(manager.calls(), vec!["connect"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_after_delay() {
        let manager = InMemoryManager::new();
        manager.set_stop_behavior(StopBehavior::After(Duration::from_millis(500)));
        let session = manager.connect().unwrap();
        let entry = session.create(&spec("svcA")).unwrap();

        entry.start().unwrap();
        let running = entry.query().unwrap();
        assert_eq!(running.state, RuntimeState::Running);
        assert_ne!(running.process_id, 0);

        let status = entry.control(ControlSignal::Stop).unwrap();
        assert_eq!(status.state, RuntimeState::StopPending);
        assert!(entry.control(ControlSignal::Stop).unwrap_err().is_control_rejection());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(entry.query().unwrap(), ServiceStatus::stopped());
    }

    #[test]
    fn test_terminator_stops_process() {
        let manager = InMemoryManager::new();
        manager.set_stop_behavior(StopBehavior::Never);
        let session = manager.connect().unwrap();
        let entry = session.create(&spec("svcA")).unwrap();
        entry.start().unwrap();
        let pid = entry.query().unwrap().process_id;

        manager.terminator().terminate(pid).unwrap();
        assert_eq!(entry.query().unwrap().state, RuntimeState::Stopped);
        assert_eq!(manager.terminated(), vec![pid]);
        assert!(matches!(
            manager.terminator().terminate(pid),
            Err(ServiceError::ProcessNotFound(_))
        ));
    }

    #[test]
    fn test_log_sources() {
        let manager = InMemoryManager::new();
        manager.register_log_source("svcA").unwrap();
        assert!(manager.has_log_source("svcA"));
        assert!(manager.register_log_source("svcA").is_err());
        manager.remove_log_source("svcA").unwrap();
        assert!(manager.remove_log_source("svcA").is_err());
    }
}
