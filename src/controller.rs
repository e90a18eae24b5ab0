//! Service controller: install, uninstall, start, stop, restart, status and
//! run for a single service

use crate::config::ServiceConfig;
use crate::control_loop::ControlLoop;
use crate::error::{Result, ServiceError};
use crate::error_box::ErrorBox;
use crate::escalation::{self, StopOutcome};
use crate::manager::{ServiceEntry, ServiceManager, ServiceSpec};
use crate::platform;
use crate::process::{ProcessTerminator, SystemTerminator};
use crate::signal;
use crate::status::{RecoveryAction, ServiceStatus};
use crate::workload::Workload;
use log::{debug, info, warn};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

type SignalFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Produces the future an interactive run races against its context
type KillSignal = Arc<dyn Fn() -> SignalFuture + Send + Sync>;

/// Read-only view of a controlled service, handed to the workload
pub struct ServiceView {
    manager: Arc<dyn ServiceManager>,
    config: ServiceConfig,
}

impl ServiceView {
    pub fn new(manager: Arc<dyn ServiceManager>, config: ServiceConfig) -> Self {
        Self { manager, config }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Current state label: "Running", "StopPending", "Stop", or the raw
    /// state code. Failures are described in the returned text.
    pub fn status(&self) -> String {
        let session = match self.manager.connect() {
            Ok(session) => session,
            Err(e) => return format!("Unknown: {}", e),
        };
        let status: Result<ServiceStatus> = session
            .open(&self.config.name)
            .and_then(|entry| entry.query());

        match status {
            Ok(status) => status.state.label(),
            Err(e) => {
                debug!("Status lookup of {} failed: {}", self.config.name, e);
                e.to_string()
            }
        }
    }
}

impl fmt::Display for ServiceView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.config.display_name())
    }
}

/// Facade over the service manager for one configured service.
///
/// Administrative calls open their manager session and service handle for
/// the duration of the call only. Callers must not run two of them
/// concurrently on the same controller.
pub struct ServiceController {
    manager: Arc<dyn ServiceManager>,
    workload: Arc<dyn Workload>,
    view: Arc<ServiceView>,
    interactive: bool,
    terminator: Arc<dyn ProcessTerminator>,
    kill_signal: KillSignal,
    errors: Arc<ErrorBox>,
}

impl ServiceController {
    /// `interactive` comes from [`platform::detect_interactive`] and selects
    /// the run strategy
    pub fn new(
        manager: Arc<dyn ServiceManager>,
        workload: Arc<dyn Workload>,
        config: ServiceConfig,
        interactive: bool,
    ) -> Self {
        Self {
            view: Arc::new(ServiceView::new(manager.clone(), config)),
            manager,
            workload,
            interactive,
            terminator: Arc::new(SystemTerminator),
            kill_signal: Arc::new(|| -> SignalFuture { Box::pin(signal::wait_for_kill_signal()) }),
            errors: Arc::new(ErrorBox::new()),
        }
    }

    /// Replace the terminator used when a stop has to be forced
    pub fn with_terminator(mut self, terminator: Arc<dyn ProcessTerminator>) -> Self {
        self.terminator = terminator;
        self
    }

    /// Replace the termination signal an interactive run waits for
    pub fn with_kill_signal<F, Fut>(mut self, kill_signal: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.kill_signal = Arc::new(move || -> SignalFuture { Box::pin(kill_signal()) });
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        self.view.config()
    }

    /// The view handed to the workload
    pub fn view(&self) -> &ServiceView {
        &self.view
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    pub fn platform(&self) -> &'static str {
        platform::platform_name()
    }

    /// Register the service with automatic start and its event log source
    pub fn install(&self) -> Result<()> {
        let config = self.config();
        let name = &config.name;
        info!("Installing service {}", name);

        let session = self.manager.connect()?;
        match session.open(name) {
            Ok(_) => return Err(ServiceError::AlreadyExists(name.clone())),
            Err(ServiceError::NotInstalled(_)) => {}
            Err(e) => return Err(e),
        }

        let spec = ServiceSpec::from_config(config)?;
        let entry = session.create(&spec)?;

        if let Err(e) = self.manager.register_log_source(name) {
            warn!("Event log source registration for {} failed, removing the service entry", name);
            return Err(match entry.delete() {
                Ok(()) => ServiceError::LogSourceRegistration {
                    name: name.clone(),
                    reason: e.to_string(),
                },
                Err(rollback) => ServiceError::RollbackFailed {
                    name: name.clone(),
                    reason: e.to_string(),
                    rollback: rollback.to_string(),
                },
            });
        }

        if config.restart_on_failure {
            if let Err(e) = entry.set_recovery_action(RecoveryAction::restart_immediately()) {
                warn!("Failed to set restart on failure for {}: {}", name, e);
            }
        }

        info!("Service {} installed ({})", name, spec.executable.display());
        Ok(())
    }

    /// Stop the service if it runs, then remove the registration and the
    /// event log source
    pub async fn uninstall(&self) -> Result<()> {
        let name = &self.config().name;
        info!("Uninstalling service {}", name);

        {
            let session = self.manager.connect()?;
            let entry = session.open(name)?;
            if let Err(e) = self.stop_entry(entry.as_ref()).await {
                debug!("Stop before uninstall of {} failed: {}", name, e);
            }
            entry.delete()?;
        }

        self.manager
            .remove_log_source(name)
            .map_err(|e| ServiceError::LogSourceRemoval {
                name: name.clone(),
                reason: e.to_string(),
            })?;

        info!("Service {} uninstalled", name);
        Ok(())
    }

    pub fn start(&self) -> Result<()> {
        let name = &self.config().name;
        info!("Starting service {}", name);

        let session = self.manager.connect()?;
        let entry = session.open(name)?;
        if self.config().restart_on_failure {
            entry.set_recovery_action(RecoveryAction::restart_immediately())?;
        }
        entry.start()?;

        info!("Service {} started", name);
        Ok(())
    }

    /// Stop the service, forcing termination when it does not stop within
    /// the manager's stop timeout
    pub async fn stop(&self) -> Result<()> {
        let name = &self.config().name;
        info!("Stopping service {}", name);

        let session = self.manager.connect()?;
        let entry = session.open(name)?;
        let outcome = self.stop_entry(entry.as_ref()).await?;

        info!("Service {} stopped ({:?})", name, outcome);
        Ok(())
    }

    pub async fn restart(&self) -> Result<()> {
        self.stop().await?;
        self.start()
    }

    /// See [`ServiceView::status`]
    pub fn status(&self) -> String {
        self.view.status()
    }

    /// Run the workload.
    ///
    /// Under the service manager the control loop is dispatched and a
    /// workload failure takes precedence over a dispatcher failure. In an
    /// interactive session the workload runs until a termination signal or
    /// the configured context cancels.
    pub async fn run(&self) -> Result<()> {
        self.errors.clear();
        let name = &self.config().name;

        if !self.interactive {
            let control_loop = ControlLoop::new(
                self.workload.clone(),
                self.view.clone(),
                self.errors.clone(),
            );
            let dispatched = self.manager.dispatch(name, control_loop).await;
            if let Some(e) = self.errors.take() {
                return Err(e);
            }
            return dispatched;
        }

        info!("Running {} interactively", name);
        self.workload
            .start(&self.view)
            .await
            .map_err(ServiceError::Workload)?;

        tokio::select! {
            _ = (self.kill_signal)() => info!("Termination signal received"),
            _ = self.config().context.cancelled() => info!("Run context cancelled"),
        }

        self.workload
            .stop(&self.view)
            .await
            .map_err(ServiceError::Workload)
    }

    async fn stop_entry(&self, entry: &dyn ServiceEntry) -> Result<StopOutcome> {
        if self.config().restart_on_failure {
            entry.set_recovery_action(RecoveryAction::None)?;
        }
        escalation::stop_and_wait(entry, self.terminator.as_ref(), self.manager.stop_timeout()).await
    }
}

impl fmt::Display for ServiceController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.view.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShutdownContext;
    use crate::control_loop::tests::CountingWorkload;
    use crate::manager::{InMemoryManager, StopBehavior};
    use crate::status::{ControlSignal, ExitCode, RuntimeState};
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::time::Instant;

    fn controller(manager: &InMemoryManager, config: ServiceConfig) -> ServiceController {
        controller_with(manager, config, Arc::new(CountingWorkload::default()), false)
    }

    fn controller_with(
        manager: &InMemoryManager,
        config: ServiceConfig,
        workload: Arc<CountingWorkload>,
        interactive: bool,
    ) -> ServiceController {
        ServiceController::new(Arc::new(manager.clone()), workload, config, interactive)
            .with_terminator(Arc::new(manager.terminator()))
    }

    fn svc_a() -> ServiceConfig {
        ServiceConfig::new("svcA").with_executable(r"C:\svcA\svcA.exe")
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_scenario() {
        let manager = InMemoryManager::new();
        let svc = controller(&manager, svc_a());

        svc.install().unwrap();
        assert!(manager.is_installed("svcA"));
        assert!(manager.has_log_source("svcA"));
        assert_eq!(svc.status(), "Stop");

        svc.start().unwrap();
        assert_eq!(svc.status(), "Running");

        svc.stop().await.unwrap();
        assert_eq!(svc.status(), "Stop");
        assert!(manager.terminated().is_empty());

        svc.uninstall().await.unwrap();
        assert!(!manager.is_installed("svcA"));
        assert!(!manager.has_log_source("svcA"));
        assert_eq!(svc.status(), "Service svcA is not installed");

        assert_eq!(manager.open_sessions(), 0);
        assert_eq!(manager.open_handles(), 0);
    }

    #[test]
    fn test_install_twice_already_exists() {
        let manager = InMemoryManager::new();
        let svc = controller(&manager, svc_a());
        svc.install().unwrap();

        manager.clear_calls();
        let err = svc.install().unwrap_err();
        assert!(matches!(err, ServiceError::AlreadyExists(ref name) if name == "svcA"));
        assert_eq!(manager.calls(), vec!["connect", "open"]);
        assert_eq!(manager.open_handles(), 0);
    }

    #[test]
    fn test_install_entry_settings() {
        let manager = InMemoryManager::new();
        let config = svc_a()
            .with_display_name("Service A")
            .with_description("Sample service")
            .with_arguments(["run"])
            .with_user(r".\svc-user", Some("pw"));
        controller(&manager, config).install().unwrap();

        let service = manager.service("svcA").unwrap();
        assert_eq!(service.spec.display_name, "Service A");
        assert_eq!(service.spec.description, "Sample service");
        assert_eq!(service.spec.arguments, vec!["run"]);
        assert_eq!(service.spec.account.as_deref(), Some(r".\svc-user"));
        assert_eq!(service.spec.password.as_deref(), Some("pw"));
        assert_eq!(service.recovery, RecoveryAction::None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uninstall_not_installed() {
        let manager = InMemoryManager::new();
        let svc = controller(&manager, svc_a());

        assert!(matches!(svc.uninstall().await, Err(ServiceError::NotInstalled(_))));

        svc.install().unwrap();
        svc.uninstall().await.unwrap();
        assert!(matches!(svc.uninstall().await, Err(ServiceError::NotInstalled(_))));
        assert!(!manager.has_log_source("svcA"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop_not_installed() {
        let manager = InMemoryManager::new();
        let svc = controller(&manager, svc_a());

        assert!(matches!(svc.start(), Err(ServiceError::NotInstalled(_))));
        assert!(matches!(svc.stop().await, Err(ServiceError::NotInstalled(_))));
        assert!(matches!(svc.restart().await, Err(ServiceError::NotInstalled(_))));
    }

    #[test]
    fn test_log_source_failure_rolls_back_entry() {
        let manager = InMemoryManager::new();
        manager.fail_log_registration(true);
        let svc = controller(&manager, svc_a());

        let err = svc.install().unwrap_err();
        assert!(matches!(err, ServiceError::LogSourceRegistration { .. }));
        assert!(!manager.is_installed("svcA"));
        assert_eq!(manager.open_handles(), 0);
        assert_eq!(manager.open_sessions(), 0);
    }

    #[test]
    fn test_failed_rollback_is_reported() {
        let manager = InMemoryManager::new();
        manager.fail_log_registration(true);
        manager.fail_delete(true);
        let svc = controller(&manager, svc_a());

        let err = svc.install().unwrap_err();
        assert!(matches!(err, ServiceError::RollbackFailed { .. }));
        assert!(err.to_string().contains("marked for deletion"));
        assert!(manager.is_installed("svcA"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_source_removal_failure_after_delete() {
        let manager = InMemoryManager::new();
        let svc = controller(&manager, svc_a());
        svc.install().unwrap();

        manager.fail_log_removal(true);
        let err = svc.uninstall().await.unwrap_err();
        assert!(matches!(err, ServiceError::LogSourceRemoval { .. }));
        assert!(!manager.is_installed("svcA"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_uninstall_stops_running_service() {
        let manager = InMemoryManager::new();
        let svc = controller(&manager, svc_a());
        svc.install().unwrap();
        svc.start().unwrap();

        svc.uninstall().await.unwrap();
        assert!(!manager.is_installed("svcA"));
        assert!(manager.terminated().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_makes_no_further_calls() {
        let manager = InMemoryManager::new();
        manager.deny_access(true);
        let svc = controller(&manager, svc_a());

        assert!(matches!(svc.install(), Err(ServiceError::PermissionDenied)));
        assert_eq!(manager.calls(), vec!["connect"]);

        manager.clear_calls();
        assert!(matches!(svc.start(), Err(ServiceError::PermissionDenied)));
        assert_eq!(manager.calls(), vec!["connect"]);

        manager.clear_calls();
        assert!(matches!(svc.stop().await, Err(ServiceError::PermissionDenied)));
        assert_eq!(manager.calls(), vec!["connect"]);

        manager.clear_calls();
        assert!(matches!(svc.restart().await, Err(ServiceError::PermissionDenied)));
        assert_eq!(manager.calls(), vec!["connect"]);

        manager.clear_calls();
        assert!(matches!(svc.uninstall().await, Err(ServiceError::PermissionDenied)));
        assert_eq!(manager.calls(), vec!["connect"]);

        manager.clear_calls();
        let status = svc.status();
        assert!(status.starts_with("Unknown: Permission denied"), "{}", status);
        assert_eq!(manager.calls(), vec!["connect"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_policy_toggles_recovery() {
        let manager = InMemoryManager::new();
        let svc = controller(&manager, svc_a().with_restart_on_failure(true));

        svc.install().unwrap();
        assert_eq!(manager.service("svcA").unwrap().recovery, RecoveryAction::restart_immediately());

        svc.start().unwrap();
        svc.stop().await.unwrap();
        assert_eq!(manager.service("svcA").unwrap().recovery, RecoveryAction::None);

        svc.start().unwrap();
        assert_eq!(manager.service("svcA").unwrap().recovery, RecoveryAction::restart_immediately());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_stops_then_starts() {
        let manager = InMemoryManager::new();
        let svc = controller(&manager, svc_a());
        svc.install().unwrap();
        svc.start().unwrap();

        svc.restart().await.unwrap();
        let service = manager.service("svcA").unwrap();
        assert_eq!(service.starts, 2);
        assert_eq!(service.status().state, RuntimeState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_aborts_when_stop_fails() {
        let manager = InMemoryManager::new();
        let svc = controller(&manager, svc_a());
        svc.install().unwrap();

        // Never started, so the stop request fails
        assert!(matches!(svc.restart().await, Err(ServiceError::Manager(_))));
        assert_eq!(manager.service("svcA").unwrap().starts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_service_is_terminated() {
        let manager = InMemoryManager::new();
        let stop_timeout = Duration::from_secs(2);
        manager.set_stop_behavior(StopBehavior::Never);
        manager.set_stop_timeout(stop_timeout);
        let svc = controller(&manager, svc_a());
        svc.install().unwrap();
        svc.start().unwrap();
        let pid = manager.service("svcA").unwrap().status().process_id;

        let started = Instant::now();
        svc.stop().await.unwrap();

        assert!(started.elapsed() <= stop_timeout + escalation::TICK_INTERVAL * 2);
        assert_eq!(manager.terminated(), vec![pid]);
        assert_eq!(svc.status(), "Stop");
        assert_eq!(manager.open_handles(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_stop_falls_back_to_termination() {
        let manager = InMemoryManager::new();
        manager.set_stop_behavior(StopBehavior::Reject);
        let svc = controller(&manager, svc_a());
        svc.install().unwrap();
        svc.start().unwrap();
        let pid = manager.service("svcA").unwrap().status().process_id;

        svc.stop().await.unwrap();
        assert_eq!(manager.terminated(), vec![pid]);
        assert_eq!(svc.status(), "Stop");
    }

    #[tokio::test]
    async fn test_run_dispatches_control_loop() {
        let manager = InMemoryManager::new();
        manager.script_signals([ControlSignal::Interrogate, ControlSignal::Stop]);
        let workload = Arc::new(CountingWorkload::default());
        let svc = controller_with(&manager, svc_a(), workload.clone(), false);

        svc.run().await.unwrap();

        assert_eq!(workload.starts.load(Ordering::SeqCst), 1);
        assert_eq!(workload.stops.load(Ordering::SeqCst), 1);
        let states: Vec<_> = manager.reports().iter().map(|r| r.state).collect();
        assert_eq!(
            states,
            vec![
                RuntimeState::StartPending,
                RuntimeState::Running,
                RuntimeState::Running,
                RuntimeState::StopPending,
                RuntimeState::Stopped,
            ]
        );
    }

    #[tokio::test]
    async fn test_run_prefers_workload_error_over_dispatch_error() {
        let manager = InMemoryManager::new();
        manager.fail_dispatch("dispatcher exited");
        let workload = Arc::new(CountingWorkload {
            fail_start: true,
            ..Default::default()
        });
        let svc = controller_with(&manager, svc_a(), workload, false);

        let err = svc.run().await.unwrap_err();
        assert!(matches!(err, ServiceError::Workload(_)));
        assert_eq!(err.to_string(), "start exploded");
        let last = manager.reports().last().cloned().unwrap();
        assert_eq!(last.exit_code, ExitCode::ServiceSpecific(1));
    }

    #[tokio::test]
    async fn test_run_reports_dispatch_error() {
        let manager = InMemoryManager::new();
        manager.fail_dispatch("dispatcher exited");
        manager.script_signals([ControlSignal::Stop]);
        let svc = controller(&manager, svc_a());

        let err = svc.run().await.unwrap_err();
        assert!(matches!(err, ServiceError::Dispatch(ref msg) if msg == "dispatcher exited"));

        // The box is cleared between runs
        manager.script_signals([ControlSignal::Shutdown]);
        svc.run().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_interactive_until_cancelled() {
        let manager = InMemoryManager::new();
        let (trigger, context) = ShutdownContext::new();
        let workload = Arc::new(CountingWorkload::default());
        let svc = controller_with(&manager, svc_a().with_context(context), workload.clone(), true)
            .with_kill_signal(std::future::pending::<()>);

        let run = svc.run();
        tokio::pin!(run);
        tokio::select! {
            _ = &mut run => panic!("run finished before cancellation"),
            _ = tokio::task::yield_now() => {}
        }
        assert_eq!(workload.starts.load(Ordering::SeqCst), 1);
        assert_eq!(workload.stops.load(Ordering::SeqCst), 0);

        trigger.cancel();
        run.await.unwrap();
        assert_eq!(workload.stops.load(Ordering::SeqCst), 1);
        assert!(manager.calls().is_empty());
    }

    #[tokio::test]
    async fn test_run_interactive_until_kill_signal() {
        let manager = InMemoryManager::new();
        let killed = Arc::new(Notify::new());
        let workload = Arc::new(CountingWorkload::default());
        let svc = {
            let killed = killed.clone();
            controller_with(&manager, svc_a(), workload.clone(), true).with_kill_signal(move || {
                let killed = killed.clone();
                async move { killed.notified().await }
            })
        };

        let run = svc.run();
        tokio::pin!(run);
        tokio::select! {
            _ = &mut run => panic!("run finished before the kill signal"),
            _ = tokio::task::yield_now() => {}
        }
        assert_eq!(workload.starts.load(Ordering::SeqCst), 1);
        assert_eq!(workload.stops.load(Ordering::SeqCst), 0);

        // The default context never cancels, so only the signal ends the run
        killed.notify_one();
        run.await.unwrap();
        assert_eq!(workload.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_workload_sees_service_view() {
        let manager = InMemoryManager::new();
        let workload = Arc::new(CountingWorkload {
            observe: true,
            ..Default::default()
        });
        let svc = controller_with(&manager, svc_a().with_display_name("Service A"), workload.clone(), true)
            .with_kill_signal(|| async {});
        svc.install().unwrap();

        svc.run().await.unwrap();
        assert_eq!(
            *workload.seen.lock().unwrap(),
            vec!["Service A: Stop".to_string(), "Service A: Stop".to_string()]
        );
        assert_eq!(svc.view().name(), "svcA");
    }

    #[tokio::test]
    async fn test_run_interactive_start_failure() {
        let manager = InMemoryManager::new();
        let workload = Arc::new(CountingWorkload {
            fail_start: true,
            ..Default::default()
        });
        let svc = controller_with(&manager, svc_a(), workload.clone(), true);

        let err = svc.run().await.unwrap_err();
        assert_eq!(err.to_string(), "start exploded");
        assert_eq!(workload.stops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_display_name() {
        let manager = InMemoryManager::new();
        assert_eq!(controller(&manager, svc_a()).to_string(), "svcA");
        let svc = controller(&manager, svc_a().with_display_name("Service A"));
        assert_eq!(svc.to_string(), "Service A");
        assert!(!svc.platform().is_empty());
    }
}
