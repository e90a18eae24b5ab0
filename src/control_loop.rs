//! State machine driven by the service manager's control requests

use crate::controller::ServiceView;
use crate::error::ServiceError;
use crate::error_box::ErrorBox;
use crate::status::{ControlSignal, ExitCode, RuntimeState, StatusReport};
use crate::workload::Workload;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Sink for the status reports sent back to the service manager
pub trait StatusReporter: Send + Sync {
    fn report(&self, status: &StatusReport);
}

/// How the control loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    Normal,
    StartFailed,
    StopFailed,
}

impl LoopExit {
    pub fn code(&self) -> u32 {
        match self {
            LoopExit::Normal => 0,
            LoopExit::StartFailed => 1,
            LoopExit::StopFailed => 2,
        }
    }

    pub fn is_abnormal(&self) -> bool {
        *self != LoopExit::Normal
    }

    fn exit_code(&self) -> ExitCode {
        match self {
            LoopExit::Normal => ExitCode::Win32(0),
            abnormal => ExitCode::ServiceSpecific(abnormal.code()),
        }
    }
}

/// One run of the service under manager supervision
pub struct ControlLoop {
    workload: Arc<dyn Workload>,
    service: Arc<ServiceView>,
    errors: Arc<ErrorBox>,
}

impl ControlLoop {
    pub fn new(workload: Arc<dyn Workload>, service: Arc<ServiceView>, errors: Arc<ErrorBox>) -> Self {
        Self {
            workload,
            service,
            errors,
        }
    }

    pub fn service_name(&self) -> &str {
        self.service.name()
    }

    /// Drive the workload through StartPending, Running, StopPending and
    /// Stopped. Signals are handled one at a time in arrival order.
    ///
    /// A start or stop failure is stored in the error box and ends the loop
    /// with an abnormal exit. A closed signal channel is treated as Shutdown.
    pub async fn run(
        self,
        mut signals: mpsc::UnboundedReceiver<ControlSignal>,
        reporter: &dyn StatusReporter,
    ) -> LoopExit {
        let exit = self.drive(&mut signals, reporter).await;
        reporter.report(&StatusReport::stopped(exit.exit_code()));
        info!("Service {} stopped (exit code {})", self.service.name(), exit.code());
        exit
    }

    async fn drive(
        &self,
        signals: &mut mpsc::UnboundedReceiver<ControlSignal>,
        reporter: &dyn StatusReporter,
    ) -> LoopExit {
        reporter.report(&StatusReport::pending(RuntimeState::StartPending));

        if let Err(e) = self.workload.start(&self.service).await {
            error!("Service {} failed to start: {}", self.service.name(), e);
            self.errors.set(ServiceError::Workload(e));
            return LoopExit::StartFailed;
        }

        let current = StatusReport::running();
        reporter.report(&current);
        info!("Service {} running", self.service.name());

        loop {
            let signal = match signals.recv().await {
                Some(signal) => signal,
                None => {
                    warn!("Control channel for {} closed, shutting down", self.service.name());
                    ControlSignal::Shutdown
                }
            };

            match signal {
                ControlSignal::Interrogate => reporter.report(&current),
                ControlSignal::Stop | ControlSignal::Shutdown => {
                    info!("Received {:?} for {}", signal, self.service.name());
                    reporter.report(&StatusReport::pending(RuntimeState::StopPending));
                    if let Err(e) = self.workload.stop(&self.service).await {
                        error!("Service {} failed to stop: {}", self.service.name(), e);
                        self.errors.set(ServiceError::Workload(e));
                        return LoopExit::StopFailed;
                    }
                    return LoopExit::Normal;
                }
                other => debug!("Ignoring control {:?} for {}", other, self.service.name()),
            }
        }
    }
}
