//! Bounded stop: request a graceful stop, poll until stopped, terminate the
//! process when the deadline passes

use crate::error::Result;
use crate::manager::ServiceEntry;
use crate::process::ProcessTerminator;
use crate::status::{ControlSignal, RuntimeState};
use log::{debug, info, warn};
use std::time::Duration;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Interval between status polls
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// How a stop completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The service reached Stopped on its own
    Graceful,
    /// The manager rejected the stop control and the process was terminated
    Rejected,
    /// The deadline passed and the process was terminated
    Terminated,
}

/// Stop the service behind `entry`, returning within
/// `stop_timeout + 2 * TICK_INTERVAL` of the stop request.
///
/// After a deadline termination the service is not queried again: the
/// termination is issued once and the call returns.
pub async fn stop_and_wait(
    entry: &dyn ServiceEntry,
    terminator: &dyn ProcessTerminator,
    stop_timeout: Duration,
) -> Result<StopOutcome> {
    let mut outcome = StopOutcome::Graceful;
    let mut status = match entry.control(ControlSignal::Stop) {
        Ok(status) => status,
        Err(e) if e.is_control_rejection() => {
            warn!("Stop control rejected ({}), terminating the service process", e);
            let status = entry.query()?;
            if let Err(e) = terminator.terminate(status.process_id) {
                warn!("Failed to terminate process {}: {}", status.process_id, e);
            }
            outcome = StopOutcome::Rejected;
            status
        }
        Err(e) => return Err(e),
    };

    let deadline = time::sleep(stop_timeout + TICK_INTERVAL * 2);
    tokio::pin!(deadline);
    let mut ticker = time::interval_at(Instant::now() + TICK_INTERVAL, TICK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while status.state != RuntimeState::Stopped {
        tokio::select! {
            _ = ticker.tick() => {
                status = entry.query()?;
                debug!("Waiting for stop, state {}", status.state);
            }
            _ = &mut deadline => {
                warn!(
                    "Service did not stop within {:?}, terminating process {}",
                    stop_timeout, status.process_id
                );
                if let Err(e) = terminator.terminate(status.process_id) {
                    warn!("Failed to terminate process {}: {}", status.process_id, e);
                }
                return Ok(StopOutcome::Terminated);
            }
        }
    }

    info!("Service stopped ({:?})", outcome);
    Ok(outcome)
}
