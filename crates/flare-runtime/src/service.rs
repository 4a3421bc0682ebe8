//! Service framework
//!
//! Each long-running protocol interaction is a service: an owned state
//! machine advanced one step at a time by a dedicated task. The spawn loop
//! keeps stepping until the service declares itself ended, the handle
//! requests shutdown, or a step returns an error. Errors that reach the
//! loop are contract violations or exhausted recoveries; they terminate the
//! task and surface through the join handle rather than being swallowed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use flare_core::errors::Result;
use tokio::task::JoinHandle;
use tracing::{error, info};

// ----------------------------------------------------------------------------
// Service Trait
// ----------------------------------------------------------------------------

/// A stepwise-driven protocol service.
#[async_trait]
pub trait Service: Send {
    /// Stable name used in logs.
    fn name(&self) -> &'static str;

    /// Perform one unit of work: typically handle the current state and
    /// advance the state machine once.
    async fn step(&mut self) -> Result<()>;

    /// Whether the service has reached a terminal state.
    fn ended(&self) -> bool;
}

// ----------------------------------------------------------------------------
// Service Handle
// ----------------------------------------------------------------------------

/// Handle to a spawned service task.
pub struct ServiceHandle {
    name: &'static str,
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<Result<()>>,
}

impl ServiceHandle {
    /// Ask the service loop to stop after its current step.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the service task to finish and return its outcome.
    pub async fn join(self) -> Result<()> {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(join_error) => {
                error!(service = self.name, %join_error, "service task panicked or was aborted");
                Err(flare_core::errors::FlareError::codec(format!(
                    "service {} task failed: {}",
                    self.name, join_error
                )))
            }
        }
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

/// Spawn a service onto the runtime and drive it to completion.
pub fn spawn_service<S: Service + 'static>(mut service: S) -> ServiceHandle {
    let name = service.name();
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(service = name, "service started");
        while !service.ended() && !shutdown_flag.load(Ordering::SeqCst) {
            if let Err(e) = service.step().await {
                error!(service = name, error = %e, "service step failed");
                return Err(e);
            }
        }
        info!(service = name, "service ended");
        Ok(())
    });

    ServiceHandle {
        name,
        shutdown,
        handle,
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
