//! Deployment orchestration.
//!
//! Request-time operations: accept a deployment, gate a promotion, start a
//! rollback. Each validates, records what it needs to and submits a job to
//! the dispatch queue; execution happens later on a dispatch worker.

mod manager;
mod promotion;
mod rollback;

pub use manager::{DeploymentManager, DeploymentRequest, RecoveryReport};
pub use promotion::PromotionGate;
pub use rollback::RollbackController;

use crate::dispatch::DispatchQueue;
use crate::error::{ControlError, ControlResult};

fn ensure_capacity(queue: &DispatchQueue) -> ControlResult<()> {
    if queue.is_full() {
        return Err(ControlError::transient("dispatch queue is full"));
    }
    Ok(())
}
