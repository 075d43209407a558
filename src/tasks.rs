//! Task lifecycle rules.
//!
//! Status changes always go through [`transition`], which checks the
//! transition table and writes the audit row. `completed_at` bookkeeping
//! lives in the store; this module only decides legality.

use crate::store::SqliteStore;
use crate::types::{RequestContext, Task, TaskStatus};

/// Legal lifecycle moves. Everything else is rejected.
pub fn allowed_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    if from == to {
        return false;
    }
    match from {
        Pending => matches!(to, Active | ClarificationNeeded | Completed | Deferred | Rejected),
        Active => matches!(to, Pending | Completed | Deferred | Rejected),
        ClarificationNeeded => matches!(to, Pending | Rejected),
        // Reopening is allowed; accidental "done" texts happen.
        Completed => matches!(to, Pending),
        // Deferred tasks resurface at week rollover or by hand.
        Deferred => matches!(to, Pending | Rejected),
        Rejected => false,
    }
}

pub async fn transition(
    store: &SqliteStore,
    ctx: &RequestContext,
    task: &Task,
    to: TaskStatus,
) -> anyhow::Result<()> {
    if !allowed_transition(task.status, to) {
        anyhow::bail!(
            "cannot move task {} from {} to {}",
            task.id,
            task.status.as_str(),
            to.as_str()
        );
    }
    store.record_transition(ctx, &task.id, task.status, to).await
}
