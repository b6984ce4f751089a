//! Live task views over the store's change stream.
//!
//! The store pushes full row images, unfiltered. Each feed re-applies its
//! status/ownership predicate on every push, so a row leaving the predicate
//! set is simply skipped.

use errand_core::enums::TaskStatus;
use errand_core::ids::WorkerId;
use errand_core::row::Row;
use errand_core::task::Task;
use tokio::sync::broadcast;

pub enum FeedPredicate {
    /// Rows in the publicly negotiable status set.
    Available,
    /// Rows assigned to one worker.
    AssignedTo(WorkerId),
}

impl FeedPredicate {
    fn matches(&self, task: &Task) -> bool {
        match self {
            FeedPredicate::Available => task.status.is_negotiable(),
            FeedPredicate::AssignedTo(worker) => {
                task.status == TaskStatus::Assigned
                    && task.delivery_man_id.as_ref() == Some(worker)
            }
        }
    }
}

pub struct TaskFeed {
    rx: broadcast::Receiver<Row>,
    predicate: FeedPredicate,
}

impl TaskFeed {
    pub(crate) fn new(rx: broadcast::Receiver<Row>, predicate: FeedPredicate) -> Self {
        Self { rx, predicate }
    }

    /// Next task matching this feed's predicate, or `None` once the store
    /// side closes. Malformed rows and lagged stretches are skipped with a
    /// warning.
    pub async fn next(&mut self) -> Option<Task> {
        loop {
            match self.rx.recv().await {
                Ok(row) => match Task::from_row(&row) {
                    Ok(task) if self.predicate.matches(&task) => return Some(task),
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping malformed row on change feed");
                        continue;
                    }
                },
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "task feed lagged, changes dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
