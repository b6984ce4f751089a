use serde::Serialize;
use serde_json::Value;

use crate::enums::ProposalStatus;
use crate::error::{DispatchError, DispatchResult};
use crate::ids::{ProposalId, TaskId, WorkerId};
use crate::row::{self, Row};

/// One offer (or counter-offer) in a cost negotiation.
///
/// At most one proposal per (task, worker) pair may be `pending` at a time;
/// updates supersede the existing row rather than creating a duplicate.
/// Rows are retained as negotiation history, never deleted.
#[derive(Clone, Debug, Serialize)]
pub struct CostProposal {
    pub id: ProposalId,
    pub task_id: TaskId,
    pub delivery_man_id: WorkerId,
    pub proposed_cost: f64,
    pub notes: Option<String>,
    pub status: ProposalStatus,
    /// The user's counter amount, set while status is `user_counter`.
    pub counter_cost: Option<f64>,
    pub counter_notes: Option<String>,
    pub proposed_at: u64,
}

impl CostProposal {
    pub fn from_row(r: &Row) -> DispatchResult<Self> {
        let status_raw = row::req_str(r, "status")?;
        let status = ProposalStatus::parse(&status_raw).ok_or_else(|| {
            DispatchError::validation(format!("unknown proposal status `{status_raw}`"))
        })?;

        Ok(CostProposal {
            id: ProposalId(row::req_str(r, "id")?),
            task_id: TaskId(row::req_str(r, "task_id")?),
            delivery_man_id: WorkerId(row::req_str(r, "delivery_man_id")?),
            proposed_cost: row::req_f64(r, "proposed_cost")?,
            notes: row::opt_str(r, "notes")?,
            status,
            counter_cost: row::opt_f64(r, "counter_cost")?,
            counter_notes: row::opt_str(r, "counter_notes")?,
            proposed_at: row::req_u64(r, "proposed_at")?,
        })
    }

    pub fn to_row(&self) -> Row {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Row::new(),
        }
    }
}
