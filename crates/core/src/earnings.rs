use serde::Serialize;
use serde_json::Value;

use crate::error::DispatchResult;
use crate::ids::{TaskId, WorkerId};
use crate::row::{self, Row};

/// Fraction of the agreed task cost credited to the worker.
pub const EARNINGS_SHARE: f64 = 0.70;

/// The worker's cut of an agreed cost.
pub fn worker_share(cost: f64) -> f64 {
    cost * EARNINGS_SHARE
}

/// Append-only ledger entry, written exactly once per completed task row.
#[derive(Clone, Debug, Serialize)]
pub struct EarningsRecord {
    pub id: String,
    pub task_id: TaskId,
    pub delivery_man_id: WorkerId,
    pub amount: f64,
    pub recorded_at: u64,
}

impl EarningsRecord {
    pub fn from_row(r: &Row) -> DispatchResult<Self> {
        Ok(EarningsRecord {
            id: row::req_str(r, "id")?,
            task_id: TaskId(row::req_str(r, "task_id")?),
            delivery_man_id: WorkerId(row::req_str(r, "delivery_man_id")?),
            amount: row::req_f64(r, "amount")?,
            recorded_at: row::req_u64(r, "recorded_at")?,
        })
    }

    pub fn to_row(&self) -> Row {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Row::new(),
        }
    }
}
