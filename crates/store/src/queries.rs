//! Task Store Access: read-only, uncached queries over the task views.
//!
//! No caching by design — this backs a live negotiation surface where
//! staleness causes double-assignment bugs.

use std::sync::Arc;

use errand_core::earnings::EarningsRecord;
use errand_core::error::{DispatchError, DispatchResult};
use errand_core::ids::{TaskId, WorkerId};
use errand_core::personnel::DeliveryPersonnel;
use errand_core::proposal::CostProposal;
use errand_core::row::Row;
use errand_core::task::Task;
use serde_json::{json, Value};

use crate::filter::{Filter, Order};
use crate::store::{procedure, relation, RelationalStore, StoreError};

pub struct TaskQueries<S> {
    store: Arc<S>,
}

impl<S> Clone for TaskQueries<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: RelationalStore> TaskQueries<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// All tasks in the publicly negotiable status set.
    pub async fn list_available(&self) -> DispatchResult<Vec<Task>> {
        let rows = self
            .store
            .select(
                relation::AVAILABLE_TASKS,
                Filter::new(),
                Some(Order::asc("created_at")),
            )
            .await
            .map_err(|e| transport("list_available", e))?;
        Ok(parse_task_rows(rows))
    }

    /// Tasks currently under cost review by one worker.
    pub async fn list_cost_review(&self, worker: &WorkerId) -> DispatchResult<Vec<Task>> {
        let rows = self
            .store
            .select(
                relation::COST_REVIEW_TASKS,
                Filter::new().eq("delivery_man_id", worker.as_str()),
                Some(Order::asc("created_at")),
            )
            .await
            .map_err(|e| transport("list_cost_review", e))?;
        Ok(parse_task_rows(rows))
    }

    /// Tasks bound to a worker.
    pub async fn list_assigned(&self, worker: &WorkerId) -> DispatchResult<Vec<Task>> {
        let rows = self
            .store
            .select(
                relation::ASSIGNED_TASKS,
                Filter::new().eq("delivery_man_id", worker.as_str()),
                Some(Order::asc("assigned_at")),
            )
            .await
            .map_err(|e| transport("list_assigned", e))?;
        Ok(parse_task_rows(rows))
    }

    /// Pending tasks near a point. Degraded, never fatal: if the geospatial
    /// procedure is unavailable this falls back to the plain pending query,
    /// and if that also fails the caller gets an empty list.
    pub async fn list_near(&self, latitude: f64, longitude: f64, radius_km: f64) -> Vec<Task> {
        let mut params = Row::new();
        params.insert("latitude".into(), json!(latitude));
        params.insert("longitude".into(), json!(longitude));
        params.insert("radius_km".into(), json!(radius_km));

        match self
            .store
            .rpc(procedure::GET_TASKS_NEAR_LOCATION, params)
            .await
        {
            Ok(Value::Array(rows)) => {
                let rows = rows
                    .into_iter()
                    .filter_map(|v| match v {
                        Value::Object(map) => Some(map),
                        _ => None,
                    })
                    .collect();
                parse_task_rows(rows)
            }
            Ok(other) => {
                tracing::warn!(?other, "unexpected proximity query result, falling back");
                self.pending_fallback().await
            }
            Err(e) => {
                tracing::warn!(error = %e, "proximity query failed, falling back to pending list");
                self.pending_fallback().await
            }
        }
    }

    /// Full negotiation history for a task, oldest first. Proposal rows are
    /// never deleted, so this includes superseded and rejected offers.
    pub async fn list_proposals(&self, task_id: &TaskId) -> DispatchResult<Vec<CostProposal>> {
        let rows = self
            .store
            .select(
                relation::COST_PROPOSALS,
                Filter::new().eq("task_id", task_id.as_str()),
                Some(Order::asc("proposed_at")),
            )
            .await
            .map_err(|e| transport("list_proposals", e))?;

        Ok(rows
            .iter()
            .filter_map(|row| match CostProposal::from_row(row) {
                Ok(proposal) => Some(proposal),
                Err(e) => {
                    tracing::warn!(task_id = %task_id, error = %e, "skipping malformed proposal row");
                    None
                }
            })
            .collect())
    }

    /// A worker's earnings ledger, newest first.
    pub async fn list_earnings(&self, worker: &WorkerId) -> DispatchResult<Vec<EarningsRecord>> {
        let rows = self
            .store
            .select(
                relation::TASK_EARNINGS,
                Filter::new().eq("delivery_man_id", worker.as_str()),
                Some(Order::desc("recorded_at")),
            )
            .await
            .map_err(|e| transport("list_earnings", e))?;

        Ok(rows
            .iter()
            .filter_map(|row| match EarningsRecord::from_row(row) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(worker_id = %worker, error = %e, "skipping malformed earnings row");
                    None
                }
            })
            .collect())
    }

    pub async fn get_personnel(
        &self,
        worker: &WorkerId,
    ) -> DispatchResult<Option<DeliveryPersonnel>> {
        let rows = self
            .store
            .select(
                relation::DELIVERY_PERSONNEL,
                Filter::new().eq("id", worker.as_str()),
                None,
            )
            .await
            .map_err(|e| transport("get_personnel", e))?;

        rows.first().map(DeliveryPersonnel::from_row).transpose()
    }

    async fn pending_fallback(&self) -> Vec<Task> {
        match self
            .store
            .select(
                relation::TASKS,
                Filter::new().eq("status", "pending"),
                Some(Order::asc("created_at")),
            )
            .await
        {
            Ok(rows) => parse_task_rows(rows),
            Err(e) => {
                tracing::warn!(error = %e, "pending fallback query failed, returning empty list");
                Vec::new()
            }
        }
    }
}

/// Parse rows into tasks, skipping malformed rows with a warning instead of
/// aborting the whole batch.
pub fn parse_task_rows(rows: Vec<Row>) -> Vec<Task> {
    rows.iter()
        .filter_map(|row| match Task::from_row(row) {
            Ok(task) => Some(task),
            Err(e) => {
                let id = row.get("id").and_then(Value::as_str).unwrap_or("<no id>");
                tracing::warn!(task_id = %id, error = %e, "skipping malformed task row");
                None
            }
        })
        .collect()
}

fn transport(operation: &'static str, e: StoreError) -> DispatchError {
    DispatchError::transport(operation, e.to_string())
}
