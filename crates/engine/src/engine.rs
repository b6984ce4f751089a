//! The negotiation engine: owner of every task status transition.
//!
//! All mutations run as single atomic store-side operations (stored
//! procedure or conditional update). The engine validates arguments before
//! any network call, maps a `false`/null procedure result to a typed
//! `PreconditionFailed`, and keeps infrastructure failures (`Transport`)
//! distinct so callers can retry the right things.

use std::sync::Arc;

use errand_core::clock::now_ms;
use errand_core::earnings::{worker_share, EarningsRecord};
use errand_core::enums::{CounterResponse, NegotiationParty, TaskStatus};
use errand_core::error::{DispatchError, DispatchResult};
use errand_core::ids::{ProposalId, TaskId, UserId, WorkerId};
use errand_core::row::Row;
use errand_core::task::Task;
use serde_json::{json, Value};
use errand_store::store::{procedure, relation};
use errand_store::{Filter, RelationalStore, TaskQueries};

use crate::bundle;
use crate::feed::{FeedPredicate, TaskFeed};

pub struct NegotiationEngine<S> {
    store: Arc<S>,
    queries: TaskQueries<S>,
}

impl<S> Clone for NegotiationEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            queries: self.queries.clone(),
        }
    }
}

impl<S: RelationalStore> NegotiationEngine<S> {
    pub fn new(store: Arc<S>) -> Self {
        let queries = TaskQueries::new(Arc::clone(&store));
        Self { store, queries }
    }

    pub fn queries(&self) -> &TaskQueries<S> {
        &self.queries
    }

    // ---- read surface -----------------------------------------------------

    /// Available work, with bundle members collapsed into synthetic tasks.
    pub async fn available_tasks(&self) -> DispatchResult<Vec<Task>> {
        Ok(bundle::aggregate(self.queries.list_available().await?))
    }

    pub async fn cost_review_tasks(&self, worker: &WorkerId) -> DispatchResult<Vec<Task>> {
        Ok(bundle::aggregate(self.queries.list_cost_review(worker).await?))
    }

    pub async fn assigned_tasks(&self, worker: &WorkerId) -> DispatchResult<Vec<Task>> {
        Ok(bundle::aggregate(self.queries.list_assigned(worker).await?))
    }

    /// Proximity search; degraded to an empty list on store failure.
    pub async fn tasks_near(&self, latitude: f64, longitude: f64, radius_km: f64) -> Vec<Task> {
        bundle::aggregate(self.queries.list_near(latitude, longitude, radius_km).await)
    }

    // ---- live views -------------------------------------------------------

    /// Push stream of tasks entering or leaving the negotiable set. The
    /// status predicate is re-applied on every push, client-side.
    pub fn available_feed(&self) -> TaskFeed {
        TaskFeed::new(
            self.store.changes(relation::TASKS),
            FeedPredicate::Available,
        )
    }

    /// Push stream of assignment changes for one worker.
    pub fn assigned_feed(&self, worker: &WorkerId) -> TaskFeed {
        TaskFeed::new(
            self.store.changes(relation::TASKS),
            FeedPredicate::AssignedTo(worker.clone()),
        )
    }

    // ---- negotiation operations -------------------------------------------

    /// Reserve a pending task (or whole bundle) for cost review. Succeeds
    /// only while the worker is available and online and every addressed row
    /// is still `pending`; the losing side of a race gets
    /// `PreconditionFailed`, never a silent no-op.
    pub async fn claim(&self, task_id: &TaskId, worker_id: &WorkerId) -> DispatchResult<()> {
        const OP: &str = "claim";
        require_id(OP, "task_id", task_id.as_str())?;
        require_id(OP, "worker_id", worker_id.as_str())?;

        let mut params = Row::new();
        params.insert("task_id".into(), json!(task_id.as_str()));
        params.insert("delivery_man_id".into(), json!(worker_id.as_str()));
        self.flag_rpc(
            OP,
            task_id,
            procedure::START_COST_REVIEW,
            params,
            "task is no longer available, or worker is not available and online",
        )
        .await
    }

    /// Offer a price for a task under review by this worker.
    pub async fn propose_cost(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        cost: f64,
        notes: Option<&str>,
    ) -> DispatchResult<()> {
        const OP: &str = "propose_cost";
        require_id(OP, "task_id", task_id.as_str())?;
        require_id(OP, "worker_id", worker_id.as_str())?;
        require_positive_cost(cost)?;

        let params = proposal_params(task_id, worker_id, cost, notes);
        self.flag_rpc(
            OP,
            task_id,
            procedure::PROPOSE_TASK_COST,
            params,
            "task is not under cost review by this worker",
        )
        .await
    }

    /// Supersede this worker's pending proposal with a new cost. Never
    /// creates a duplicate row.
    pub async fn update_proposal(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        cost: f64,
        notes: Option<&str>,
    ) -> DispatchResult<()> {
        const OP: &str = "update_proposal";
        require_id(OP, "task_id", task_id.as_str())?;
        require_id(OP, "worker_id", worker_id.as_str())?;
        require_positive_cost(cost)?;

        let params = proposal_params(task_id, worker_id, cost, notes);
        self.flag_rpc(
            OP,
            task_id,
            procedure::UPDATE_COST_PROPOSAL,
            params,
            "no pending proposal to update for this worker",
        )
        .await
    }

    /// Accept the oldest pending proposal (earliest `proposed_at` wins ties
    /// by insertion order).
    pub async fn accept_proposed_cost(
        &self,
        task_id: &TaskId,
        user_id: &UserId,
    ) -> DispatchResult<()> {
        const OP: &str = "accept_proposed_cost";
        require_id(OP, "task_id", task_id.as_str())?;
        require_id(OP, "user_id", user_id.as_str())?;

        let mut params = Row::new();
        params.insert("task_id".into(), json!(task_id.as_str()));
        params.insert("user_id".into(), json!(user_id.as_str()));
        self.flag_rpc(
            OP,
            task_id,
            procedure::ACCEPT_COST_PROPOSAL,
            params,
            "no pending proposal, or task is not awaiting acceptance",
        )
        .await
    }

    /// Accept one explicit proposal; used when several workers have proposed
    /// concurrently (non-bundle, multi-bidder flows).
    pub async fn accept_specific_proposal(
        &self,
        task_id: &TaskId,
        proposal_id: &ProposalId,
        user_id: &UserId,
    ) -> DispatchResult<()> {
        const OP: &str = "accept_specific_proposal";
        require_id(OP, "task_id", task_id.as_str())?;
        require_id(OP, "proposal_id", proposal_id.as_str())?;
        require_id(OP, "user_id", user_id.as_str())?;

        let mut params = Row::new();
        params.insert("task_id".into(), json!(task_id.as_str()));
        params.insert("proposal_id".into(), json!(proposal_id.as_str()));
        params.insert("user_id".into(), json!(user_id.as_str()));
        self.flag_rpc(
            OP,
            task_id,
            procedure::ACCEPT_SPECIFIC_COST_PROPOSAL,
            params,
            "proposal is not pending, or task is not awaiting acceptance",
        )
        .await
    }

    /// Decline every open proposal at once, returning the task to `pending`.
    pub async fn reject_all_proposals(
        &self,
        task_id: &TaskId,
        user_id: &UserId,
    ) -> DispatchResult<()> {
        const OP: &str = "reject_all_proposals";
        require_id(OP, "task_id", task_id.as_str())?;
        require_id(OP, "user_id", user_id.as_str())?;

        let mut params = Row::new();
        params.insert("task_id".into(), json!(task_id.as_str()));
        params.insert("user_id".into(), json!(user_id.as_str()));
        self.flag_rpc(
            OP,
            task_id,
            procedure::REJECT_ALL_COST_PROPOSALS,
            params,
            "task is not in an active negotiation",
        )
        .await
    }

    /// Worker walks away from a review before proposing; the task goes back
    /// to `pending` and the worker becomes available again.
    pub async fn cancel_cost_review(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
    ) -> DispatchResult<()> {
        const OP: &str = "cancel_cost_review";
        require_id(OP, "task_id", task_id.as_str())?;
        require_id(OP, "worker_id", worker_id.as_str())?;

        let mut params = Row::new();
        params.insert("task_id".into(), json!(task_id.as_str()));
        params.insert("delivery_man_id".into(), json!(worker_id.as_str()));
        self.flag_rpc(
            OP,
            task_id,
            procedure::CANCEL_COST_REVIEW,
            params,
            "task is not under cost review by this worker",
        )
        .await
    }

    pub async fn user_propose_counter_offer(
        &self,
        task_id: &TaskId,
        user_id: &UserId,
        cost: f64,
        notes: Option<&str>,
    ) -> DispatchResult<()> {
        const OP: &str = "user_propose_counter_offer";
        require_id(OP, "task_id", task_id.as_str())?;
        require_id(OP, "user_id", user_id.as_str())?;
        require_positive_cost(cost)?;

        let mut params = Row::new();
        params.insert("task_id".into(), json!(task_id.as_str()));
        params.insert("user_id".into(), json!(user_id.as_str()));
        params.insert("proposed_cost".into(), json!(cost));
        params.insert("notes".into(), json!(notes));
        self.flag_rpc(
            OP,
            task_id,
            procedure::USER_PROPOSE_COUNTER_OFFER,
            params,
            "no worker proposal to counter",
        )
        .await
    }

    pub async fn delivery_man_respond_to_counter_offer(
        &self,
        task_id: &TaskId,
        worker_id: &WorkerId,
        response: CounterResponse,
        new_cost: Option<f64>,
        notes: Option<&str>,
    ) -> DispatchResult<()> {
        const OP: &str = "delivery_man_respond_to_counter_offer";
        require_id(OP, "task_id", task_id.as_str())?;
        require_id(OP, "worker_id", worker_id.as_str())?;
        if response == CounterResponse::Counter {
            let cost = new_cost.ok_or_else(|| {
                DispatchError::validation("counter response requires a new cost")
            })?;
            require_positive_cost(cost)?;
        }

        let mut params = Row::new();
        params.insert("task_id".into(), json!(task_id.as_str()));
        params.insert("delivery_man_id".into(), json!(worker_id.as_str()));
        params.insert("response_type".into(), json!(response.as_str()));
        params.insert("new_cost".into(), json!(new_cost));
        params.insert("notes".into(), json!(notes));
        self.flag_rpc(
            OP,
            task_id,
            procedure::DELIVERY_MAN_RESPOND_TO_COUNTER_OFFER,
            params,
            "no user counter-offer awaiting this worker",
        )
        .await
    }

    /// Terminal agreement step of a negotiation.
    pub async fn finalize_cost_negotiation(
        &self,
        task_id: &TaskId,
        final_cost: f64,
        agreed_by: NegotiationParty,
    ) -> DispatchResult<()> {
        const OP: &str = "finalize_cost_negotiation";
        require_id(OP, "task_id", task_id.as_str())?;
        require_positive_cost(final_cost)?;

        let mut params = Row::new();
        params.insert("task_id".into(), json!(task_id.as_str()));
        params.insert("final_cost".into(), json!(final_cost));
        params.insert("agreed_by".into(), json!(agreed_by.as_str()));
        self.flag_rpc(
            OP,
            task_id,
            procedure::FINALIZE_COST_NEGOTIATION,
            params,
            "task is not in an active negotiation",
        )
        .await
    }

    /// Return a task (or bundle) to `pending`, rejecting in-flight
    /// proposals and restoring the worker's availability.
    pub async fn cancel_cost_negotiation(
        &self,
        task_id: &TaskId,
        cancelled_by: NegotiationParty,
        cancelled_by_id: &str,
    ) -> DispatchResult<()> {
        const OP: &str = "cancel_cost_negotiation";
        require_id(OP, "task_id", task_id.as_str())?;
        require_id(OP, "cancelled_by_id", cancelled_by_id)?;

        let mut params = Row::new();
        params.insert("task_id".into(), json!(task_id.as_str()));
        params.insert("cancelled_by".into(), json!(cancelled_by.as_str()));
        params.insert("cancelled_by_id".into(), json!(cancelled_by_id));
        self.flag_rpc(
            OP,
            task_id,
            procedure::CANCEL_COST_NEGOTIATION,
            params,
            "task is not in a cancellable negotiation state",
        )
        .await
    }

    /// Mark a task (or every bundle member) completed, free the worker and
    /// credit earnings.
    ///
    /// The status precondition on the update makes this idempotent: a
    /// repeated call affects zero rows and therefore writes zero earnings.
    /// Earnings are inserted only for rows the update actually transitioned.
    pub async fn complete_task(&self, task_id: &TaskId, worker_id: &WorkerId) -> DispatchResult<()> {
        const OP: &str = "complete_task";
        require_id(OP, "task_id", task_id.as_str())?;
        require_id(OP, "worker_id", worker_id.as_str())?;

        let member_filter = match task_id.as_bundle() {
            Some(bundle_id) => Filter::new().eq("bundle_id", bundle_id),
            None => Filter::new().eq("id", task_id.as_str()),
        };
        let filter = member_filter
            .eq("delivery_man_id", worker_id.as_str())
            .is_in("status", vec![Value::from(TaskStatus::Assigned.as_str())]);

        let now = now_ms();
        let mut patch = Row::new();
        patch.insert("status".into(), json!(TaskStatus::Completed.as_str()));
        patch.insert("completed_at".into(), json!(now));
        patch.insert("updated_at".into(), json!(now));

        let affected = self
            .store
            .update(relation::TASKS, patch, filter)
            .await
            .map_err(|e| DispatchError::transport(OP, e.to_string()))?;

        if affected.is_empty() {
            return Err(DispatchError::precondition(
                OP,
                task_id,
                "task is not assigned to this worker (or already completed)",
            ));
        }

        // Free the worker before the ledger writes: the status transition
        // above can never re-run, so a failed earnings insert must not leave
        // the worker stuck unavailable.
        self.store
            .update(
                relation::DELIVERY_PERSONNEL,
                single_patch("is_available", json!(true)),
                Filter::new().eq("id", worker_id.as_str()),
            )
            .await
            .map_err(|e| DispatchError::transport(OP, e.to_string()))?;

        for row in &affected {
            let member_id = row
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or(task_id.as_str());
            let cost = row
                .get("accepted_cost")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            let record = EarningsRecord {
                id: String::new(), // store assigns
                task_id: TaskId::from(member_id),
                delivery_man_id: worker_id.clone(),
                amount: worker_share(cost),
                recorded_at: now,
            };
            let mut earnings_row = record.to_row();
            earnings_row.remove("id");
            self.store
                .insert(relation::TASK_EARNINGS, earnings_row)
                .await
                .map_err(|e| DispatchError::transport(OP, e.to_string()))?;
            tracing::debug!(task_id = %member_id, amount = record.amount, "earnings recorded");
        }

        tracing::info!(task_id = %task_id, worker_id = %worker_id, rows = affected.len(), "task completed");
        Ok(())
    }

    /// Mark one stop of a task done. Atomic server-side append.
    pub async fn mark_location_completed(
        &self,
        task_id: &TaskId,
        location_index: u64,
    ) -> DispatchResult<()> {
        const OP: &str = "mark_location_completed";
        require_id(OP, "task_id", task_id.as_str())?;

        let mut params = Row::new();
        params.insert("task_id".into(), json!(task_id.as_str()));
        params.insert("location_index".into(), json!(location_index));
        self.flag_rpc(
            OP,
            task_id,
            procedure::MARK_LOCATION_COMPLETED,
            params,
            "task not found or location index out of range",
        )
        .await
    }

    pub async fn add_location_note(
        &self,
        task_id: &TaskId,
        location_index: u64,
        note: &str,
    ) -> DispatchResult<()> {
        const OP: &str = "add_location_note";
        require_id(OP, "task_id", task_id.as_str())?;
        if note.trim().is_empty() {
            return Err(DispatchError::validation("note must not be empty"));
        }

        let mut params = Row::new();
        params.insert("task_id".into(), json!(task_id.as_str()));
        params.insert("location_index".into(), json!(location_index));
        params.insert("note".into(), json!(note));
        self.flag_rpc(
            OP,
            task_id,
            procedure::ADD_LOCATION_NOTE,
            params,
            "task not found",
        )
        .await
    }

    /// Call a boolean stored procedure and map `false`/null to a typed
    /// precondition failure carrying the operation name and task id.
    async fn flag_rpc(
        &self,
        operation: &'static str,
        task_id: &TaskId,
        proc: &str,
        params: Row,
        reason: &str,
    ) -> DispatchResult<()> {
        let result = self
            .store
            .rpc(proc, params)
            .await
            .map_err(|e| DispatchError::transport(operation, e.to_string()))?;

        match result {
            Value::Bool(true) => Ok(()),
            Value::Bool(false) | Value::Null => {
                tracing::debug!(task_id = %task_id, operation, "store precondition rejected");
                Err(DispatchError::precondition(operation, task_id, reason))
            }
            other => Err(DispatchError::transport(
                operation,
                format!("unexpected procedure result: {other}"),
            )),
        }
    }
}

fn proposal_params(
    task_id: &TaskId,
    worker_id: &WorkerId,
    cost: f64,
    notes: Option<&str>,
) -> Row {
    let mut params = Row::new();
    params.insert("task_id".into(), json!(task_id.as_str()));
    params.insert("delivery_man_id".into(), json!(worker_id.as_str()));
    params.insert("proposed_cost".into(), json!(cost));
    params.insert("notes".into(), json!(notes));
    params
}

fn single_patch(key: &str, value: Value) -> Row {
    let mut patch = Row::new();
    patch.insert(key.to_string(), value);
    patch
}

fn require_id(operation: &str, name: &str, value: &str) -> DispatchResult<()> {
    if value.trim().is_empty() {
        return Err(DispatchError::validation(format!(
            "{operation}: `{name}` must not be empty"
        )));
    }
    Ok(())
}

fn require_positive_cost(cost: f64) -> DispatchResult<()> {
    if !cost.is_finite() || cost <= 0.0 {
        return Err(DispatchError::validation(format!(
            "cost must be a positive amount, got {cost}"
        )));
    }
    Ok(())
}
