//! In-memory reference implementation of [`RelationalStore`].
//!
//! Stands in for the real Postgres/REST backend: tables are plain row
//! vectors behind a single mutex, views resolve to filtered selects, and
//! every stored procedure runs its whole body under the lock, so the
//! conditional-update semantics the negotiation engine relies on (single
//! claim, idempotent completion) hold exactly as they would server-side.

use dashmap::DashMap;
use errand_core::clock::now_ms;
use errand_core::enums::TaskStatus;
use errand_core::ids::BUNDLE_ID_PREFIX;
use errand_core::row::Row;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use crate::filter::{Filter, Order};
use crate::store::{procedure, relation, RelationalStore, StoreError};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct Tables {
    tasks: Vec<Row>,
    cost_proposals: Vec<Row>,
    delivery_personnel: Vec<Row>,
    task_earnings: Vec<Row>,
}

impl Tables {
    fn table_mut(&mut self, name: &str) -> Result<&mut Vec<Row>, StoreError> {
        match name {
            relation::TASKS => Ok(&mut self.tasks),
            relation::COST_PROPOSALS => Ok(&mut self.cost_proposals),
            relation::DELIVERY_PERSONNEL => Ok(&mut self.delivery_personnel),
            relation::TASK_EARNINGS => Ok(&mut self.task_earnings),
            other => Err(StoreError::UnknownRelation(other.to_string())),
        }
    }

    /// Member rows addressed by a task id. A `group-<id>` id resolves to
    /// every row sharing that bundle id; a plain id resolves to one row.
    fn task_indexes(&self, task_id: &str) -> Vec<usize> {
        if let Some(bundle) = task_id.strip_prefix(BUNDLE_ID_PREFIX) {
            self.tasks
                .iter()
                .enumerate()
                .filter(|(_, r)| str_field(r, "bundle_id") == Some(bundle))
                .map(|(i, _)| i)
                .collect()
        } else {
            self.tasks
                .iter()
                .enumerate()
                .filter(|(_, r)| str_field(r, "id") == Some(task_id))
                .map(|(i, _)| i)
                .collect()
        }
    }

    fn all_status(&self, indexes: &[usize], allowed: &[TaskStatus]) -> bool {
        !indexes.is_empty()
            && indexes.iter().all(|&i| {
                str_field(&self.tasks[i], "status")
                    .and_then(TaskStatus::parse)
                    .is_some_and(|s| allowed.contains(&s))
            })
    }

    fn all_owned_by(&self, indexes: &[usize], worker: &str) -> bool {
        !indexes.is_empty()
            && indexes
                .iter()
                .all(|&i| str_field(&self.tasks[i], "delivery_man_id") == Some(worker))
    }

    fn personnel_mut(&mut self, worker: &str) -> Option<&mut Row> {
        self.delivery_personnel
            .iter_mut()
            .find(|r| str_field(r, "id") == Some(worker))
    }

    /// Index of the oldest pending proposal for a task, ties broken by row
    /// order (insertion order).
    fn oldest_pending_proposal(&self, task_id: &str) -> Option<usize> {
        self.cost_proposals
            .iter()
            .enumerate()
            .filter(|(_, r)| {
                str_field(r, "task_id") == Some(task_id)
                    && str_field(r, "status") == Some("pending")
            })
            .min_by_key(|(_, r)| r.get("proposed_at").and_then(Value::as_u64).unwrap_or(0))
            .map(|(i, _)| i)
    }

    fn proposal_for_worker(&self, task_id: &str, worker: &str, status: &str) -> Option<usize> {
        self.cost_proposals.iter().position(|r| {
            str_field(r, "task_id") == Some(task_id)
                && str_field(r, "delivery_man_id") == Some(worker)
                && str_field(r, "status") == Some(status)
        })
    }
}

pub struct MemoryStore {
    tables: Mutex<Tables>,
    channels: DashMap<String, broadcast::Sender<Row>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            channels: DashMap::new(),
        }
    }

    fn publish(&self, table: &str, row: &Row) {
        if let Some(tx) = self.channels.get(table) {
            let _ = tx.send(row.clone());
        }
    }

    fn view_filter(relation_name: &str) -> Option<(&'static str, Filter)> {
        let status_filter = |statuses: &[TaskStatus]| {
            Filter::new().is_in(
                "status",
                statuses.iter().map(|s| Value::from(s.as_str())).collect(),
            )
        };
        match relation_name {
            relation::AVAILABLE_TASKS => {
                Some((relation::TASKS, status_filter(&TaskStatus::NEGOTIABLE)))
            }
            relation::COST_REVIEW_TASKS => {
                Some((relation::TASKS, status_filter(&[TaskStatus::CostReview])))
            }
            relation::COST_PROPOSED_TASKS => {
                Some((relation::TASKS, status_filter(&[TaskStatus::CostProposed])))
            }
            relation::USER_COUNTER_TASKS => Some((
                relation::TASKS,
                status_filter(&[TaskStatus::UserCounterProposed]),
            )),
            relation::ASSIGNED_TASKS => {
                Some((relation::TASKS, status_filter(&[TaskStatus::Assigned])))
            }
            _ => None,
        }
    }
}

impl RelationalStore for MemoryStore {
    async fn select(
        &self,
        relation_name: &str,
        filter: Filter,
        order: Option<Order>,
    ) -> Result<Vec<Row>, StoreError> {
        let (base, effective) = match Self::view_filter(relation_name) {
            Some((base, view)) => (base, view.and(filter)),
            None => (relation_name, filter),
        };

        let mut tables = self.tables.lock().await;
        let rows = tables.table_mut(base)?;
        let mut out: Vec<Row> = rows.iter().filter(|r| effective.matches(r)).cloned().collect();
        if let Some(order) = order {
            order.apply(&mut out);
        }
        Ok(out)
    }

    async fn rpc(&self, proc: &str, params: Row) -> Result<Value, StoreError> {
        match proc {
            procedure::START_COST_REVIEW => self.start_cost_review(params).await,
            procedure::PROPOSE_TASK_COST => self.propose_task_cost(params, false).await,
            procedure::UPDATE_COST_PROPOSAL => self.propose_task_cost(params, true).await,
            procedure::ACCEPT_COST_PROPOSAL => self.accept_cost_proposal(params, None).await,
            procedure::ACCEPT_SPECIFIC_COST_PROPOSAL => {
                let proposal_id =
                    p_str(&params, procedure::ACCEPT_SPECIFIC_COST_PROPOSAL, "proposal_id")?;
                self.accept_cost_proposal(params, Some(proposal_id)).await
            }
            procedure::REJECT_ALL_COST_PROPOSALS => self.reject_all_cost_proposals(params).await,
            procedure::CANCEL_COST_REVIEW => self.cancel_cost_review(params).await,
            procedure::USER_PROPOSE_COUNTER_OFFER => self.user_propose_counter_offer(params).await,
            procedure::DELIVERY_MAN_RESPOND_TO_COUNTER_OFFER => {
                self.respond_to_counter_offer(params).await
            }
            procedure::FINALIZE_COST_NEGOTIATION => self.finalize_cost_negotiation(params).await,
            procedure::CANCEL_COST_NEGOTIATION => self.cancel_cost_negotiation(params).await,
            procedure::GET_TASKS_NEAR_LOCATION => self.tasks_near_location(params).await,
            procedure::MARK_LOCATION_COMPLETED => self.mark_location_completed(params).await,
            procedure::ADD_LOCATION_NOTE => self.add_location_note(params).await,
            other => Err(StoreError::UnknownProcedure(other.to_string())),
        }
    }

    async fn update(
        &self,
        table: &str,
        patch: Row,
        filter: Filter,
    ) -> Result<Vec<Row>, StoreError> {
        let mut tables = self.tables.lock().await;
        let rows = tables.table_mut(table)?;

        let mut affected = Vec::new();
        for row in rows.iter_mut().filter(|r| filter.matches(r)) {
            for (k, v) in &patch {
                row.insert(k.clone(), v.clone());
            }
            affected.push(row.clone());
        }
        drop(tables);

        for row in &affected {
            self.publish(table, row);
        }
        Ok(affected)
    }

    async fn insert(&self, table: &str, mut row: Row) -> Result<Row, StoreError> {
        if !row.contains_key("id") {
            row.insert("id".to_string(), json!(Uuid::new_v4().to_string()));
        }

        let mut tables = self.tables.lock().await;
        tables.table_mut(table)?.push(row.clone());
        drop(tables);

        self.publish(table, &row);
        Ok(row)
    }

    fn changes(&self, table: &str) -> broadcast::Receiver<Row> {
        self.channels
            .entry(table.to_string())
            .or_insert_with(|| broadcast::channel(CHANGE_CHANNEL_CAPACITY).0)
            .subscribe()
    }
}

// Stored-procedure bodies. Each runs entirely under the table lock and
// returns `false` instead of erroring when a precondition is not met.
impl MemoryStore {
    async fn start_cost_review(&self, params: Row) -> Result<Value, StoreError> {
        const P: &str = procedure::START_COST_REVIEW;
        let task_id = p_str(&params, P, "task_id")?;
        let worker = p_str(&params, P, "delivery_man_id")?;

        let mut tables = self.tables.lock().await;

        let can_claim = tables
            .personnel_mut(&worker)
            .map(|r| {
                bool_field(r, "is_available") && bool_field(r, "is_online")
            })
            .unwrap_or(false);
        if !can_claim {
            return Ok(json!(false));
        }

        let indexes = tables.task_indexes(&task_id);
        if !tables.all_status(&indexes, &[TaskStatus::Pending]) {
            return Ok(json!(false));
        }

        let now = now_ms();
        let mut changed = Vec::new();
        for &i in &indexes {
            let row = &mut tables.tasks[i];
            row.insert("status".into(), json!(TaskStatus::CostReview.as_str()));
            row.insert("delivery_man_id".into(), json!(worker));
            row.insert("updated_at".into(), json!(now));
            changed.push(row.clone());
        }

        let personnel = tables
            .personnel_mut(&worker)
            .map(|r| {
                r.insert("is_available".into(), json!(false));
                r.clone()
            });
        drop(tables);

        for row in &changed {
            self.publish(relation::TASKS, row);
        }
        if let Some(row) = personnel {
            self.publish(relation::DELIVERY_PERSONNEL, &row);
        }
        Ok(json!(true))
    }

    /// Shared body for `propose_task_cost` and `update_cost_proposal`; the
    /// latter requires an existing pending row to supersede.
    async fn propose_task_cost(&self, params: Row, update_only: bool) -> Result<Value, StoreError> {
        const P: &str = procedure::PROPOSE_TASK_COST;
        let task_id = p_str(&params, P, "task_id")?;
        let worker = p_str(&params, P, "delivery_man_id")?;
        let cost = p_f64(&params, P, "proposed_cost")?;
        let notes = p_opt_str(&params, "notes");

        if cost <= 0.0 {
            return Ok(json!(false));
        }

        let mut tables = self.tables.lock().await;
        let indexes = tables.task_indexes(&task_id);

        let allowed = if update_only {
            vec![TaskStatus::CostReview, TaskStatus::CostProposed]
        } else {
            vec![TaskStatus::CostReview]
        };
        if !tables.all_status(&indexes, &allowed) || !tables.all_owned_by(&indexes, &worker) {
            return Ok(json!(false));
        }

        let now = now_ms();
        let existing = tables.proposal_for_worker(&task_id, &worker, "pending");
        if update_only && existing.is_none() {
            return Ok(json!(false));
        }

        let proposal = match existing {
            // Supersede in place: one pending row per (task, worker).
            Some(i) => {
                let row = &mut tables.cost_proposals[i];
                row.insert("proposed_cost".into(), json!(cost));
                row.insert("notes".into(), json!(notes));
                row.insert("proposed_at".into(), json!(now));
                row.clone()
            }
            None => {
                let mut row = Row::new();
                row.insert("id".into(), json!(Uuid::new_v4().to_string()));
                row.insert("task_id".into(), json!(task_id));
                row.insert("delivery_man_id".into(), json!(worker));
                row.insert("proposed_cost".into(), json!(cost));
                row.insert("notes".into(), json!(notes));
                row.insert("status".into(), json!("pending"));
                row.insert("counter_cost".into(), Value::Null);
                row.insert("counter_notes".into(), Value::Null);
                row.insert("proposed_at".into(), json!(now));
                tables.cost_proposals.push(row.clone());
                row
            }
        };

        let mut changed = Vec::new();
        for &i in &indexes {
            let row = &mut tables.tasks[i];
            row.insert("status".into(), json!(TaskStatus::CostProposed.as_str()));
            row.insert("updated_at".into(), json!(now));
            changed.push(row.clone());
        }
        drop(tables);

        self.publish(relation::COST_PROPOSALS, &proposal);
        for row in &changed {
            self.publish(relation::TASKS, row);
        }
        Ok(json!(true))
    }

    async fn accept_cost_proposal(
        &self,
        params: Row,
        proposal_id: Option<String>,
    ) -> Result<Value, StoreError> {
        const P: &str = procedure::ACCEPT_COST_PROPOSAL;
        let task_id = p_str(&params, P, "task_id")?;

        let mut tables = self.tables.lock().await;
        let indexes = tables.task_indexes(&task_id);
        if !tables.all_status(
            &indexes,
            &[TaskStatus::CostProposed, TaskStatus::DeliveryCounterProposed],
        ) {
            return Ok(json!(false));
        }

        let chosen = match &proposal_id {
            Some(pid) => tables.cost_proposals.iter().position(|r| {
                str_field(r, "id") == Some(pid.as_str())
                    && str_field(r, "task_id") == Some(task_id.as_str())
                    && str_field(r, "status") == Some("pending")
            }),
            None => tables.oldest_pending_proposal(&task_id),
        };
        let Some(chosen) = chosen else {
            return Ok(json!(false));
        };

        let worker = str_field(&tables.cost_proposals[chosen], "delivery_man_id")
            .unwrap_or_default()
            .to_string();
        let cost = tables.cost_proposals[chosen]
            .get("proposed_cost")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);

        let now = now_ms();
        let mut changed_proposals = Vec::new();
        for (i, row) in tables.cost_proposals.iter_mut().enumerate() {
            if str_field(row, "task_id") != Some(task_id.as_str()) {
                continue;
            }
            if i == chosen {
                row.insert("status".into(), json!("accepted"));
                changed_proposals.push(row.clone());
            } else if str_field(row, "status") == Some("pending") {
                row.insert("status".into(), json!("rejected"));
                changed_proposals.push(row.clone());
            }
        }

        let changed_tasks = assign_members(&mut tables, &indexes, &worker, cost, now);
        drop(tables);

        for row in &changed_proposals {
            self.publish(relation::COST_PROPOSALS, row);
        }
        for row in &changed_tasks {
            self.publish(relation::TASKS, row);
        }
        Ok(json!(true))
    }

    async fn reject_all_cost_proposals(&self, params: Row) -> Result<Value, StoreError> {
        const P: &str = procedure::REJECT_ALL_COST_PROPOSALS;
        let task_id = p_str(&params, P, "task_id")?;

        let mut tables = self.tables.lock().await;
        let indexes = tables.task_indexes(&task_id);
        let rejectable = [
            TaskStatus::CostReview,
            TaskStatus::CostProposed,
            TaskStatus::UserCounterProposed,
            TaskStatus::DeliveryCounterProposed,
        ];
        if !tables.all_status(&indexes, &rejectable) {
            return Ok(json!(false));
        }

        let changed = release_negotiation(&mut tables, &task_id, &indexes);
        drop(tables);

        self.publish_release(&changed);
        Ok(json!(true))
    }

    async fn cancel_cost_review(&self, params: Row) -> Result<Value, StoreError> {
        const P: &str = procedure::CANCEL_COST_REVIEW;
        let task_id = p_str(&params, P, "task_id")?;
        let worker = p_str(&params, P, "delivery_man_id")?;

        let mut tables = self.tables.lock().await;
        let indexes = tables.task_indexes(&task_id);
        if !tables.all_status(&indexes, &[TaskStatus::CostReview])
            || !tables.all_owned_by(&indexes, &worker)
        {
            return Ok(json!(false));
        }

        let changed = release_negotiation(&mut tables, &task_id, &indexes);
        drop(tables);

        self.publish_release(&changed);
        Ok(json!(true))
    }

    async fn user_propose_counter_offer(&self, params: Row) -> Result<Value, StoreError> {
        const P: &str = procedure::USER_PROPOSE_COUNTER_OFFER;
        let task_id = p_str(&params, P, "task_id")?;
        let counter_cost = p_f64(&params, P, "proposed_cost")?;
        let notes = p_opt_str(&params, "notes");

        if counter_cost <= 0.0 {
            return Ok(json!(false));
        }

        let mut tables = self.tables.lock().await;
        let indexes = tables.task_indexes(&task_id);
        if !tables.all_status(
            &indexes,
            &[TaskStatus::CostProposed, TaskStatus::DeliveryCounterProposed],
        ) {
            return Ok(json!(false));
        }

        let Some(p) = tables.oldest_pending_proposal(&task_id) else {
            return Ok(json!(false));
        };

        let now = now_ms();
        let proposal = {
            let row = &mut tables.cost_proposals[p];
            row.insert("status".into(), json!("user_counter"));
            row.insert("counter_cost".into(), json!(counter_cost));
            row.insert("counter_notes".into(), json!(notes));
            row.clone()
        };

        let mut changed = Vec::new();
        for &i in &indexes {
            let row = &mut tables.tasks[i];
            row.insert(
                "status".into(),
                json!(TaskStatus::UserCounterProposed.as_str()),
            );
            row.insert("updated_at".into(), json!(now));
            changed.push(row.clone());
        }
        drop(tables);

        self.publish(relation::COST_PROPOSALS, &proposal);
        for row in &changed {
            self.publish(relation::TASKS, row);
        }
        Ok(json!(true))
    }

    async fn respond_to_counter_offer(&self, params: Row) -> Result<Value, StoreError> {
        const P: &str = procedure::DELIVERY_MAN_RESPOND_TO_COUNTER_OFFER;
        let task_id = p_str(&params, P, "task_id")?;
        let worker = p_str(&params, P, "delivery_man_id")?;
        let response = p_str(&params, P, "response_type")?;
        let new_cost = params.get("new_cost").and_then(Value::as_f64);
        let notes = p_opt_str(&params, "notes");

        let mut tables = self.tables.lock().await;
        let indexes = tables.task_indexes(&task_id);
        if !tables.all_status(&indexes, &[TaskStatus::UserCounterProposed])
            || !tables.all_owned_by(&indexes, &worker)
        {
            return Ok(json!(false));
        }

        let Some(p) = tables.proposal_for_worker(&task_id, &worker, "user_counter") else {
            return Ok(json!(false));
        };

        let now = now_ms();
        match response.as_str() {
            "accept" => {
                let Some(cost) = tables.cost_proposals[p]
                    .get("counter_cost")
                    .and_then(Value::as_f64)
                else {
                    return Ok(json!(false));
                };
                let proposal = {
                    let row = &mut tables.cost_proposals[p];
                    row.insert("status".into(), json!("accepted"));
                    row.clone()
                };
                let changed = assign_members(&mut tables, &indexes, &worker, cost, now);
                drop(tables);

                self.publish(relation::COST_PROPOSALS, &proposal);
                for row in &changed {
                    self.publish(relation::TASKS, row);
                }
                Ok(json!(true))
            }
            "reject" => {
                let changed = release_negotiation(&mut tables, &task_id, &indexes);
                drop(tables);

                self.publish_release(&changed);
                Ok(json!(true))
            }
            "counter" => {
                let Some(cost) = new_cost.filter(|c| *c > 0.0) else {
                    return Ok(json!(false));
                };
                let proposal = {
                    let row = &mut tables.cost_proposals[p];
                    row.insert("proposed_cost".into(), json!(cost));
                    row.insert("notes".into(), json!(notes));
                    row.insert("status".into(), json!("pending"));
                    row.insert("counter_cost".into(), Value::Null);
                    row.insert("counter_notes".into(), Value::Null);
                    row.insert("proposed_at".into(), json!(now));
                    row.clone()
                };
                let mut changed = Vec::new();
                for &i in &indexes {
                    let row = &mut tables.tasks[i];
                    row.insert(
                        "status".into(),
                        json!(TaskStatus::DeliveryCounterProposed.as_str()),
                    );
                    row.insert("updated_at".into(), json!(now));
                    changed.push(row.clone());
                }
                drop(tables);

                self.publish(relation::COST_PROPOSALS, &proposal);
                for row in &changed {
                    self.publish(relation::TASKS, row);
                }
                Ok(json!(true))
            }
            other => Err(StoreError::BadParams {
                procedure: P,
                message: format!("unknown response_type `{other}`"),
            }),
        }
    }

    async fn finalize_cost_negotiation(&self, params: Row) -> Result<Value, StoreError> {
        const P: &str = procedure::FINALIZE_COST_NEGOTIATION;
        let task_id = p_str(&params, P, "task_id")?;
        let final_cost = p_f64(&params, P, "final_cost")?;
        let agreed_by = p_str(&params, P, "agreed_by")?;

        if final_cost <= 0.0 {
            return Ok(json!(false));
        }

        let mut tables = self.tables.lock().await;
        let indexes = tables.task_indexes(&task_id);
        let negotiating = [
            TaskStatus::CostProposed,
            TaskStatus::UserCounterProposed,
            TaskStatus::DeliveryCounterProposed,
        ];
        if !tables.all_status(&indexes, &negotiating) {
            return Ok(json!(false));
        }

        let Some(worker) = str_field(&tables.tasks[indexes[0]], "delivery_man_id")
            .map(str::to_string)
        else {
            return Ok(json!(false));
        };

        let now = now_ms();
        let mut changed_proposals = Vec::new();
        for row in tables.cost_proposals.iter_mut() {
            if str_field(row, "task_id") != Some(task_id.as_str()) {
                continue;
            }
            match str_field(row, "status") {
                Some("pending") | Some("user_counter") => {
                    let status = if str_field(row, "delivery_man_id") == Some(worker.as_str()) {
                        "accepted"
                    } else {
                        "rejected"
                    };
                    row.insert("status".into(), json!(status));
                    changed_proposals.push(row.clone());
                }
                _ => {}
            }
        }

        let mut changed_tasks = assign_members(&mut tables, &indexes, &worker, final_cost, now);
        for (&i, row) in indexes.iter().zip(changed_tasks.iter_mut()) {
            tables.tasks[i].insert("agreed_by".into(), json!(agreed_by));
            row.insert("agreed_by".into(), json!(agreed_by.clone()));
        }
        drop(tables);

        for row in &changed_proposals {
            self.publish(relation::COST_PROPOSALS, row);
        }
        for row in &changed_tasks {
            self.publish(relation::TASKS, row);
        }
        Ok(json!(true))
    }

    async fn cancel_cost_negotiation(&self, params: Row) -> Result<Value, StoreError> {
        const P: &str = procedure::CANCEL_COST_NEGOTIATION;
        let task_id = p_str(&params, P, "task_id")?;

        let mut tables = self.tables.lock().await;
        let indexes = tables.task_indexes(&task_id);
        let cancellable = [
            TaskStatus::CostReview,
            TaskStatus::CostProposed,
            TaskStatus::UserCounterProposed,
            TaskStatus::DeliveryCounterProposed,
        ];
        if !tables.all_status(&indexes, &cancellable) {
            return Ok(json!(false));
        }

        let changed = release_negotiation(&mut tables, &task_id, &indexes);
        drop(tables);

        self.publish_release(&changed);
        Ok(json!(true))
    }

    async fn tasks_near_location(&self, params: Row) -> Result<Value, StoreError> {
        const P: &str = procedure::GET_TASKS_NEAR_LOCATION;
        let lat = p_f64(&params, P, "latitude")?;
        let lon = p_f64(&params, P, "longitude")?;
        let radius_km = p_f64(&params, P, "radius_km")?;

        let tables = self.tables.lock().await;
        let rows: Vec<Value> = tables
            .tasks
            .iter()
            .filter(|r| str_field(r, "status") == Some("pending"))
            .filter(|r| {
                first_location(r).is_some_and(|(task_lat, task_lon)| {
                    haversine_km(lat, lon, task_lat, task_lon) <= radius_km
                })
            })
            .map(|r| Value::Object(r.clone()))
            .collect();
        Ok(Value::Array(rows))
    }

    async fn mark_location_completed(&self, params: Row) -> Result<Value, StoreError> {
        const P: &str = procedure::MARK_LOCATION_COMPLETED;
        let task_id = p_str(&params, P, "task_id")?;
        let index = p_u64(&params, P, "location_index")?;

        let mut tables = self.tables.lock().await;
        let Some(row) = tables
            .tasks
            .iter_mut()
            .find(|r| str_field(r, "id") == Some(task_id.as_str()))
        else {
            return Ok(json!(false));
        };

        let location_count = row
            .get("locations")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0) as u64;
        if index >= location_count {
            return Ok(json!(false));
        }

        let mut completed: Vec<u64> = row
            .get("completed_locations")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_u64).collect())
            .unwrap_or_default();
        if !completed.contains(&index) {
            completed.push(index);
        }
        row.insert("completed_locations".into(), json!(completed));
        row.insert("updated_at".into(), json!(now_ms()));
        let changed = row.clone();
        drop(tables);

        self.publish(relation::TASKS, &changed);
        Ok(json!(true))
    }

    async fn add_location_note(&self, params: Row) -> Result<Value, StoreError> {
        const P: &str = procedure::ADD_LOCATION_NOTE;
        let task_id = p_str(&params, P, "task_id")?;
        let index = p_u64(&params, P, "location_index")?;
        let note = p_str(&params, P, "note")?;

        let mut tables = self.tables.lock().await;
        let Some(row) = tables
            .tasks
            .iter_mut()
            .find(|r| str_field(r, "id") == Some(task_id.as_str()))
        else {
            return Ok(json!(false));
        };

        let mut notes = match row.get("location_notes") {
            Some(Value::Object(map)) => map.clone(),
            _ => Row::new(),
        };
        notes.insert(index.to_string(), json!(note));
        row.insert("location_notes".into(), Value::Object(notes));
        row.insert("updated_at".into(), json!(now_ms()));
        let changed = row.clone();
        drop(tables);

        self.publish(relation::TASKS, &changed);
        Ok(json!(true))
    }

    fn publish_release(&self, changed: &ReleasedRows) {
        for row in &changed.proposals {
            self.publish(relation::COST_PROPOSALS, row);
        }
        for row in &changed.tasks {
            self.publish(relation::TASKS, row);
        }
        if let Some(row) = &changed.personnel {
            self.publish(relation::DELIVERY_PERSONNEL, row);
        }
    }
}

struct ReleasedRows {
    tasks: Vec<Row>,
    proposals: Vec<Row>,
    personnel: Option<Row>,
}

/// Return member tasks to `pending`, reject in-flight proposals and restore
/// the owning worker's availability. Shared by every cancellation path.
fn release_negotiation(tables: &mut Tables, task_id: &str, indexes: &[usize]) -> ReleasedRows {
    let now = now_ms();
    let prior_worker = indexes
        .first()
        .and_then(|&i| str_field(&tables.tasks[i], "delivery_man_id").map(str::to_string));

    let mut proposals = Vec::new();
    for row in tables.cost_proposals.iter_mut() {
        if str_field(row, "task_id") != Some(task_id) {
            continue;
        }
        if matches!(str_field(row, "status"), Some("pending") | Some("user_counter")) {
            row.insert("status".into(), json!("rejected"));
            proposals.push(row.clone());
        }
    }

    let mut tasks = Vec::new();
    for &i in indexes {
        let row = &mut tables.tasks[i];
        row.insert("status".into(), json!(TaskStatus::Pending.as_str()));
        row.insert("delivery_man_id".into(), Value::Null);
        row.insert("accepted_cost".into(), Value::Null);
        row.insert("updated_at".into(), json!(now));
        tasks.push(row.clone());
    }

    let personnel = prior_worker.and_then(|w| {
        tables.personnel_mut(&w).map(|r| {
            r.insert("is_available".into(), json!(true));
            r.clone()
        })
    });

    ReleasedRows {
        tasks,
        proposals,
        personnel,
    }
}

fn assign_members(
    tables: &mut Tables,
    indexes: &[usize],
    worker: &str,
    cost: f64,
    now: u64,
) -> Vec<Row> {
    let mut changed = Vec::new();
    for &i in indexes {
        let row = &mut tables.tasks[i];
        row.insert("status".into(), json!(TaskStatus::Assigned.as_str()));
        row.insert("delivery_man_id".into(), json!(worker));
        row.insert("accepted_cost".into(), json!(cost));
        row.insert("assigned_at".into(), json!(now));
        row.insert("updated_at".into(), json!(now));
        changed.push(row.clone());
    }
    changed
}

fn str_field<'a>(row: &'a Row, key: &str) -> Option<&'a str> {
    row.get(key).and_then(Value::as_str)
}

fn bool_field(row: &Row, key: &str) -> bool {
    row.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn first_location(row: &Row) -> Option<(f64, f64)> {
    let loc = row.get("locations")?.as_array()?.first()?.as_object()?;
    Some((
        loc.get("latitude")?.as_f64()?,
        loc.get("longitude")?.as_f64()?,
    ))
}

fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

fn p_str(params: &Row, proc: &'static str, key: &str) -> Result<String, StoreError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| StoreError::BadParams {
            procedure: proc,
            message: format!("missing string param `{key}`"),
        })
}

fn p_f64(params: &Row, proc: &'static str, key: &str) -> Result<f64, StoreError> {
    params
        .get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| StoreError::BadParams {
            procedure: proc,
            message: format!("missing numeric param `{key}`"),
        })
}

fn p_u64(params: &Row, proc: &'static str, key: &str) -> Result<u64, StoreError> {
    params
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| StoreError::BadParams {
            procedure: proc,
            message: format!("missing integer param `{key}`"),
        })
}

fn p_opt_str(params: &Row, key: &str) -> Option<String> {
    params.get(key).and_then(Value::as_str).map(str::to_string)
}
