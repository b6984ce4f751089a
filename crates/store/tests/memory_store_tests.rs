use std::sync::Arc;

use errand_core::row::Row;
use errand_store::store::{procedure, relation, RelationalStore};
use errand_store::{Filter, MemoryStore, Order, TaskQueries};
use serde_json::{json, Value};

fn task_row(id: &str, status: &str) -> Row {
    let mut row = Row::new();
    row.insert("id".into(), json!(id));
    row.insert("description".into(), json!("deliver documents"));
    row.insert(
        "locations".into(),
        json!([{"name": "Office", "purpose": "dropoff", "latitude": 31.95, "longitude": 35.91}]),
    );
    row.insert("user_id".into(), json!("user-1"));
    row.insert("status".into(), json!(status));
    row.insert("created_at".into(), json!(1_700_000_000_000u64));
    row.insert("updated_at".into(), json!(1_700_000_000_000u64));
    row
}

fn worker_row(id: &str, available: bool, online: bool) -> Row {
    let mut row = Row::new();
    row.insert("id".into(), json!(id));
    row.insert("is_available".into(), json!(available));
    row.insert("is_online".into(), json!(online));
    row.insert("rating".into(), json!(4.5));
    row.insert("delivery_count".into(), json!(12));
    row
}

fn claim_params(task: &str, worker: &str) -> Row {
    let mut params = Row::new();
    params.insert("task_id".into(), json!(task));
    params.insert("delivery_man_id".into(), json!(worker));
    params
}

fn propose_params(task: &str, worker: &str, cost: f64) -> Row {
    let mut params = Row::new();
    params.insert("task_id".into(), json!(task));
    params.insert("delivery_man_id".into(), json!(worker));
    params.insert("proposed_cost".into(), json!(cost));
    params
}

async fn seed(store: &MemoryStore, tasks: &[Row], workers: &[Row]) {
    for row in tasks {
        store.insert(relation::TASKS, row.clone()).await.unwrap();
    }
    for row in workers {
        store
            .insert(relation::DELIVERY_PERSONNEL, row.clone())
            .await
            .unwrap();
    }
}

async fn task_status(store: &MemoryStore, id: &str) -> String {
    let rows = store
        .select(relation::TASKS, Filter::new().eq("id", id), None)
        .await
        .unwrap();
    rows[0]
        .get("status")
        .and_then(Value::as_str)
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn views_filter_by_status_category() {
    let store = MemoryStore::new();
    seed(
        &store,
        &[
            task_row("t1", "pending"),
            task_row("t2", "cost_proposed"),
            task_row("t3", "assigned"),
            task_row("t4", "completed"),
        ],
        &[],
    )
    .await;

    let available = store
        .select(relation::AVAILABLE_TASKS, Filter::new(), None)
        .await
        .unwrap();
    assert_eq!(available.len(), 2);

    let assigned = store
        .select(relation::ASSIGNED_TASKS, Filter::new(), None)
        .await
        .unwrap();
    assert_eq!(assigned.len(), 1);
    assert_eq!(assigned[0].get("id"), Some(&json!("t3")));
}

#[tokio::test]
async fn start_cost_review_claims_task_and_reserves_worker() {
    let store = MemoryStore::new();
    seed(
        &store,
        &[task_row("t1", "pending")],
        &[worker_row("w1", true, true)],
    )
    .await;

    let result = store
        .rpc(procedure::START_COST_REVIEW, claim_params("t1", "w1"))
        .await
        .unwrap();
    assert_eq!(result, json!(true));
    assert_eq!(task_status(&store, "t1").await, "cost_review");

    let workers = store
        .select(
            relation::DELIVERY_PERSONNEL,
            Filter::new().eq("id", "w1"),
            None,
        )
        .await
        .unwrap();
    assert_eq!(workers[0].get("is_available"), Some(&json!(false)));
}

#[tokio::test]
async fn start_cost_review_rejects_offline_worker_and_taken_task() {
    let store = MemoryStore::new();
    seed(
        &store,
        &[task_row("t1", "pending"), task_row("t2", "assigned")],
        &[worker_row("w-offline", true, false), worker_row("w1", true, true)],
    )
    .await;

    let result = store
        .rpc(procedure::START_COST_REVIEW, claim_params("t1", "w-offline"))
        .await
        .unwrap();
    assert_eq!(result, json!(false));

    let result = store
        .rpc(procedure::START_COST_REVIEW, claim_params("t2", "w1"))
        .await
        .unwrap();
    assert_eq!(result, json!(false));
    assert_eq!(task_status(&store, "t2").await, "assigned");
}

#[tokio::test]
async fn concurrent_claims_admit_exactly_one_worker() {
    let store = Arc::new(MemoryStore::new());
    seed(
        &store,
        &[task_row("t1", "pending")],
        &[worker_row("w1", true, true), worker_row("w2", true, true)],
    )
    .await;

    let a = tokio::spawn({
        let store = Arc::clone(&store);
        async move {
            store
                .rpc(procedure::START_COST_REVIEW, claim_params("t1", "w1"))
                .await
                .unwrap()
        }
    });
    let b = tokio::spawn({
        let store = Arc::clone(&store);
        async move {
            store
                .rpc(procedure::START_COST_REVIEW, claim_params("t1", "w2"))
                .await
                .unwrap()
        }
    });

    let (a, b) = (a.await.unwrap(), b.await.unwrap());
    let wins = [&a, &b].iter().filter(|v| ***v == json!(true)).count();
    assert_eq!(wins, 1, "exactly one claim must win, got {a} / {b}");
}

#[tokio::test]
async fn update_supersedes_pending_proposal_instead_of_duplicating() {
    let store = MemoryStore::new();
    seed(
        &store,
        &[task_row("t1", "pending")],
        &[worker_row("w1", true, true)],
    )
    .await;

    store
        .rpc(procedure::START_COST_REVIEW, claim_params("t1", "w1"))
        .await
        .unwrap();
    store
        .rpc(procedure::PROPOSE_TASK_COST, propose_params("t1", "w1", 500.0))
        .await
        .unwrap();
    let result = store
        .rpc(
            procedure::UPDATE_COST_PROPOSAL,
            propose_params("t1", "w1", 450.0),
        )
        .await
        .unwrap();
    assert_eq!(result, json!(true));

    let pending = store
        .select(
            relation::COST_PROPOSALS,
            Filter::new().eq("task_id", "t1").eq("status", "pending"),
            None,
        )
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].get("proposed_cost"), Some(&json!(450.0)));
}

#[tokio::test]
async fn update_proposal_without_existing_row_fails_precondition() {
    let store = MemoryStore::new();
    seed(
        &store,
        &[task_row("t1", "pending")],
        &[worker_row("w1", true, true)],
    )
    .await;

    store
        .rpc(procedure::START_COST_REVIEW, claim_params("t1", "w1"))
        .await
        .unwrap();
    let result = store
        .rpc(
            procedure::UPDATE_COST_PROPOSAL,
            propose_params("t1", "w1", 450.0),
        )
        .await
        .unwrap();
    assert_eq!(result, json!(false));
}

#[tokio::test]
async fn accept_takes_oldest_pending_proposal() {
    let store = MemoryStore::new();
    seed(&store, &[task_row("t1", "cost_proposed")], &[]).await;

    // Two competing proposals, the first one older.
    let mut older = propose_params("t1", "w1", 500.0);
    older.insert("status".into(), json!("pending"));
    older.insert("proposed_at".into(), json!(1_000u64));
    let mut newer = propose_params("t1", "w2", 400.0);
    newer.insert("status".into(), json!("pending"));
    newer.insert("proposed_at".into(), json!(2_000u64));
    store.insert(relation::COST_PROPOSALS, older).await.unwrap();
    store.insert(relation::COST_PROPOSALS, newer).await.unwrap();

    let mut params = Row::new();
    params.insert("task_id".into(), json!("t1"));
    let result = store
        .rpc(procedure::ACCEPT_COST_PROPOSAL, params)
        .await
        .unwrap();
    assert_eq!(result, json!(true));

    let rows = store
        .select(
            relation::COST_PROPOSALS,
            Filter::new().eq("task_id", "t1"),
            Some(Order::asc("proposed_at")),
        )
        .await
        .unwrap();
    assert_eq!(rows[0].get("status"), Some(&json!("accepted")));
    assert_eq!(rows[1].get("status"), Some(&json!("rejected")));

    let task = store
        .select(relation::TASKS, Filter::new().eq("id", "t1"), None)
        .await
        .unwrap();
    assert_eq!(task[0].get("status"), Some(&json!("assigned")));
    assert_eq!(task[0].get("delivery_man_id"), Some(&json!("w1")));
    assert_eq!(task[0].get("accepted_cost"), Some(&json!(500.0)));
}

#[tokio::test]
async fn tasks_near_location_filters_by_radius() {
    let store = MemoryStore::new();
    let mut near = task_row("near", "pending");
    near.insert(
        "locations".into(),
        json!([{"name": "Close by", "latitude": 31.95, "longitude": 35.91}]),
    );
    let mut far = task_row("far", "pending");
    far.insert(
        "locations".into(),
        json!([{"name": "Another city", "latitude": 35.0, "longitude": 38.0}]),
    );
    seed(&store, &[near, far], &[]).await;

    let mut params = Row::new();
    params.insert("latitude".into(), json!(31.95));
    params.insert("longitude".into(), json!(35.91));
    params.insert("radius_km".into(), json!(10.0));
    let result = store
        .rpc(procedure::GET_TASKS_NEAR_LOCATION, params)
        .await
        .unwrap();

    let rows = result.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("id"), Some(&json!("near")));
}

#[tokio::test]
async fn list_near_falls_back_to_pending_on_procedure_failure() {
    // A store whose rpc surface always fails.
    struct BrokenRpc(MemoryStore);

    impl RelationalStore for BrokenRpc {
        async fn select(
            &self,
            relation: &str,
            filter: Filter,
            order: Option<Order>,
        ) -> Result<Vec<Row>, errand_store::StoreError> {
            self.0.select(relation, filter, order).await
        }

        async fn rpc(
            &self,
            procedure: &str,
            _params: Row,
        ) -> Result<Value, errand_store::StoreError> {
            Err(errand_store::StoreError::UnknownProcedure(
                procedure.to_string(),
            ))
        }

        async fn update(
            &self,
            table: &str,
            patch: Row,
            filter: Filter,
        ) -> Result<Vec<Row>, errand_store::StoreError> {
            self.0.update(table, patch, filter).await
        }

        async fn insert(&self, table: &str, row: Row) -> Result<Row, errand_store::StoreError> {
            self.0.insert(table, row).await
        }

        fn changes(&self, table: &str) -> tokio::sync::broadcast::Receiver<Row> {
            self.0.changes(table)
        }
    }

    let inner = MemoryStore::new();
    seed(&inner, &[task_row("t1", "pending"), task_row("t2", "assigned")], &[]).await;

    let queries = TaskQueries::new(Arc::new(BrokenRpc(inner)));
    let tasks = queries.list_near(31.95, 35.91, 10.0).await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id.as_str(), "t1");
}

#[tokio::test]
async fn malformed_rows_are_skipped_not_fatal() {
    let store = MemoryStore::new();
    let mut bad = task_row("bad", "pending");
    bad.remove("description");
    seed(&store, &[task_row("good", "pending"), bad], &[]).await;

    let queries = TaskQueries::new(Arc::new(store));
    let tasks = queries.list_available().await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id.as_str(), "good");
}

#[tokio::test]
async fn change_feed_emits_full_row_images() {
    let store = MemoryStore::new();
    let mut rx = store.changes(relation::TASKS);

    seed(&store, &[task_row("t1", "pending")], &[]).await;
    let inserted = rx.recv().await.unwrap();
    assert_eq!(inserted.get("id"), Some(&json!("t1")));

    store
        .update(
            relation::TASKS,
            {
                let mut patch = Row::new();
                patch.insert("status".into(), json!("assigned"));
                patch
            },
            Filter::new().eq("id", "t1"),
        )
        .await
        .unwrap();
    let updated = rx.recv().await.unwrap();
    assert_eq!(updated.get("status"), Some(&json!("assigned")));
}

#[tokio::test]
async fn mark_location_completed_is_bounded_and_idempotent() {
    let store = MemoryStore::new();
    seed(&store, &[task_row("t1", "assigned")], &[]).await;

    let mut params = Row::new();
    params.insert("task_id".into(), json!("t1"));
    params.insert("location_index".into(), json!(0));
    assert_eq!(
        store
            .rpc(procedure::MARK_LOCATION_COMPLETED, params.clone())
            .await
            .unwrap(),
        json!(true)
    );
    // Repeat marking the same stop does not duplicate the entry.
    store
        .rpc(procedure::MARK_LOCATION_COMPLETED, params)
        .await
        .unwrap();

    let rows = store
        .select(relation::TASKS, Filter::new().eq("id", "t1"), None)
        .await
        .unwrap();
    assert_eq!(rows[0].get("completed_locations"), Some(&json!([0])));

    let mut out_of_range = Row::new();
    out_of_range.insert("task_id".into(), json!("t1"));
    out_of_range.insert("location_index".into(), json!(5));
    assert_eq!(
        store
            .rpc(procedure::MARK_LOCATION_COMPLETED, out_of_range)
            .await
            .unwrap(),
        json!(false)
    );
}

#[tokio::test]
async fn add_location_note_stores_note_by_index() {
    let store = MemoryStore::new();
    seed(&store, &[task_row("t1", "assigned")], &[]).await;

    let mut params = Row::new();
    params.insert("task_id".into(), json!("t1"));
    params.insert("location_index".into(), json!(0));
    params.insert("note".into(), json!("gate code 1234"));
    assert_eq!(
        store
            .rpc(procedure::ADD_LOCATION_NOTE, params)
            .await
            .unwrap(),
        json!(true)
    );

    let rows = store
        .select(relation::TASKS, Filter::new().eq("id", "t1"), None)
        .await
        .unwrap();
    assert_eq!(
        rows[0].get("location_notes"),
        Some(&json!({"0": "gate code 1234"}))
    );
}
