//! The narrow relational-store surface the negotiation core consumes.

use errand_core::row::Row;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::filter::{Filter, Order};

/// Table and view names.
pub mod relation {
    pub const TASKS: &str = "tasks";
    pub const COST_PROPOSALS: &str = "cost_proposals";
    pub const DELIVERY_PERSONNEL: &str = "delivery_personnel";
    pub const TASK_EARNINGS: &str = "task_earnings";

    /// Views, one per status category.
    pub const AVAILABLE_TASKS: &str = "available_tasks";
    pub const COST_REVIEW_TASKS: &str = "cost_review_tasks";
    pub const COST_PROPOSED_TASKS: &str = "cost_proposed_tasks";
    pub const USER_COUNTER_TASKS: &str = "user_counter_tasks";
    pub const ASSIGNED_TASKS: &str = "assigned_tasks";
}

/// Server-side procedures. Each returns `true` on success and `false` (or
/// null) when a precondition was not met; precondition failures are results,
/// not exceptions.
pub mod procedure {
    pub const START_COST_REVIEW: &str = "start_cost_review";
    pub const PROPOSE_TASK_COST: &str = "propose_task_cost";
    pub const UPDATE_COST_PROPOSAL: &str = "update_cost_proposal";
    pub const ACCEPT_COST_PROPOSAL: &str = "accept_cost_proposal";
    pub const ACCEPT_SPECIFIC_COST_PROPOSAL: &str = "accept_specific_cost_proposal";
    pub const REJECT_ALL_COST_PROPOSALS: &str = "reject_all_cost_proposals";
    pub const CANCEL_COST_REVIEW: &str = "cancel_cost_review";
    pub const USER_PROPOSE_COUNTER_OFFER: &str = "user_propose_counter_offer";
    pub const DELIVERY_MAN_RESPOND_TO_COUNTER_OFFER: &str =
        "delivery_man_respond_to_counter_offer";
    pub const FINALIZE_COST_NEGOTIATION: &str = "finalize_cost_negotiation";
    pub const CANCEL_COST_NEGOTIATION: &str = "cancel_cost_negotiation";
    pub const GET_TASKS_NEAR_LOCATION: &str = "get_tasks_near_location";
    pub const MARK_LOCATION_COMPLETED: &str = "mark_location_completed";
    pub const ADD_LOCATION_NOTE: &str = "add_location_note";
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unknown relation: {0}")]
    UnknownRelation(String),

    #[error("unknown procedure: {0}")]
    UnknownProcedure(String),

    #[error("bad params for {procedure}: {message}")]
    BadParams {
        procedure: &'static str,
        message: String,
    },

    #[error("transport: {0}")]
    Transport(String),
}

/// Read/write access to the backing relational store.
///
/// Mutations must be atomic on the server side; the client never holds a
/// lock. Implementations also push a full row image on `changes` for every
/// insert or update, unfiltered; subscribers re-apply their own predicates.
#[allow(async_fn_in_trait)]
pub trait RelationalStore: Send + Sync {
    async fn select(
        &self,
        relation: &str,
        filter: Filter,
        order: Option<Order>,
    ) -> Result<Vec<Row>, StoreError>;

    async fn rpc(&self, procedure: &str, params: Row) -> Result<Value, StoreError>;

    /// Conditional update; returns the rows actually affected.
    async fn update(
        &self,
        table: &str,
        patch: Row,
        filter: Filter,
    ) -> Result<Vec<Row>, StoreError>;

    async fn insert(&self, table: &str, row: Row) -> Result<Row, StoreError>;

    fn changes(&self, table: &str) -> broadcast::Receiver<Row>;
}
