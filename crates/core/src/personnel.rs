use serde::Serialize;
use serde_json::Value;

use crate::error::DispatchResult;
use crate::ids::WorkerId;
use crate::row::{self, Row};

/// Availability record for a delivery worker.
#[derive(Clone, Debug, Serialize)]
pub struct DeliveryPersonnel {
    pub id: WorkerId,
    pub is_available: bool,
    pub is_online: bool,
    pub rating: f64,
    pub delivery_count: u64,
}

impl DeliveryPersonnel {
    /// A worker must be both available and online to claim new work.
    pub fn can_claim(&self) -> bool {
        self.is_available && self.is_online
    }

    pub fn from_row(r: &Row) -> DispatchResult<Self> {
        Ok(DeliveryPersonnel {
            id: WorkerId(row::req_str(r, "id")?),
            is_available: row::opt_bool(r, "is_available", false)?,
            is_online: row::opt_bool(r, "is_online", false)?,
            rating: row::opt_f64(r, "rating")?.unwrap_or(0.0),
            delivery_count: row::opt_u64(r, "delivery_count")?.unwrap_or(0),
        })
    }

    pub fn to_row(&self) -> Row {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Row::new(),
        }
    }
}
