use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::enums::TaskStatus;
use crate::error::{DispatchError, DispatchResult};
use crate::ids::{TaskId, UserId, WorkerId};
use crate::row::{self, Row};

/// One stop of a task.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TaskLocation {
    pub name: String,
    pub purpose: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
}

impl TaskLocation {
    pub fn new(name: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            name: name.into(),
            purpose: None,
            latitude,
            longitude,
        }
    }
}

/// A requested unit of errand work.
///
/// A task whose id is `group-<bundleId>` is a synthetic aggregate produced by
/// the bundle aggregator and never exists as a store row.
#[derive(Clone, Debug, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub locations: Vec<TaskLocation>,
    pub scheduled_at: Option<u64>,
    pub user_id: UserId,
    pub delivery_man_id: Option<WorkerId>,
    pub image_url: Option<String>,
    pub special_instructions: Option<String>,
    /// Explicit bundle membership. Rows written before the schema migration
    /// only carry the `group:<id>` marker inside `special_instructions`;
    /// parsing falls back to that marker.
    pub bundle_id: Option<String>,
    pub status: TaskStatus,
    pub accepted_cost: Option<f64>,
    /// Indexes into `locations` that the worker has marked done.
    pub completed_locations: Vec<u64>,
    /// Worker notes keyed by location index (decimal string keys, as stored).
    pub location_notes: BTreeMap<String, String>,
    pub created_at: u64,
    pub updated_at: u64,
    pub assigned_at: Option<u64>,
    pub completed_at: Option<u64>,
}

impl Task {
    pub fn from_row(r: &Row) -> DispatchResult<Self> {
        let id = TaskId(row::req_str(r, "id")?);
        let special_instructions = row::opt_str(r, "special_instructions")?;

        let bundle_id = match row::opt_str(r, "bundle_id")? {
            Some(b) => Some(b),
            None => special_instructions
                .as_deref()
                .and_then(extract_bundle_marker)
                .map(str::to_string),
        };

        let status_raw = row::req_str(r, "status")?;
        let status = TaskStatus::parse(&status_raw).ok_or_else(|| {
            DispatchError::validation(format!("unknown task status `{status_raw}`"))
        })?;

        Ok(Task {
            id,
            description: row::req_str(r, "description")?,
            locations: parse_locations(r)?,
            scheduled_at: row::opt_u64(r, "scheduled_at")?,
            user_id: UserId(row::req_str(r, "user_id")?),
            delivery_man_id: row::opt_str(r, "delivery_man_id")?.map(WorkerId),
            image_url: row::opt_str(r, "image_url")?,
            special_instructions,
            bundle_id,
            status,
            accepted_cost: row::opt_f64(r, "accepted_cost")?,
            completed_locations: parse_completed_locations(r)?,
            location_notes: parse_location_notes(r)?,
            created_at: row::req_u64(r, "created_at")?,
            updated_at: row::opt_u64(r, "updated_at")?.unwrap_or(0),
            assigned_at: row::opt_u64(r, "assigned_at")?,
            completed_at: row::opt_u64(r, "completed_at")?,
        })
    }

    pub fn to_row(&self) -> Row {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Row::new(),
        }
    }

    pub fn note_for(&self, location_index: usize) -> Option<&str> {
        self.location_notes
            .get(&location_index.to_string())
            .map(String::as_str)
    }
}

/// Parse the legacy `group:<id>` marker out of a free-text instructions
/// field. The id runs to the next whitespace or end of string.
pub fn extract_bundle_marker(instructions: &str) -> Option<&str> {
    let start = instructions.find("group:")? + "group:".len();
    let rest = &instructions[start..];
    let id = match rest.find(char::is_whitespace) {
        Some(end) => &rest[..end],
        None => rest,
    };
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

fn parse_locations(r: &Row) -> DispatchResult<Vec<TaskLocation>> {
    let raw = match r.get("locations") {
        Some(Value::Array(items)) => items,
        Some(Value::Null) | None => return Ok(Vec::new()),
        Some(_) => {
            return Err(DispatchError::validation(
                "field `locations` is not an array",
            ))
        }
    };

    let mut locations = Vec::with_capacity(raw.len());
    for item in raw {
        let obj = item.as_object().ok_or_else(|| {
            DispatchError::validation("location entry is not an object")
        })?;
        locations.push(TaskLocation {
            name: row::req_str(obj, "name")?,
            purpose: row::opt_str(obj, "purpose")?,
            latitude: row::req_f64(obj, "latitude")?,
            longitude: row::req_f64(obj, "longitude")?,
        });
    }
    Ok(locations)
}

fn parse_completed_locations(r: &Row) -> DispatchResult<Vec<u64>> {
    let raw = match r.get("completed_locations") {
        Some(Value::Array(items)) => items,
        Some(Value::Null) | None => return Ok(Vec::new()),
        Some(_) => {
            return Err(DispatchError::validation(
                "field `completed_locations` is not an array",
            ))
        }
    };

    raw.iter()
        .map(|v| {
            v.as_u64().ok_or_else(|| {
                DispatchError::validation("completed location index is not an integer")
            })
        })
        .collect()
}

fn parse_location_notes(r: &Row) -> DispatchResult<BTreeMap<String, String>> {
    let raw = match r.get("location_notes") {
        Some(Value::Object(map)) => map,
        Some(Value::Null) | None => return Ok(BTreeMap::new()),
        Some(_) => {
            return Err(DispatchError::validation(
                "field `location_notes` is not an object",
            ))
        }
    };

    let mut notes = BTreeMap::new();
    for (k, v) in raw {
        let note = v.as_str().ok_or_else(|| {
            DispatchError::validation("location note is not a string")
        })?;
        notes.insert(k.clone(), note.to_string());
    }
    Ok(notes)
}
