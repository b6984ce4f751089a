//! Bundle aggregation: collapse task rows sharing a bundle id into one
//! synthetic multi-stop entity.
//!
//! Pure function of its input. Output order is deterministic: singleton
//! tasks first in input order, then one synthetic task per bundle in
//! first-encounter order.

use errand_core::ids::TaskId;
use errand_core::task::{Task, TaskLocation};
use indexmap::IndexMap;

pub fn aggregate(tasks: Vec<Task>) -> Vec<Task> {
    let mut singles = Vec::new();
    let mut bundles: IndexMap<String, Vec<Task>> = IndexMap::new();

    for task in tasks {
        match task.bundle_id.clone() {
            Some(bundle_id) => bundles.entry(bundle_id).or_default().push(task),
            None => singles.push(task),
        }
    }

    let mut out = singles;
    out.extend(
        bundles
            .into_iter()
            .filter_map(|(bundle_id, members)| synthesize(bundle_id, members)),
    );
    out
}

/// Build the aggregate entity for one bundle. Display fields come from the
/// first member in encounter order; member ids are not retained, callers
/// needing member detail re-query by bundle id. `None` only for an empty
/// member list, which `aggregate` never produces.
fn synthesize(bundle_id: String, members: Vec<Task>) -> Option<Task> {
    let count = members.len();
    let mut first = members.into_iter().next()?;

    first.id = TaskId::for_bundle(&bundle_id);
    first.description = format!("bundle ({count}) - multi-stop request");
    if count > 1 {
        first.locations = vec![TaskLocation::new("Multiple locations", 0.0, 0.0)];
    }
    first.bundle_id = Some(bundle_id);
    Some(first)
}
